use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Read,
    Write,
}

/// Dispatch tier. `High` always leaves the queue before any `Normal` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Register table addressed by a function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterMode {
    Coils = 1,
    DiscreteInputs = 2,
    Holding = 3,
    Input = 4,
}

impl RegisterMode {
    pub fn is_bit(self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }
}

impl std::fmt::Display for RegisterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterMode::Coils => write!(f, "coils"),
            RegisterMode::DiscreteInputs => write!(f, "discrete_inputs"),
            RegisterMode::Holding => write!(f, "holding"),
            RegisterMode::Input => write!(f, "input"),
        }
    }
}

/// The function codes the gateway knows how to put on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
        }
    }

    pub fn kind(self) -> TransactionKind {
        match self {
            Self::ReadCoils
            | Self::ReadDiscreteInputs
            | Self::ReadHoldingRegisters
            | Self::ReadInputRegisters => TransactionKind::Read,
            _ => TransactionKind::Write,
        }
    }

    pub fn register_mode(self) -> RegisterMode {
        match self {
            Self::ReadCoils | Self::WriteSingleCoil | Self::WriteMultipleCoils => {
                RegisterMode::Coils
            }
            Self::ReadDiscreteInputs => RegisterMode::DiscreteInputs,
            Self::ReadHoldingRegisters | Self::WriteSingleRegister | Self::WriteMultipleRegisters => {
                RegisterMode::Holding
            }
            Self::ReadInputRegisters => RegisterMode::Input,
        }
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::ReadCoils,
            0x02 => Self::ReadDiscreteInputs,
            0x03 => Self::ReadHoldingRegisters,
            0x04 => Self::ReadInputRegisters,
            0x05 => Self::WriteSingleCoil,
            0x06 => Self::WriteSingleRegister,
            0x0F => Self::WriteMultipleCoils,
            0x10 => Self::WriteMultipleRegisters,
            other => {
                return Err(GatewayError::InvalidValue(format!(
                    "unsupported function code 0x{other:02X}"
                )))
            }
        })
    }
}

impl From<FunctionCode> for u8 {
    fn from(value: FunctionCode) -> Self {
        value.code()
    }
}

impl std::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.code())
    }
}

/// Register count for reads, values for writes. Coil values are `0` or `1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Count(u16),
    Values(Vec<u16>),
}

/// One bus operation as handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusRequest {
    pub id: String,
    pub unit: u8,
    pub function: FunctionCode,
    pub address: u16,
    pub payload: Payload,
}

impl BusRequest {
    pub fn kind(&self) -> TransactionKind {
        self.function.kind()
    }

    /// Number of registers or coils covered by this request.
    pub fn quantity(&self) -> u16 {
        match &self.payload {
            Payload::Count(count) => *count,
            Payload::Values(values) => values.len() as u16,
        }
    }
}

/// Data carried back by a completed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionData {
    Registers { address: u16, values: Vec<u16> },
    Written { address: u16, quantity: u16 },
}

impl TransactionData {
    pub fn values(&self) -> &[u16] {
        match self {
            TransactionData::Registers { values, .. } => values,
            TransactionData::Written { .. } => &[],
        }
    }
}

/// Successful completion of a queued transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionOutcome {
    pub id: String,
    pub data: TransactionData,
    pub attempts: u32,
    /// Time spent pending before the first transmission.
    pub queue_wait: Duration,
    /// Bus time of the attempt that succeeded.
    pub latency: Duration,
}

/// Transaction as submitted to the command queue.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub request: BusRequest,
    pub priority: Priority,
    /// Restamped by the queue on submission; the queue wait is measured from here.
    pub submitted_at: Instant,
}

impl Transaction {
    pub fn new(
        id: Option<String>,
        unit: u8,
        function: FunctionCode,
        address: u16,
        payload: Payload,
        priority: Priority,
    ) -> Self {
        let id = id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        Self {
            request: BusRequest {
                id,
                unit,
                function,
                address,
                payload,
            },
            priority,
            submitted_at: Instant::now(),
        }
    }

    pub fn read(unit: u8, function: FunctionCode, address: u16, count: u16) -> Self {
        Self::new(
            None,
            unit,
            function,
            address,
            Payload::Count(count),
            Priority::Normal,
        )
    }

    pub fn write(unit: u8, function: FunctionCode, address: u16, values: Vec<u16>) -> Self {
        Self::new(
            None,
            unit,
            function,
            address,
            Payload::Values(values),
            Priority::Normal,
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.request.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.request.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_codes_classify_reads_and_writes() {
        for code in [0x01u8, 0x02, 0x03, 0x04] {
            let function = FunctionCode::try_from(code).unwrap();
            assert_eq!(function.kind(), TransactionKind::Read);
            assert_eq!(function.code(), code);
        }
        for code in [0x05u8, 0x06, 0x0F, 0x10] {
            assert_eq!(
                FunctionCode::try_from(code).unwrap().kind(),
                TransactionKind::Write
            );
        }
        assert!(FunctionCode::try_from(0x2B).is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = Transaction::read(1, FunctionCode::ReadHoldingRegisters, 0, 1);
        let b = Transaction::read(1, FunctionCode::ReadHoldingRegisters, 0, 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.priority, Priority::Normal);
    }

    #[test]
    fn quantity_follows_payload() {
        let write = Transaction::write(2, FunctionCode::WriteMultipleRegisters, 10, vec![1, 2, 3]);
        assert_eq!(write.request.quantity(), 3);
        assert_eq!(write.kind(), TransactionKind::Write);
    }
}
