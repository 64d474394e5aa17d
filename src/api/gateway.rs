//! Operator commands addressed by logical port and command name
//!
//! A direct command is only accepted while polling is stopped. The check and
//! the hand-off to the queue happen under the orchestrator's state lock, so a
//! concurrent `start` cannot slip a cycle in between.
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{
    orchestrator::PollingOrchestrator,
    queue::CommandQueue,
    traits::{PortCommandMap, PortCommandTarget},
};
use crate::{
    core::logs::{EventSink, GatewayEvent},
    protocol::{
        error::{ErrorKind, GatewayError},
        transaction::{FunctionCode, Priority, Transaction, TransactionData, TransactionKind},
    },
};

/// Value supplied by the caller, before conversion to a wire word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<bool> for CommandValue {
    fn from(value: bool) -> Self {
        CommandValue::Bool(value)
    }
}

impl From<u16> for CommandValue {
    fn from(value: u16) -> Self {
        CommandValue::Number(f64::from(value))
    }
}

impl From<f64> for CommandValue {
    fn from(value: f64) -> Self {
        CommandValue::Number(value)
    }
}

impl From<&str> for CommandValue {
    fn from(value: &str) -> Self {
        CommandValue::Text(value.to_string())
    }
}

impl CommandValue {
    /// Convert to a single 16-bit word.
    pub fn to_word(&self) -> Result<u16, GatewayError> {
        match self {
            CommandValue::Bool(value) => Ok(u16::from(*value)),
            CommandValue::Number(value) => number_to_word(*value),
            CommandValue::Text(text) => {
                let text = text.trim();
                match text.to_ascii_lowercase().as_str() {
                    "true" | "on" => return Ok(1),
                    "false" | "off" => return Ok(0),
                    _ => {}
                }
                let value: f64 = text
                    .parse()
                    .map_err(|_| GatewayError::InvalidValue(format!("{text:?} is not a number")))?;
                number_to_word(value)
            }
        }
    }
}

fn number_to_word(value: f64) -> Result<u16, GatewayError> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(GatewayError::InvalidValue(format!(
            "{value} is not a whole number"
        )));
    }
    if !(0.0..=f64::from(u16::MAX)).contains(&value) {
        return Err(GatewayError::InvalidValue(format!(
            "{value} is outside 0..=65535"
        )));
    }
    Ok(value as u16)
}

/// Build the bus transaction for a resolved target and a coerced word.
fn build_transaction(target: PortCommandTarget, word: u16) -> Transaction {
    let function = target.function;
    match function.kind() {
        TransactionKind::Read => {
            Transaction::read(target.unit, function, target.address, word.max(1))
        }
        TransactionKind::Write => {
            let value = match function {
                FunctionCode::WriteSingleCoil | FunctionCode::WriteMultipleCoils => {
                    u16::from(word != 0)
                }
                _ => word,
            };
            Transaction::write(target.unit, function, target.address, vec![value])
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Caller-facing result of a direct command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<TransactionData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl From<Result<TransactionData, GatewayError>> for CommandResult {
    fn from(result: Result<TransactionData, GatewayError>) -> Self {
        match result {
            Ok(data) => CommandResult {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(err) => CommandResult {
                success: false,
                data: None,
                error: Some(CommandError {
                    kind: err.kind(),
                    message: err.to_string(),
                }),
            },
        }
    }
}

#[derive(Clone)]
pub struct DirectCommandGateway {
    queue: CommandQueue,
    orchestrator: PollingOrchestrator,
    ports: Arc<dyn PortCommandMap>,
    events: Arc<dyn EventSink>,
}

impl DirectCommandGateway {
    pub fn new(
        queue: CommandQueue,
        orchestrator: PollingOrchestrator,
        ports: Arc<dyn PortCommandMap>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            ports,
            events,
        }
    }

    /// Run one operator command at high priority.
    pub async fn execute(&self, port: &str, command: &str, value: CommandValue) -> CommandResult {
        let result = self.dispatch(port, command, &value).await;
        match &result {
            Ok(_) => log::info!("Direct command {port}/{command} = {value:?} succeeded"),
            Err(err) => log::warn!("Direct command {port}/{command} = {value:?} failed: {err}"),
        }
        self.events.emit(GatewayEvent::DirectCommand {
            port: port.to_string(),
            command: command.to_string(),
            success: result.is_ok(),
        });
        result.into()
    }

    async fn dispatch(
        &self,
        port: &str,
        command: &str,
        value: &CommandValue,
    ) -> Result<TransactionData, GatewayError> {
        // Checked again under the state lock right before enqueueing.
        if self.orchestrator.is_polling_active() {
            return Err(GatewayError::Conflict);
        }

        let unknown = || GatewayError::UnknownPortCommand {
            port: port.to_string(),
            command: command.to_string(),
        };
        let target = match self.ports.resolve(port, command).await {
            Ok(Some(target)) => target,
            Ok(None) => return Err(unknown()),
            Err(err) => {
                log::warn!("Port map lookup for {port}/{command} failed: {err:#}");
                return Err(unknown());
            }
        };

        let word = value.to_word()?;
        let transaction = build_transaction(target, word).with_priority(Priority::High);
        log::debug!(
            "Direct command {port}/{command} -> unit {} fc {} addr {} ({})",
            target.unit,
            target.function,
            target.address,
            transaction.id()
        );

        let ticket = self
            .orchestrator
            .while_stopped(|| self.queue.try_enqueue(transaction))
            .ok_or(GatewayError::Conflict)??;
        ticket.wait().await.map(|outcome| outcome.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{
            orchestrator::OrchestratorOptions,
            orchestrator::PollingMode,
            test_support::{
                descriptor, eventually, quick_policy, FixedPortMap, FixedRegistry,
                ScriptedTransport,
            },
        },
        core::{logs::MemoryEventSink, persistence::MemorySnapshotStore},
        protocol::{
            error::TransportError,
            transaction::RegisterMode,
            transport::{MockOptions, MockTransport, Transport},
        },
    };
    use std::time::Duration;

    struct Harness {
        gateway: DirectCommandGateway,
        orchestrator: PollingOrchestrator,
        queue: CommandQueue,
        events: Arc<MemoryEventSink>,
    }

    fn harness(transport: Arc<dyn Transport>) -> Harness {
        harness_with(transport, Arc::new(FixedRegistry::new(Vec::new())))
    }

    fn harness_with(transport: Arc<dyn Transport>, registry: Arc<FixedRegistry>) -> Harness {
        let events = Arc::new(MemoryEventSink::default());
        let queue = CommandQueue::spawn(transport, quick_policy(), 16, events.clone());
        let orchestrator = PollingOrchestrator::new(
            queue.clone(),
            registry,
            Arc::new(MemorySnapshotStore::new()),
            events.clone(),
            OrchestratorOptions {
                interval: Duration::from_secs(60),
                ..OrchestratorOptions::default()
            },
        );
        let gateway = DirectCommandGateway::new(
            queue.clone(),
            orchestrator.clone(),
            Arc::new(FixedPortMap),
            events.clone(),
        );
        Harness {
            gateway,
            orchestrator,
            queue,
            events,
        }
    }

    #[tokio::test]
    async fn conflict_while_polling_never_reaches_bus() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::default());
        let h = harness(transport.clone());
        h.orchestrator.start().await?;
        assert!(h.orchestrator.is_polling_active());

        let result = h.gateway.execute("DO1", "POWER", true.into()).await;
        assert!(!result.success);
        let error = result.error.expect("error present");
        assert_eq!(error.kind, ErrorKind::Conflict);
        assert!(error.message.contains("stop polling"));
        assert!(transport.sent_ids().is_empty());
        assert_eq!(h.queue.stats().submitted, 0);

        let json = serde_json::to_value(h.gateway.execute("DO1", "POWER", true.into()).await)?;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "conflict");

        h.orchestrator.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn conflict_while_polling_is_stopping() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::gated());
        let registry = Arc::new(FixedRegistry::new(vec![descriptor("boiler", 1, "TEMP", 0)]));
        let h = harness_with(transport.clone(), registry);
        h.orchestrator.start().await?;
        transport.wait_started().await;

        let orchestrator = h.orchestrator.clone();
        let stopping = tokio::spawn(async move { orchestrator.stop().await });
        assert!(eventually(|| h.orchestrator.mode() == PollingMode::Stopping).await);

        let result = h.gateway.execute("DO1", "POWER", true.into()).await;
        assert_eq!(result.error.map(|err| err.kind), Some(ErrorKind::Conflict));

        transport.release(1);
        assert!(stopping.await?);
        assert!(transport.sent_ids().iter().all(|id| id.starts_with("poll-")));
        assert_eq!(h.queue.stats().submitted, 1);
        Ok(())
    }

    #[tokio::test]
    async fn conflict_while_polling_is_starting() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::default());
        let registry = Arc::new(FixedRegistry::gated(Vec::new()));
        let h = harness_with(transport.clone(), registry.clone());

        let orchestrator = h.orchestrator.clone();
        let starting = tokio::spawn(async move { orchestrator.start().await });
        assert!(eventually(|| registry.load_count() == 1).await);
        assert_eq!(h.orchestrator.mode(), PollingMode::Starting);

        let result = h.gateway.execute("AO1", "SETPOINT", 7u16.into()).await;
        assert_eq!(result.error.map(|err| err.kind), Some(ErrorKind::Conflict));
        assert!(h.orchestrator.while_stopped(|| ()).is_none());

        registry.release_loads(1);
        assert!(starting.await??);
        h.orchestrator.stop().await;
        assert!(transport.sent_ids().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn command_runs_once_polling_is_stopped() -> anyhow::Result<()> {
        let transport = Arc::new(MockTransport::new(MockOptions::default()));
        let h = harness(transport.clone());
        h.orchestrator.start().await?;
        h.orchestrator.stop().await;

        let result = h.gateway.execute("AO1", "SETPOINT", "215".into()).await;
        assert!(result.success, "{result:?}");
        assert_eq!(
            result.data,
            Some(TransactionData::Written {
                address: 40,
                quantity: 1
            })
        );

        let readback = h
            .queue
            .submit(Transaction::read(2, FunctionCode::ReadHoldingRegisters, 40, 1))
            .await?;
        assert_eq!(readback.data.values(), &[215]);
        assert_eq!(h.events.named("direct_command").len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn coil_command_writes_one() -> anyhow::Result<()> {
        let transport = Arc::new(MockTransport::new(MockOptions::default()));
        let h = harness(transport.clone());

        assert!(h.gateway.execute("DO1", "POWER", CommandValue::Number(7.0)).await.success);
        let readback = h
            .queue
            .submit(Transaction::read(1, FunctionCode::ReadCoils, 0, 1))
            .await?;
        assert_eq!(readback.data.values(), &[1]);
        Ok(())
    }

    #[tokio::test]
    async fn read_command_uses_value_as_count() -> anyhow::Result<()> {
        let transport = Arc::new(MockTransport::new(MockOptions {
            randomized: false,
            ..MockOptions::default()
        }));
        transport.set_register(2, RegisterMode::Input, 0, 42);
        let h = harness(transport);

        let result = h.gateway.execute("AI1", "TEMP", CommandValue::Number(0.0)).await;
        assert_eq!(result.data.map(|data| data.values().to_vec()), Some(vec![42]));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_port_command_is_rejected() {
        let transport = Arc::new(ScriptedTransport::default());
        let h = harness(transport.clone());

        let result = h.gateway.execute("DO9", "POWER", true.into()).await;
        assert_eq!(
            result.error.map(|e| e.kind),
            Some(ErrorKind::UnknownPortCommand)
        );
        assert!(transport.sent_ids().is_empty());
    }

    #[tokio::test]
    async fn invalid_values_are_rejected() {
        let transport = Arc::new(ScriptedTransport::default());
        let h = harness(transport.clone());

        for value in [
            CommandValue::from("warm"),
            CommandValue::Number(1.5),
            CommandValue::Number(-1.0),
            CommandValue::Number(70_000.0),
            CommandValue::Number(f64::NAN),
        ] {
            let result = h.gateway.execute("AO1", "SETPOINT", value).await;
            assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::InvalidValue));
        }
        assert!(transport.sent_ids().is_empty());
    }

    #[tokio::test]
    async fn bus_failures_surface_to_caller() {
        let transport = Arc::new(ScriptedTransport::always_failing(TransportError::Timeout(5)));
        let h = harness(transport);

        let result = h.gateway.execute("AO1", "SETPOINT", 10u16.into()).await;
        assert!(!result.success);
        assert_eq!(
            result.error.map(|e| e.kind),
            Some(ErrorKind::BusCommunicationError)
        );
    }

    #[test]
    fn text_values_coerce() {
        assert_eq!(CommandValue::from(" 12 ").to_word(), Ok(12));
        assert_eq!(CommandValue::from("ON").to_word(), Ok(1));
        assert_eq!(CommandValue::from("off").to_word(), Ok(0));
        assert_eq!(CommandValue::from("65535").to_word(), Ok(65535));
        assert!(CommandValue::from("").to_word().is_err());
    }

    #[test]
    fn untagged_values_deserialize() -> anyhow::Result<()> {
        let values: Vec<CommandValue> = serde_json::from_str(r#"[true, 3, "7"]"#)?;
        assert_eq!(
            values,
            vec![
                CommandValue::Bool(true),
                CommandValue::Number(3.0),
                CommandValue::Text("7".into())
            ]
        );
        Ok(())
    }
}
