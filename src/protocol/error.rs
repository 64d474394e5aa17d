//! Error taxonomy shared by the queue, the gateway and the orchestrator.
use serde::{Deserialize, Serialize};

/// Failure reported by a transport for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no reply within {0} ms")]
    Timeout(u64),

    #[error("bus i/o failure: {0}")]
    Io(String),

    #[error("transport is not connected")]
    Disconnected,

    #[error("device exception 0x{code:02X} for function 0x{function:02X}")]
    Exception { function: u8, code: u8 },

    #[error("malformed reply: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Only link-level failures are worth another attempt. A device that
    /// rejected the request will reject it again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Io(_) | TransportError::Disconnected
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::Timeout(0)
            }
            std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe => {
                TransportError::Disconnected
            }
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Caller-facing error classes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    BusCommunicationError,
    DeviceRejected,
    Conflict,
    UnknownPortCommand,
    InvalidValue,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("bus communication failed after {attempts} attempt(s): {source}")]
    BusCommunication {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("command queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("command queue is full")]
    QueueFull,

    #[error("device rejected the request: {0}")]
    DeviceRejected(#[source] TransportError),

    #[error("polling is active; stop polling before sending direct commands")]
    Conflict,

    #[error("no mapping for port {port:?} command {command:?}")]
    UnknownPortCommand { port: String, command: String },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("transaction {0} was cancelled before it reached the bus")]
    Cancelled(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::BusCommunication { .. }
            | GatewayError::QueueUnavailable(_)
            | GatewayError::QueueFull => ErrorKind::BusCommunicationError,
            GatewayError::DeviceRejected(_) => ErrorKind::DeviceRejected,
            GatewayError::Conflict => ErrorKind::Conflict,
            GatewayError::UnknownPortCommand { .. } => ErrorKind::UnknownPortCommand,
            GatewayError::InvalidValue(_) => ErrorKind::InvalidValue,
            GatewayError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Final classification of a transport failure once the queue gives up on it.
    pub fn from_transport(err: TransportError, attempts: u32) -> Self {
        if err.is_retryable() {
            GatewayError::BusCommunication {
                attempts,
                source: err,
            }
        } else {
            GatewayError::DeviceRejected(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_use_kebab_case_names() {
        assert_eq!(
            ErrorKind::BusCommunicationError.to_string(),
            "bus-communication-error"
        );
        assert_eq!(GatewayError::Conflict.kind().as_ref(), "conflict");
        assert_eq!(
            serde_json::to_string(&ErrorKind::UnknownPortCommand).unwrap(),
            "\"unknown-port-command\""
        );
    }

    #[test]
    fn only_link_failures_are_retryable() {
        assert!(TransportError::Timeout(100).is_retryable());
        assert!(TransportError::Disconnected.is_retryable());
        assert!(!TransportError::Malformed("crc".into()).is_retryable());
        assert!(!TransportError::Exception {
            function: 3,
            code: 2
        }
        .is_retryable());
    }

    #[test]
    fn transport_failures_map_to_kinds() {
        let bus = GatewayError::from_transport(TransportError::Timeout(50), 3);
        assert_eq!(bus.kind(), ErrorKind::BusCommunicationError);
        let rejected = GatewayError::from_transport(
            TransportError::Exception {
                function: 6,
                code: 3,
            },
            1,
        );
        assert_eq!(rejected.kind(), ErrorKind::DeviceRejected);
    }
}
