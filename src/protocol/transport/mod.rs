//! Bus transports.
//!
//! A transport owns the physical link and performs exactly one request/reply
//! exchange per `send_transaction` call. It is never shared outside the
//! command queue, which guarantees that calls never overlap.
mod mock;
mod serial;

use async_trait::async_trait;
use std::sync::Arc;

use super::{
    error::TransportError,
    transaction::{BusRequest, TransactionData},
};
use crate::core::config::{TransportConfig, TransportMode};

pub use mock::{MockOptions, MockTransport};
pub use serial::SerialTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link. Returns `Ok(false)` when the link could not be opened
    /// but the failure is expected to be transient.
    async fn connect(&self) -> Result<bool, TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn send_transaction(&self, request: &BusRequest)
        -> Result<TransactionData, TransportError>;

    fn name(&self) -> &str;
}

/// Build the transport selected by configuration. The choice is final for the
/// lifetime of the returned value.
pub fn build_transport(config: &TransportConfig) -> Arc<dyn Transport> {
    match config.mode {
        TransportMode::Serial => Arc::new(SerialTransport::new(
            config.port.clone(),
            config.baud_rate,
            config.read_timeout(),
        )),
        TransportMode::Mock => Arc::new(MockTransport::new(MockOptions::from(&config.mock))),
    }
}
