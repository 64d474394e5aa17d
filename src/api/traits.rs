//! Collaborator interfaces consumed by the gateway services
//!
//! The device registry, the port-command map, the snapshot store and the
//! persisted runtime configuration live outside this crate in production.
//! `crate::core::persistence` provides in-process implementations used by the
//! daemon and by tests.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::protocol::{error::ErrorKind, transaction::FunctionCode};

pub use crate::core::logs::EventSink;

/// One value read by every polling cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollDescriptor {
    pub device: String,
    pub unit: u8,
    pub command: String,
    pub function: FunctionCode,
    pub address: u16,
    pub count: u16,
}

/// Concrete bus target a logical (port, command) pair maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCommandTarget {
    pub unit: u8,
    pub function: FunctionCode,
    pub address: u16,
}

/// Values read for one unit during one cycle, keyed by command name.
pub type UnitValues = BTreeMap<String, Vec<u16>>;

/// Per-unit failure recorded by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollErrorInfo {
    pub command: String,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn list_poll_descriptors(&self) -> Result<Vec<PollDescriptor>>;
}

#[async_trait]
pub trait PortCommandMap: Send + Sync {
    async fn resolve(&self, port: &str, command: &str) -> Result<Option<PortCommandTarget>>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn write_snapshot(&self, device: &str, unit: u8, values: &UnitValues) -> Result<()>;

    async fn write_error(&self, device: &str, unit: u8, error: &PollErrorInfo) -> Result<()>;
}

/// Persisted operator intent, which survives restarts of the process.
#[async_trait]
pub trait RuntimeConfigStore: Send + Sync {
    async fn desired_polling_enabled(&self) -> Result<bool>;

    async fn set_desired_polling_enabled(&self, enabled: bool) -> Result<()>;
}
