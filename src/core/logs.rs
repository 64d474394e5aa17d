//! Structured observability events and the sinks that receive them
//!
//! Components never format log lines for operators directly; they emit a
//! `GatewayEvent` and let the configured sink decide where it goes.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::protocol::error::ErrorKind;

/// Events emitted by the queue, orchestrator, gateway and watchdog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    PollingStarted {
        descriptors: usize,
        interval_ms: u64,
    },
    PollingStopped {
        cancelled: usize,
    },
    CycleCompleted {
        succeeded: u64,
        failed: u64,
        duration_ms: u64,
    },
    TransactionFailed {
        id: String,
        kind: ErrorKind,
        attempts: u32,
        message: String,
    },
    DirectCommand {
        port: String,
        command: String,
        success: bool,
    },
    RecoveryPerformed {
        sequence: u64,
    },
    RecoveryFailed {
        sequence: u64,
        message: String,
    },
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::PollingStarted { .. } => "polling_started",
            GatewayEvent::PollingStopped { .. } => "polling_stopped",
            GatewayEvent::CycleCompleted { .. } => "cycle_completed",
            GatewayEvent::TransactionFailed { .. } => "transaction_failed",
            GatewayEvent::DirectCommand { .. } => "direct_command",
            GatewayEvent::RecoveryPerformed { .. } => "recovery_performed",
            GatewayEvent::RecoveryFailed { .. } => "recovery_failed",
        }
    }

    pub fn level(&self) -> LogLevel {
        match self {
            GatewayEvent::TransactionFailed { .. } | GatewayEvent::RecoveryPerformed { .. } => {
                LogLevel::Warning
            }
            GatewayEvent::RecoveryFailed { .. } => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Log entry severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// A log entry with timestamp and the event it records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub event: GatewayEvent,
}

impl LogEntry {
    pub fn new(event: GatewayEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            level: event.level(),
            event,
        }
    }
}

/// Receiver of observability events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

/// Forwards events to the `log` facade as a single structured line.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: GatewayEvent) {
        let fields = serde_json::to_string(&event).unwrap_or_default();
        match event.level() {
            LogLevel::Info => log::info!("[{}] {}", event.name(), fields),
            LogLevel::Warning => log::warn!("[{}] {}", event.name(), fields),
            LogLevel::Error => log::error!("[{}] {}", event.name(), fields),
        }
    }
}

/// Keeps the most recent events in memory.
pub struct MemoryEventSink {
    entries: Mutex<Vec<LogEntry>>,
    max_entries: usize,
}

impl MemoryEventSink {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_entries,
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Events with the given name, oldest first.
    pub fn named(&self, name: &str) -> Vec<GatewayEvent> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.event.name() == name)
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryEventSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: GatewayEvent) {
        let mut entries = self.entries.lock();
        entries.push(LogEntry::new(event));

        // Trim oldest entries if we exceed the max
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(0..excess);
        }
    }
}

/// Sends every event to each inner sink in order.
pub struct FanoutSink(pub Vec<std::sync::Arc<dyn EventSink>>);

impl EventSink for FanoutSink {
    fn emit(&self, event: GatewayEvent) {
        for sink in &self.0 {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_trims_oldest() {
        let sink = MemoryEventSink::new(2);
        for sequence in 1..=3 {
            sink.emit(GatewayEvent::RecoveryPerformed { sequence });
        }
        let kept = sink.named("recovery_performed");
        assert_eq!(
            kept,
            vec![
                GatewayEvent::RecoveryPerformed { sequence: 2 },
                GatewayEvent::RecoveryPerformed { sequence: 3 },
            ]
        );
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&GatewayEvent::PollingStopped { cancelled: 4 }).unwrap();
        assert_eq!(json, r#"{"event":"polling_stopped","cancelled":4}"#);
    }
}
