//! Gateway configuration, resolved once at startup.
//!
//! Every field has a default so a minimal file only needs the device and port
//! tables. Both TOML and JSON are accepted, chosen by file extension.
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::protocol::transaction::{FunctionCode, TransactionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Serial,
    #[default]
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub seed: Option<u64>,
    pub latency_ms: u64,
    pub failure_rate: f64,
    pub randomized: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            seed: None,
            latency_ms: 20,
            failure_rate: 0.0,
            randomized: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
    pub port: String,
    pub baud_rate: u32,
    /// Serial read timeout. A reply is read in two steps, so twice this must
    /// stay below `queue.timeout_ms`.
    pub read_timeout_ms: u64,
    pub mock: MockConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Mock,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 400,
            mock: MockConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bound of the submission channel feeding the queue worker.
    pub capacity: usize,
    pub timeout_ms: u64,
    /// Total transport attempts per transaction, first try included.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            timeout_ms: 1000,
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    /// Number of recent response times the rolling average covers.
    pub metrics_window: usize,
    pub cleanup_interval_secs: u64,
    /// Desired polling state until the operator persists one.
    pub autostart: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            metrics_window: 100,
            cleanup_interval_secs: 3600,
            autostart: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Extra consecutive ticks the orchestrator must be seen stopped before a restart.
    pub grace_ticks: u32,
    pub cooldown_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 2000,
            grace_ticks: 1,
            cooldown_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Dump the latest snapshots to `snapshots.json` after every cycle.
    pub dump_snapshots: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("busgate_data"),
            dump_snapshots: false,
        }
    }
}

fn default_count() -> u16 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub name: String,
    pub function_code: u8,
    pub address: u16,
    #[serde(default = "default_count")]
    pub count: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfig {
    pub unit: u8,
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub units: Vec<UnitConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortCommandConfig {
    pub port: String,
    pub command: String,
    pub unit: u8,
    pub function_code: u8,
    pub address: u16,
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub transport: TransportConfig,
    pub queue: QueueConfig,
    pub polling: PollingConfig,
    pub watchdog: WatchdogConfig,
    pub storage: StorageConfig,
    pub devices: Vec<DeviceConfig>,
    pub ports: Vec<PortCommandConfig>,
}

impl GatewayConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse TOML configuration")
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse JSON configuration")
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&text)?,
            _ => Self::from_toml(&text)?,
        };
        config.validate()?;
        log::info!(
            "Loaded configuration from {} ({} devices, {} port commands, {:?} transport)",
            path.display(),
            config.devices.len(),
            config.ports.len(),
            config.transport.mode
        );
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            bail!("queue.max_attempts must be at least 1");
        }
        if self.queue.capacity == 0 {
            bail!("queue.capacity must be at least 1");
        }
        if self.polling.interval_ms == 0 || self.watchdog.interval_ms == 0 {
            bail!("polling.interval_ms and watchdog.interval_ms must be positive");
        }
        if self.transport.mode == TransportMode::Serial
            && self.transport.read_timeout_ms.saturating_mul(2) >= self.queue.timeout_ms
        {
            bail!(
                "transport.read_timeout_ms ({}) must be less than half of queue.timeout_ms ({})",
                self.transport.read_timeout_ms,
                self.queue.timeout_ms
            );
        }
        if !(0.0..=1.0).contains(&self.transport.mock.failure_rate) {
            bail!("transport.mock.failure_rate must be within 0.0..=1.0");
        }

        for device in &self.devices {
            for unit in &device.units {
                for command in &unit.commands {
                    let function = FunctionCode::try_from(command.function_code).map_err(|err| {
                        anyhow!("device {} command {}: {err}", device.id, command.name)
                    })?;
                    if function.kind() != TransactionKind::Read {
                        bail!(
                            "device {} command {} uses write function {function} for polling",
                            device.id,
                            command.name
                        );
                    }
                    if command.count == 0 {
                        bail!("device {} command {} polls zero registers", device.id, command.name);
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        for entry in &self.ports {
            FunctionCode::try_from(entry.function_code)
                .map_err(|err| anyhow!("port {} command {}: {err}", entry.port, entry.command))?;
            if !seen.insert((entry.port.as_str(), entry.command.as_str())) {
                bail!("duplicate mapping for port {} command {}", entry.port, entry.command);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [transport]
        mode = "mock"

        [transport.mock]
        seed = 42
        latency_ms = 0

        [queue]
        max_attempts = 5

        [[devices]]
        id = "hvac-1"

        [[devices.units]]
        unit = 2
        commands = [
            { name = "TEMP", function_code = 4, address = 0 },
            { name = "MODE", function_code = 3, address = 10, count = 2 },
        ]

        [[ports]]
        port = "DO1"
        command = "POWER"
        unit = 1
        function_code = 5
        address = 0
    "#;

    #[test]
    fn parses_toml_with_defaults() {
        let config = GatewayConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.transport.mode, TransportMode::Mock);
        assert_eq!(config.transport.mock.seed, Some(42));
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.timeout_ms, 1000);
        assert_eq!(config.devices[0].units[0].commands[0].count, 1);
        assert_eq!(config.ports[0].function_code, 5);
    }

    #[test]
    fn json_round_trip_keeps_tables() {
        let config = GatewayConfig::from_toml(SAMPLE).unwrap();
        let parsed = GatewayConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed.devices, config.devices);
        assert_eq!(parsed.ports, config.ports);
    }

    #[test]
    fn rejects_write_function_in_poll_table() {
        let mut config = GatewayConfig::from_toml(SAMPLE).unwrap();
        config.devices[0].units[0].commands[0].function_code = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_port_mapping() {
        let mut config = GatewayConfig::from_toml(SAMPLE).unwrap();
        let duplicate = config.ports[0].clone();
        config.ports.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn serial_read_budget_must_fit_attempt_timeout() {
        let mut config = GatewayConfig::from_toml(SAMPLE).unwrap();
        config.transport.mode = TransportMode::Serial;
        config.validate().unwrap();

        config.transport.read_timeout_ms = config.queue.timeout_ms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("read_timeout_ms"));

        config.transport.mode = TransportMode::Mock;
        config.validate().unwrap();
    }
}
