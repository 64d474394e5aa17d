//! In-process implementations of the gateway collaborators
//!
//! The daemon persists operator intent (whether polling should run) to a
//! small JSON file in the configured data directory, so a restarted process
//! picks up where the operator left it. Device and port tables come straight
//! from the configuration file. Snapshots are kept in memory and can
//! optionally be dumped to `snapshots.json` for inspection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use super::config::{DeviceConfig, GatewayConfig, PortCommandConfig};
use crate::{
    api::traits::{
        DeviceRegistry, PollDescriptor, PollErrorInfo, PortCommandMap, PortCommandTarget,
        RuntimeConfigStore, SnapshotStore, UnitValues,
    },
    protocol::transaction::FunctionCode,
};

const RUNTIME_FILE: &str = "runtime.json";
const SNAPSHOT_FILE: &str = "snapshots.json";

/// Device registry backed by the `devices` table of the configuration.
pub struct StaticDeviceRegistry {
    descriptors: RwLock<Vec<PollDescriptor>>,
}

impl StaticDeviceRegistry {
    pub fn from_devices(devices: &[DeviceConfig]) -> Result<Self> {
        Ok(Self {
            descriptors: RwLock::new(flatten_devices(devices)?),
        })
    }

    /// Replace the registered devices. Takes effect at the next polling start.
    pub fn replace(&self, devices: &[DeviceConfig]) -> Result<()> {
        *self.descriptors.write() = flatten_devices(devices)?;
        Ok(())
    }
}

fn flatten_devices(devices: &[DeviceConfig]) -> Result<Vec<PollDescriptor>> {
    let mut descriptors = Vec::new();
    for device in devices {
        for unit in &device.units {
            for command in &unit.commands {
                let function = FunctionCode::try_from(command.function_code)
                    .with_context(|| format!("device {} command {}", device.id, command.name))?;
                descriptors.push(PollDescriptor {
                    device: device.id.clone(),
                    unit: unit.unit,
                    command: command.name.clone(),
                    function,
                    address: command.address,
                    count: command.count.max(1),
                });
            }
        }
    }
    Ok(descriptors)
}

#[async_trait]
impl DeviceRegistry for StaticDeviceRegistry {
    async fn list_poll_descriptors(&self) -> Result<Vec<PollDescriptor>> {
        Ok(self.descriptors.read().clone())
    }
}

/// Port-command map backed by the `ports` table of the configuration.
pub struct StaticPortMap {
    targets: HashMap<(String, String), PortCommandTarget>,
}

impl StaticPortMap {
    pub fn from_ports(ports: &[PortCommandConfig]) -> Result<Self> {
        let mut targets = HashMap::new();
        for entry in ports {
            let function = FunctionCode::try_from(entry.function_code)
                .with_context(|| format!("port {} command {}", entry.port, entry.command))?;
            targets.insert(
                (entry.port.clone(), entry.command.clone()),
                PortCommandTarget {
                    unit: entry.unit,
                    function,
                    address: entry.address,
                },
            );
        }
        Ok(Self { targets })
    }
}

#[async_trait]
impl PortCommandMap for StaticPortMap {
    async fn resolve(&self, port: &str, command: &str) -> Result<Option<PortCommandTarget>> {
        Ok(self
            .targets
            .get(&(port.to_string(), command.to_string()))
            .copied())
    }
}

/// Latest known state of one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitRecord {
    pub values: UnitValues,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<PollErrorInfo>,
}

/// Snapshot store that keeps the last known state per (device, unit).
#[derive(Default)]
pub struct MemorySnapshotStore {
    records: Mutex<BTreeMap<String, BTreeMap<u8, UnitRecord>>>,
    dump_path: Option<PathBuf>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also write every update to `snapshots.json` in `data_dir`.
    pub fn with_dump_dir(data_dir: PathBuf) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            dump_path: Some(data_dir.join(SNAPSHOT_FILE)),
        }
    }

    pub fn record(&self, device: &str, unit: u8) -> Option<UnitRecord> {
        self.records
            .lock()
            .get(device)
            .and_then(|units| units.get(&unit))
            .cloned()
    }

    async fn dump(&self) -> Result<()> {
        let Some(path) = &self.dump_path else {
            return Ok(());
        };
        let json = {
            let records = self.records.lock();
            serde_json::to_string_pretty(&*records).context("Failed to serialize snapshots")?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn write_snapshot(&self, device: &str, unit: u8, values: &UnitValues) -> Result<()> {
        {
            let mut records = self.records.lock();
            let record = records
                .entry(device.to_string())
                .or_default()
                .entry(unit)
                .or_default();
            record.values.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            record.updated_at = Some(Utc::now());
            // A fresh reading of the failed command means it has recovered.
            if record
                .last_error
                .as_ref()
                .is_some_and(|error| values.contains_key(&error.command))
            {
                record.last_error = None;
            }
        }
        self.dump().await
    }

    async fn write_error(&self, device: &str, unit: u8, error: &PollErrorInfo) -> Result<()> {
        {
            let mut records = self.records.lock();
            records
                .entry(device.to_string())
                .or_default()
                .entry(unit)
                .or_default()
                .last_error = Some(error.clone());
        }
        self.dump().await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedRuntime {
    polling_enabled: bool,
    updated_at: DateTime<Utc>,
}

/// Desired polling state stored as JSON in the data directory.
///
/// The file is re-read on every query so an edit made by another process is
/// picked up by the next watchdog tick.
pub struct JsonRuntimeConfigStore {
    path: PathBuf,
    default_enabled: bool,
}

impl JsonRuntimeConfigStore {
    pub fn new(data_dir: PathBuf, default_enabled: bool) -> Self {
        Self {
            path: data_dir.join(RUNTIME_FILE),
            default_enabled,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl RuntimeConfigStore for JsonRuntimeConfigStore {
    async fn desired_polling_enabled(&self) -> Result<bool> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => {
                let persisted: PersistedRuntime = serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse {}", self.path.display()))?;
                Ok(persisted.polling_enabled)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(self.default_enabled),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        }
    }

    async fn set_desired_polling_enabled(&self, enabled: bool) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let persisted = PersistedRuntime {
            polling_enabled: enabled,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&persisted)
            .context("Failed to serialize runtime config")?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        log::info!("Desired polling state set to {enabled}");
        Ok(())
    }
}

/// Volatile desired-state store.
#[derive(Debug, Default)]
pub struct MemoryRuntimeConfigStore {
    enabled: AtomicBool,
}

impl MemoryRuntimeConfigStore {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }
}

#[async_trait]
impl RuntimeConfigStore for MemoryRuntimeConfigStore {
    async fn desired_polling_enabled(&self) -> Result<bool> {
        Ok(self.enabled.load(Ordering::SeqCst))
    }

    async fn set_desired_polling_enabled(&self, enabled: bool) -> Result<()> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry and port map built from one configuration.
pub fn static_collaborators(
    config: &GatewayConfig,
) -> Result<(StaticDeviceRegistry, StaticPortMap)> {
    Ok((
        StaticDeviceRegistry::from_devices(&config.devices)?,
        StaticPortMap::from_ports(&config.ports)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::config::{CommandConfig, UnitConfig},
        protocol::error::ErrorKind,
    };

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!("busgate_{tag}_{nanos}"))
    }

    #[tokio::test]
    async fn runtime_store_round_trip() -> Result<()> {
        let dir = temp_dir("runtime");
        let store = JsonRuntimeConfigStore::new(dir.clone(), false);
        assert!(!store.desired_polling_enabled().await?);

        assert!(!store.path().exists());
        store.set_desired_polling_enabled(true).await?;
        assert!(store.desired_polling_enabled().await?);
        assert_eq!(store.path(), dir.join("runtime.json"));
        let persisted: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path())?)?;
        assert_eq!(persisted["polling_enabled"], true);

        // A second store over the same directory sees the persisted value.
        let reopened = JsonRuntimeConfigStore::new(dir.clone(), false);
        assert!(reopened.desired_polling_enabled().await?);

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[tokio::test]
    async fn registry_flattens_devices() -> Result<()> {
        let registry = StaticDeviceRegistry::from_devices(&[DeviceConfig {
            id: "env-1".into(),
            units: vec![UnitConfig {
                unit: 4,
                commands: vec![
                    CommandConfig {
                        name: "CO2".into(),
                        function_code: 4,
                        address: 0,
                        count: 1,
                    },
                    CommandConfig {
                        name: "HUMIDITY".into(),
                        function_code: 4,
                        address: 1,
                        count: 0,
                    },
                ],
            }],
        }])?;
        let descriptors = registry.list_poll_descriptors().await?;
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[1].count, 1);
        assert_eq!(descriptors[0].function, FunctionCode::ReadInputRegisters);

        registry.replace(&[DeviceConfig {
            id: "env-2".into(),
            units: vec![UnitConfig {
                unit: 5,
                commands: vec![CommandConfig {
                    name: "LUX".into(),
                    function_code: 3,
                    address: 9,
                    count: 2,
                }],
            }],
        }])?;
        let descriptors = registry.list_poll_descriptors().await?;
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].device, "env-2");
        assert_eq!(descriptors[0].count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn fresh_reading_clears_stale_error() -> Result<()> {
        let store = MemorySnapshotStore::new();
        let failure = |command: &str| PollErrorInfo {
            command: command.into(),
            kind: ErrorKind::BusCommunicationError,
            message: "no reply within 200 ms".into(),
            at: Utc::now(),
        };

        store.write_error("pump", 2, &failure("SPEED")).await?;
        let mut other = UnitValues::new();
        other.insert("FLOW".into(), vec![12]);
        store.write_snapshot("pump", 2, &other).await?;
        let record = store.record("pump", 2).expect("record exists");
        assert_eq!(record.last_error.map(|error| error.command), Some("SPEED".into()));

        let mut recovered = UnitValues::new();
        recovered.insert("SPEED".into(), vec![1450]);
        store.write_snapshot("pump", 2, &recovered).await?;
        let record = store.record("pump", 2).expect("record exists");
        assert!(record.last_error.is_none());
        assert_eq!(record.values.get("SPEED"), Some(&vec![1450]));
        Ok(())
    }

    #[tokio::test]
    async fn snapshots_merge_per_unit() -> Result<()> {
        let store = MemorySnapshotStore::new();
        let mut first = UnitValues::new();
        first.insert("TEMP".into(), vec![215]);
        store.write_snapshot("hvac-1", 2, &first).await?;

        let mut second = UnitValues::new();
        second.insert("MODE".into(), vec![1]);
        store.write_snapshot("hvac-1", 2, &second).await?;

        let record = store.record("hvac-1", 2).expect("record exists");
        assert_eq!(record.values.len(), 2);
        assert!(record.updated_at.is_some());
        Ok(())
    }
}
