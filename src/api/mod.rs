pub mod gateway;
pub mod orchestrator;
pub mod queue;
pub mod traits;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod test_support;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::{
    core::{
        config::GatewayConfig,
        logs::{EventSink, FanoutSink, LogEventSink},
        persistence::{static_collaborators, JsonRuntimeConfigStore, MemorySnapshotStore},
    },
    protocol::transport::{build_transport, Transport},
};

pub use gateway::{CommandError, CommandResult, CommandValue, DirectCommandGateway};
pub use orchestrator::{OrchestratorOptions, PollingMetrics, PollingMode, PollingOrchestrator};
pub use queue::{CommandQueue, QueueStats, RetryPolicy, Ticket};
pub use traits::{DeviceRegistry, PortCommandMap, RuntimeConfigStore, SnapshotStore};
pub use watchdog::{AutoRecoveryWatchdog, CheckOutcome, RecoveryState, WatchdogOptions};

/// Builder wiring the queue, orchestrator, gateway and watchdog together.
///
/// Every collaborator not supplied explicitly is derived from the
/// configuration: the transport from `transport`, the device registry and
/// port map from the `devices` and `ports` tables, and the runtime state from
/// `runtime.json` under `storage.data_dir`.
///
/// # Example
///
/// ```no_run
/// use busgate::api::GatewayBuilder;
/// use busgate::core::config::GatewayConfig;
///
/// # async fn run() -> anyhow::Result<()> {
/// let gateway = GatewayBuilder::new(GatewayConfig::default()).build()?;
/// gateway.launch().await?;
/// # Ok(())
/// # }
/// ```
pub struct GatewayBuilder {
    config: GatewayConfig,
    transport: Option<Arc<dyn Transport>>,
    registry: Option<Arc<dyn DeviceRegistry>>,
    ports: Option<Arc<dyn PortCommandMap>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    runtime: Option<Arc<dyn RuntimeConfigStore>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            transport: None,
            registry: None,
            ports: None,
            snapshots: None,
            runtime: None,
            sinks: Vec::new(),
        }
    }

    /// Use a specific transport instead of the one selected by `transport.mode`.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_device_registry(mut self, registry: Arc<dyn DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_port_map(mut self, ports: Arc<dyn PortCommandMap>) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn with_snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_runtime_store(mut self, runtime: Arc<dyn RuntimeConfigStore>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Add an event sink. Events always go to the `log` facade as well.
    pub fn add_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build every service and spawn the queue worker. Must run inside a tokio runtime.
    pub fn build(self) -> Result<FieldGateway> {
        let config = self.config;
        config.validate().context("Invalid gateway configuration")?;

        let (registry, ports) = match (self.registry, self.ports) {
            (Some(registry), Some(ports)) => (registry, ports),
            (registry, ports) => {
                let (static_registry, static_ports) = static_collaborators(&config)?;
                (
                    registry.unwrap_or_else(|| Arc::new(static_registry)),
                    ports.unwrap_or_else(|| Arc::new(static_ports)),
                )
            }
        };
        let snapshots = self.snapshots.unwrap_or_else(|| {
            if config.storage.dump_snapshots {
                Arc::new(MemorySnapshotStore::with_dump_dir(
                    config.storage.data_dir.clone(),
                ))
            } else {
                Arc::new(MemorySnapshotStore::new())
            }
        });
        let runtime = self.runtime.unwrap_or_else(|| {
            Arc::new(JsonRuntimeConfigStore::new(
                config.storage.data_dir.clone(),
                config.polling.autostart,
            ))
        });
        let transport = self
            .transport
            .unwrap_or_else(|| build_transport(&config.transport));

        let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogEventSink)];
        sinks.extend(self.sinks);
        let events: Arc<dyn EventSink> = Arc::new(FanoutSink(sinks));

        let queue = CommandQueue::spawn(
            transport,
            RetryPolicy::from(&config.queue),
            config.queue.capacity,
            events.clone(),
        );
        let orchestrator = PollingOrchestrator::new(
            queue.clone(),
            registry,
            snapshots,
            events.clone(),
            OrchestratorOptions::from(&config.polling),
        );
        let gateway =
            DirectCommandGateway::new(queue.clone(), orchestrator.clone(), ports, events.clone());
        let watchdog = AutoRecoveryWatchdog::new(
            orchestrator.clone(),
            runtime.clone(),
            events,
            WatchdogOptions::from(&config.watchdog),
        );

        Ok(FieldGateway {
            config,
            queue,
            gateway,
            orchestrator,
            watchdog,
            runtime,
        })
    }
}

/// All gateway services of one process, constructed once.
pub struct FieldGateway {
    config: GatewayConfig,
    queue: CommandQueue,
    gateway: DirectCommandGateway,
    orchestrator: PollingOrchestrator,
    watchdog: AutoRecoveryWatchdog,
    runtime: Arc<dyn RuntimeConfigStore>,
}

impl FieldGateway {
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn gateway(&self) -> &DirectCommandGateway {
        &self.gateway
    }

    pub fn orchestrator(&self) -> &PollingOrchestrator {
        &self.orchestrator
    }

    pub fn watchdog(&self) -> &AutoRecoveryWatchdog {
        &self.watchdog
    }

    /// Start polling if the operator wants it, then the watchdog if enabled.
    pub async fn launch(&self) -> Result<()> {
        if self.runtime.desired_polling_enabled().await? {
            self.orchestrator.start().await?;
        } else {
            log::info!("Polling disabled by persisted runtime state");
        }
        if self.config.watchdog.enabled {
            self.watchdog.start_auto_recovery();
        }
        Ok(())
    }

    /// Persist that polling is wanted and start it.
    pub async fn enable_polling(&self) -> Result<bool> {
        self.runtime.set_desired_polling_enabled(true).await?;
        self.orchestrator.start().await
    }

    /// Persist that polling is not wanted and stop it.
    ///
    /// The flag is written first so the watchdog never sees the stop as a crash.
    pub async fn disable_polling(&self) -> Result<bool> {
        self.runtime.set_desired_polling_enabled(false).await?;
        Ok(self.orchestrator.stop().await)
    }

    pub async fn execute(&self, port: &str, command: &str, value: CommandValue) -> CommandResult {
        self.gateway.execute(port, command, value).await
    }

    /// Stop the watchdog and polling without touching the persisted flag, then drain the queue.
    pub async fn shutdown(&self) {
        self.watchdog.stop_auto_recovery().await;
        self.orchestrator.stop().await;
        self.queue.shutdown().await;
        log::info!("Gateway shut down");
    }
}
