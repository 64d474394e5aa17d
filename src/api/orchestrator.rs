//! Cyclic polling of every registered descriptor through the command queue
//!
//! The orchestrator owns one cycle task at a time. Each cycle reads every
//! descriptor in order, waits for each result before submitting the next,
//! writes a consolidated snapshot per unit and then sleeps for the polling
//! interval. The next cycle only starts once the previous one has finished,
//! so a slow bus stretches the period instead of piling up reads.
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::{BTreeMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use strum::Display;
use tokio::task::JoinHandle;

use super::{
    queue::{CommandQueue, TransactionResult},
    traits::{DeviceRegistry, PollDescriptor, PollErrorInfo, SnapshotStore, UnitValues},
};
use crate::{
    core::{
        config::PollingConfig,
        logs::{EventSink, GatewayEvent},
        task_manager::{join_task, spawn_task},
    },
    protocol::{error::GatewayError, transaction::Transaction},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PollingMode {
    Stopped,
    Starting,
    RunningIdle,
    RunningIterating,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollingMetrics {
    pub total_polling_calls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    /// Rolling average over the most recent response times, in milliseconds.
    pub average_response_time_ms: f64,
    pub last_cleanup: DateTime<Utc>,
    pub cycles_completed: u64,
    pub last_cycle_duration_ms: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl Default for PollingMetrics {
    fn default() -> Self {
        Self {
            total_polling_calls: 0,
            successful_polls: 0,
            failed_polls: 0,
            average_response_time_ms: 0.0,
            last_cleanup: Utc::now(),
            cycles_completed: 0,
            last_cycle_duration_ms: 0,
            last_cycle_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub interval: Duration,
    pub metrics_window: usize,
    pub cleanup_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl From<&PollingConfig> for OrchestratorOptions {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms),
            metrics_window: config.metrics_window.max(1),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
        }
    }
}

struct MetricsState {
    metrics: PollingMetrics,
    samples: VecDeque<Duration>,
    last_cleanup_at: Instant,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            metrics: PollingMetrics::default(),
            samples: VecDeque::new(),
            last_cleanup_at: Instant::now(),
        }
    }

    fn record(&mut self, result: &TransactionResult, window: usize) {
        self.metrics.total_polling_calls += 1;
        match result {
            Ok(outcome) => {
                self.metrics.successful_polls += 1;
                self.samples.push_back(outcome.latency);
                while self.samples.len() > window {
                    self.samples.pop_front();
                }
                let total: f64 = self.samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
                self.metrics.average_response_time_ms = total / self.samples.len() as f64;
            }
            Err(_) => self.metrics.failed_polls += 1,
        }
    }

    fn finish_cycle(&mut self, duration: Duration, cleanup_interval: Duration) {
        self.metrics.cycles_completed += 1;
        self.metrics.last_cycle_duration_ms = duration.as_millis() as u64;
        self.metrics.last_cycle_at = Some(Utc::now());

        if self.last_cleanup_at.elapsed() >= cleanup_interval {
            log::debug!("Clearing {} response time samples", self.samples.len());
            self.samples.clear();
            self.last_cleanup_at = Instant::now();
            self.metrics.last_cleanup = Utc::now();
        }
    }
}

/// Stop switch shared with a running cycle task.
struct CycleControl {
    running: Arc<AtomicBool>,
    wake: flume::Sender<()>,
}

struct CycleState {
    mode: PollingMode,
    /// Bumped by every start and stop so a stale start cannot resurrect a stopped cycle.
    generation: u64,
    descriptors: Arc<Vec<PollDescriptor>>,
    control: Option<CycleControl>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    queue: CommandQueue,
    registry: Arc<dyn DeviceRegistry>,
    snapshots: Arc<dyn SnapshotStore>,
    events: Arc<dyn EventSink>,
    options: OrchestratorOptions,
    state: Mutex<CycleState>,
    metrics: Mutex<MetricsState>,
    cycle_counter: AtomicU64,
}

/// Cloneable handle to the polling state machine.
#[derive(Clone)]
pub struct PollingOrchestrator {
    inner: Arc<Inner>,
}

impl PollingOrchestrator {
    pub fn new(
        queue: CommandQueue,
        registry: Arc<dyn DeviceRegistry>,
        snapshots: Arc<dyn SnapshotStore>,
        events: Arc<dyn EventSink>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                registry,
                snapshots,
                events,
                options,
                state: Mutex::new(CycleState {
                    mode: PollingMode::Stopped,
                    generation: 0,
                    descriptors: Arc::new(Vec::new()),
                    control: None,
                    task: None,
                }),
                metrics: Mutex::new(MetricsState::new()),
                cycle_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Start polling. Returns `Ok(false)` when polling was not stopped.
    pub async fn start(&self) -> anyhow::Result<bool> {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.mode != PollingMode::Stopped {
                log::debug!("Polling start ignored in mode {}", state.mode);
                return Ok(false);
            }
            state.mode = PollingMode::Starting;
            state.generation += 1;
            state.generation
        };

        let descriptors = match self.inner.registry.list_poll_descriptors().await {
            Ok(descriptors) => Arc::new(descriptors),
            Err(err) => {
                let mut state = self.inner.state.lock();
                if state.generation == generation {
                    state.mode = PollingMode::Stopped;
                }
                return Err(err.context("Failed to load poll descriptors"));
            }
        };

        {
            let mut state = self.inner.state.lock();
            if state.mode != PollingMode::Starting || state.generation != generation {
                log::debug!("Polling start superseded while loading descriptors");
                return Ok(false);
            }

            let running = Arc::new(AtomicBool::new(true));
            let (wake, wake_rx) = flume::bounded(1);
            state.mode = PollingMode::RunningIdle;
            state.descriptors = descriptors.clone();
            state.control = Some(CycleControl {
                running: running.clone(),
                wake,
            });
            state.task = Some(spawn_task(
                "polling cycle",
                supervise(
                    self.inner.clone(),
                    generation,
                    descriptors.clone(),
                    running,
                    wake_rx,
                ),
            ));
        }

        log::info!(
            "Polling started with {} descriptor(s) every {} ms",
            descriptors.len(),
            self.inner.options.interval.as_millis()
        );
        self.inner.events.emit(GatewayEvent::PollingStarted {
            descriptors: descriptors.len(),
            interval_ms: self.inner.options.interval.as_millis() as u64,
        });
        Ok(true)
    }

    /// Stop polling and cancel its pending reads. Returns `false` when already stopped.
    pub async fn stop(&self) -> bool {
        let (control, task) = {
            let mut state = self.inner.state.lock();
            if matches!(state.mode, PollingMode::Stopped | PollingMode::Stopping) {
                return false;
            }
            state.mode = PollingMode::Stopping;
            state.generation += 1;
            (state.control.take(), state.task.take())
        };

        if let Some(control) = control {
            control.running.store(false, Ordering::SeqCst);
            let _ = control.wake.try_send(());
        }
        let cancelled = self.inner.queue.clear().await;
        if let Some(task) = task {
            join_task("polling cycle", task).await;
        }

        self.inner.state.lock().mode = PollingMode::Stopped;
        log::info!("Polling stopped, {cancelled} pending read(s) cancelled");
        self.inner
            .events
            .emit(GatewayEvent::PollingStopped { cancelled });
        true
    }

    pub fn mode(&self) -> PollingMode {
        self.inner.state.lock().mode
    }

    /// Whether polling is anything but stopped.
    pub fn is_polling_active(&self) -> bool {
        self.mode() != PollingMode::Stopped
    }

    pub fn is_cycle_running(&self) -> bool {
        self.mode() == PollingMode::RunningIterating
    }

    pub fn metrics(&self) -> PollingMetrics {
        self.inner.metrics.lock().metrics.clone()
    }

    /// Descriptors loaded by the most recent start.
    pub fn descriptors(&self) -> Arc<Vec<PollDescriptor>> {
        self.inner.state.lock().descriptors.clone()
    }

    /// Run `action` only if polling is stopped, holding the state lock throughout.
    ///
    /// `start` takes the same lock to leave `Stopped`, so nothing `action`
    /// enqueues can interleave with a cycle.
    pub(crate) fn while_stopped<T>(&self, action: impl FnOnce() -> T) -> Option<T> {
        let state = self.inner.state.lock();
        if state.mode != PollingMode::Stopped {
            return None;
        }
        Some(action())
    }
}

/// Run cycles until stopped, and mark polling stopped if they end on their own.
async fn supervise(
    inner: Arc<Inner>,
    generation: u64,
    descriptors: Arc<Vec<PollDescriptor>>,
    running: Arc<AtomicBool>,
    wake: flume::Receiver<()>,
) {
    let outcome = AssertUnwindSafe(run_cycles(&inner, &descriptors, &running, &wake))
        .catch_unwind()
        .await;

    if !running.load(Ordering::SeqCst) {
        return;
    }
    let reason = match outcome {
        Ok(Ok(())) => "cycle loop exited".to_string(),
        Ok(Err(err)) => err.to_string(),
        Err(_) => "cycle task panicked".to_string(),
    };
    log::error!("Polling stopped unexpectedly: {reason}");

    let mut state = inner.state.lock();
    if state.generation == generation {
        state.mode = PollingMode::Stopped;
        state.control = None;
        state.task = None;
    }
}

async fn run_cycles(
    inner: &Inner,
    descriptors: &[PollDescriptor],
    running: &AtomicBool,
    wake: &flume::Receiver<()>,
) -> Result<(), GatewayError> {
    loop {
        if !set_iterating(inner, running, true) {
            return Ok(());
        }
        let result = run_cycle(inner, descriptors, running).await;
        set_iterating(inner, running, false);
        result?;

        tokio::select! {
            _ = tokio::time::sleep(inner.options.interval) => {}
            _ = wake.recv_async() => {}
        }
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }
    }
}

/// Flip between the two running modes. Returns `false` once a stop is under way.
fn set_iterating(inner: &Inner, running: &AtomicBool, iterating: bool) -> bool {
    let mut state = inner.state.lock();
    if !running.load(Ordering::SeqCst)
        || !matches!(
            state.mode,
            PollingMode::RunningIdle | PollingMode::RunningIterating
        )
    {
        return false;
    }
    state.mode = if iterating {
        PollingMode::RunningIterating
    } else {
        PollingMode::RunningIdle
    };
    true
}

async fn run_cycle(
    inner: &Inner,
    descriptors: &[PollDescriptor],
    running: &AtomicBool,
) -> Result<(), GatewayError> {
    let started = Instant::now();
    let cycle = inner.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let mut values: BTreeMap<(&str, u8), UnitValues> = BTreeMap::new();
    let mut errors: Vec<(&str, u8, PollErrorInfo)> = Vec::new();
    let (mut succeeded, mut failed) = (0u64, 0u64);

    for descriptor in descriptors {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let transaction = Transaction::read(
            descriptor.unit,
            descriptor.function,
            descriptor.address,
            descriptor.count,
        )
        .with_id(format!(
            "poll-{cycle}-{}-{}-{}",
            descriptor.device, descriptor.unit, descriptor.command
        ));

        let result = inner.queue.submit(transaction).await;
        if let Err(GatewayError::QueueUnavailable(message)) = &result {
            return Err(GatewayError::QueueUnavailable(message.clone()));
        }
        // Cleared by a stop; not a device failure.
        if matches!(result, Err(GatewayError::Cancelled(_))) {
            break;
        }
        inner
            .metrics
            .lock()
            .record(&result, inner.options.metrics_window);

        match result {
            Ok(outcome) => {
                succeeded += 1;
                values
                    .entry((descriptor.device.as_str(), descriptor.unit))
                    .or_default()
                    .insert(descriptor.command.clone(), outcome.data.values().to_vec());
            }
            Err(err) => {
                failed += 1;
                log::warn!(
                    "Poll of {}/{}/{} failed: {err}",
                    descriptor.device,
                    descriptor.unit,
                    descriptor.command
                );
                errors.push((
                    descriptor.device.as_str(),
                    descriptor.unit,
                    PollErrorInfo {
                        command: descriptor.command.clone(),
                        kind: err.kind(),
                        message: err.to_string(),
                        at: Utc::now(),
                    },
                ));
            }
        }
    }

    for ((device, unit), unit_values) in &values {
        if let Err(err) = inner
            .snapshots
            .write_snapshot(device, *unit, unit_values)
            .await
        {
            log::warn!("Failed to write snapshot for {device}/{unit}: {err:#}");
        }
    }
    for (device, unit, info) in &errors {
        if let Err(err) = inner.snapshots.write_error(device, *unit, info).await {
            log::warn!("Failed to record poll error for {device}/{unit}: {err:#}");
        }
    }

    let duration = started.elapsed();
    inner
        .metrics
        .lock()
        .finish_cycle(duration, inner.options.cleanup_interval);
    log::debug!(
        "Cycle {cycle} finished in {} ms: {succeeded} ok, {failed} failed",
        duration.as_millis()
    );
    inner.events.emit(GatewayEvent::CycleCompleted {
        succeeded,
        failed,
        duration_ms: duration.as_millis() as u64,
    });
    Ok(())
}
