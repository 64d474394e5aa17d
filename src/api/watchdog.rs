//! Restarts polling when it stopped without the operator asking for it
//!
//! The persisted runtime configuration holds what the operator wants; the
//! orchestrator's mode says what is actually happening. The watchdog only
//! acts when polling is wanted but has been seen stopped for more than
//! `grace_ticks` consecutive checks, and it waits out a cooldown between
//! restart attempts. It never gives up on its own.
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use super::{orchestrator::PollingOrchestrator, traits::RuntimeConfigStore};
use crate::core::{
    config::WatchdogConfig,
    logs::{EventSink, GatewayEvent},
    task_manager::{join_task, spawn_task},
};

#[derive(Debug, Clone)]
pub struct WatchdogOptions {
    pub interval: Duration,
    pub grace_ticks: u32,
    pub cooldown: Duration,
}

impl Default for WatchdogOptions {
    fn default() -> Self {
        Self::from(&WatchdogConfig::default())
    }
}

impl From<&WatchdogConfig> for WatchdogOptions {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms.max(1)),
            grace_ticks: config.grace_ticks,
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }
}

/// What a single check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Polling is not wanted; nothing to do.
    Disabled,
    Healthy,
    /// Seen stopped, still inside the grace window.
    Waiting,
    CoolingDown,
    Recovered,
    Failed,
    /// The desired state could not be read.
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryState {
    pub is_running: bool,
    pub recovery_count: u64,
    pub last_recovery_time: Option<DateTime<Utc>>,
    /// Restart attempts, failed ones included. Used as the event sequence number.
    pub attempts: u64,
}

#[derive(Default)]
struct Tracker {
    stopped_ticks: u32,
    recovery_count: u64,
    attempts: u64,
    last_recovery_time: Option<DateTime<Utc>>,
    last_attempt_at: Option<Instant>,
}

struct WatchdogTask {
    stop: flume::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    orchestrator: PollingOrchestrator,
    runtime: Arc<dyn RuntimeConfigStore>,
    events: Arc<dyn EventSink>,
    options: WatchdogOptions,
    tracker: Mutex<Tracker>,
    task: Mutex<Option<WatchdogTask>>,
}

#[derive(Clone)]
pub struct AutoRecoveryWatchdog {
    inner: Arc<Inner>,
}

impl AutoRecoveryWatchdog {
    pub fn new(
        orchestrator: PollingOrchestrator,
        runtime: Arc<dyn RuntimeConfigStore>,
        events: Arc<dyn EventSink>,
        options: WatchdogOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                runtime,
                events,
                options,
                tracker: Mutex::new(Tracker::default()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the check timer. Returns `false` if it is already running.
    pub fn start_auto_recovery(&self) -> bool {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return false;
        }
        let (stop, stop_rx) = flume::bounded(1);
        let watchdog = self.clone();
        let handle = spawn_task("watchdog", async move { watchdog.run(stop_rx).await });
        *task = Some(WatchdogTask { stop, handle });

        log::info!(
            "Auto-recovery watchdog started (every {} ms, grace {} tick(s), cooldown {} ms)",
            self.inner.options.interval.as_millis(),
            self.inner.options.grace_ticks,
            self.inner.options.cooldown.as_millis()
        );
        true
    }

    /// Stop the check timer, waiting for an in-progress check to finish.
    pub async fn stop_auto_recovery(&self) -> bool {
        let task = self.inner.task.lock().take();
        let Some(task) = task else {
            return false;
        };
        let _ = task.stop.try_send(());
        join_task("watchdog", task.handle).await;
        log::info!("Auto-recovery watchdog stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    pub fn recovery_count(&self) -> u64 {
        self.inner.tracker.lock().recovery_count
    }

    pub fn last_recovery_time(&self) -> Option<DateTime<Utc>> {
        self.inner.tracker.lock().last_recovery_time
    }

    pub fn state(&self) -> RecoveryState {
        let tracker = self.inner.tracker.lock();
        RecoveryState {
            is_running: self.is_running(),
            recovery_count: tracker.recovery_count,
            last_recovery_time: tracker.last_recovery_time,
            attempts: tracker.attempts,
        }
    }

    async fn run(self, stop: flume::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.inner.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.check_once().await;
                    log::trace!("Watchdog check: {outcome:?}");
                }
                _ = stop.recv_async() => break,
            }
        }
    }

    /// Compare desired and actual polling state once and act on it.
    pub async fn check_once(&self) -> CheckOutcome {
        let desired = match self.inner.runtime.desired_polling_enabled().await {
            Ok(desired) => desired,
            Err(err) => {
                log::warn!("Watchdog could not read the desired polling state: {err:#}");
                return CheckOutcome::Unknown;
            }
        };
        if !desired {
            self.inner.tracker.lock().stopped_ticks = 0;
            return CheckOutcome::Disabled;
        }
        if self.inner.orchestrator.is_polling_active() {
            self.inner.tracker.lock().stopped_ticks = 0;
            return CheckOutcome::Healthy;
        }

        let sequence = {
            let mut tracker = self.inner.tracker.lock();
            tracker.stopped_ticks = tracker.stopped_ticks.saturating_add(1);
            if tracker.stopped_ticks <= self.inner.options.grace_ticks {
                log::debug!(
                    "Polling seen stopped ({}/{} grace tick(s))",
                    tracker.stopped_ticks,
                    self.inner.options.grace_ticks
                );
                return CheckOutcome::Waiting;
            }
            if let Some(at) = tracker.last_attempt_at {
                if at.elapsed() < self.inner.options.cooldown {
                    return CheckOutcome::CoolingDown;
                }
            }
            tracker.last_attempt_at = Some(Instant::now());
            tracker.attempts += 1;
            tracker.attempts
        };

        log::warn!("Polling is wanted but stopped; recovery attempt #{sequence}");
        match self.inner.orchestrator.start().await {
            Ok(started) => {
                let mut tracker = self.inner.tracker.lock();
                tracker.stopped_ticks = 0;
                if !started {
                    // Someone else started it first.
                    return CheckOutcome::Healthy;
                }
                tracker.recovery_count += 1;
                tracker.last_recovery_time = Some(Utc::now());
                drop(tracker);

                log::warn!("Polling recovered (attempt #{sequence})");
                self.inner
                    .events
                    .emit(GatewayEvent::RecoveryPerformed { sequence });
                CheckOutcome::Recovered
            }
            Err(err) => {
                log::error!("Recovery attempt #{sequence} failed: {err:#}");
                self.inner.events.emit(GatewayEvent::RecoveryFailed {
                    sequence,
                    message: format!("{err:#}"),
                });
                CheckOutcome::Failed
            }
        }
    }
}
