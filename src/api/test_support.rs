//! Test doubles shared by the unit tests of the api modules.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{Notify, Semaphore};

use super::{
    queue::RetryPolicy,
    traits::{PollDescriptor, PortCommandMap, PortCommandTarget},
};
use crate::protocol::{
    error::TransportError,
    transaction::{BusRequest, FunctionCode, Payload, TransactionData},
    transport::Transport,
};

pub fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_millis(200),
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
    }
}

/// Transport that records what it was asked to send and replies from a script.
#[derive(Default)]
pub struct ScriptedTransport {
    sent: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    started: Notify,
    failures: Mutex<VecDeque<TransportError>>,
    always: Option<TransportError>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransport {
    /// Every exchange blocks until `release` hands out a permit.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn always_failing(err: TransportError) -> Self {
        Self {
            always: Some(err),
            ..Default::default()
        }
    }

    /// Fail the next `count` exchanges with `err`.
    pub fn fail_next(&self, count: usize, err: TransportError) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(err.clone());
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    /// Resolves once an exchange has started since the last call.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn sent_ids(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<bool, TransportError> {
        Ok(true)
    }

    async fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        true
    }

    async fn send_transaction(
        &self,
        request: &BusRequest,
    ) -> Result<TransactionData, TransportError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.sent.lock().push(request.id.clone());
        self.started.notify_one();

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(err) = &self.always {
            return Err(err.clone());
        }
        let scripted = self.failures.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        Ok(match &request.payload {
            Payload::Count(count) => TransactionData::Registers {
                address: request.address,
                values: (0..*count).map(|i| request.address + i).collect(),
            },
            Payload::Values(values) => TransactionData::Written {
                address: request.address,
                quantity: values.len() as u16,
            },
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Port map with a fixed `DO1/POWER` coil and `AO1/SETPOINT` register.
pub struct FixedPortMap;

#[async_trait]
impl PortCommandMap for FixedPortMap {
    async fn resolve(
        &self,
        port: &str,
        command: &str,
    ) -> anyhow::Result<Option<PortCommandTarget>> {
        Ok(match (port, command) {
            ("DO1", "POWER") => Some(PortCommandTarget {
                unit: 1,
                function: FunctionCode::WriteSingleCoil,
                address: 0,
            }),
            ("AO1", "SETPOINT") => Some(PortCommandTarget {
                unit: 2,
                function: FunctionCode::WriteSingleRegister,
                address: 40,
            }),
            ("AI1", "TEMP") => Some(PortCommandTarget {
                unit: 2,
                function: FunctionCode::ReadInputRegisters,
                address: 0,
            }),
            _ => None,
        })
    }
}

pub fn descriptor(device: &str, unit: u8, command: &str, address: u16) -> PollDescriptor {
    PollDescriptor {
        device: device.into(),
        unit,
        command: command.into(),
        function: FunctionCode::ReadHoldingRegisters,
        address,
        count: 1,
    }
}

/// Registry returning a fixed list, or failing on demand.
#[derive(Default)]
pub struct FixedRegistry {
    descriptors: Mutex<Vec<PollDescriptor>>,
    failing: std::sync::atomic::AtomicBool,
    loads: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl FixedRegistry {
    pub fn new(descriptors: Vec<PollDescriptor>) -> Self {
        Self {
            descriptors: Mutex::new(descriptors),
            ..Default::default()
        }
    }

    /// Every load blocks until `release_loads` hands out a permit.
    pub fn gated(descriptors: Vec<PollDescriptor>) -> Self {
        Self {
            descriptors: Mutex::new(descriptors),
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Default::default()
        }
    }

    pub fn release_loads(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl super::traits::DeviceRegistry for FixedRegistry {
    async fn list_poll_descriptors(&self) -> anyhow::Result<Vec<PollDescriptor>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("device registry offline");
        }
        Ok(self.descriptors.lock().clone())
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
