use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rmodbus::server::{context::ModbusContext, storage::ModbusStorageSmall};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use super::Transport;
use crate::{
    core::config::MockConfig,
    protocol::{
        error::TransportError,
        transaction::{BusRequest, Payload, RegisterMode, TransactionData, TransactionKind},
    },
};

const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Fixed seed for reproducible runs; entropy-seeded when absent.
    pub seed: Option<u64>,
    pub latency: Duration,
    /// Probability in `0.0..=1.0` that an exchange times out.
    pub failure_rate: f64,
    /// Refresh input registers and discrete inputs with random data on every read.
    pub randomized: bool,
}

impl From<&MockConfig> for MockOptions {
    fn from(config: &MockConfig) -> Self {
        Self {
            seed: config.seed,
            latency: Duration::from_millis(config.latency_ms),
            failure_rate: config.failure_rate.clamp(0.0, 1.0),
            randomized: config.randomized,
        }
    }
}

/// Simulated bus. Every unit is backed by an `rmodbus` register storage, so
/// writes are visible to later reads.
pub struct MockTransport {
    options: MockOptions,
    rng: Mutex<StdRng>,
    units: Mutex<HashMap<u8, ModbusStorageSmall>>,
    connected: AtomicBool,
    exchanges: AtomicU64,
}

impl MockTransport {
    pub fn new(options: MockOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            options,
            rng: Mutex::new(rng),
            units: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Number of exchanges attempted so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Preload a word register table entry.
    pub fn set_register(&self, unit: u8, mode: RegisterMode, address: u16, value: u16) -> bool {
        let mut units = self.units.lock();
        let storage = units.entry(unit).or_insert_with(ModbusStorageSmall::new);
        let result = match mode {
            RegisterMode::Holding => storage.set_holding(address, value),
            RegisterMode::Input => storage.set_input(address, value),
            RegisterMode::Coils => storage.set_coil(address, value != 0),
            RegisterMode::DiscreteInputs => storage.set_discrete(address, value != 0),
        };
        result.is_ok()
    }

    fn exchange(&self, request: &BusRequest) -> Result<TransactionData, TransportError> {
        let mode = request.function.register_mode();
        let mut units = self.units.lock();
        let storage = units.entry(request.unit).or_insert_with(ModbusStorageSmall::new);
        let rejected = TransportError::Exception {
            function: request.function.code(),
            code: ILLEGAL_DATA_ADDRESS,
        };

        match (&request.payload, request.kind()) {
            (Payload::Count(count), TransactionKind::Read) => {
                let sensor_table = matches!(mode, RegisterMode::Input | RegisterMode::DiscreteInputs);
                if self.options.randomized && sensor_table {
                    let mut rng = self.rng.lock();
                    for offset in 0..*count {
                        let address = request.address.wrapping_add(offset);
                        let written = match mode {
                            RegisterMode::Input => storage.set_input(address, rng.random()),
                            _ => storage.set_discrete(address, rng.random_bool(0.5)),
                        };
                        written.map_err(|_| rejected.clone())?;
                    }
                }

                let mut values = Vec::with_capacity(*count as usize);
                for offset in 0..*count {
                    let address = request.address.wrapping_add(offset);
                    let value = match mode {
                        RegisterMode::Holding => storage.get_holding(address),
                        RegisterMode::Input => storage.get_input(address),
                        RegisterMode::Coils => storage.get_coil(address).map(u16::from),
                        RegisterMode::DiscreteInputs => storage.get_discrete(address).map(u16::from),
                    };
                    values.push(value.map_err(|_| rejected.clone())?);
                }
                Ok(TransactionData::Registers {
                    address: request.address,
                    values,
                })
            }
            (Payload::Values(values), TransactionKind::Write) => {
                for (offset, value) in values.iter().enumerate() {
                    let address = request.address.wrapping_add(offset as u16);
                    let written = match mode {
                        RegisterMode::Coils => storage.set_coil(address, *value != 0),
                        _ => storage.set_holding(address, *value),
                    };
                    written.map_err(|_| rejected.clone())?;
                }
                Ok(TransactionData::Written {
                    address: request.address,
                    quantity: values.len() as u16,
                })
            }
            (payload, _) => Err(TransportError::Malformed(format!(
                "payload {payload:?} does not fit function {}",
                request.function
            ))),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<bool, TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_transaction(
        &self,
        request: &BusRequest,
    ) -> Result<TransactionData, TransportError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            self.connect().await?;
        }

        if !self.options.latency.is_zero() {
            tokio::time::sleep(self.options.latency).await;
        }

        let failed = self.options.failure_rate > 0.0
            && self.rng.lock().random_bool(self.options.failure_rate);
        if failed {
            log::debug!("Simulated timeout for {}", request.id);
            return Err(TransportError::Timeout(self.options.latency.as_millis() as u64));
        }

        self.exchange(request)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
