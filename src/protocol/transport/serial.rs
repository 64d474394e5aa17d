use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use super::Transport;
use crate::{
    core::task_manager::spawn_blocking_task,
    protocol::{
        error::TransportError,
        modbus::{encode_request, read_rtu_reply},
        transaction::{BusRequest, TransactionData},
    },
};

type PortHandle = Arc<Mutex<Option<Box<dyn serialport::SerialPort>>>>;

/// Modbus RTU over a local serial port.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    port: PortHandle,
}

impl SerialTransport {
    pub fn new(port_name: String, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout,
            port: Arc::new(Mutex::new(None)),
        }
    }
}

/// Marks an exchange as abandoned once the awaiting future is dropped, as
/// happens when the queue's per-attempt timeout fires.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Write one request frame and read its reply, unless the exchange was given
/// up while waiting for the port.
fn transmit<P: Read + Write + ?Sized>(
    port: &mut P,
    frame: &[u8],
    abandoned: &AtomicBool,
    timeout_ms: u64,
) -> Result<Vec<u8>, TransportError> {
    if abandoned.load(Ordering::SeqCst) {
        log::debug!("Skipping stale exchange without writing");
        return Err(TransportError::Timeout(timeout_ms));
    }
    port.write_all(frame)?;
    port.flush()?;
    read_rtu_reply(port)
}

/// Open a serial port with the requested timeout, enabling exclusive access on Unix systems.
fn open_serial_port(
    port: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn serialport::SerialPort>, TransportError> {
    let builder = serialport::new(port, baud_rate).timeout(timeout);

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| TransportError::Io(format!("failed to open port {port}: {err}")))?;
        handle.set_exclusive(true).map_err(|err| {
            TransportError::Io(format!(
                "failed to acquire exclusive access to {port}: {err}"
            ))
        })?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder
            .open()
            .map_err(|err| TransportError::Io(format!("failed to open port {port}: {err}")))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&self) -> Result<bool, TransportError> {
        if self.is_connected() {
            return Ok(true);
        }

        let port_name = self.port_name.clone();
        let baud_rate = self.baud_rate;
        let timeout = self.timeout;
        let slot = self.port.clone();

        spawn_blocking_task(move || match open_serial_port(&port_name, baud_rate, timeout) {
            Ok(handle) => {
                *slot.lock() = Some(handle);
                log::info!("Opened {port_name} at {baud_rate} baud");
                Ok(true)
            }
            Err(err) => {
                log::warn!("Could not open {port_name}: {err}");
                Ok(false)
            }
        })
        .await
        .map_err(|err| TransportError::Io(format!("open task failed: {err}")))?
    }

    async fn disconnect(&self) {
        if self.port.lock().take().is_some() {
            log::info!("Closed {}", self.port_name);
        }
    }

    fn is_connected(&self) -> bool {
        self.port.lock().is_some()
    }

    async fn send_transaction(
        &self,
        request: &BusRequest,
    ) -> Result<TransactionData, TransportError> {
        if !self.is_connected() && !self.connect().await? {
            return Err(TransportError::Disconnected);
        }

        let exchange = encode_request(request)?;
        let slot = self.port.clone();
        let timeout_ms = self.timeout.as_millis() as u64;
        let abandoned = Arc::new(AtomicBool::new(false));
        let _abandon = AbandonOnDrop(abandoned.clone());
        let id = request.id.clone();

        spawn_blocking_task(move || {
            let mut guard = slot.lock();
            let port = guard.as_mut().ok_or(TransportError::Disconnected)?;

            // Drop stale bytes left by an earlier timed-out exchange.
            if let Err(err) = port.clear(serialport::ClearBuffer::Input) {
                log::debug!("Failed to clear input buffer: {err}");
            }

            let result = transmit(port.as_mut(), &exchange.frame, &abandoned, timeout_ms);
            if abandoned.load(Ordering::SeqCst) {
                log::debug!("Exchange {id} finished after its caller gave up");
            }

            match result {
                Ok(reply) => exchange.decode_reply(&reply),
                Err(TransportError::Timeout(_)) => Err(TransportError::Timeout(timeout_ms)),
                Err(TransportError::Disconnected) => {
                    *guard = None;
                    Err(TransportError::Disconnected)
                }
                Err(err) => Err(err),
            }
        })
        .await
        .map_err(|err| TransportError::Io(format!("bus task failed: {err}")))?
    }

    fn name(&self) -> &str {
        &self.port_name
    }
}
