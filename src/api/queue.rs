//! Priority command queue in front of the bus transport
//!
//! All queue state lives inside one worker task. Callers reach it through a
//! bounded `flume` channel and get their result back through a `oneshot`
//! channel, which can only ever be completed once. The worker keeps at most
//! one transaction in flight, so the transport never sees overlapping calls.
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    core::{
        config::QueueConfig,
        logs::{EventSink, GatewayEvent},
        task_manager::{join_task, spawn_task},
    },
    protocol::{
        error::{GatewayError, TransportError},
        transaction::{Priority, Transaction, TransactionOutcome},
        transport::Transport,
    },
};

pub type TransactionResult = Result<TransactionOutcome, GatewayError>;

/// Timeout and retry policy applied to every transaction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from `backoff_base`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    /// Submissions turned away because `capacity` transactions were already pending.
    pub rejected: u64,
    pub pending: usize,
    pub busy: bool,
}

#[derive(Default)]
struct QueueShared {
    busy: AtomicBool,
    pending: AtomicUsize,
    counters: Mutex<QueueStats>,
}

struct PendingTransaction {
    transaction: Transaction,
    completion: oneshot::Sender<TransactionResult>,
}

impl PendingTransaction {
    fn id(&self) -> &str {
        self.transaction.id()
    }

    fn complete(self, result: TransactionResult) {
        if self.completion.send(result).is_err() {
            log::debug!(
                "Submitter of {} dropped its ticket before completion",
                self.transaction.id()
            );
        }
    }
}

enum QueueCommand {
    Submit(PendingTransaction),
    Clear(oneshot::Sender<usize>),
    Shutdown,
}

/// Handle on a submitted transaction.
pub struct Ticket {
    id: String,
    receiver: oneshot::Receiver<TransactionResult>,
}

impl Ticket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the transaction to complete, fail or be cancelled.
    pub async fn wait(self) -> TransactionResult {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::QueueUnavailable(format!(
                "queue worker stopped before {} completed",
                self.id
            ))),
        }
    }
}

/// Pending transactions, FIFO within each priority tier.
#[derive(Default)]
struct PendingList {
    high: VecDeque<PendingTransaction>,
    normal: VecDeque<PendingTransaction>,
}

impl PendingList {
    fn push(&mut self, pending: PendingTransaction) {
        match pending.transaction.priority {
            Priority::High => self.high.push_back(pending),
            Priority::Normal => self.normal.push_back(pending),
        }
    }

    fn pop(&mut self) -> Option<PendingTransaction> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    fn drain(&mut self) -> Vec<PendingTransaction> {
        self.high.drain(..).chain(self.normal.drain(..)).collect()
    }
}

/// Cloneable handle to the queue worker.
#[derive(Clone)]
pub struct CommandQueue {
    sender: flume::Sender<QueueCommand>,
    shared: Arc<QueueShared>,
    worker: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl CommandQueue {
    /// Start the worker task that owns `transport`. Must be called inside a tokio runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        capacity: usize,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = flume::bounded(capacity);
        let shared = Arc::new(QueueShared::default());
        let worker = Worker {
            receiver,
            capacity,
            transport,
            policy,
            shared: shared.clone(),
            events,
        };
        let handle = spawn_task("queue worker", worker.run());

        Self {
            sender,
            shared,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    fn pending(mut transaction: Transaction) -> (PendingTransaction, Ticket) {
        transaction.submitted_at = Instant::now();
        let (completion, receiver) = oneshot::channel();
        let ticket = Ticket {
            id: transaction.id().to_string(),
            receiver,
        };
        (
            PendingTransaction {
                transaction,
                completion,
            },
            ticket,
        )
    }

    /// Hand a transaction to the queue, waiting for channel space if needed.
    pub async fn enqueue(&self, transaction: Transaction) -> Result<Ticket, GatewayError> {
        let (pending, ticket) = Self::pending(transaction);
        self.sender
            .send_async(QueueCommand::Submit(pending))
            .await
            .map_err(|_| GatewayError::QueueUnavailable("queue worker stopped".into()))?;
        Ok(ticket)
    }

    /// Hand a transaction to the queue without suspending.
    pub fn try_enqueue(&self, transaction: Transaction) -> Result<Ticket, GatewayError> {
        let (pending, ticket) = Self::pending(transaction);
        self.sender
            .try_send(QueueCommand::Submit(pending))
            .map_err(|err| match err {
                flume::TrySendError::Full(_) => GatewayError::QueueFull,
                flume::TrySendError::Disconnected(_) => {
                    GatewayError::QueueUnavailable("queue worker stopped".into())
                }
            })?;
        Ok(ticket)
    }

    /// Submit a transaction and wait for its result.
    pub async fn submit(&self, transaction: Transaction) -> TransactionResult {
        self.enqueue(transaction).await?.wait().await
    }

    /// Cancel every pending transaction. The one on the bus, if any, is left to finish.
    pub async fn clear(&self) -> usize {
        let (reply, receiver) = oneshot::channel();
        if self.sender.send_async(QueueCommand::Clear(reply)).await.is_err() {
            return 0;
        }
        receiver.await.unwrap_or(0)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = *self.shared.counters.lock();
        stats.pending = self.shared.pending.load(Ordering::SeqCst);
        stats.busy = self.is_busy();
        stats
    }

    /// Cancel pending work, let the in-flight transaction finish and stop the worker.
    pub async fn shutdown(&self) {
        if self.sender.send_async(QueueCommand::Shutdown).await.is_err() {
            return;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            join_task("queue worker", handle).await;
        }
    }
}

struct Worker {
    receiver: flume::Receiver<QueueCommand>,
    /// Most transactions allowed to wait behind the one on the bus.
    capacity: usize,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    shared: Arc<QueueShared>,
    events: Arc<dyn EventSink>,
}

/// Wait on the in-flight exchange, or forever when the bus is idle.
async fn drive(in_flight: &mut Option<BoxFuture<'static, ()>>) {
    match in_flight.as_mut() {
        Some(exchange) => exchange.await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(self) {
        match self.transport.connect().await {
            Ok(true) => log::info!("Bus transport {} connected", self.transport.name()),
            Ok(false) => log::warn!(
                "Bus transport {} not connected yet; will retry on first transaction",
                self.transport.name()
            ),
            Err(err) => log::warn!("Bus transport {} failed to connect: {err}", self.transport.name()),
        }

        let mut pending = PendingList::default();
        let mut in_flight: Option<BoxFuture<'static, ()>> = None;
        let mut accepting = true;

        loop {
            // Absorb everything already submitted so the dispatch decision sees
            // every high-priority entry, not just the ones received so far.
            while accepting {
                match self.receiver.try_recv() {
                    Ok(command) => accepting = self.handle(command, &mut pending),
                    Err(flume::TryRecvError::Empty) => break,
                    Err(flume::TryRecvError::Disconnected) => accepting = false,
                }
            }

            if in_flight.is_none() {
                if let Some(next) = pending.pop() {
                    self.shared.busy.store(true, Ordering::SeqCst);
                    in_flight = Some(
                        execute(
                            self.transport.clone(),
                            self.policy.clone(),
                            self.shared.clone(),
                            self.events.clone(),
                            next,
                        )
                        .boxed(),
                    );
                } else {
                    self.shared.busy.store(false, Ordering::SeqCst);
                }
            }
            self.shared.pending.store(pending.len(), Ordering::SeqCst);

            if !accepting && in_flight.is_none() && pending.len() == 0 {
                break;
            }

            tokio::select! {
                _ = drive(&mut in_flight) => {
                    in_flight = None;
                }
                command = self.receiver.recv_async(), if accepting => match command {
                    Ok(command) => accepting = self.handle(command, &mut pending),
                    Err(_) => accepting = false,
                },
            }
        }

        self.shared.busy.store(false, Ordering::SeqCst);
        self.transport.disconnect().await;
        log::info!("Command queue worker stopped");
    }

    /// Returns `false` once the queue should stop accepting commands.
    fn handle(&self, command: QueueCommand, pending: &mut PendingList) -> bool {
        match command {
            QueueCommand::Submit(entry) if pending.len() >= self.capacity => {
                self.shared.counters.lock().rejected += 1;
                log::warn!(
                    "Rejected {}: {} transaction(s) already pending",
                    entry.id(),
                    pending.len()
                );
                entry.complete(Err(GatewayError::QueueFull));
                true
            }
            QueueCommand::Submit(entry) => {
                self.shared.counters.lock().submitted += 1;
                log::debug!(
                    "Queued {} ({:?}, {:?} priority, unit {}, fc {}, addr {})",
                    entry.id(),
                    entry.transaction.kind(),
                    entry.transaction.priority,
                    entry.transaction.request.unit,
                    entry.transaction.request.function,
                    entry.transaction.request.address,
                );
                pending.push(entry);
                true
            }
            QueueCommand::Clear(reply) => {
                let cancelled = self.cancel_all(pending);
                let _ = reply.send(cancelled);
                true
            }
            QueueCommand::Shutdown => {
                self.cancel_all(pending);
                false
            }
        }
    }

    fn cancel_all(&self, pending: &mut PendingList) -> usize {
        let drained = pending.drain();
        let cancelled = drained.len();
        self.shared.counters.lock().cancelled += cancelled as u64;
        for entry in drained {
            let id = entry.id().to_string();
            entry.complete(Err(GatewayError::Cancelled(id)));
        }
        if cancelled > 0 {
            log::info!("Cancelled {cancelled} pending transaction(s)");
        }
        cancelled
    }
}

/// Run one transaction to completion, retrying link-level failures.
async fn execute(
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    shared: Arc<QueueShared>,
    events: Arc<dyn EventSink>,
    entry: PendingTransaction,
) {
    let request = &entry.transaction.request;
    let queue_wait = entry.transaction.submitted_at.elapsed();
    let mut attempt = 0u32;

    let result = loop {
        attempt += 1;
        let started = Instant::now();
        let reply =
            match tokio::time::timeout(policy.timeout, transport.send_transaction(request)).await {
                Ok(reply) => reply,
                Err(_) => Err(TransportError::Timeout(policy.timeout.as_millis() as u64)),
            };

        match reply {
            Ok(data) => {
                break Ok(TransactionOutcome {
                    id: request.id.clone(),
                    data,
                    attempts: attempt,
                    queue_wait,
                    latency: started.elapsed(),
                })
            }
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                log::warn!(
                    "Attempt {attempt}/{} for {} failed: {err}; retrying in {} ms",
                    policy.max_attempts,
                    request.id,
                    delay.as_millis()
                );
                shared.counters.lock().retries += 1;
                tokio::time::sleep(delay).await;
            }
            Err(err) => break Err(GatewayError::from_transport(err, attempt)),
        }
    };

    match &result {
        Ok(_) => shared.counters.lock().succeeded += 1,
        Err(err) => {
            shared.counters.lock().failed += 1;
            events.emit(GatewayEvent::TransactionFailed {
                id: request.id.clone(),
                kind: err.kind(),
                attempts: attempt,
                message: err.to_string(),
            });
        }
    }

    entry.complete(result);
}
