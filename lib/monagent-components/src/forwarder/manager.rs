use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use monagent_core::observability::MetricsBuilder;
use monagent_error::{error_chain_string, generic_error, GenericError};
use tokio::{
    select,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{telemetry::Telemetry, DeliveryEndpoint, ExponentialBackoff, ForwarderConfiguration, Transaction};

/// Result of appending a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppendOutcome {
    /// Identifier assigned to the appended transaction.
    pub id: u64,

    /// Number of transactions evicted to get back under the size ceiling.
    pub evicted: usize,
}

/// How a flush cycle ended.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FlushStatus {
    /// Every eligible transaction, up to the per-cycle budget, was attempted.
    #[default]
    Completed,

    /// The previous attempt was too recent, so nothing was attempted.
    Throttled,

    /// Another flush was already running.
    AlreadyFlushing,

    /// Shutdown was requested before every eligible transaction was attempted.
    Cancelled,
}

/// What a flush cycle did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushSummary {
    /// How the cycle ended.
    pub status: FlushStatus,

    /// Delivery attempts made.
    pub attempted: usize,

    /// Attempts that succeeded.
    pub succeeded: usize,

    /// Attempts that failed.
    pub failed: usize,

    /// Transactions dropped for exceeding the retry limit or the maximum age.
    pub dropped: usize,
}

enum AttemptOutcome {
    Delivered,
    Retrying,
    Dropped,
    Gone,
}

struct QueueState {
    // Ordered by id, which is also arrival order.
    pending: VecDeque<Transaction>,
    total_bytes: u64,
    next_id: u64,
    last_attempt: Option<Instant>,
}

impl QueueState {
    fn position(&self, id: u64) -> Option<usize> {
        self.pending.binary_search_by_key(&id, Transaction::id).ok()
    }

    fn remove(&mut self, id: u64) -> Option<Transaction> {
        let idx = self.position(id)?;
        let tx = self.pending.remove(idx)?;
        self.total_bytes -= tx.size_bytes();
        Some(tx)
    }

    fn pop_oldest(&mut self) -> Option<Transaction> {
        let tx = self.pending.pop_front()?;
        self.total_bytes -= tx.size_bytes();
        Some(tx)
    }
}

/// A bounded, retrying queue of transactions.
///
/// Producers [`append`][Self::append] transactions from any task. A periodic driver calls [`flush`][Self::flush],
/// which attempts delivery of queued transactions, oldest first. Successful transactions are removed, failed ones stay
/// queued and are retried after an exponential backoff, until they either hit the retry limit or grow too old.
///
/// The total size of queued payloads never exceeds the configured ceiling: appending past it evicts the oldest
/// transactions, whether or not they were ever attempted. Only one flush runs at a time, and no lock is held while a
/// delivery is in flight, so producers are never blocked by a slow endpoint.
pub struct TransactionManager {
    state: Mutex<QueueState>,
    flush_guard: tokio::sync::Mutex<()>,
    endpoint: Arc<dyn DeliveryEndpoint>,
    backoff: ExponentialBackoff,
    max_queue_size_bytes: u64,
    throttle_delay: Duration,
    max_retries: u32,
    max_age: Duration,
    backlog_send_rate: usize,
    request_timeout: Duration,
    telemetry: Telemetry,
}

impl TransactionManager {
    /// Creates an empty manager delivering to `endpoint`.
    pub fn new(config: &ForwarderConfiguration, endpoint: Arc<dyn DeliveryEndpoint>) -> Self {
        let builder = MetricsBuilder::for_component("forwarder").add_default_tag(("endpoint", endpoint.name().to_string()));

        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                total_bytes: 0,
                next_id: 1,
                last_attempt: None,
            }),
            flush_guard: tokio::sync::Mutex::new(()),
            endpoint,
            backoff: config.retry_backoff(),
            max_queue_size_bytes: config.max_queue_size_bytes(),
            throttle_delay: config.throttle_delay(),
            max_retries: config.max_retries(),
            max_age: config.max_transaction_age(),
            backlog_send_rate: config.backlog_send_rate(),
            request_timeout: config.request_timeout(),
            telemetry: Telemetry::new(&builder),
        }
    }

    /// Replaces the retry backoff policy.
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of queued transactions.
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    /// Returns `true` if no transactions are queued.
    pub fn is_empty(&self) -> bool {
        self.state().pending.is_empty()
    }

    /// Returns the total size of queued payloads, in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.state().total_bytes
    }

    /// Appends a transaction to the tail of the queue.
    ///
    /// If the queue is now over its size ceiling, the oldest transactions are evicted until it is not. A transaction
    /// larger than the ceiling on its own therefore evicts everything, itself included.
    pub fn append(&self, mut tx: Transaction) -> AppendOutcome {
        let mut state = self.state();

        let id = state.next_id;
        state.next_id += 1;
        tx.assign_id(id);

        state.total_bytes += tx.size_bytes();
        state.pending.push_back(tx);
        self.telemetry.transaction_appended();

        let mut evicted = 0;
        let mut evicted_bytes = 0;
        while state.total_bytes > self.max_queue_size_bytes {
            match state.pop_oldest() {
                Some(oldest) => {
                    evicted += 1;
                    evicted_bytes += oldest.size_bytes();
                }
                None => break,
            }
        }

        if evicted > 0 {
            warn!(
                evicted,
                evicted_bytes,
                max_queue_size_bytes = self.max_queue_size_bytes,
                "Transaction queue full. Evicted oldest transactions."
            );
            self.telemetry.transactions_evicted(evicted);
        }

        self.telemetry.set_queue_depth(state.pending.len(), state.total_bytes);
        AppendOutcome { id, evicted }
    }

    /// Runs one flush cycle.
    ///
    /// The cycle is skipped if another flush is running, or if less than the throttle delay has passed since the last
    /// delivery attempt. Otherwise, transactions older than the maximum age are dropped, and the transactions that are
    /// due are attempted oldest first, up to the per-cycle budget. `shutdown` is checked before every attempt.
    pub async fn flush(&self, shutdown: &CancellationToken) -> FlushSummary {
        let mut summary = FlushSummary::default();

        let Ok(_flushing) = self.flush_guard.try_lock() else {
            debug!("Flush already in progress. Skipping cycle.");
            summary.status = FlushStatus::AlreadyFlushing;
            return summary;
        };

        let candidates = match self.prepare_cycle() {
            Some((candidates, expired)) => {
                summary.dropped += expired;
                candidates
            }
            None => {
                summary.status = FlushStatus::Throttled;
                return summary;
            }
        };

        for id in candidates {
            if shutdown.is_cancelled() {
                debug!("Shutdown requested. Stopping flush cycle.");
                summary.status = FlushStatus::Cancelled;
                break;
            }

            let Some((payload, size)) = self.begin_attempt(id) else {
                continue;
            };

            summary.attempted += 1;
            let started = Instant::now();
            let result = self.deliver(payload).await;
            match self.complete_attempt(id, size, result, started.elapsed()) {
                AttemptOutcome::Delivered => summary.succeeded += 1,
                AttemptOutcome::Retrying | AttemptOutcome::Gone => summary.failed += 1,
                AttemptOutcome::Dropped => {
                    summary.failed += 1;
                    summary.dropped += 1;
                }
            }
        }

        if summary.failed > 0 {
            warn!(
                attempted = summary.attempted,
                failed = summary.failed,
                dropped = summary.dropped,
                "Failed to deliver some transactions."
            );
        } else if summary.attempted > 0 {
            debug!(attempted = summary.attempted, "Flushed transactions.");
        }

        summary
    }

    /// Applies the throttle, drops expired transactions, and picks the ids to attempt this cycle.
    ///
    /// Returns `None` if the cycle is throttled.
    fn prepare_cycle(&self) -> Option<(Vec<u64>, usize)> {
        let now = Instant::now();
        let mut state = self.state();

        if let Some(last_attempt) = state.last_attempt {
            let elapsed = now.saturating_duration_since(last_attempt);
            if elapsed < self.throttle_delay {
                debug!(?elapsed, throttle_delay = ?self.throttle_delay, "Throttling flush cycle.");
                return None;
            }
        }

        let expired = self.drop_expired(&mut state, now);
        let candidates = state
            .pending
            .iter()
            .filter(|tx| tx.is_due(now))
            .map(Transaction::id)
            .take(self.backlog_send_rate)
            .collect();

        Some((candidates, expired))
    }

    fn drop_expired(&self, state: &mut QueueState, now: Instant) -> usize {
        if self.max_age.is_zero() {
            return 0;
        }

        let mut expired = 0;
        let mut expired_bytes = 0;
        state.pending.retain(|tx| {
            let keep = tx.age(now) < self.max_age;
            if !keep {
                expired += 1;
                expired_bytes += tx.size_bytes();
            }
            keep
        });

        if expired > 0 {
            state.total_bytes -= expired_bytes;
            warn!(
                expired,
                max_age = ?self.max_age,
                "Dropping transactions that could not be delivered before reaching the maximum age."
            );
            for _ in 0..expired {
                self.telemetry.transaction_dropped();
            }
            self.telemetry.set_queue_depth(state.pending.len(), state.total_bytes);
        }

        expired
    }

    fn begin_attempt(&self, id: u64) -> Option<(Bytes, u64)> {
        let mut state = self.state();
        let idx = state.position(id)?;
        let tx = &state.pending[idx];
        let attempt = (tx.payload().clone(), tx.size_bytes());
        state.last_attempt = Some(Instant::now());
        Some(attempt)
    }

    /// Posts `payload` on its own task, so that neither a panic nor a hung endpoint can escape the attempt.
    async fn deliver(&self, payload: Bytes) -> Result<(), GenericError> {
        let endpoint = Arc::clone(&self.endpoint);
        let request_timeout = self.request_timeout;
        let attempt = tokio::spawn(async move { tokio::time::timeout(request_timeout, endpoint.post(payload)).await });

        match attempt.await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(generic_error!(
                "Delivery attempt timed out after {:?}.",
                request_timeout
            )),
            Err(e) => Err(generic_error!("Delivery attempt panicked: {}", e)),
        }
    }

    fn complete_attempt(
        &self, id: u64, size: u64, result: Result<(), GenericError>, latency: Duration,
    ) -> AttemptOutcome {
        let now = Instant::now();
        let mut state = self.state();

        let outcome = match result {
            Ok(()) => {
                // The transaction may have been evicted while in flight. It was delivered all the same.
                state.remove(id);
                self.telemetry.transaction_sent(size, latency);
                AttemptOutcome::Delivered
            }
            Err(e) => {
                self.telemetry.transaction_failed();
                match state.position(id) {
                    None => {
                        debug!(id, error = %error_chain_string(&e), "Delivery failed for a transaction evicted while in flight.");
                        AttemptOutcome::Gone
                    }
                    Some(idx) => {
                        let error_count = state.pending[idx].error_count().saturating_add(1);
                        let age = state.pending[idx].age(now);

                        if error_count >= self.max_retries || (!self.max_age.is_zero() && age >= self.max_age) {
                            state.remove(id);
                            self.telemetry.transaction_dropped();
                            warn!(
                                id,
                                error_count,
                                ?age,
                                error = %error_chain_string(&e),
                                "Dropping transaction after repeated delivery failures."
                            );
                            AttemptOutcome::Dropped
                        } else {
                            let delay = self.backoff.get_backoff_duration(error_count);
                            state.pending[idx].record_failure(now, delay);
                            debug!(
                                id,
                                error_count,
                                retry_in = ?delay,
                                error = %error_chain_string(&e),
                                "Delivery failed. Transaction will be retried."
                            );
                            AttemptOutcome::Retrying
                        }
                    }
                }
            }
        };

        self.telemetry.set_queue_depth(state.pending.len(), state.total_bytes);
        outcome
    }

    /// Flushes the queue every `flush_interval` until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, flush_interval: Duration, shutdown: CancellationToken) {
        let mut ticker = interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(?flush_interval, "Forwarder started.");

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush(&shutdown).await;
                }
            }
        }

        info!(queued = self.len(), "Forwarder stopped.");
    }
}
