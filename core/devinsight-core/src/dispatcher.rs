//! Moves queued heartbeats to the collector.
//!
//! ```text
//! Idle ──tick/flush──▶ Draining ──batch──▶ Sending ──ok──▶ Acking ──▶ Draining
//!   ▲                     │ empty              │ retryable
//!   └─────────────────────┘                    └──────────▶ Backoff ──▶ Idle
//! ```
//!
//! A single cycle runs at a time (`cycle_lock`). Sends happen without holding
//! the queue's connection lock, so intake is never stalled by the network.
//! Flush requests set one coalesced flag; the worker consumes it between
//! cycles. Timer ticks also prune activity history past its retention.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backoff::{BackoffSnapshot, ExponentialBackoff};
use crate::config::DispatchConfig;
use crate::delivery::{DeliveryClient, DeliveryOutcome};
use crate::error::{InsightError, Result};
use crate::queue::DurableQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Draining,
    Sending,
    Acking,
    Backoff,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub batches_sent: usize,
    pub delivered_entries: usize,
    pub rejected_entries: usize,
    pub dropped_entries: usize,
    /// Set when the cycle ended in backoff.
    pub backoff_delay: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub phase: Phase,
    pub delivered_entries: u64,
    pub delivered_batches: u64,
    pub failed_attempts: u64,
    pub dropped_batches: u64,
    pub dropped_entries: u64,
    pub rejected_entries: u64,
    pub cycles_run: u64,
    pub flush_pending: bool,
    pub backoff: BackoffSnapshot,
    /// Seconds until the next retry when backing off.
    pub retry_in_secs: Option<u64>,
}

#[derive(Default)]
struct Counters {
    delivered_entries: AtomicU64,
    delivered_batches: AtomicU64,
    failed_attempts: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_entries: AtomicU64,
    rejected_entries: AtomicU64,
    cycles_run: AtomicU64,
}

struct DispatchState {
    phase: Phase,
    backoff: ExponentialBackoff,
    next_attempt_at: Option<Instant>,
    flush_pending: bool,
    shutdown: bool,
    /// Bumped by every `spawn`; a worker from an earlier run exits when it
    /// sees a newer value.
    generation: u64,
}

enum Trigger {
    Timer,
    Flush,
    Retry,
    Shutdown,
    Superseded,
}

pub struct Dispatcher {
    queue: Arc<DurableQueue>,
    client: Arc<dyn DeliveryClient>,
    batch_size: usize,
    interval: Duration,
    history_retention: Option<ChronoDuration>,
    cycle_lock: Mutex<()>,
    state: Mutex<DispatchState>,
    wake: Condvar,
    counters: Counters,
}

/// Owns the worker thread. Dropping it without [`DispatcherHandle::shutdown`]
/// leaves the worker running until the process exits.
pub struct DispatcherHandle {
    dispatcher: Arc<Dispatcher>,
    thread: Option<JoinHandle<()>>,
    finished: mpsc::Receiver<()>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<DurableQueue>,
        client: Arc<dyn DeliveryClient>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            queue,
            client,
            batch_size: config.batch_size.max(1),
            interval: config.interval(),
            history_retention: None,
            cycle_lock: Mutex::new(()),
            state: Mutex::new(DispatchState {
                phase: Phase::Idle,
                backoff: ExponentialBackoff::new(config.backoff_base(), config.backoff_max()),
                next_attempt_at: None,
                flush_pending: false,
                shutdown: false,
                generation: 0,
            }),
            wake: Condvar::new(),
            counters: Counters::default(),
        }
    }

    /// Keeps activity history for `retention`; older rows are pruned on
    /// every timer tick.
    pub fn with_history_retention(mut self, retention: ChronoDuration) -> Self {
        self.history_retention = Some(retention);
        self
    }

    /// Deletes activity history older than the retention window.
    pub fn prune_history(&self) -> Result<u64> {
        let retention = match self.history_retention {
            Some(retention) => retention,
            None => return Ok(0),
        };
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let pruned = self.queue.prune_activity(cutoff)?;
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned old activity history");
        }
        Ok(pruned)
    }

    /// Asks the worker for a cycle. Repeated requests before the worker
    /// picks one up collapse into a single cycle.
    pub fn request_flush(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.flush_pending = true;
        }
        self.wake.notify_all();
    }

    pub fn phase(&self) -> Phase {
        self.state
            .lock()
            .map(|state| state.phase)
            .unwrap_or(Phase::Idle)
    }

    pub fn backoff_snapshot(&self) -> BackoffSnapshot {
        match self.state.lock() {
            Ok(state) => state.backoff.snapshot(),
            Err(poisoned) => poisoned.into_inner().backoff.snapshot(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let (phase, flush_pending, backoff, retry_in_secs) = match self.state.lock() {
            Ok(state) => (
                state.phase,
                state.flush_pending,
                state.backoff.snapshot(),
                state
                    .next_attempt_at
                    .map(|at| at.saturating_duration_since(Instant::now()).as_secs()),
            ),
            Err(_) => (Phase::Idle, false, BackoffSnapshot::default(), None),
        };

        DispatchStats {
            phase,
            delivered_entries: self.counters.delivered_entries.load(Ordering::Relaxed),
            delivered_batches: self.counters.delivered_batches.load(Ordering::Relaxed),
            failed_attempts: self.counters.failed_attempts.load(Ordering::Relaxed),
            dropped_batches: self.counters.dropped_batches.load(Ordering::Relaxed),
            dropped_entries: self.counters.dropped_entries.load(Ordering::Relaxed),
            rejected_entries: self.counters.rejected_entries.load(Ordering::Relaxed),
            cycles_run: self.counters.cycles_run.load(Ordering::Relaxed),
            flush_pending,
            backoff,
            retry_in_secs,
        }
    }

    /// Runs one dispatch cycle: drain batches until the queue is empty or a
    /// send fails with a retryable outcome.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        let _cycle = self
            .cycle_lock
            .lock()
            .map_err(|_| InsightError::LockPoisoned)?;
        self.counters.cycles_run.fetch_add(1, Ordering::Relaxed);

        let mut report = CycleReport::default();
        let result = self.drain(&mut report);
        if result.is_err() {
            self.set_phase(Phase::Idle);
        }
        result.map(|_| report)
    }

    fn drain(&self, report: &mut CycleReport) -> Result<()> {
        loop {
            self.set_phase(Phase::Draining);
            let batch = self.queue.peek_batch(self.batch_size)?;
            if batch.is_empty() {
                self.set_phase(Phase::Idle);
                return Ok(());
            }

            self.set_phase(Phase::Sending);
            let ids: Vec<u64> = batch.iter().map(|entry| entry.sequence_id).collect();
            report.batches_sent += 1;

            match self.client.send(&batch) {
                DeliveryOutcome::Success(ack) => {
                    self.set_phase(Phase::Acking);
                    self.queue.acknowledge(&ids)?;

                    let rejected: BTreeSet<usize> = ack
                        .rejected
                        .iter()
                        .map(|entry| entry.index)
                        .filter(|index| *index < batch.len())
                        .collect();
                    for index in &rejected {
                        tracing::warn!(
                            entity = %batch[*index].heartbeat.entity(),
                            sequence_id = batch[*index].sequence_id,
                            "Collector rejected heartbeat; dropping"
                        );
                    }
                    let delivered = batch.len() - rejected.len();

                    self.counters
                        .delivered_entries
                        .fetch_add(delivered as u64, Ordering::Relaxed);
                    self.counters
                        .rejected_entries
                        .fetch_add(rejected.len() as u64, Ordering::Relaxed);
                    self.counters
                        .delivered_batches
                        .fetch_add(1, Ordering::Relaxed);
                    report.delivered_entries += delivered;
                    report.rejected_entries += rejected.len();

                    if let Ok(mut state) = self.state.lock() {
                        state.backoff.reset();
                        state.next_attempt_at = None;
                    }
                    tracing::debug!(batch = ids.len(), delivered, "Delivered heartbeat batch");
                }
                DeliveryOutcome::RetryableFailure {
                    reason,
                    retry_after,
                } => {
                    self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    let delay = match self.state.lock() {
                        Ok(mut state) => {
                            let delay = state.backoff.on_failure(retry_after);
                            state.next_attempt_at = Some(Instant::now() + delay);
                            state.phase = Phase::Backoff;
                            delay
                        }
                        Err(_) => return Err(InsightError::LockPoisoned),
                    };
                    tracing::warn!(
                        reason = %reason,
                        pending = ids.len(),
                        retry_in_secs = delay.as_secs(),
                        "Heartbeat delivery failed; backing off"
                    );
                    report.backoff_delay = Some(delay);
                    return Ok(());
                }
                DeliveryOutcome::FatalFailure { reason } => {
                    self.queue.acknowledge(&ids)?;
                    self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .dropped_entries
                        .fetch_add(ids.len() as u64, Ordering::Relaxed);
                    report.dropped_entries += ids.len();
                    tracing::error!(
                        reason = %reason,
                        dropped = ids.len(),
                        "Collector refused heartbeat batch; dropping it"
                    );
                }
            }
        }
    }

    /// Starts the background worker. Calling it again after a shutdown
    /// starts a fresh worker; a pending flush request carries over.
    pub fn spawn(self: &Arc<Self>) -> Result<DispatcherHandle> {
        let generation = {
            let mut state = self.state.lock().map_err(|_| InsightError::LockPoisoned)?;
            state.shutdown = false;
            state.phase = Phase::Idle;
            state.generation = state.generation.wrapping_add(1);
            state.generation
        };

        let (done_tx, done_rx) = mpsc::channel();
        let dispatcher = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("devinsight-dispatcher".to_string())
            .spawn(move || {
                dispatcher.worker_loop(generation);
                let _ = done_tx.send(());
            })
            .map_err(|source| InsightError::Io {
                context: "Failed to spawn dispatcher thread".to_string(),
                source,
            })?;

        Ok(DispatcherHandle {
            dispatcher: Arc::clone(self),
            thread: Some(thread),
            finished: done_rx,
        })
    }

    fn worker_loop(&self, generation: u64) {
        let mut next_tick = Instant::now() + self.interval;
        loop {
            let trigger = match self.wait_for_trigger(generation, next_tick) {
                Some(trigger) => trigger,
                None => {
                    tracing::error!("Dispatcher state lock poisoned; stopping worker");
                    return;
                }
            };

            let label = match trigger {
                Trigger::Timer => "timer",
                Trigger::Flush => "flush",
                Trigger::Retry => "retry",
                Trigger::Shutdown => "shutdown",
                Trigger::Superseded => {
                    tracing::debug!(generation, "Dispatcher worker superseded; exiting");
                    return;
                }
            };
            tracing::debug!(trigger = label, "Dispatch cycle starting");

            if let Err(err) = self.run_cycle() {
                tracing::warn!(error = %err, trigger = label, "Dispatch cycle failed");
            }
            if matches!(trigger, Trigger::Timer) {
                if let Err(err) = self.prune_history() {
                    tracing::warn!(error = %err, "Failed to prune activity history");
                }
            }
            next_tick = Instant::now() + self.interval;

            if matches!(trigger, Trigger::Shutdown) {
                self.set_phase(Phase::Idle);
                return;
            }
        }
    }

    /// Blocks until there is a reason to run a cycle. While a retry deadline
    /// is pending, timer ticks and flush requests wait for it.
    fn wait_for_trigger(&self, generation: u64, next_tick: Instant) -> Option<Trigger> {
        let mut state = self.state.lock().ok()?;
        loop {
            if state.generation != generation {
                return Some(Trigger::Superseded);
            }
            if state.shutdown {
                state.flush_pending = false;
                return Some(Trigger::Shutdown);
            }

            let now = Instant::now();
            if let Some(at) = state.next_attempt_at {
                if now >= at {
                    state.next_attempt_at = None;
                    state.flush_pending = false;
                    return Some(Trigger::Retry);
                }
                state = wait(&self.wake, state, at - now)?;
                continue;
            }

            if state.flush_pending {
                state.flush_pending = false;
                return Some(Trigger::Flush);
            }
            if now >= next_tick {
                return Some(Trigger::Timer);
            }
            state = wait(&self.wake, state, next_tick - now)?;
        }
    }

    fn begin_shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.shutdown = true;
        }
        self.wake.notify_all();
    }

    fn set_phase(&self, phase: Phase) {
        if let Ok(mut state) = self.state.lock() {
            state.phase = phase;
        }
    }
}

fn wait<'a>(
    condvar: &Condvar,
    guard: MutexGuard<'a, DispatchState>,
    timeout: Duration,
) -> Option<MutexGuard<'a, DispatchState>> {
    condvar
        .wait_timeout(guard, timeout)
        .ok()
        .map(|(guard, _)| guard)
}

impl DispatcherHandle {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stops the timer and lets the worker run one final cycle, waiting at
    /// most `grace`. Returns `false` when the worker was still busy; it is
    /// then detached and its unsent entries stay queued.
    pub fn shutdown(mut self, grace: Duration) -> bool {
        self.dispatcher.begin_shutdown();
        match self.finished.recv_timeout(grace) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Final flush did not finish in time; leaving entries queued"
                );
                false
            }
        }
    }
}
