//! The pipeline context: one instance owns the queue, the debouncer and the
//! dispatcher worker. Nothing here is process-global, so independent
//! pipelines can coexist (tests run several side by side).
//!
//! Intake never returns an error to the caller. Failures are logged and
//! counted, and show up in [`Pipeline::diagnostics`].

use chrono::{DateTime, Utc};
use devinsight_protocol::{ActivityEvent, EntityType};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::InsightConfig;
use crate::debounce::{Admission, CapturedEvent, Debouncer};
use crate::delivery::{DeliveryClient, HttpDeliveryClient};
use crate::dispatcher::{DispatchStats, Dispatcher, DispatcherHandle};
use crate::error::{InsightError, Result};
use crate::heartbeat::HeartbeatContext;
use crate::language::{detect_language, LanguageAliases};
use crate::project::detect_project;
use crate::queue::{DurableQueue, QueueStats};
use crate::summary::{summarize, ActivitySummary, SummaryOptions};

#[derive(Default)]
struct IntakeCounters {
    received: AtomicU64,
    accepted: AtomicU64,
    suppressed_events: AtomicU64,
    invalid_heartbeats: AtomicU64,
    persistence_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeStats {
    pub received: u64,
    pub accepted: u64,
    pub suppressed_events: u64,
    pub invalid_heartbeats: u64,
    pub persistence_failures: u64,
    pub tracked_entities: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub worker_running: bool,
    pub queue: QueueStats,
    pub dispatch: DispatchStats,
    pub intake: IntakeStats,
}

pub struct Pipeline {
    config: InsightConfig,
    queue: Arc<DurableQueue>,
    debouncer: Mutex<Debouncer>,
    dispatcher: Arc<Dispatcher>,
    worker: Mutex<Option<DispatcherHandle>>,
    aliases: LanguageAliases,
    counters: IntakeCounters,
    since_flush: AtomicUsize,
}

impl Pipeline {
    /// Opens the durable queue and wires the dispatcher to `client`. Call
    /// [`Pipeline::initialize`] to start delivering.
    pub fn new(config: InsightConfig, client: Arc<dyn DeliveryClient>) -> Result<Self> {
        let queue_path = config.queue_path()?;
        if let Some(parent) = queue_path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| InsightError::Io {
                context: format!("Failed to create queue directory {}", parent.display()),
                source,
            })?;
        }

        let queue = Arc::new(DurableQueue::open(queue_path, config.queue.max_entries)?);
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::clone(&queue), client, &config.dispatch)
                .with_history_retention(config.summary.history_retention()),
        );
        let debouncer = Debouncer::new(config.debounce.interval(), config.debounce.clock_skew());
        let aliases = LanguageAliases::new(&config.language.aliases);

        Ok(Self {
            config,
            queue,
            debouncer: Mutex::new(debouncer),
            dispatcher,
            worker: Mutex::new(None),
            aliases,
            counters: IntakeCounters::default(),
            since_flush: AtomicUsize::new(0),
        })
    }

    /// Builds a pipeline delivering over HTTP to the configured endpoint.
    pub fn from_config(config: InsightConfig) -> Result<Self> {
        let client = HttpDeliveryClient::new(&config.api)?;
        Self::new(config, Arc::new(client))
    }

    pub fn config(&self) -> &InsightConfig {
        &self.config
    }

    /// Starts the dispatcher worker. Calling it again is a no-op; after
    /// [`Pipeline::dispose`] it starts a new worker.
    pub fn initialize(&self) -> Result<()> {
        let mut worker = self.worker.lock().map_err(|_| InsightError::LockPoisoned)?;
        if worker.is_some() {
            return Ok(());
        }

        if let Err(err) = self.dispatcher.prune_history() {
            tracing::warn!(error = %err, "Failed to prune activity history");
        }

        *worker = Some(self.dispatcher.spawn()?);

        let pending = self.queue.size()?;
        if pending > 0 {
            self.dispatcher.request_flush();
        }
        tracing::info!(
            pending,
            path = %self.queue.path().display(),
            endpoint = %self.config.api.endpoint,
            "Heartbeat pipeline initialized"
        );
        Ok(())
    }

    /// Stops the timer and attempts a final flush within the configured grace
    /// period. Returns `false` if the final flush did not finish in time.
    pub fn dispose(&self) -> bool {
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => {
                tracing::error!("Pipeline worker lock poisoned; skipping final flush");
                return false;
            }
        };

        let handle = match handle {
            Some(handle) => handle,
            None => return true,
        };

        let finished = handle.shutdown(self.config.dispatch.shutdown_grace());
        let pending = self.queue.size().unwrap_or(0);
        tracing::info!(finished, pending, "Heartbeat pipeline disposed");
        finished
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.is_some())
            .unwrap_or(false)
    }

    /// Accepts one editor event. Returns the queue sequence id when the event
    /// produced a heartbeat, `None` when it was suppressed or failed.
    pub fn record_event(&self, event: ActivityEvent) -> Option<u64> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let captured = match self.capture(event) {
            Ok(captured) => captured,
            Err(err) => {
                self.counters
                    .invalid_heartbeats
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "Rejected activity event");
                return None;
            }
        };

        let mut debouncer = match self.debouncer.lock() {
            Ok(debouncer) => debouncer,
            Err(_) => {
                tracing::error!("Debouncer lock poisoned; dropping event");
                return None;
            }
        };

        let heartbeat = match debouncer.admit(captured) {
            Ok(Admission::Emit { heartbeat, reason }) => {
                tracing::debug!(
                    entity = %heartbeat.entity(),
                    reason = ?reason,
                    "Heartbeat emitted"
                );
                heartbeat
            }
            Ok(Admission::Suppressed) => {
                self.counters
                    .suppressed_events
                    .fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(err) => {
                self.counters
                    .invalid_heartbeats
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "Rejected heartbeat");
                return None;
            }
        };

        // Enqueue under the debouncer lock so sequence ids follow admission order.
        let sequence_id = match self.queue.enqueue(&heartbeat) {
            Ok(sequence_id) => sequence_id,
            Err(err) => {
                self.counters
                    .persistence_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %err,
                    entity = %heartbeat.entity(),
                    "Failed to persist heartbeat; it is lost"
                );
                return None;
            }
        };
        drop(debouncer);

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        self.note_accepted();
        Some(sequence_id)
    }

    /// Asks the dispatcher for an immediate cycle. Before `initialize` the
    /// request is held and served once the worker starts.
    pub fn flush_now(&self) {
        self.since_flush.store(0, Ordering::Relaxed);
        self.dispatcher.request_flush();
        if !self.is_running() {
            tracing::debug!("Flush requested before initialize; deferring to worker start");
        }
    }

    pub fn queue_size(&self) -> Result<usize> {
        self.queue.size()
    }

    pub fn diagnostics(&self) -> Result<Diagnostics> {
        let tracked_entities = self
            .debouncer
            .lock()
            .map(|debouncer| debouncer.tracked_entities())
            .unwrap_or(0);

        Ok(Diagnostics {
            worker_running: self.is_running(),
            queue: self.queue.stats()?,
            dispatch: self.dispatcher.stats(),
            intake: IntakeStats {
                received: self.counters.received.load(Ordering::Relaxed),
                accepted: self.counters.accepted.load(Ordering::Relaxed),
                suppressed_events: self.counters.suppressed_events.load(Ordering::Relaxed),
                invalid_heartbeats: self.counters.invalid_heartbeats.load(Ordering::Relaxed),
                persistence_failures: self.counters.persistence_failures.load(Ordering::Relaxed),
                tracked_entities,
            },
        })
    }

    /// Coding time since `since`, defaulting to the history retention window.
    pub fn activity_summary(&self, since: Option<DateTime<Utc>>) -> Result<ActivitySummary> {
        let since = since.unwrap_or_else(|| {
            Utc::now()
                .checked_sub_signed(self.config.summary.history_retention())
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });
        let rows = self.queue.list_activity_since(since)?;
        Ok(summarize(
            &rows,
            since,
            &SummaryOptions {
                session_gap: self.config.summary.session_gap(),
                aliases: &self.aliases,
                excluded_languages: &self.config.summary.excluded_languages,
            },
        ))
    }

    fn capture(&self, event: ActivityEvent) -> Result<CapturedEvent> {
        event
            .validate()
            .map_err(|info| InsightError::invalid(info.message))?;

        let occurred_at = match &event.occurred_at {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|err| InsightError::invalid(format!("occurred_at: {}", err)))?
                .with_timezone(&Utc),
            None => Utc::now(),
        };

        let is_file = event.entity_type == EntityType::File;
        let path = Path::new(&event.entity);

        let language = event
            .language
            .clone()
            .or_else(|| {
                if is_file {
                    detect_language(path).map(str::to_string)
                } else {
                    None
                }
            })
            .map(|language| self.aliases.resolve(&language));

        let project = event.project.clone().or_else(|| {
            if is_file {
                detect_project(path)
            } else {
                None
            }
        });

        Ok(CapturedEvent {
            entity: event.entity,
            entity_type: event.entity_type,
            is_write: event.is_write,
            occurred_at,
            context: HeartbeatContext {
                project,
                language,
                line_count: event.line_count,
                cursor_line: event.cursor_line,
                category: event.category.unwrap_or_default(),
            },
        })
    }

    fn note_accepted(&self) {
        let threshold = self.config.dispatch.flush_threshold;
        if threshold == 0 {
            return;
        }
        let accumulated = self.since_flush.fetch_add(1, Ordering::Relaxed) + 1;
        if accumulated >= threshold {
            self.since_flush.store(0, Ordering::Relaxed);
            tracing::debug!(accumulated, "Flush threshold reached");
            self.dispatcher.request_flush();
        }
    }
}
