//! Collapses bursts of editor events into heartbeats.
//!
//! ```text
//! no state for entity      → emit (first_seen)
//! same timestamp and kind  → suppress (replayed event)
//! is_write                 → emit (write)
//! elapsed > interval       → emit (window_elapsed)
//! entity != last emitted   → emit (entity_switch)
//! otherwise                → suppress
//! ```
//!
//! The window is per entity; the switch rule compares against the single
//! most recently emitted entity process-wide.

use chrono::{DateTime, Duration, Utc};
use devinsight_protocol::EntityType;
use std::collections::HashMap;

use crate::error::Result;
use crate::heartbeat::{Heartbeat, HeartbeatContext};

/// State entries are pruned once the map grows past this size. Entries older
/// than the window are dropped, which never changes a decision.
const PRUNE_THRESHOLD: usize = 4096;

/// A raw editor event after the host's fields have been resolved.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub entity: String,
    pub entity_type: EntityType,
    pub is_write: bool,
    pub occurred_at: DateTime<Utc>,
    pub context: HeartbeatContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DebounceState {
    last_emitted_at: DateTime<Utc>,
    last_was_write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitReason {
    FirstSeen,
    Write,
    WindowElapsed,
    EntitySwitch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Emit {
        heartbeat: Heartbeat,
        reason: EmitReason,
    },
    Suppressed,
}

#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    clock_skew: Duration,
    states: HashMap<String, DebounceState>,
    last_entity: Option<String>,
}

impl Debouncer {
    pub fn new(interval: Duration, clock_skew: Duration) -> Self {
        Self {
            interval,
            clock_skew,
            states: HashMap::new(),
            last_entity: None,
        }
    }

    pub fn admit(&mut self, event: CapturedEvent) -> Result<Admission> {
        self.admit_at(event, Utc::now())
    }

    /// Decides on `event`, validating its timestamp against `now`.
    ///
    /// A heartbeat that fails validation leaves the debounce state untouched.
    pub fn admit_at(&mut self, event: CapturedEvent, now: DateTime<Utc>) -> Result<Admission> {
        let reason = match self.emit_reason(&event.entity, event.is_write, event.occurred_at) {
            Some(reason) => reason,
            None => return Ok(Admission::Suppressed),
        };

        let heartbeat = Heartbeat::new_at(
            event.entity,
            event.entity_type,
            event.is_write,
            event.occurred_at,
            event.context,
            now,
            self.clock_skew,
        )?;

        self.record_emission(&heartbeat);
        Ok(Admission::Emit { heartbeat, reason })
    }

    pub fn tracked_entities(&self) -> usize {
        self.states.len()
    }

    fn emit_reason(&self, entity: &str, is_write: bool, at: DateTime<Utc>) -> Option<EmitReason> {
        let state = match self.states.get(entity) {
            Some(state) => state,
            None => return Some(EmitReason::FirstSeen),
        };

        // A client retrying a request resends the identical event.
        if at == state.last_emitted_at && is_write == state.last_was_write {
            return None;
        }

        if is_write {
            return Some(EmitReason::Write);
        }

        // Out-of-order events (negative elapsed) stay inside the window.
        if at.signed_duration_since(state.last_emitted_at) > self.interval {
            return Some(EmitReason::WindowElapsed);
        }

        if self.last_entity.as_deref() != Some(entity) {
            return Some(EmitReason::EntitySwitch);
        }

        None
    }

    fn record_emission(&mut self, heartbeat: &Heartbeat) {
        let entity = heartbeat.entity().to_string();
        self.states.insert(
            entity.clone(),
            DebounceState {
                last_emitted_at: heartbeat.timestamp(),
                last_was_write: heartbeat.is_write(),
            },
        );
        self.last_entity = Some(entity);

        if self.states.len() > PRUNE_THRESHOLD {
            self.prune(heartbeat.timestamp());
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let interval = self.interval;
        let last_entity = self.last_entity.clone();
        self.states.retain(|entity, state| {
            Some(entity) == last_entity.as_ref()
                || now.signed_duration_since(state.last_emitted_at) <= interval
        });
    }
}
