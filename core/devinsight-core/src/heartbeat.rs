//! The heartbeat record and its queue wrapper.
//!
//! A [`Heartbeat`] is immutable once built: fields are private and only
//! exposed through accessors. Construction validates the entity and rejects
//! timestamps too far in the future, so nothing invalid enters the pipeline.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use devinsight_protocol::{Category, EntityType, HeartbeatRecord};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{InsightError, Result};

/// How far ahead of local time a heartbeat may be stamped.
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 5;

/// Best-effort context captured alongside a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatContext {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub line_count: Option<u32>,
    #[serde(default)]
    pub cursor_line: Option<u32>,
    #[serde(default)]
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    timestamp: DateTime<Utc>,
    entity: String,
    entity_type: EntityType,
    is_write: bool,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    line_count: Option<u32>,
    #[serde(default)]
    cursor_line: Option<u32>,
    #[serde(default)]
    category: Category,
}

impl Heartbeat {
    pub fn new(
        entity: impl Into<String>,
        entity_type: EntityType,
        is_write: bool,
        timestamp: DateTime<Utc>,
        context: HeartbeatContext,
    ) -> Result<Self> {
        Self::new_at(
            entity,
            entity_type,
            is_write,
            timestamp,
            context,
            Utc::now(),
            Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS),
        )
    }

    /// Builds a heartbeat validated against an explicit `now`.
    pub fn new_at(
        entity: impl Into<String>,
        entity_type: EntityType,
        is_write: bool,
        timestamp: DateTime<Utc>,
        context: HeartbeatContext,
        now: DateTime<Utc>,
        clock_skew: Duration,
    ) -> Result<Self> {
        let entity = entity.into();
        if entity.trim().is_empty() {
            return Err(InsightError::invalid("entity is empty"));
        }
        let latest = now.checked_add_signed(clock_skew).unwrap_or(DateTime::<Utc>::MAX_UTC);
        if timestamp > latest {
            return Err(InsightError::invalid(format!(
                "timestamp {} is ahead of local clock {}",
                timestamp.to_rfc3339(),
                now.to_rfc3339()
            )));
        }

        Ok(Self {
            timestamp,
            entity,
            entity_type,
            is_write,
            project: non_blank(context.project),
            language: non_blank(context.language),
            line_count: context.line_count,
            cursor_line: context.cursor_line,
            category: context.category,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn is_write(&self) -> bool {
        self.is_write
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn line_count(&self) -> Option<u32> {
        self.line_count
    }

    pub fn cursor_line(&self) -> Option<u32> {
        self.cursor_line
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn to_record(&self, user_id: Option<&str>) -> HeartbeatRecord {
        HeartbeatRecord {
            entity: self.entity.clone(),
            entity_type: self.entity_type,
            is_write: self.is_write,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            project: self.project.clone(),
            language: self.language.clone(),
            category: self.category,
            line_count: self.line_count,
            cursor_line: self.cursor_line,
            user_id: user_id.map(str::to_string),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// A heartbeat waiting in the durable queue.
///
/// Entries compare by `sequence_id` only: that is the delivery order, even
/// when capture timestamps are slightly out of order.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub sequence_id: u64,
    pub enqueued_at: DateTime<Utc>,
    pub heartbeat: Heartbeat,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sequence_id == other.sequence_id
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence_id.cmp(&other.sequence_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
    }

    fn build(entity: &str, timestamp: DateTime<Utc>) -> Result<Heartbeat> {
        Heartbeat::new_at(
            entity,
            EntityType::File,
            false,
            timestamp,
            HeartbeatContext::default(),
            t0(),
            Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS),
        )
    }

    #[test]
    fn rejects_empty_entity() {
        let err = build("  ", t0()).unwrap_err();
        assert!(matches!(err, InsightError::InvalidHeartbeat { .. }));
    }

    #[test]
    fn accepts_timestamp_within_skew() {
        assert!(build("/repo/a.rs", t0() + Duration::seconds(4)).is_ok());
    }

    #[test]
    fn skew_past_the_calendar_end_accepts_instead_of_panicking() {
        let heartbeat = Heartbeat::new_at(
            "/repo/a.rs",
            EntityType::File,
            false,
            t0() + Duration::days(365),
            HeartbeatContext::default(),
            t0(),
            Duration::days(365 * 200_000),
        );
        assert!(heartbeat.is_ok());
    }

    #[test]
    fn rejects_timestamp_beyond_skew() {
        let err = build("/repo/a.rs", t0() + Duration::seconds(30)).unwrap_err();
        assert!(matches!(err, InsightError::InvalidHeartbeat { .. }));
    }

    #[test]
    fn past_timestamps_are_fine() {
        assert!(build("/repo/a.rs", t0() - Duration::days(2)).is_ok());
    }

    #[test]
    fn blank_context_labels_are_dropped() {
        let heartbeat = Heartbeat::new_at(
            "/repo/a.rs",
            EntityType::File,
            true,
            t0(),
            HeartbeatContext {
                project: Some("  ".to_string()),
                language: Some(" rust ".to_string()),
                ..HeartbeatContext::default()
            },
            t0(),
            Duration::seconds(5),
        )
        .expect("heartbeat");
        assert_eq!(heartbeat.project(), None);
        assert_eq!(heartbeat.language(), Some("rust"));
        assert_eq!(heartbeat.category(), Category::Coding);
    }

    #[test]
    fn record_uses_millisecond_rfc3339() {
        let heartbeat = build("/repo/a.rs", t0() + Duration::milliseconds(250)).expect("heartbeat");
        let record = heartbeat.to_record(Some("user-1"));
        assert_eq!(record.timestamp, "2026-10-19T09:00:00.250Z");
        assert_eq!(record.user_id.as_deref(), Some("user-1"));
        assert_eq!(record.category, Category::Coding);
    }

    #[test]
    fn queue_entries_order_by_sequence_not_timestamp() {
        let early = build("/repo/a.rs", t0() - Duration::seconds(10)).unwrap();
        let late = build("/repo/b.rs", t0()).unwrap();
        let mut entries = vec![
            QueueEntry {
                sequence_id: 2,
                enqueued_at: t0(),
                heartbeat: early,
            },
            QueueEntry {
                sequence_id: 1,
                enqueued_at: t0(),
                heartbeat: late,
            },
        ];
        entries.sort();
        assert_eq!(entries[0].heartbeat.entity(), "/repo/b.rs");
    }
}
