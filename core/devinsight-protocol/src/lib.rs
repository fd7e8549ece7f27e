//! IPC protocol and collector wire types for DevInsight.
//!
//! This crate is shared by the daemon, the pipeline library and the editor
//! hook CLI to prevent schema drift. The daemon remains the authority on
//! validation, but clients reuse the same types to build valid requests.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

pub const MAX_ENTITY_LEN: usize = 4096;
pub const MAX_LABEL_LEN: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Event,
    Flush,
    GetQueueSize,
    GetDiagnostics,
    GetSummary,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Activity vocabulary
// ─────────────────────────────────────────────────────────────────────────────

/// What kind of object a heartbeat is about.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    #[default]
    File,
    App,
    Domain,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::File => "file",
            EntityType::App => "app",
            EntityType::Domain => "domain",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Coding,
    Debugging,
    Building,
    CodeReviewing,
    WritingTests,
    Browsing,
    Meeting,
}

/// A raw editor event, as reported by the host extension.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActivityEvent {
    pub entity: String,
    #[serde(default)]
    pub entity_type: EntityType,
    #[serde(default)]
    pub is_write: bool,
    /// RFC3339; the daemon stamps receipt time when absent.
    #[serde(default)]
    pub occurred_at: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub line_count: Option<u32>,
    #[serde(default)]
    pub cursor_line: Option<u32>,
    #[serde(default)]
    pub category: Option<Category>,
}

impl ActivityEvent {
    pub fn new(entity: impl Into<String>, entity_type: EntityType, is_write: bool) -> Self {
        Self {
            entity: entity.into(),
            entity_type,
            is_write,
            occurred_at: None,
            project: None,
            language: None,
            line_count: None,
            cursor_line: None,
            category: None,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.entity.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_entity", "entity is required"));
        }
        if self.entity.len() > MAX_ENTITY_LEN {
            return Err(ErrorInfo::new(
                "invalid_entity",
                format!("entity must be {} bytes or fewer", MAX_ENTITY_LEN),
            ));
        }

        if let Some(occurred_at) = &self.occurred_at {
            if DateTime::parse_from_rfc3339(occurred_at).is_err() {
                return Err(ErrorInfo::new(
                    "invalid_timestamp",
                    "occurred_at must be RFC3339",
                ));
            }
        }

        require_label(&self.project, "project")?;
        require_label(&self.language, "language")?;
        Ok(())
    }
}

pub fn parse_event(params: Value) -> Result<ActivityEvent, ErrorInfo> {
    let event: ActivityEvent = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid JSON: {}", err),
        )
    })?;
    event.validate()?;
    Ok(event)
}

fn require_label(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    match value {
        Some(label) if label.trim().is_empty() => Err(ErrorInfo::new(
            "invalid_field",
            format!("{} must not be blank when present", field),
        )),
        Some(label) if label.len() > MAX_LABEL_LEN => Err(ErrorInfo::new(
            "invalid_field",
            format!("{} must be {} bytes or fewer", field, MAX_LABEL_LEN),
        )),
        _ => Ok(()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collector wire format
// ─────────────────────────────────────────────────────────────────────────────

/// One heartbeat as sent to the remote collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRecord {
    pub entity: String,
    pub entity_type: EntityType,
    pub is_write: bool,
    /// RFC3339 with millisecond precision.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatBatch {
    pub heartbeats: Vec<HeartbeatRecord>,
}

/// Optional body of a successful batch response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchAck {
    #[serde(default)]
    pub accepted: Option<usize>,
    #[serde(default)]
    pub rejected: Vec<RejectedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedEntry {
    /// Position of the record in the submitted batch.
    pub index: usize,
    #[serde(default)]
    pub reason: Option<String>,
}
