//! One-shot batch delivery to the remote collector.
//!
//! A send is a single attempt that resolves to a [`DeliveryOutcome`]; retry
//! policy lives in the dispatcher.

use chrono::{DateTime, Utc};
use devinsight_protocol::{BatchAck, HeartbeatBatch};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

use crate::config::ApiConfig;
use crate::error::{InsightError, Result};
use crate::heartbeat::QueueEntry;

const USER_AGENT: &str = concat!("devinsight/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Success(BatchAck),
    RetryableFailure {
        reason: String,
        retry_after: Option<Duration>,
    },
    FatalFailure {
        reason: String,
    },
}

impl DeliveryOutcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        DeliveryOutcome::RetryableFailure {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        DeliveryOutcome::FatalFailure {
            reason: reason.into(),
        }
    }
}

/// Transport seam used by the dispatcher.
pub trait DeliveryClient: Send + Sync {
    fn send(&self, batch: &[QueueEntry]) -> DeliveryOutcome;
}

pub struct HttpDeliveryClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    user_id: Option<String>,
}

impl HttpDeliveryClient {
    pub fn new(api: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(api.connect_timeout())
            .timeout(api.timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| InsightError::HttpClient(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: api.endpoint.clone(),
            api_key: api.api_key.clone(),
            user_id: api.user_id.clone(),
        })
    }

    pub fn build_batch(&self, entries: &[QueueEntry]) -> HeartbeatBatch {
        HeartbeatBatch {
            heartbeats: entries
                .iter()
                .map(|entry| entry.heartbeat.to_record(self.user_id.as_deref()))
                .collect(),
        }
    }
}

impl DeliveryClient for HttpDeliveryClient {
    fn send(&self, batch: &[QueueEntry]) -> DeliveryOutcome {
        let body = self.build_batch(batch);
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = match request.send() {
            Ok(response) => response,
            Err(err) => {
                let kind = if err.is_timeout() {
                    "timeout"
                } else if err.is_connect() {
                    "connect"
                } else {
                    "transport"
                };
                return DeliveryOutcome::retryable(format!("{} error: {}", kind, err));
            }
        };

        let status = response.status().as_u16();
        let retry_after = retry_after_from_headers(response.headers(), Utc::now());
        let body = response.text().unwrap_or_default();
        classify_response(status, retry_after, &body)
    }
}

/// Maps an HTTP status (and body) to a delivery outcome.
pub fn classify_response(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> DeliveryOutcome {
    match status {
        200..=299 => DeliveryOutcome::Success(parse_ack(body)),
        429 => DeliveryOutcome::RetryableFailure {
            reason: "rate limited (HTTP 429)".to_string(),
            retry_after,
        },
        408 => DeliveryOutcome::retryable("request timeout (HTTP 408)"),
        400..=499 => DeliveryOutcome::fatal(format!(
            "collector rejected batch (HTTP {}): {}",
            status,
            truncate(body, 200)
        )),
        500..=599 => DeliveryOutcome::RetryableFailure {
            reason: format!("server error (HTTP {})", status),
            retry_after,
        },
        other => DeliveryOutcome::retryable(format!("unexpected HTTP status {}", other)),
    }
}

fn parse_ack(body: &str) -> BatchAck {
    if body.trim().is_empty() {
        return BatchAck::default();
    }
    match serde_json::from_str(body) {
        Ok(ack) => ack,
        Err(err) => {
            tracing::debug!(
                error = %err,
                "Collector ack body was not understood; assuming full acceptance"
            );
            BatchAck::default()
        }
    }
}

fn retry_after_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_retry_after(value, now))
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let delta = at.signed_duration_since(now);
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}
