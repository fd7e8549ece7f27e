//! Parameter parsing for read-only daemon methods.

use chrono::{DateTime, Duration, Utc};
use devinsight_protocol::ErrorInfo;
use serde_json::Value;

const MAX_SUMMARY_DAYS: u64 = 366;

/// `get_summary` accepts either `since` (RFC3339) or `days` (look-back
/// window). With neither, the pipeline's retention window applies.
pub fn parse_summary_params(params: Option<Value>) -> Result<Option<DateTime<Utc>>, ErrorInfo> {
    parse_summary_params_at(params, Utc::now())
}

fn parse_summary_params_at(
    params: Option<Value>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ErrorInfo> {
    let params = match params {
        Some(Value::Null) | None => return Ok(None),
        Some(params) => params,
    };
    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }

    if let Some(since) = params.get("since").and_then(|v| v.as_str()) {
        let parsed = DateTime::parse_from_rfc3339(since)
            .map_err(|_| ErrorInfo::new("invalid_params", "since must be RFC3339"))?;
        return Ok(Some(parsed.with_timezone(&Utc)));
    }

    if let Some(days) = params.get("days") {
        let days = days
            .as_u64()
            .filter(|days| (1..=MAX_SUMMARY_DAYS).contains(days))
            .ok_or_else(|| {
                ErrorInfo::new(
                    "invalid_params",
                    format!("days must be between 1 and {}", MAX_SUMMARY_DAYS),
                )
            })?;
        return Ok(Some(now - Duration::days(days as i64)));
    }

    Ok(None)
}
