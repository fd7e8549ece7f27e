//! Local coding-time summary built from the activity history.
//!
//! Heartbeats are sorted by time and split into sessions wherever the gap
//! between neighbours exceeds the session gap. A session lasts from its first
//! to its last heartbeat; its whole duration is attributed to the language
//! and project of its first heartbeat.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::language::LanguageAliases;
use crate::queue::ActivityRow;

pub const UNKNOWN_LABEL: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: i64,
    pub language: String,
    pub project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelTime {
    pub name: String,
    pub seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivitySummary {
    pub since: DateTime<Utc>,
    pub heartbeats: usize,
    pub writes: usize,
    pub total_secs: i64,
    pub sessions: Vec<Session>,
    /// Sorted by time, longest first.
    pub languages: Vec<LabelTime>,
    pub projects: Vec<LabelTime>,
}

#[derive(Debug, Clone)]
pub struct SummaryOptions<'a> {
    pub session_gap: Duration,
    pub aliases: &'a LanguageAliases,
    pub excluded_languages: &'a [String],
}

pub fn summarize(
    rows: &[ActivityRow],
    since: DateTime<Utc>,
    options: &SummaryOptions<'_>,
) -> ActivitySummary {
    let mut rows: Vec<&ActivityRow> = rows.iter().filter(|row| row.recorded_at >= since).collect();
    rows.sort_by_key(|row| row.recorded_at);

    let sessions = split_sessions(&rows, options);
    let total_secs = sessions.iter().map(|session| session.duration_secs).sum();

    let mut languages: HashMap<String, i64> = HashMap::new();
    let mut projects: HashMap<String, i64> = HashMap::new();
    for session in &sessions {
        let excluded = options
            .excluded_languages
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&session.language));
        if !excluded {
            *languages.entry(session.language.clone()).or_default() += session.duration_secs;
        }
        if let Some(project) = &session.project {
            *projects.entry(project.clone()).or_default() += session.duration_secs;
        }
    }

    ActivitySummary {
        since,
        heartbeats: rows.len(),
        writes: rows.iter().filter(|row| row.is_write).count(),
        total_secs,
        sessions,
        languages: sorted_by_time(languages),
        projects: sorted_by_time(projects),
    }
}

fn split_sessions(rows: &[&ActivityRow], options: &SummaryOptions<'_>) -> Vec<Session> {
    let mut sessions = Vec::new();
    let mut iter = rows.iter();
    let first = match iter.next() {
        Some(first) => first,
        None => return sessions,
    };

    let mut current = open_session(first, options.aliases);
    for row in iter {
        if row.recorded_at.signed_duration_since(current.end) > options.session_gap {
            sessions.push(close_session(current));
            current = open_session(row, options.aliases);
        } else {
            current.end = row.recorded_at;
        }
    }
    sessions.push(close_session(current));
    sessions
}

fn open_session(row: &ActivityRow, aliases: &LanguageAliases) -> Session {
    Session {
        start: row.recorded_at,
        end: row.recorded_at,
        duration_secs: 0,
        language: row
            .language
            .as_deref()
            .map(|language| aliases.resolve(language))
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
        project: row.project.clone(),
    }
}

fn close_session(mut session: Session) -> Session {
    session.duration_secs = session.end.signed_duration_since(session.start).num_seconds();
    session
}

fn sorted_by_time(totals: HashMap<String, i64>) -> Vec<LabelTime> {
    let mut entries: Vec<LabelTime> = totals
        .into_iter()
        .map(|(name, seconds)| LabelTime { name, seconds })
        .collect();
    entries.sort_by(|a, b| b.seconds.cmp(&a.seconds).then_with(|| a.name.cmp(&b.name)));
    entries
}
