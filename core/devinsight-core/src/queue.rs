//! SQLite-backed durable queue of pending heartbeats.
//!
//! Two tables:
//! - `heartbeat_queue`: append-ordered pending entries keyed by an
//!   AUTOINCREMENT sequence id, so ids are never reused across restarts.
//! - `activity_log`: local history of admitted heartbeats, feeding the
//!   activity summary. Pruned by age, never delivered.
//!
//! All access goes through one connection behind a mutex, which is the only
//! synchronization point between event intake and the dispatcher. Network I/O
//! never happens while the lock is held.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{InsightError, Result};
use crate::heartbeat::{Heartbeat, QueueEntry};

/// SQLite's default host parameter limit is 999; stay well below it.
const ACK_CHUNK_SIZE: usize = 500;

pub struct DurableQueue {
    path: PathBuf,
    conn: Mutex<Connection>,
    max_entries: usize,
    dropped_entries: AtomicU64,
    discarded_corrupt: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub max_entries: usize,
    pub dropped_entries: u64,
    pub discarded_corrupt: u64,
}

/// One row of local activity history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityRow {
    pub entity: String,
    pub project: Option<String>,
    pub language: Option<String>,
    pub is_write: bool,
    pub recorded_at: DateTime<Utc>,
}

impl DurableQueue {
    /// Opens (or creates) the queue at `path` and recovers persisted entries.
    pub fn open(path: impl Into<PathBuf>, max_entries: usize) -> Result<Self> {
        let path = path.into();
        let conn = open_connection(&path)?;
        let queue = Self {
            path,
            conn: Mutex::new(conn),
            max_entries: max_entries.max(1),
            dropped_entries: AtomicU64::new(0),
            discarded_corrupt: AtomicU64::new(0),
        };
        queue.init_schema()?;
        let discarded = queue.recover()?;
        if discarded > 0 {
            tracing::warn!(
                discarded,
                path = %queue.path.display(),
                "Discarded unreadable queue records during recovery"
            );
        }
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists `heartbeat` and returns its sequence id.
    ///
    /// The write is committed before this returns. When the queue is over its
    /// ceiling the oldest entries are discarded and counted.
    pub fn enqueue(&self, heartbeat: &Heartbeat) -> Result<u64> {
        let payload = serde_json::to_string(heartbeat).map_err(|source| InsightError::Json {
            context: "Failed to serialize heartbeat".to_string(),
            source,
        })?;
        let enqueued_at = format_timestamp(Utc::now());
        let recorded_at = format_timestamp(heartbeat.timestamp());
        let max_entries = self.max_entries as i64;

        let (sequence_id, overflow) = self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| InsightError::persistence("Failed to start enqueue", err))?;

            tx.execute(
                "INSERT INTO heartbeat_queue (enqueued_at, payload) VALUES (?1, ?2)",
                params![enqueued_at, payload],
            )
            .map_err(|err| InsightError::persistence("Failed to insert heartbeat", err))?;
            let sequence_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO activity_log (entity, project, language, is_write, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    heartbeat.entity(),
                    heartbeat.project(),
                    heartbeat.language(),
                    heartbeat.is_write(),
                    recorded_at
                ],
            )
            .map_err(|err| InsightError::persistence("Failed to insert activity row", err))?;

            let pending: i64 = tx
                .query_row("SELECT COUNT(*) FROM heartbeat_queue", [], |row| row.get(0))
                .map_err(|err| InsightError::persistence("Failed to count queue", err))?;
            let overflow = (pending - max_entries).max(0);
            if overflow > 0 {
                tx.execute(
                    "DELETE FROM heartbeat_queue WHERE seq IN \
                     (SELECT seq FROM heartbeat_queue ORDER BY seq ASC LIMIT ?1)",
                    params![overflow],
                )
                .map_err(|err| InsightError::persistence("Failed to drop oldest entries", err))?;
            }

            tx.commit()
                .map_err(|err| InsightError::persistence("Failed to commit enqueue", err))?;
            Ok((sequence_id, overflow))
        })?;

        if overflow > 0 {
            self.dropped_entries
                .fetch_add(overflow as u64, Ordering::Relaxed);
            tracing::warn!(
                dropped = overflow,
                max_entries = self.max_entries,
                "Queue ceiling reached; discarded oldest heartbeats"
            );
        }

        Ok(sequence_id as u64)
    }

    /// Returns up to `max_size` oldest entries without removing them.
    pub fn peek_batch(&self, max_size: usize) -> Result<Vec<QueueEntry>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }

        let (entries, corrupt) = self.with_connection(|conn| {
            let rows: Vec<(i64, String, String)> = {
                let mut stmt = conn
                    .prepare(
                        "SELECT seq, enqueued_at, payload FROM heartbeat_queue \
                         ORDER BY seq ASC LIMIT ?1",
                    )
                    .map_err(|err| InsightError::persistence("Failed to prepare peek", err))?;
                let mapped = stmt
                    .query_map(params![max_size as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })
                    .map_err(|err| InsightError::persistence("Failed to read queue rows", err))?;

                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row.map_err(|err| {
                        InsightError::persistence("Failed to decode queue row", err)
                    })?);
                }
                rows
            };

            let mut entries = Vec::with_capacity(rows.len());
            let mut corrupt = Vec::new();
            for (seq, enqueued_at, payload) in rows {
                match decode_entry(seq, &enqueued_at, &payload) {
                    Some(entry) => entries.push(entry),
                    None => corrupt.push(seq as u64),
                }
            }
            Ok((entries, corrupt))
        })?;

        if !corrupt.is_empty() {
            tracing::warn!(count = corrupt.len(), "Discarding unreadable queue records");
            self.remove_ids(&corrupt)?;
            self.discarded_corrupt
                .fetch_add(corrupt.len() as u64, Ordering::Relaxed);
        }

        Ok(entries)
    }

    /// Removes the given entries. Unknown ids are ignored.
    pub fn acknowledge(&self, sequence_ids: &[u64]) -> Result<usize> {
        self.remove_ids(sequence_ids)
    }

    pub fn size(&self) -> Result<usize> {
        self.with_connection(|conn| {
            conn.query_row("SELECT COUNT(*) FROM heartbeat_queue", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|count| count as usize)
            .map_err(|err| InsightError::persistence("Failed to count queue", err))
        })
    }

    pub fn dropped_entries(&self) -> u64 {
        self.dropped_entries.load(Ordering::Relaxed)
    }

    pub fn discarded_corrupt(&self) -> u64 {
        self.discarded_corrupt.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.size()?,
            max_entries: self.max_entries,
            dropped_entries: self.dropped_entries(),
            discarded_corrupt: self.discarded_corrupt(),
        })
    }

    pub fn list_activity_since(&self, since: DateTime<Utc>) -> Result<Vec<ActivityRow>> {
        let since = format_timestamp(since);
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT entity, project, language, is_write, recorded_at \
                     FROM activity_log WHERE recorded_at >= ?1 \
                     ORDER BY recorded_at ASC, id ASC",
                )
                .map_err(|err| InsightError::persistence("Failed to prepare activity query", err))?;

            let rows = stmt
                .query_map(params![since], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(|err| InsightError::persistence("Failed to query activity rows", err))?;

            let mut entries = Vec::new();
            for row in rows {
                let (entity, project, language, is_write, recorded_at) = row.map_err(|err| {
                    InsightError::persistence("Failed to decode activity row", err)
                })?;
                if let Some(recorded_at) = parse_timestamp(&recorded_at) {
                    entries.push(ActivityRow {
                        entity,
                        project,
                        language,
                        is_write,
                        recorded_at,
                    });
                }
            }
            Ok(entries)
        })
    }

    pub fn prune_activity(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let cutoff = format_timestamp(older_than);
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM activity_log WHERE recorded_at < ?1",
                params![cutoff],
            )
            .map(|count| count as u64)
            .map_err(|err| InsightError::persistence("Failed to prune activity log", err))
        })
    }

    fn remove_ids(&self, sequence_ids: &[u64]) -> Result<usize> {
        if sequence_ids.is_empty() {
            return Ok(0);
        }

        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| InsightError::persistence("Failed to start acknowledge", err))?;
            let mut removed = 0usize;
            for chunk in sequence_ids.chunks(ACK_CHUNK_SIZE) {
                let placeholders: Vec<String> =
                    (1..=chunk.len()).map(|i| format!("?{}", i)).collect();
                let sql = format!(
                    "DELETE FROM heartbeat_queue WHERE seq IN ({})",
                    placeholders.join(", ")
                );
                let ids: Vec<i64> = chunk.iter().map(|id| *id as i64).collect();
                let params: Vec<&dyn rusqlite::types::ToSql> = ids
                    .iter()
                    .map(|id| id as &dyn rusqlite::types::ToSql)
                    .collect();
                removed += tx
                    .execute(&sql, params.as_slice())
                    .map_err(|err| InsightError::persistence("Failed to remove entries", err))?;
            }
            tx.commit()
                .map_err(|err| InsightError::persistence("Failed to commit acknowledge", err))?;
            Ok(removed)
        })
    }

    /// Drops records whose payload no longer decodes (a torn last write).
    fn recover(&self) -> Result<usize> {
        let corrupt = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT seq, enqueued_at, payload FROM heartbeat_queue ORDER BY seq ASC")
                .map_err(|err| InsightError::persistence("Failed to prepare recovery scan", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })
                .map_err(|err| InsightError::persistence("Failed to scan queue", err))?;

            let mut corrupt = Vec::new();
            for row in rows {
                let (seq, enqueued_at, payload) = row.map_err(|err| {
                    InsightError::persistence("Failed to decode queue row", err)
                })?;
                let readable = match (enqueued_at, payload) {
                    (Some(enqueued_at), Some(payload)) => {
                        decode_entry(seq, &enqueued_at, &payload).is_some()
                    }
                    _ => false,
                };
                if !readable {
                    corrupt.push(seq as u64);
                }
            }
            Ok(corrupt)
        })?;

        if corrupt.is_empty() {
            return Ok(0);
        }
        self.remove_ids(&corrupt)?;
        self.discarded_corrupt
            .fetch_add(corrupt.len() as u64, Ordering::Relaxed);
        Ok(corrupt.len())
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS heartbeat_queue (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    enqueued_at TEXT NOT NULL,
                    payload TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS activity_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity TEXT NOT NULL,
                    project TEXT,
                    language TEXT,
                    is_write INTEGER NOT NULL DEFAULT 0,
                    recorded_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS activity_log_recorded_at
                    ON activity_log (recorded_at);
                 COMMIT;",
            )
            .map_err(|err| InsightError::persistence("Failed to initialize schema", err))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| InsightError::LockPoisoned)?;
        op(&mut conn)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).map_err(|source| InsightError::Io {
            context: "Failed to create queue data dir".to_string(),
            source,
        })?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let conn = Connection::open_with_flags(path, flags)
        .map_err(|err| InsightError::persistence("Failed to open sqlite db", err))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|err| InsightError::persistence("Failed to enable WAL", err))?;
    // Every enqueue must survive power loss, not only a process crash.
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(|err| InsightError::persistence("Failed to set synchronous", err))?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(|err| InsightError::persistence("Failed to set busy_timeout", err))?;

    Ok(conn)
}

fn decode_entry(seq: i64, enqueued_at: &str, payload: &str) -> Option<QueueEntry> {
    let heartbeat: Heartbeat = serde_json::from_str(payload).ok()?;
    let enqueued_at = parse_timestamp(enqueued_at)?;
    Some(QueueEntry {
        sequence_id: seq as u64,
        enqueued_at,
        heartbeat,
    })
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
