//! devinsight-hook: CLI used by editor extensions to report activity.
//!
//! Each invocation is one short request to the DevInsight daemon, which owns
//! debouncing, persistence and delivery.
//!
//! ## Subcommands
//!
//! - `event`: Report one editor event (fire-and-forget, always exits 0)
//! - `flush`: Ask the daemon to deliver queued heartbeats now
//! - `queue-size`: Print the number of undelivered heartbeats
//! - `status`: Print dispatcher and intake diagnostics
//! - `summary`: Print coding time grouped by language and project
//! - `health`: Check that the daemon is up

mod daemon_client;
mod logging;

use clap::{Parser, Subcommand};
use devinsight_protocol::{ActivityEvent, Category, EntityType, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "devinsight-hook")]
#[command(about = "Report editor activity to the DevInsight daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report an editor event
    Event {
        /// File path, app name or domain the event is about
        #[arg(value_name = "ENTITY")]
        entity: String,

        /// file, app or domain
        #[arg(long, default_value = "file", value_parser = parse_label::<EntityType>)]
        entity_type: EntityType,

        /// The event was a save
        #[arg(long)]
        write: bool,

        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        language: Option<String>,

        #[arg(long)]
        line_count: Option<u32>,

        #[arg(long)]
        cursor_line: Option<u32>,

        /// coding, debugging, building, code_reviewing, writing_tests, browsing or meeting
        #[arg(long, value_parser = parse_label::<Category>)]
        category: Option<Category>,

        /// RFC3339 time of the event (defaults to the time it is sent)
        #[arg(long)]
        occurred_at: Option<String>,
    },

    /// Deliver queued heartbeats now
    Flush,

    /// Print the number of undelivered heartbeats
    QueueSize,

    /// Print dispatcher and intake diagnostics
    Status,

    /// Print an activity summary
    Summary {
        /// Look back this many days
        #[arg(long, conflicts_with = "since")]
        days: Option<u64>,

        /// RFC3339 start of the window
        #[arg(long)]
        since: Option<String>,
    },

    /// Check that the daemon is reachable
    Health,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Event {
            entity,
            entity_type,
            write,
            project,
            language,
            line_count,
            cursor_line,
            category,
            occurred_at,
        } => {
            let event = ActivityEvent {
                entity,
                entity_type,
                is_write: write,
                occurred_at,
                project,
                language,
                line_count,
                cursor_line,
                category,
            };
            // Event reporting must never disrupt the editor; log and exit 0.
            match daemon_client::send_activity(&event) {
                Ok(data) => tracing::debug!(response = %data, "Event reported"),
                Err(daemon_client::ClientError::Disabled) => {}
                Err(err) => {
                    tracing::warn!(error = %err, entity = %event.entity, "Failed to report event")
                }
            }
        }
        Commands::Flush => run_query(Method::Flush, None),
        Commands::QueueSize => run_query(Method::GetQueueSize, None),
        Commands::Status => run_query(Method::GetDiagnostics, None),
        Commands::Summary { days, since } => {
            let params = serde_json::json!({ "days": days, "since": since });
            let params = strip_nulls(params);
            run_query(Method::GetSummary, Some(params));
        }
        Commands::Health => run_query(Method::GetHealth, None),
    }
}

fn run_query(method: Method, params: Option<Value>) {
    match daemon_client::call(method, params) {
        Ok(data) => match serde_json::to_string_pretty(&data) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                eprintln!("devinsight-hook: failed to render response: {}", err);
                std::process::exit(1);
            }
        },
        Err(err) => {
            tracing::error!(error = %err, method = ?method, "devinsight-hook request failed");
            eprintln!("devinsight-hook: {}", err);
            std::process::exit(1);
        }
    }
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            Value::Object(map.into_iter().filter(|(_, v)| !v.is_null()).collect())
        }
        other => other,
    }
}

/// Parses a snake_case protocol label (`code_reviewing`, `domain`, ...).
fn parse_label<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_value(Value::String(raw.trim().to_ascii_lowercase()))
        .map_err(|_| format!("unknown value '{}'", raw))
}
