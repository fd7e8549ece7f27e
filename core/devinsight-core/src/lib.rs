//! # devinsight-core
//!
//! The heartbeat capture-and-delivery pipeline behind DevInsight.
//!
//! ```text
//! editor event ─▶ Debouncer ─▶ DurableQueue ─▶ Dispatcher ─▶ DeliveryClient ─▶ collector
//! ```
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. The dispatcher owns one worker thread.
//! - **Durable first**: A heartbeat is committed to SQLite before intake
//!   returns and leaves the queue only after the collector acknowledges it.
//! - **Fire-and-forget intake**: [`Pipeline::record_event`] never returns an
//!   error; failures are logged and counted in [`Diagnostics`].
//! - **No globals**: All state lives in a [`Pipeline`] instance.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use devinsight_core::{load_config, Pipeline};
//! use devinsight_protocol::{ActivityEvent, EntityType};
//!
//! let pipeline = Pipeline::from_config(load_config(None)?)?;
//! pipeline.initialize()?;
//! pipeline.record_event(ActivityEvent::new("/repo/src/main.rs", EntityType::File, true));
//! pipeline.flush_now();
//! pipeline.dispose();
//! ```

pub mod backoff;
pub mod config;
pub mod debounce;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod language;
pub mod pipeline;
pub mod project;
pub mod queue;
pub mod summary;

pub use backoff::{BackoffSnapshot, ExponentialBackoff};
pub use config::{load_config, InsightConfig};
pub use debounce::{Admission, CapturedEvent, Debouncer, EmitReason};
pub use delivery::{DeliveryClient, DeliveryOutcome, HttpDeliveryClient};
pub use dispatcher::{CycleReport, DispatchStats, Dispatcher, DispatcherHandle, Phase};
pub use error::{InsightError, Result};
pub use heartbeat::{Heartbeat, HeartbeatContext, QueueEntry};
pub use pipeline::{Diagnostics, IntakeStats, Pipeline};
pub use queue::{ActivityRow, DurableQueue, QueueStats};
pub use summary::{ActivitySummary, LabelTime, Session};
