//! Shift Report - scheduled production reports from plant time-series data.
//!
//! On a fixed schedule anchored to a time of day, the agent fetches machine
//! readings and batch state changes for a trailing window, attaches to every
//! reading the batch that was in effect when it was taken, derives downtime
//! and utilisation reports, writes them out and emails them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Shift Report                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │   RunLoop   │──▶│   Fetcher   │──▶│    Align    │       │
//! │  │  (anchored) │   │  (InfluxDB) │   │ (fwd-fill)  │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! │         │                                    │              │
//! │         ▼                                    ▼              │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │   RunLog    │   │  Notifier   │◀──│    Sink     │       │
//! │  │   (stats)   │   │   (SMTP)    │   │   (CSV)     │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use shift_report::core::{align, unset_attributes, Reading, StateChange};
//! use chrono::Utc;
//!
//! let now = Utc::now();
//! let readings = vec![Reading::new(now).with("machine_name", "filler")];
//! let changes = vec![StateChange::new(now).with("batch_id", "B1")];
//!
//! let aligned = align(&readings, &changes, &unset_attributes()).unwrap();
//! assert_eq!(aligned[0].attribute("batch_id").unwrap().to_string(), "B1");
//! ```

pub mod config;
pub mod core;
pub mod influx;
pub mod notify;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod stats;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use crate::core::{
    align, next_fire, AnnotatedReading, PreconditionError, Reading, StateChange,
};
pub use influx::{BlockingInfluxClient, InfluxClient, InfluxConfig};
pub use notify::{EmailNotifier, NoopNotifier, Notifier, NotifyError};
pub use pipeline::{PipelineError, PipelineSettings, ReportPipeline, RunOutcome};
pub use sink::{CsvSink, Sink, SinkError};
pub use source::{FetchError, Fetcher, Window};
pub use stats::{RunLog, RunStats, SharedRunLog};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
