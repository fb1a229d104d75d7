//! Core functionality for the shift report agent.
//!
//! This module contains:
//! - Record types for readings and state changes, with their schemas
//! - Temporal alignment of state changes onto readings
//! - The anchored schedule and the run loop that drives it
//! - Report derivation from aligned readings

pub mod align;
pub mod error;
pub mod record;
pub mod reports;
pub mod runner;
pub mod schedule;

// Re-export commonly used types
pub use align::{align, segments, Segment};
pub use error::PreconditionError;
pub use record::{
    unset_attributes, AnnotatedReading, Fields, Reading, RecordSchema, SchemaError, StateChange,
    StreamKind, Value,
};
pub use reports::{ReportTable, StatusSummary};
pub use runner::{Clock, LoopState, RunLoop, SystemClock};
pub use schedule::{next_fire, parse_anchor, parse_duration, ScheduleState};
