//! Precondition failures shared by the alignment and scheduling code.

use crate::core::record::StreamKind;
use thiserror::Error;

/// Caller-side contract violations. These are never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("{stream} are not sorted by timestamp (first out-of-order row at index {index})")]
    Unsorted { stream: StreamKind, index: usize },

    #[error("invalid duration '{0}' (expected e.g. \"1d\", \"2h30m\", \"90s\")")]
    InvalidDuration(String),

    #[error("interval must be positive")]
    NonPositiveInterval,

    #[error("invalid anchor time '{0}' (expected HH:MM or HH:MM:SS)")]
    InvalidAnchorTime(String),

    #[error("schedule arithmetic overflowed")]
    Overflow,
}
