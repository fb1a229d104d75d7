//! Fetch boundary: the query window and the [`Fetcher`] contract.

use crate::core::record::{Reading, SchemaError, StateChange, StreamKind};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Half-open query window `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        Self { start, stop }
    }

    /// The window of the given length ending at `now`.
    pub fn trailing(now: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start: now - length,
            stop: now,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.stop
    }

    pub fn start_rfc3339(&self) -> String {
        self.start.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub fn stop_rfc3339(&self) -> String {
        self.stop.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start_rfc3339(), self.stop_rfc3339())
    }
}

/// Fetch failures. These abort the current run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source config error: {0}")]
    Config(String),

    #[error("source network error: {0}")]
    Network(String),

    #[error("source server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("could not decode source response: {0}")]
    Decode(String),

    #[error("invalid {stream} row {row}: {source}")]
    Schema {
        stream: StreamKind,
        row: usize,
        #[source]
        source: SchemaError,
    },
}

/// Supplies both streams for a window, each sorted ascending by timestamp.
pub trait Fetcher {
    fn fetch_readings(&self, window: &Window) -> Result<Vec<Reading>, FetchError>;

    fn fetch_state_changes(&self, window: &Window) -> Result<Vec<StateChange>, FetchError>;

    /// The last state change strictly before `window.start`, carried into the
    /// window so leading readings inherit the state already in effect.
    ///
    /// Sources without history return `None`.
    fn fetch_state_before(&self, _window: &Window) -> Result<Option<StateChange>, FetchError> {
        Ok(None)
    }
}
