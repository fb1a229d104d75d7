//! Cumulative run statistics.
//!
//! Counters are kept in memory for the life of the process and persisted as
//! JSON so `shift-report status` can show them from another process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Run counters for the current process.
#[derive(Debug)]
pub struct RunLog {
    /// Number of fires that completed
    fires: AtomicU64,
    /// Number of fires that failed
    failed_fires: AtomicU64,
    /// Number of readings aligned
    readings_aligned: AtomicU64,
    /// Number of report files published
    reports_published: AtomicU64,
    /// Number of notifications delivered
    notifications_sent: AtomicU64,
    /// Start of the current process
    started: DateTime<Utc>,
    /// Time of the last completed fire
    last_fire: Mutex<Option<DateTime<Utc>>>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl RunLog {
    pub fn new() -> Self {
        Self {
            fires: AtomicU64::new(0),
            failed_fires: AtomicU64::new(0),
            readings_aligned: AtomicU64::new(0),
            reports_published: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            started: Utc::now(),
            last_fire: Mutex::new(None),
            persist_path: None,
        }
    }

    /// Create a run log that resumes from, and saves to, `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "could not load previous run statistics");
        }

        log
    }

    /// Record a completed fire.
    pub fn record_fire(&self, readings: u64, reports: u64, notified: bool) {
        self.fires.fetch_add(1, Ordering::Relaxed);
        self.readings_aligned.fetch_add(readings, Ordering::Relaxed);
        self.reports_published.fetch_add(reports, Ordering::Relaxed);
        if notified {
            self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut last) = self.last_fire.lock() {
            *last = Some(Utc::now());
        }
    }

    /// Record a fire that aborted.
    pub fn record_failure(&self) {
        self.failed_fires.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            fires: self.fires.load(Ordering::Relaxed),
            failed_fires: self.failed_fires.load(Ordering::Relaxed),
            readings_aligned: self.readings_aligned.load(Ordering::Relaxed),
            reports_published: self.reports_published.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            last_fire: self.last_fire.lock().ok().and_then(|l| *l),
            started: self.started,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        let last_fire = stats
            .last_fire
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        format!(
            "Run Statistics:\n\
             - Fires completed: {}\n\
             - Fires failed: {}\n\
             - Readings aligned: {}\n\
             - Reports published: {}\n\
             - Notifications sent: {}\n\
             - Last fire: {}",
            stats.fires,
            stats.failed_fires,
            stats.readings_aligned,
            stats.reports_published,
            stats.notifications_sent,
            last_fire
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let json = serde_json::to_string_pretty(&self.stats()).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let persisted = load_stats(path)?;

                self.fires.store(persisted.fires, Ordering::Relaxed);
                self.failed_fires
                    .store(persisted.failed_fires, Ordering::Relaxed);
                self.readings_aligned
                    .store(persisted.readings_aligned, Ordering::Relaxed);
                self.reports_published
                    .store(persisted.reports_published, Ordering::Relaxed);
                self.notifications_sent
                    .store(persisted.notifications_sent, Ordering::Relaxed);
                if let Ok(mut last) = self.last_fire.lock() {
                    *last = persisted.last_fire;
                }
            }
        }
        Ok(())
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of run statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub fires: u64,
    #[serde(default)]
    pub failed_fires: u64,
    pub readings_aligned: u64,
    pub reports_published: u64,
    pub notifications_sent: u64,
    pub last_fire: Option<DateTime<Utc>>,
    pub started: DateTime<Utc>,
}

/// Read persisted statistics.
pub fn load_stats(path: &std::path::Path) -> Result<RunStats, std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(std::io::Error::other)
}

/// Thread-safe shared run log.
pub type SharedRunLog = Arc<RunLog>;

/// Create a new shared run log with persistence.
pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedRunLog {
    Arc::new(RunLog::with_persistence(path))
}
