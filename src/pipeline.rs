//! One fire: fetch, align, render, publish, notify.
//!
//! Everything that can fail on bad data happens before the first report is
//! published, so a failed fire leaves no partial report set behind.

use crate::config::{Config, ConfigError};
use crate::core::align::align;
use crate::core::error::PreconditionError;
use crate::core::record::unset_attributes;
use crate::core::reports::{
    downtime_events, downtime_summary, downtime_table, summary_text, utilisation,
    utilisation_table, StatusSummary,
};
use crate::notify::Notifier;
use crate::sink::{Sink, SinkError};
use crate::source::{FetchError, Fetcher, Window};
use crate::stats::SharedRunLog;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Failures that abort a fire.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Per-process settings for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Length of the trailing query window
    pub window: Duration,
    /// Timezone for report dates
    pub tz: Tz,
    /// Whether to call the notifier
    pub notify: bool,
    /// Host name shown in notification bodies
    pub hostname: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            window: config.report.window,
            tz: config.report.tz()?,
            notify: config.email.notifications_enabled(),
            hostname,
        })
    }
}

/// Result of a successful fire.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub window: Window,
    pub readings: usize,
    pub state_changes: usize,
    pub locations: Vec<PathBuf>,
    pub downtime: Vec<StatusSummary>,
    pub notified: bool,
}

/// The fetch-align-publish pipeline over injected collaborators.
pub struct ReportPipeline<F, S, N> {
    fetcher: F,
    sink: S,
    notifier: N,
    settings: PipelineSettings,
    run_log: Option<SharedRunLog>,
}

impl<F: Fetcher, S: Sink, N: Notifier> ReportPipeline<F, S, N> {
    pub fn new(fetcher: F, sink: S, notifier: N, settings: PipelineSettings) -> Self {
        Self {
            fetcher,
            sink,
            notifier,
            settings,
            run_log: None,
        }
    }

    /// Record every fire in `run_log`.
    pub fn with_run_log(mut self, run_log: SharedRunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Report names carry the production date in the report timezone.
    fn report_name(&self, kind: &str, now: DateTime<Utc>) -> String {
        format!(
            "{kind}_report-produced-{}",
            now.with_timezone(&self.settings.tz).format("%Y-%m-%d")
        )
    }

    /// Run one fire for the window ending at `now`.
    pub fn run(&self, now: DateTime<Utc>) -> Result<RunOutcome, PipelineError> {
        let result = self.run_inner(now);
        if let Some(log) = &self.run_log {
            match &result {
                Ok(outcome) => log.record_fire(
                    outcome.readings as u64,
                    outcome.locations.len() as u64,
                    outcome.notified,
                ),
                Err(_) => log.record_failure(),
            }
        }
        result
    }

    fn run_inner(&self, now: DateTime<Utc>) -> Result<RunOutcome, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("fire", %run_id);
        let _enter = span.enter();

        let window = Window::trailing(now, self.settings.window);
        tracing::info!(%window, "running analysis");

        let readings = self.fetcher.fetch_readings(&window)?;
        let mut changes = Vec::new();
        if let Some(carried) = self.fetcher.fetch_state_before(&window)? {
            if carried.timestamp < window.start {
                tracing::debug!(timestamp = %carried.timestamp, "carrying state into window");
                changes.push(carried);
            } else {
                tracing::warn!(
                    timestamp = %carried.timestamp,
                    "ignoring carried state that is not before the window"
                );
            }
        }
        changes.extend(self.fetcher.fetch_state_changes(&window)?);

        let aligned = align(&readings, &changes, &unset_attributes())?;

        let events = downtime_events(&aligned, window.stop);
        let machines = utilisation(&aligned, window.stop);
        let summary = downtime_summary(&events);

        let tz = self.settings.tz;
        let downtime = downtime_table(&self.report_name("downtime", now), &events, tz);
        let utilisation = utilisation_table(&self.report_name("utilisation", now), &machines);

        let locations = vec![
            self.sink.publish(&downtime)?,
            self.sink.publish(&utilisation)?,
            self.sink
                .publish_annotated(&self.report_name("production", now), &aligned)?,
        ];
        tracing::info!(
            readings = readings.len(),
            state_changes = changes.len(),
            downtime_events = events.len(),
            reports = locations.len(),
            "reports published"
        );

        let notified = self.settings.notify
            && self.send_notification(
                now,
                &window,
                (readings.len(), changes.len()),
                &summary,
                &locations,
            );

        Ok(RunOutcome {
            run_id,
            window,
            readings: readings.len(),
            state_changes: changes.len(),
            locations,
            downtime: summary,
            notified,
        })
    }

    /// Best-effort delivery; failures are logged and do not fail the fire.
    fn send_notification(
        &self,
        now: DateTime<Utc>,
        window: &Window,
        (readings, state_changes): (usize, usize),
        summary: &[StatusSummary],
        locations: &[PathBuf],
    ) -> bool {
        let date = now.with_timezone(&self.settings.tz).format("%Y-%m-%d");
        let subject = format!("Production Report {date}");
        let body = format!(
            "Report Attached\n\n\
             Host: {}\n\
             Window: {window}\n\
             Readings: {readings} (state changes: {state_changes})\n\n\
             {}",
            self.settings.hostname,
            summary_text(summary)
        );

        match self.notifier.notify(&subject, &body, locations) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    channel = self.notifier.channel_name(),
                    error = %e,
                    "notification failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::{Reading, StateChange};
    use crate::core::reports::ReportTable;
    use crate::notify::NotifyError;
    use crate::stats::RunLog;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    struct StaticFetcher {
        readings: Vec<Reading>,
        changes: Vec<StateChange>,
        carried: Option<StateChange>,
    }

    impl Fetcher for StaticFetcher {
        fn fetch_readings(&self, _window: &Window) -> Result<Vec<Reading>, FetchError> {
            Ok(self.readings.clone())
        }

        fn fetch_state_changes(&self, _window: &Window) -> Result<Vec<StateChange>, FetchError> {
            Ok(self.changes.clone())
        }

        fn fetch_state_before(&self, _window: &Window) -> Result<Option<StateChange>, FetchError> {
            Ok(self.carried.clone())
        }
    }

    #[derive(Default)]
    struct MemorySink {
        tables: RefCell<Vec<ReportTable>>,
    }

    impl Sink for &MemorySink {
        fn publish(&self, table: &ReportTable) -> Result<PathBuf, SinkError> {
            self.tables.borrow_mut().push(table.clone());
            Ok(PathBuf::from(format!("{}.csv", table.name)))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: RefCell<Vec<(String, String, usize)>>,
        fail: bool,
    }

    impl Notifier for &RecordingNotifier {
        fn notify(
            &self,
            subject: &str,
            body: &str,
            attachments: &[PathBuf],
        ) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Smtp("connection refused".to_string()));
            }
            self.sent
                .borrow_mut()
                .push((subject.to_string(), body.to_string(), attachments.len()));
            Ok(())
        }

        fn channel_name(&self) -> &str {
            "memory"
        }
    }

    fn settings(notify: bool) -> PipelineSettings {
        PipelineSettings {
            window: Duration::hours(1),
            tz: chrono_tz::UTC,
            notify,
            hostname: "plant-01".to_string(),
        }
    }

    fn fetcher() -> StaticFetcher {
        StaticFetcher {
            readings: vec![
                Reading::new(ts(-600))
                    .with("machine_name", "filler")
                    .with("status", "Running")
                    .with("running", true),
                Reading::new(ts(-300))
                    .with("machine_name", "filler")
                    .with("status", "Jam")
                    .with("running", false),
                Reading::new(ts(-120))
                    .with("machine_name", "filler")
                    .with("status", "Running")
                    .with("running", true),
            ],
            changes: vec![StateChange::new(ts(-400)).with("batch_id", "B7")],
            carried: None,
        }
    }

    #[test]
    fn test_run_publishes_all_reports() {
        let sink = MemorySink::default();
        let notifier = RecordingNotifier::default();
        let pipeline = ReportPipeline::new(fetcher(), &sink, &notifier, settings(true));

        let outcome = pipeline.run(ts(0)).unwrap();
        assert_eq!(outcome.readings, 3);
        assert_eq!(outcome.state_changes, 1);
        assert_eq!(outcome.window.stop, ts(0));
        assert!(outcome.notified);

        let tables = sink.tables.borrow();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "downtime_report-produced-2023-11-14",
                "utilisation_report-produced-2023-11-14",
                "production_report-produced-2023-11-14",
            ]
        );

        let downtime = &tables[0];
        assert_eq!(downtime.len(), 1);
        assert_eq!(downtime.cell(0, "status"), Some("Jam"));
        assert_eq!(downtime.cell(0, "duration (seconds)"), Some("180"));
        assert_eq!(downtime.cell(0, "batch_id"), Some("B7"));

        let production = &tables[2];
        assert_eq!(production.len(), 3);
        assert_eq!(production.cell(0, "batch_id"), Some("unset"));
        assert_eq!(production.cell(2, "batch_id"), Some("B7"));

        let sent = notifier.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Production Report 2023-11-14");
        assert!(sent[0].1.starts_with("Report Attached"));
        assert!(sent[0].1.contains("plant-01"));
        assert!(sent[0].1.contains("Jam"));
        assert_eq!(sent[0].2, 3);
    }

    #[test]
    fn test_notification_disabled() {
        let sink = MemorySink::default();
        let notifier = RecordingNotifier::default();
        let pipeline = ReportPipeline::new(fetcher(), &sink, &notifier, settings(false));

        let outcome = pipeline.run(ts(0)).unwrap();
        assert!(!outcome.notified);
        assert!(notifier.sent.borrow().is_empty());
        assert_eq!(sink.tables.borrow().len(), 3);
    }

    #[test]
    fn test_notification_failure_does_not_fail_run() {
        let sink = MemorySink::default();
        let notifier = RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        };
        let pipeline = ReportPipeline::new(fetcher(), &sink, &notifier, settings(true));

        let outcome = pipeline.run(ts(0)).unwrap();
        assert!(!outcome.notified);
        assert_eq!(outcome.locations.len(), 3);
    }

    #[test]
    fn test_unsorted_stream_publishes_nothing() {
        let mut source = fetcher();
        source.readings.swap(0, 2);

        let sink = MemorySink::default();
        let notifier = RecordingNotifier::default();
        let log = Arc::new(RunLog::new());
        let pipeline = ReportPipeline::new(source, &sink, &notifier, settings(true))
            .with_run_log(log.clone());

        let err = pipeline.run(ts(0)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Precondition(PreconditionError::Unsorted { index: 1, .. })
        ));
        assert!(sink.tables.borrow().is_empty());
        assert!(notifier.sent.borrow().is_empty());
        assert_eq!(log.stats().failed_fires, 1);
        assert_eq!(log.stats().fires, 0);
    }

    #[test]
    fn test_run_log_records_fire() {
        let sink = MemorySink::default();
        let notifier = RecordingNotifier::default();
        let log = Arc::new(RunLog::new());
        let pipeline = ReportPipeline::new(fetcher(), &sink, &notifier, settings(true))
            .with_run_log(log.clone());

        pipeline.run(ts(0)).unwrap();
        let stats = log.stats();
        assert_eq!(stats.fires, 1);
        assert_eq!(stats.readings_aligned, 3);
        assert_eq!(stats.reports_published, 3);
        assert_eq!(stats.notifications_sent, 1);
    }

    #[test]
    fn test_report_dates_follow_timezone() {
        let sink = MemorySink::default();
        let notifier = RecordingNotifier::default();
        let mut tokyo = settings(false);
        tokyo.tz = chrono_tz::Asia::Tokyo;
        let pipeline = ReportPipeline::new(fetcher(), &sink, &notifier, tokyo);

        // 2023-11-14 22:13:20 UTC is already the 15th in Tokyo.
        pipeline.run(ts(0)).unwrap();
        assert_eq!(
            sink.tables.borrow()[0].name,
            "downtime_report-produced-2023-11-15"
        );
    }

    #[test]
    fn test_state_before_window_is_carried() {
        let mut source = fetcher();
        source.carried = Some(StateChange::new(ts(-7200)).with("batch_id", "B6"));

        let sink = MemorySink::default();
        let notifier = RecordingNotifier::default();
        let pipeline = ReportPipeline::new(source, &sink, &notifier, settings(false));

        let outcome = pipeline.run(ts(0)).unwrap();
        assert_eq!(outcome.state_changes, 2);

        let tables = sink.tables.borrow();
        let production = &tables[2];
        assert_eq!(production.cell(0, "batch_id"), Some("B6"));
        assert_eq!(production.cell(2, "batch_id"), Some("B7"));
    }

    #[test]
    fn test_carried_state_inside_window_is_ignored() {
        let mut source = fetcher();
        source.carried = Some(StateChange::new(ts(-900)).with("batch_id", "B6"));

        let sink = MemorySink::default();
        let notifier = RecordingNotifier::default();
        let pipeline = ReportPipeline::new(source, &sink, &notifier, settings(false));

        let outcome = pipeline.run(ts(0)).unwrap();
        assert_eq!(outcome.state_changes, 1);
        assert_eq!(sink.tables.borrow()[2].cell(0, "batch_id"), Some("unset"));
    }
}
