//! Report derivation from aligned readings.
//!
//! Durations follow event-duration semantics: a reading lasts until the next
//! reading of the same machine, and the last one lasts until the window stop.

use crate::core::record::{AnnotatedReading, Fields, BATCH_ID};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use statrs::statistics::{Data, Median, Statistics};
use std::collections::{BTreeMap, BTreeSet};

/// Status values that do not count as downtime.
pub const NON_DOWNTIME_STATUSES: [&str; 2] = ["Running", "Shift End"];

/// Status marking the end of a shift; excluded from utilisation.
pub const SHIFT_END: &str = "Shift End";

/// Prefix for attribute columns whose name collides with a reading column.
pub const ATTRIBUTE_PREFIX: &str = "state.";

/// Prefix for pass-through columns whose name collides with the time column.
pub const EXTRA_PREFIX: &str = "extra.";

/// Column holding the reading timestamp.
pub const TIME_COLUMN: &str = "time";

/// A rendered table ready for a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ReportTable {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up a cell by row index and column name.
    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(col).map(String::as_str)
    }
}

fn render_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn cell(fields: &Fields, name: &str) -> String {
    fields.get(name).map(|v| v.to_string()).unwrap_or_default()
}

/// Row-for-row rendering of annotated readings.
///
/// Columns are `time`, the reading fields, the pass-through fields, then the
/// inherited attributes. Column names are unique: a pass-through field named
/// `time` becomes `extra.time`, and an attribute that collides with any
/// earlier column gets the `state.` prefix. Absent values render as empty
/// cells.
pub fn annotated_table(name: &str, rows: &[AnnotatedReading]) -> ReportTable {
    let mut field_names = BTreeSet::new();
    let mut extra_names = BTreeSet::new();
    let mut attr_names = BTreeSet::new();
    for row in rows {
        field_names.extend(row.reading.fields.keys().cloned());
        extra_names.extend(row.reading.extra.keys().cloned());
        attr_names.extend(row.attributes.keys().cloned());
    }
    extra_names.retain(|n| !field_names.contains(n));

    let mut columns = vec![TIME_COLUMN.to_string()];
    columns.extend(field_names.iter().cloned());
    for extra in &extra_names {
        if extra == TIME_COLUMN {
            columns.push(format!("{EXTRA_PREFIX}{extra}"));
        } else {
            columns.push(extra.clone());
        }
    }
    for attr in &attr_names {
        if columns.contains(attr) {
            columns.push(format!("{ATTRIBUTE_PREFIX}{attr}"));
        } else {
            columns.push(attr.clone());
        }
    }

    let rows = rows
        .iter()
        .map(|row| {
            let mut out = Vec::with_capacity(columns.len());
            out.push(render_time(row.timestamp()));
            out.extend(field_names.iter().map(|n| cell(&row.reading.fields, n)));
            out.extend(extra_names.iter().map(|n| cell(&row.reading.extra, n)));
            out.extend(attr_names.iter().map(|n| cell(&row.attributes, n)));
            out
        })
        .collect();

    ReportTable {
        name: name.to_string(),
        columns,
        rows,
    }
}

fn machine_of(row: &AnnotatedReading) -> Option<&str> {
    row.reading.get("machine_name").and_then(|v| v.as_str())
}

/// Pair each row with its duration, per machine.
fn with_durations<'a, I>(rows: I, stop: DateTime<Utc>) -> Vec<(&'a AnnotatedReading, Duration)>
where
    I: IntoIterator<Item = &'a AnnotatedReading>,
{
    let mut by_machine: BTreeMap<&str, Vec<&AnnotatedReading>> = BTreeMap::new();
    for row in rows {
        if let Some(machine) = machine_of(row) {
            by_machine.entry(machine).or_default().push(row);
        }
    }

    let mut out = Vec::new();
    for series in by_machine.values() {
        for (i, row) in series.iter().enumerate() {
            let until = series.get(i + 1).map_or(stop, |next| next.timestamp());
            let duration = (until - row.timestamp()).max(Duration::zero());
            out.push((*row, duration));
        }
    }
    out
}

/// A period spent in a non-running status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DowntimeEvent {
    pub machine_name: String,
    pub status: String,
    pub start: DateTime<Utc>,
    pub duration_secs: i64,
    pub attributes: Fields,
}

/// Downtime events from the status series of each machine.
pub fn downtime_events(rows: &[AnnotatedReading], stop: DateTime<Utc>) -> Vec<DowntimeEvent> {
    let status_rows = rows.iter().filter(|r| r.reading.get("status").is_some());

    let mut events: Vec<DowntimeEvent> = with_durations(status_rows, stop)
        .into_iter()
        .filter_map(|(row, duration)| {
            let status = row.reading.get("status")?.to_string();
            if NON_DOWNTIME_STATUSES.contains(&status.as_str()) {
                return None;
            }
            Some(DowntimeEvent {
                machine_name: machine_of(row)?.to_string(),
                status,
                start: row.timestamp(),
                duration_secs: duration.num_seconds(),
                attributes: row.attributes.clone(),
            })
        })
        .collect();

    events.sort_by_key(|e| e.start);
    events
}

/// Render downtime events in the report timezone.
pub fn downtime_table(name: &str, events: &[DowntimeEvent], tz: Tz) -> ReportTable {
    let mut table = ReportTable::new(
        name,
        &[
            "machine_name",
            "status",
            "duration (seconds)",
            BATCH_ID,
            "Date",
            "Time",
        ],
    );
    for event in events {
        let local = event.start.with_timezone(&tz);
        table.rows.push(vec![
            event.machine_name.clone(),
            event.status.clone(),
            event.duration_secs.to_string(),
            cell(&event.attributes, BATCH_ID),
            local.format("%Y-%m-%d").to_string(),
            local.format("%H:%M:%S").to_string(),
        ]);
    }
    table
}

/// Running versus stopped time for one machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utilisation {
    pub machine_name: String,
    pub running_secs: i64,
    pub stopped_secs: i64,
    pub percent: f64,
}

/// Per-machine utilisation over the window.
///
/// Shift-end rows and rows without a `running` flag are ignored. A machine
/// with no recorded stopped time is 100% utilised.
pub fn utilisation(rows: &[AnnotatedReading], stop: DateTime<Utc>) -> Vec<Utilisation> {
    let mut totals: BTreeMap<String, (i64, i64)> = BTreeMap::new();

    for (row, duration) in with_durations(rows, stop) {
        if row.reading.get("status").and_then(|v| v.as_str()) == Some(SHIFT_END) {
            continue;
        }
        let Some(running) = row.reading.get("running").and_then(|v| v.as_bool()) else {
            continue;
        };
        let Some(machine) = machine_of(row) else {
            continue;
        };
        let entry = totals.entry(machine.to_string()).or_default();
        if running {
            entry.0 += duration.num_seconds();
        } else {
            entry.1 += duration.num_seconds();
        }
    }

    totals
        .into_iter()
        .map(|(machine_name, (running_secs, stopped_secs))| {
            let percent = if stopped_secs != 0 {
                running_secs as f64 / (running_secs + stopped_secs) as f64 * 100.0
            } else {
                100.0
            };
            Utilisation {
                machine_name,
                running_secs,
                stopped_secs,
                percent,
            }
        })
        .collect()
}

pub fn utilisation_table(name: &str, machines: &[Utilisation]) -> ReportTable {
    let mut table = ReportTable::new(name, &["machine_name", "utilisation (%)"]);
    for m in machines {
        table
            .rows
            .push(vec![m.machine_name.clone(), format!("{:.2}", m.percent)]);
    }
    table
}

/// Aggregate downtime for one status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub status: String,
    pub count: usize,
    pub total_secs: i64,
    pub mean_secs: f64,
    pub median_secs: f64,
}

/// Summarise downtime per status, largest total first.
pub fn downtime_summary(events: &[DowntimeEvent]) -> Vec<StatusSummary> {
    let mut by_status: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for event in events {
        by_status
            .entry(event.status.as_str())
            .or_default()
            .push(event.duration_secs as f64);
    }

    let mut out: Vec<StatusSummary> = by_status
        .into_iter()
        .map(|(status, secs)| {
            let total_secs = secs.iter().sum::<f64>() as i64;
            let mean_secs = secs.iter().mean();
            let median_secs = Data::new(secs.clone()).median();
            StatusSummary {
                status: status.to_string(),
                count: secs.len(),
                total_secs,
                mean_secs,
                median_secs,
            }
        })
        .collect();

    out.sort_by(|a, b| b.total_secs.cmp(&a.total_secs).then(a.status.cmp(&b.status)));
    out
}

/// Plain-text rendering of a downtime summary.
pub fn summary_text(summary: &[StatusSummary]) -> String {
    if summary.is_empty() {
        return "No downtime recorded.".to_string();
    }
    let mut out = String::from("Downtime by status:\n");
    for s in summary {
        out.push_str(&format!(
            "  - {}: {} event(s), total {}s, mean {:.0}s, median {:.0}s\n",
            s.status, s.count, s.total_secs, s.mean_secs, s.median_secs
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::align::align;
    use crate::core::record::{unset_attributes, Reading, StateChange};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn status(t: i64, machine: &str, status: &str, running: bool) -> Reading {
        Reading::new(ts(t))
            .with("machine_name", machine)
            .with("status", status)
            .with("running", running)
    }

    fn fixture() -> Vec<AnnotatedReading> {
        let readings = vec![
            status(0, "filler", "Running", true),
            status(0, "capper", "Running", true),
            status(100, "filler", "Jam", false),
            status(160, "filler", "Running", true),
            status(200, "capper", "Starved", false),
            status(400, "filler", "Shift End", false),
        ];
        let changes = vec![StateChange::new(ts(150)).with(BATCH_ID, "B-7")];
        align(&readings, &changes, &unset_attributes()).unwrap()
    }

    #[test]
    fn test_annotated_table_is_lossless() {
        let mut rows = fixture();
        rows[0].reading.extra.insert("line".into(), "L1".into());
        rows[1].reading.extra.insert(BATCH_ID.into(), "raw".into());

        let table = annotated_table("production", &rows);
        assert_eq!(table.len(), rows.len());
        assert_eq!(
            table.columns,
            [
                "time",
                "machine_name",
                "running",
                "status",
                "batch_id",
                "line",
                "state.batch_id"
            ]
        );
        assert_eq!(table.cell(0, "line"), Some("L1"));
        assert_eq!(table.cell(1, "line"), Some(""));
        assert_eq!(table.cell(0, "state.batch_id"), Some("unset"));
        assert_eq!(table.cell(3, "state.batch_id"), Some("B-7"));
        assert_eq!(table.cell(2, "running"), Some("false"));
    }

    #[test]
    fn test_time_extra_does_not_shadow_timestamp() {
        let readings = vec![Reading::new(ts(0)).with("machine_name", "filler")];
        let mut rows = align(&readings, &[], &unset_attributes()).unwrap();
        rows[0].reading.extra.insert("time".into(), "shift-b".into());

        let table = annotated_table("production", &rows);
        assert_eq!(
            table.columns,
            ["time", "machine_name", "extra.time", "batch_id"]
        );
        assert_eq!(table.cell(0, "time"), Some("2023-11-14T22:13:20Z"));
        assert_eq!(table.cell(0, "extra.time"), Some("shift-b"));

        let unique: BTreeSet<&String> = table.columns.iter().collect();
        assert_eq!(unique.len(), table.columns.len());
    }

    #[test]
    fn test_downtime_events() {
        let events = downtime_events(&fixture(), ts(500));
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].machine_name, "filler");
        assert_eq!(events[0].status, "Jam");
        assert_eq!(events[0].duration_secs, 60);
        assert_eq!(events[0].attributes, unset_attributes());

        assert_eq!(events[1].machine_name, "capper");
        assert_eq!(events[1].status, "Starved");
        // last capper reading runs until the window stop
        assert_eq!(events[1].duration_secs, 300);
        assert_eq!(events[1].attributes.get(BATCH_ID), Some(&"B-7".into()));
    }

    #[test]
    fn test_downtime_table_uses_timezone() {
        let events = downtime_events(&fixture(), ts(500));
        let table = downtime_table("downtime", &events, chrono_tz::Asia::Tokyo);
        // 2023-11-14T22:15:00Z is 07:15 the next day in Tokyo
        assert_eq!(table.cell(0, "Date"), Some("2023-11-15"));
        assert_eq!(table.cell(0, "Time"), Some("07:15:00"));
        assert_eq!(table.cell(1, BATCH_ID), Some("B-7"));
    }

    #[test]
    fn test_utilisation() {
        let machines = utilisation(&fixture(), ts(500));
        assert_eq!(machines.len(), 2);

        let capper = &machines[0];
        assert_eq!(capper.machine_name, "capper");
        assert_eq!(capper.running_secs, 200);
        assert_eq!(capper.stopped_secs, 300);
        assert!((capper.percent - 40.0).abs() < 1e-9);

        // shift end row excluded: 100+240 running, 60 stopped
        let filler = &machines[1];
        assert_eq!(filler.running_secs, 340);
        assert_eq!(filler.stopped_secs, 60);
        assert!((filler.percent - 85.0).abs() < 1e-9);
    }

    #[test]
    fn test_utilisation_without_stops_is_full() {
        let rows = align(
            &[status(0, "labeller", "Running", true)],
            &[],
            &unset_attributes(),
        )
        .unwrap();
        let machines = utilisation(&rows, ts(60));
        assert_eq!(machines[0].percent, 100.0);

        let table = utilisation_table("utilisation", &machines);
        assert_eq!(table.cell(0, "utilisation (%)"), Some("100.00"));
    }

    #[test]
    fn test_downtime_summary() {
        let events = downtime_events(&fixture(), ts(500));
        let summary = downtime_summary(&events);
        assert_eq!(summary[0].status, "Starved");
        assert_eq!(summary[0].total_secs, 300);
        assert_eq!(summary[1].status, "Jam");
        assert!((summary[1].median_secs - 60.0).abs() < 1e-9);

        let text = summary_text(&summary);
        assert!(text.contains("Starved: 1 event(s), total 300s"));
        assert_eq!(summary_text(&[]), "No downtime recorded.");
    }
}
