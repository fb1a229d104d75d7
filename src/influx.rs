//! InfluxDB 2.x fetcher.
//!
//! Flux queries are posted to `/api/v2/query` and the CSV response is parsed
//! row by row through the stream schemas, so nothing loosely typed leaves
//! this module.

use crate::core::record::{
    RecordSchema, Reading, StateChange, StreamKind, READING_SCHEMA, STATE_CHANGE_SCHEMA,
};
use crate::source::{FetchError, Fetcher, Window};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Columns added by the query engine that are not record fields.
const BOOKKEEPING_COLUMNS: [&str; 7] = [
    "",
    "result",
    "table",
    "_start",
    "_stop",
    "_measurement",
    "_time",
];

/// Connection settings for the time-series store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://localhost:8086`
    pub url: String,
    pub org: String,
    pub bucket: String,
    /// API token
    pub token: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Measurement holding the production status readings
    pub readings_measurement: String,
    /// Measurement holding batch changeovers
    pub batch_measurement: String,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            org: String::new(),
            bucket: String::new(),
            token: String::new(),
            timeout_secs: 30,
            readings_measurement: "fault_tracking".to_string(),
            batch_measurement: "batch_tracking".to_string(),
        }
    }
}

impl InfluxConfig {
    /// Get the query endpoint URL.
    pub fn query_url(&self) -> String {
        format!("{}/api/v2/query", self.url.trim_end_matches('/'))
    }

    /// Get the health check endpoint URL.
    pub fn health_url(&self) -> String {
        format!("{}/health", self.url.trim_end_matches('/'))
    }
}

/// Flux query for one measurement, pivoted to one row per timestamp and tag set.
pub fn pivot_query(bucket: &str, measurement: &str, window: &Window) -> String {
    format!(
        r#"from(bucket: "{bucket}")
    |> range(start: {start}, stop: {stop})
    |> filter(fn: (r) => r["_measurement"] == "{measurement}")
    |> pivot(rowKey: ["_time"], columnKey: ["_field"], valueColumn: "_value")
    |> drop(columns: ["_start", "_stop", "_measurement"])
    |> group()
    |> sort(columns: ["_time"])"#,
        start = window.start_rfc3339(),
        stop = window.stop_rfc3339(),
    )
}

/// Flux query for the most recent row of a measurement before `window.start`.
pub fn last_before_query(bucket: &str, measurement: &str, window: &Window) -> String {
    format!(
        r#"from(bucket: "{bucket}")
    |> range(start: 1970-01-01T00:00:00Z, stop: {stop})
    |> filter(fn: (r) => r["_measurement"] == "{measurement}")
    |> pivot(rowKey: ["_time"], columnKey: ["_field"], valueColumn: "_value")
    |> drop(columns: ["_start", "_stop", "_measurement"])
    |> group()
    |> sort(columns: ["_time"])
    |> tail(n: 1)"#,
        stop = window.start_rfc3339(),
    )
}

/// One data row of a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub time: DateTime<Utc>,
    pub cells: Vec<(String, String)>,
}

/// Parse an annotation-free CSV query response.
///
/// Multi-table results start each table with a header row, usually after a
/// blank line. A row is a header when it is the first row, follows a blank
/// line, or repeats `_time` in the current header's `_time` position; a data
/// cell that merely contains the text `_time` is never taken for a header.
pub fn parse_csv_response(body: &str) -> Result<Vec<RawRow>, FetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut header: Option<Vec<String>> = None;
    let mut after_blank = true;
    let mut rows = Vec::new();

    for record in reader.records() {
        let record = record.map_err(|e| FetchError::Decode(e.to_string()))?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            after_blank = true;
            continue;
        }

        let repeats_header = header
            .as_ref()
            .and_then(|columns| columns.iter().position(|c| c == "_time"))
            .is_some_and(|idx| record.get(idx) == Some("_time"));
        let starts_table = after_blank && record.iter().any(|cell| cell == "_time");
        after_blank = false;

        if starts_table || repeats_header {
            header = Some(record.iter().map(str::to_string).collect());
            continue;
        }
        let Some(columns) = header.as_ref() else {
            return Err(FetchError::Decode("data row before header".to_string()));
        };

        let mut time = None;
        let mut cells = Vec::new();
        for (name, value) in columns.iter().zip(record.iter()) {
            if name == "_time" {
                let parsed = DateTime::parse_from_rfc3339(value)
                    .map_err(|e| FetchError::Decode(format!("bad _time '{value}': {e}")))?;
                time = Some(parsed.with_timezone(&Utc));
            } else if !BOOKKEEPING_COLUMNS.contains(&name.as_str()) {
                cells.push((name.clone(), value.to_string()));
            }
        }
        let time = time.ok_or_else(|| FetchError::Decode("row without _time".to_string()))?;
        rows.push(RawRow { time, cells });
    }

    Ok(rows)
}

fn validate_rows<T>(
    rows: &[RawRow],
    schema: &RecordSchema,
    build: impl Fn(&RecordSchema, &RawRow) -> Result<T, crate::core::record::SchemaError>,
) -> Result<Vec<T>, FetchError> {
    rows.iter()
        .enumerate()
        .map(|(row, raw)| {
            build(schema, raw).map_err(|source| FetchError::Schema {
                stream: schema.kind,
                row,
                source,
            })
        })
        .collect()
}

/// Decode readings from a CSV query response.
pub fn decode_readings(body: &str) -> Result<Vec<Reading>, FetchError> {
    let rows = parse_csv_response(body)?;
    validate_rows(&rows, &READING_SCHEMA, |schema, raw| {
        schema.reading(
            raw.time,
            raw.cells.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )
    })
}

/// Decode state changes from a CSV query response.
pub fn decode_state_changes(body: &str) -> Result<Vec<StateChange>, FetchError> {
    let rows = parse_csv_response(body)?;
    validate_rows(&rows, &STATE_CHANGE_SCHEMA, |schema, raw| {
        schema.state_change(
            raw.time,
            raw.cells.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )
    })
}

/// Async client for the query API.
pub struct InfluxClient {
    config: InfluxConfig,
    client: reqwest::Client,
}

impl InfluxClient {
    /// Create a new client.
    pub fn new(config: InfluxConfig) -> Result<Self, FetchError> {
        if config.org.is_empty() || config.bucket.is_empty() {
            return Err(FetchError::Config(
                "source org and bucket must be set".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FetchError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &InfluxConfig {
        &self.config
    }

    /// Test connection to the store.
    pub async fn test_connection(&self) -> Result<bool, FetchError> {
        let response = self
            .client
            .get(self.config.health_url())
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    /// Run a Flux query and return the raw CSV body.
    pub async fn query(&self, flux: &str) -> Result<String, FetchError> {
        let body = serde_json::json!({
            "query": flux,
            "type": "flux",
            "dialect": {
                "header": true,
                "annotations": [],
                "delimiter": ",",
            },
        });

        let started = std::time::Instant::now();
        let response = self
            .client
            .post(self.config.query_url())
            .query(&[("org", self.config.org.as_str())])
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Accept", "application/csv")
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(FetchError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = text.len(),
            "query completed"
        );
        Ok(text)
    }

    pub async fn readings(&self, window: &Window) -> Result<Vec<Reading>, FetchError> {
        let flux = pivot_query(
            &self.config.bucket,
            &self.config.readings_measurement,
            window,
        );
        tracing::trace!(query = %flux, "readings query");
        decode_readings(&self.query(&flux).await?)
    }

    pub async fn state_changes(&self, window: &Window) -> Result<Vec<StateChange>, FetchError> {
        let flux = pivot_query(&self.config.bucket, &self.config.batch_measurement, window);
        tracing::trace!(query = %flux, "state change query");
        decode_state_changes(&self.query(&flux).await?)
    }

    /// The last state change recorded before the window opens, if any.
    pub async fn state_before(&self, window: &Window) -> Result<Option<StateChange>, FetchError> {
        let flux = last_before_query(&self.config.bucket, &self.config.batch_measurement, window);
        tracing::trace!(query = %flux, "carried state query");
        Ok(decode_state_changes(&self.query(&flux).await?)?.pop())
    }
}

/// Blocking client for use from the synchronous run loop.
pub struct BlockingInfluxClient {
    inner: InfluxClient,
    runtime: tokio::runtime::Runtime,
}

impl BlockingInfluxClient {
    /// Create a new blocking client.
    pub fn new(config: InfluxConfig) -> Result<Self, FetchError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| FetchError::Config(format!("Failed to create runtime: {e}")))?;

        Ok(Self {
            inner: InfluxClient::new(config)?,
            runtime,
        })
    }

    /// Test connection to the store.
    pub fn test_connection(&self) -> Result<bool, FetchError> {
        self.runtime.block_on(self.inner.test_connection())
    }
}

impl Fetcher for BlockingInfluxClient {
    fn fetch_readings(&self, window: &Window) -> Result<Vec<Reading>, FetchError> {
        let readings = self.runtime.block_on(self.inner.readings(window))?;
        tracing::info!(stream = %StreamKind::Readings, rows = readings.len(), "fetched");
        Ok(readings)
    }

    fn fetch_state_changes(&self, window: &Window) -> Result<Vec<StateChange>, FetchError> {
        let changes = self.runtime.block_on(self.inner.state_changes(window))?;
        tracing::info!(stream = %StreamKind::StateChanges, rows = changes.len(), "fetched");
        Ok(changes)
    }

    fn fetch_state_before(&self, window: &Window) -> Result<Option<StateChange>, FetchError> {
        self.runtime.block_on(self.inner.state_before(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::{SchemaError, Value};
    use chrono::TimeZone;

    const READINGS_CSV: &str = "\
,result,table,_time,machine_name,running,status
,_result,0,2024-05-01T06:00:00Z,filler,true,Running
,_result,0,2024-05-01T06:05:00Z,filler,false,Jam

,result,table,_time,machine_name,running,status,shift
,_result,1,2024-05-01T06:07:30.5Z,capper,true,,night
";

    #[test]
    fn test_config_urls() {
        let config = InfluxConfig {
            url: "http://influx:8086/".to_string(),
            ..InfluxConfig::default()
        };
        assert_eq!(config.query_url(), "http://influx:8086/api/v2/query");
        assert_eq!(config.health_url(), "http://influx:8086/health");
    }

    #[test]
    fn test_pivot_query_contains_window() {
        let window = Window::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
        );
        let flux = pivot_query("plant", "fault_tracking", &window);
        assert!(flux.contains(r#"from(bucket: "plant")"#));
        assert!(flux.contains("range(start: 2024-05-01T00:00:00Z, stop: 2024-05-02T00:00:00Z)"));
        assert!(flux.contains(r#"r["_measurement"] == "fault_tracking""#));
        assert!(flux.contains(r#"sort(columns: ["_time"])"#));
    }

    #[test]
    fn test_last_before_query_stops_at_window_start() {
        let window = Window::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
        );
        let flux = last_before_query("plant", "batch_tracking", &window);
        assert!(flux.contains("range(start: 1970-01-01T00:00:00Z, stop: 2024-05-01T00:00:00Z)"));
        assert!(flux.contains(r#"r["_measurement"] == "batch_tracking""#));
        assert!(flux.ends_with("|> tail(n: 1)"));
    }

    #[test]
    fn test_decode_readings_across_tables() {
        let readings = decode_readings(READINGS_CSV).unwrap();
        assert_eq!(readings.len(), 3);

        assert_eq!(readings[1].get("status"), Some(&Value::from("Jam")));
        assert_eq!(readings[1].get("running"), Some(&Value::Bool(false)));

        let last = &readings[2];
        assert_eq!(
            last.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 6, 7, 30).unwrap() + chrono::Duration::milliseconds(500)
        );
        assert!(last.get("status").is_none());
        assert_eq!(last.extra.get("shift"), Some(&Value::from("night")));
        assert!(!last.fields.contains_key("result"));
    }

    #[test]
    fn test_decode_state_changes_rejects_bad_rows() {
        let csv = "\
,result,table,_time,batch_id,product_id
,_result,0,2024-05-01T06:00:00Z,B-1,P-9
,_result,0,2024-05-01T08:00:00Z,,P-9
";
        let err = decode_state_changes(csv).unwrap_err();
        match err {
            FetchError::Schema {
                stream,
                row,
                source,
            } => {
                assert_eq!(stream, StreamKind::StateChanges);
                assert_eq!(row, 1);
                assert_eq!(source, SchemaError::MissingField("batch_id".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_time_text_in_data_is_not_a_header() {
        let csv = "\
,result,table,_time,machine_name,status
,_result,0,2024-05-01T06:00:00Z,filler,_time
,_result,0,2024-05-01T06:05:00Z,filler,Jam
,result,table,_time,machine_name,status
,_result,1,2024-05-01T06:07:00Z,capper,Running
";
        let readings = decode_readings(csv).unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0].get("status"), Some(&Value::from("_time")));
        assert_eq!(readings[1].get("status"), Some(&Value::from("Jam")));
        assert_eq!(readings[2].get("machine_name"), Some(&Value::from("capper")));
    }

    #[test]
    fn test_bad_time_is_decode_error() {
        let csv = ",result,table,_time,machine_name\n,_result,0,yesterday,filler\n";
        assert!(matches!(
            decode_readings(csv),
            Err(FetchError::Decode(_))
        ));
    }

    #[test]
    fn test_empty_response() {
        assert!(decode_readings("").unwrap().is_empty());
        assert!(decode_readings("\r\n").unwrap().is_empty());
    }

    #[test]
    fn test_client_requires_org_and_bucket() {
        assert!(matches!(
            InfluxClient::new(InfluxConfig::default()),
            Err(FetchError::Config(_))
        ));
    }
}
