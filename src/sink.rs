//! Report persistence.

use crate::core::record::AnnotatedReading;
use crate::core::reports::{annotated_table, ReportTable};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error writing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error writing {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Persists a rendered report and returns where it went.
pub trait Sink {
    fn publish(&self, table: &ReportTable) -> Result<PathBuf, SinkError>;

    /// Publish annotated readings row for row.
    fn publish_annotated(
        &self,
        name: &str,
        rows: &[AnnotatedReading],
    ) -> Result<PathBuf, SinkError> {
        self.publish(&annotated_table(name, rows))
    }
}

/// Writes each report to `{output_dir}/{name}.csv`.
#[derive(Debug, Clone)]
pub struct CsvSink {
    output_dir: PathBuf,
}

impl CsvSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path a report with the given name is written to.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{name}.csv"))
    }
}

impl Sink for CsvSink {
    fn publish(&self, table: &ReportTable) -> Result<PathBuf, SinkError> {
        std::fs::create_dir_all(&self.output_dir).map_err(|source| SinkError::Io {
            path: self.output_dir.clone(),
            source,
        })?;

        let path = self.path_for(&table.name);
        let csv_err = |source| SinkError::Csv {
            path: path.clone(),
            source,
        };

        let mut writer = csv::Writer::from_path(&path).map_err(csv_err)?;
        writer.write_record(&table.columns).map_err(csv_err)?;
        for row in &table.rows {
            writer.write_record(row).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| SinkError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(path = %path.display(), rows = table.len(), "report written");
        Ok(path)
    }
}
