//! Run metadata written next to the data file.

use crate::acquisition::session::RunStatus;
use crate::error::AppResult;
use crate::measurement::filter::FilterConfig;
use crate::measurement::mode::{MeasurementMode, ModeParameters, SourceSettings};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Describes one acquisition run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub mode: MeasurementMode,
    pub resource: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
    pub point_count: u32,
    pub records_written: usize,
    pub parameters: ModeParameters,
    pub source: SourceSettings,
    pub filter: FilterConfig,
    /// Parameter summary as shown to the operator.
    #[serde(default)]
    pub summary: String,
    /// Version of the acquisition software.
    pub software_version: String,
}

impl RunMetadata {
    pub fn new(
        run_id: Uuid,
        resource: &str,
        started_at: DateTime<Utc>,
        point_count: u32,
        parameters: ModeParameters,
        source: SourceSettings,
        filter: FilterConfig,
    ) -> Self {
        Self {
            run_id,
            mode: parameters.mode(),
            resource: resource.to_string(),
            started_at,
            finished_at: None,
            status: None,
            point_count,
            records_written: 0,
            parameters,
            source,
            filter,
            summary: String::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Record how the run ended.
    pub fn finish(&mut self, status: RunStatus, records_written: usize) {
        self.finished_at = Some(Utc::now());
        self.status = Some(status);
        self.records_written = records_written;
    }
}

/// Sidecar path for a data file: `<stem>.meta.json` in the same directory.
pub fn metadata_path(data_path: &Path) -> PathBuf {
    let stem = data_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string());
    data_path.with_file_name(format!("{stem}.meta.json"))
}

/// Write metadata as pretty JSON beside the data file.
pub async fn write_metadata(data_path: &Path, metadata: &RunMetadata) -> AppResult<PathBuf> {
    let path = metadata_path(data_path);
    let json = serde_json::to_string_pretty(metadata).map_err(std::io::Error::other)?;
    tokio::fs::write(&path, json).await?;
    Ok(path)
}
