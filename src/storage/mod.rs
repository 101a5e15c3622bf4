//! Record persistence.
//!
//! A [`RecordSink`] receives the header line once, then one line per point,
//! then `close`. The controller opens a sink through a [`SinkFactory`] only
//! after the device reports armed, so a failed arm never creates a file.

pub mod metadata;

use crate::error::AppResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

pub use metadata::{metadata_path, write_metadata, RunMetadata};

/// Destination for persisted records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Write the header line followed by a blank line.
    async fn write_header(&mut self, line: &str) -> AppResult<()>;

    /// Write one newline-terminated data line.
    async fn write_line(&mut self, line: &str) -> AppResult<()>;

    /// Flush and release the destination. Further writes are ignored.
    async fn close(&mut self) -> AppResult<()>;
}

/// Opens sinks for a selected path.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self, path: &Path) -> AppResult<Box<dyn RecordSink>>;
}

/// Plain-text file sink.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    /// Create (or truncate) the file, creating parent directories as needed.
    pub async fn create(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        info!(path = %path.display(), "Opened data file");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for FileSink {
    async fn write_header(&mut self, line: &str) -> AppResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n\n").await?;
        }
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> AppResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
            info!(path = %self.path.display(), "Closed data file");
        }
        Ok(())
    }
}

/// Opens [`FileSink`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSinkFactory;

#[async_trait]
impl SinkFactory for FileSinkFactory {
    async fn open(&self, path: &Path) -> AppResult<Box<dyn RecordSink>> {
        Ok(Box::new(FileSink::create(path).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_header_blank_line_and_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("run.txt");

        let mut sink = FileSinkFactory.open(&path).await.unwrap();
        sink.write_header("Delta Reading (V)\ttimestamp (s)").await.unwrap();
        sink.write_line("1\t2\t3\t4\t0").await.unwrap();
        sink.close().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Delta Reading (V)\ttimestamp (s)\n\n1\t2\t3\t4\t0\n");
    }

    #[tokio::test]
    async fn writes_after_close_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.txt");

        let mut sink = FileSink::create(&path).await.unwrap();
        sink.close().await.unwrap();
        sink.write_line("late").await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(sink.path(), path.as_path());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
