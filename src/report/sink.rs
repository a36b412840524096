//! Verdict sinks.
//!
//! The monitor core only ever talks to the `VerdictSink` trait; what happens
//! to a verdict after `emit` is the sink's business.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::monitor::model::{ResourceSample, Severity, Verdict};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait VerdictSink: Send + Sync {
    async fn emit(&self, verdict: &Verdict) -> Result<(), SinkError>;
    async fn emit_sample(&self, sample: &ResourceSample) -> Result<(), SinkError>;
}

/// Writes each verdict through the process logger at a level matching its
/// severity. The default sink when no output directory is configured.
pub struct LogSink;

#[async_trait]
impl VerdictSink for LogSink {
    async fn emit(&self, verdict: &Verdict) -> Result<(), SinkError> {
        let line = serde_json::to_string(verdict)?;
        match verdict.severity {
            Severity::Critical => log::error!("{line}"),
            Severity::Warning => log::warn!("{line}"),
            Severity::Info => log::info!("{line}"),
        }
        Ok(())
    }

    async fn emit_sample(&self, sample: &ResourceSample) -> Result<(), SinkError> {
        log::info!("{}", serde_json::to_string(sample)?);
        Ok(())
    }
}

/// Appends verdicts and resource samples as JSON lines under the configured
/// output directory, one file per record type.
pub struct JsonFileSink {
    verdicts_path: PathBuf,
    stats_path: PathBuf,
}

impl JsonFileSink {
    pub fn new(output_dir: &Path) -> Result<Self, SinkError> {
        std::fs::create_dir_all(output_dir)?;
        Ok(Self {
            verdicts_path: output_dir.join("verdicts.jsonl"),
            stats_path: output_dir.join("stats.jsonl"),
        })
    }

    async fn append(&self, path: &Path, mut line: Vec<u8>) -> Result<(), SinkError> {
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl VerdictSink for JsonFileSink {
    async fn emit(&self, verdict: &Verdict) -> Result<(), SinkError> {
        self.append(&self.verdicts_path, serde_json::to_vec(verdict)?)
            .await
    }

    async fn emit_sample(&self, sample: &ResourceSample) -> Result<(), SinkError> {
        self.append(&self.stats_path, serde_json::to_vec(sample)?)
            .await
    }
}
