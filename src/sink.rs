//! Output sinks for crawl results.
//!
//! The engine only knows the [`Sink`] trait; concrete backends are looked
//! up by name the same way queue backends are. Results go out as JSON
//! lines in all bundled sinks.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::CrawlConfig;
use crate::models::CrawlResult;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown output sink: {0}")]
    UnknownSink(String),

    #[error("file sink requires output_dir")]
    MissingOutputDir,

    #[error("custom sink must be supplied by the embedding application")]
    CustomRequired,
}

/// Consumer of emitted results. Implementations must tolerate concurrent
/// callers; the bundled sinks serialize through a lock.
pub trait Sink: Send + Sync {
    fn emit(&self, result: &CrawlResult) -> Result<(), SinkError>;

    /// Flush buffered output; called once at crawl end
    fn finish(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// JSON lines on stdout
pub struct ConsoleSink {
    lock: Mutex<()>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for ConsoleSink {
    fn emit(&self, result: &CrawlResult) -> Result<(), SinkError> {
        let line = serde_json::to_string(result)?;
        let _guard = self.lock.lock();
        println!("{line}");
        Ok(())
    }
}

/// JSON lines in `<output_dir>/<crawl_id>.jsonl`
pub struct FileSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    pub fn new(output_dir: &Path, crawl_id: &str) -> Result<Self, SinkError> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(format!("{crawl_id}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl Sink for FileSink {
    fn emit(&self, result: &CrawlResult) -> Result<(), SinkError> {
        let line = serde_json::to_string(result)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        Ok(())
    }

    fn finish(&self) -> Result<(), SinkError> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

/// Build the configured sink by name
pub fn build_sink(config: &CrawlConfig, crawl_id: &str) -> Result<Arc<dyn Sink>, SinkError> {
    match config.output_sink.as_str() {
        "console" => Ok(Arc::new(ConsoleSink::new())),
        "file" => {
            let dir = config.output_dir.as_ref().ok_or(SinkError::MissingOutputDir)?;
            Ok(Arc::new(FileSink::new(dir, crawl_id)?))
        }
        // "custom" is only reachable through an injected sink
        "custom" => Err(SinkError::CustomRequired),
        other => Err(SinkError::UnknownSink(other.to_string())),
    }
}
