//! JSONL file sink

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracewire_core::{ExportSink, SinkError, SinkResult};
use tracing::info;

#[derive(Debug, Clone)]
pub struct JsonlSinkConfig {
    pub path: PathBuf,

    /// Keep earlier records; the file is truncated on open otherwise
    pub append: bool,

    /// Indent each document over several lines
    pub pretty: bool,

    /// Push every record to the file before `export` returns
    pub flush_each: bool,
}

impl Default for JsonlSinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/tracewire-events.jsonl"),
            append: true,
            pretty: false,
            flush_each: true,
        }
    }
}

/// Writes one JSON document per line
pub struct JsonlSink {
    config: JsonlSinkConfig,
    writer: Mutex<Option<BufWriter<File>>>,
    events_written: AtomicU64,
}

impl JsonlSink {
    /// Open (or create) the output file
    pub fn open(config: JsonlSinkConfig) -> std::io::Result<Self> {
        let file = if config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?
        } else {
            File::create(&config.path)?
        };
        info!("JSONL sink writing to: {:?}", config.path);

        Ok(Self {
            config,
            writer: Mutex::new(Some(BufWriter::new(file))),
            events_written: AtomicU64::new(0),
        })
    }

    pub fn events_written(&self) -> u64 {
        self.events_written.load(Ordering::Relaxed)
    }

    /// Flush and release the file; later exports fail with `Closed`
    pub fn close(&self) -> SinkResult<()> {
        if let Some(mut w) = self.writer.lock().take() {
            w.flush()?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExportSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn export(
        &self,
        document: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> SinkResult<()> {
        if cancel.is_cancelled() {
            return Err(SinkError::Cancelled);
        }

        let json = if self.config.pretty {
            serde_json::to_string_pretty(document)?
        } else {
            serde_json::to_string(document)?
        };

        let mut guard = self.writer.lock();
        let w = guard.as_mut().ok_or(SinkError::Closed)?;
        writeln!(w, "{}", json)?;
        if self.config.flush_each {
            w.flush()?;
        }

        self.events_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> SinkResult<()> {
        if let Some(w) = self.writer.lock().as_mut() {
            w.flush()?;
        }
        Ok(())
    }
}
