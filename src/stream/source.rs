//! Byte sources
//!
//! Producers that push chunks into a sink until cancelled, closing the sink
//! (by dropping it) when they finish or fail. The stream pump treats them
//! exactly like a scraper's sink.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{SourceConfig, SourceKind};
use crate::error::Result;
use crate::stats::ContainerStats;

/// A producer of byte chunks
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Name used in logs and routes
    fn name(&self) -> &str;

    /// Send chunks into `sink` until the data ends or `cancel` fires.
    /// The sink is dropped, and so closed, when this returns.
    async fn stream(&self, sink: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Result<()>;
}

/// Streams the lines of a file, optionally following appended data
#[derive(Debug, Clone)]
pub struct LineSource {
    name: String,
    path: PathBuf,
    kind: SourceKind,
    follow: bool,
    poll_interval: Duration,
}

impl LineSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: SourceKind::Lines,
            follow: false,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            path: config.path.clone(),
            kind: config.kind,
            follow: config.follow,
            poll_interval: config.poll_interval(),
        }
    }

    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Keep polling for new lines at `poll_interval` after end of file
    pub fn following(mut self, poll_interval: Duration) -> Self {
        self.follow = true;
        self.poll_interval = poll_interval;
        self
    }

    /// Apply the source kind to one line; `None` drops it
    fn accept(&self, line: &[u8]) -> Option<Bytes> {
        match self.kind {
            SourceKind::Lines => Some(Bytes::copy_from_slice(line)),
            SourceKind::Stats => match ContainerStats::decode(line) {
                Ok(_) => Some(Bytes::copy_from_slice(line)),
                Err(e) => {
                    warn!("Skipping malformed stats line from {}: {}", self.name, e);
                    None
                }
            },
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[async_trait]
impl ByteSource for LineSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, sink, cancel), fields(source = %self.name))]
    async fn stream(&self, sink: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Result<()> {
        let file = File::open(&self.path).await?;
        let mut reader = BufReader::new(file);
        let mut pending = Vec::new();

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                read = reader.read_until(b'\n', &mut pending) => read?,
            };

            if read == 0 {
                if !self.follow {
                    // Last line without a terminator
                    if !pending.is_empty() {
                        if let Some(chunk) = self.accept(trim_line_end(&pending)) {
                            let _ = send(&sink, chunk, &cancel).await;
                        }
                    }
                    debug!("Reached end of {}", self.path.display());
                    return Ok(());
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = sleep(self.poll_interval) => continue,
                }
            }

            // A partial line stays buffered until its terminator is appended
            if !pending.ends_with(b"\n") {
                continue;
            }

            let line = trim_line_end(&pending);
            if !line.is_empty() {
                if let Some(chunk) = self.accept(line) {
                    if !send(&sink, chunk, &cancel).await {
                        return Ok(());
                    }
                }
            }
            pending.clear();
        }
    }
}

/// Blocking send raced against cancellation; false when streaming must stop
async fn send(sink: &mpsc::Sender<Bytes>, chunk: Bytes, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = sink.send(chunk) => sent.is_ok(),
    }
}
