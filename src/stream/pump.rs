//! Stream pump
//!
//! Moves chunks from a receive-only source to one subscriber, framing and
//! flushing each chunk as it arrives. Cancellation interrupts both the wait
//! for the next chunk and a blocked write.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::sse::{frame, EventWriter};
use crate::error::Result;
use crate::telemetry;

/// Destination of framed events
#[async_trait]
pub trait EventSink: Send {
    /// Write one complete frame
    async fn write_frame(&mut self, frame: Bytes) -> Result<()>;

    /// Push buffered bytes to the subscriber
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// How a pump finished without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The source signalled end of data
    SourceClosed,
    /// The subscriber's cancellation signal fired
    Cancelled,
}

/// Summary of a finished pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub outcome: PumpOutcome,
    /// Frames written before the pump stopped
    pub frames: u64,
}

/// Forward every chunk of `source` to `sink` until the source closes or
/// `cancel` fires. A failed write ends the pump with that error.
pub async fn pump<S>(
    source: &mut mpsc::Receiver<Bytes>,
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<PumpReport>
where
    S: EventSink + ?Sized,
{
    let mut frames = 0u64;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(PumpReport { outcome: PumpOutcome::Cancelled, frames });
            }
            chunk = source.recv() => match chunk {
                Some(chunk) => chunk,
                None => return Ok(PumpReport { outcome: PumpOutcome::SourceClosed, frames }),
            },
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(PumpReport { outcome: PumpOutcome::Cancelled, frames });
            }
            written = write_and_flush(sink, frame(&chunk)) => written,
        };
        written?;

        frames += 1;
        telemetry::metrics().stream_frames.inc();
    }
}

async fn write_and_flush<S>(sink: &mut S, frame: Bytes) -> Result<()>
where
    S: EventSink + ?Sized,
{
    sink.write_frame(frame).await?;
    sink.flush().await
}

// =============================================================================
// Stream Session
// =============================================================================

/// One subscriber bound to one upstream source and one cancellation signal.
///
/// The session cancels its token when it ends, whatever the reason, so a
/// producer sharing the token stops instead of blocking on a sink nobody
/// reads. A dropped subscriber connection cancels the token as well.
#[derive(Debug)]
pub struct StreamSession {
    id: String,
    source: mpsc::Receiver<Bytes>,
    writer: EventWriter,
    cancel: CancellationToken,
}

impl StreamSession {
    pub fn new(
        source: mpsc::Receiver<Bytes>,
        writer: EventWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            writer,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pump until the source closes, the subscriber goes away, or the
    /// token is cancelled.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn run(mut self) -> Result<PumpReport> {
        telemetry::metrics().stream_sessions.inc();
        info!("Stream session started");

        let watcher = self.writer.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher.closed() => {
                    debug!("Subscriber disconnected");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        });

        let result = pump(&mut self.source, &mut self.writer, &self.cancel).await;
        self.cancel.cancel();

        match &result {
            Ok(report) => info!(
                "Stream session ended ({:?}) after {} frame(s)",
                report.outcome, report.frames
            ),
            Err(e) => warn!("Stream session failed: {}", e),
        }
        result
    }
}
