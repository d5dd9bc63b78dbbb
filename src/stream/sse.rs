//! Event-stream framing and the hyper response body behind it

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::{Body, Frame};
use hyper::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use tokio::sync::mpsc;

use super::pump::EventSink;
use crate::error::{Error, Result};

/// Content type of an event stream
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Wrap one chunk as a single `data:` field followed by a blank line.
///
/// The chunk is rendered as text; invalid UTF-8 is replaced.
pub fn frame(chunk: &[u8]) -> Bytes {
    Bytes::from(format!("data: {}\n\n", String::from_utf8_lossy(chunk)))
}

// =============================================================================
// Event Body
// =============================================================================

/// Response body fed by an [`EventWriter`]; ends when every writer is dropped
#[derive(Debug)]
pub struct EventBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for EventBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|bytes| Ok(Frame::data(bytes))))
    }
}

// =============================================================================
// Event Writer
// =============================================================================

/// Writing half of an event stream response
#[derive(Debug, Clone)]
pub struct EventWriter {
    tx: mpsc::Sender<Bytes>,
}

impl EventWriter {
    /// Resolves once the subscriber's connection has dropped the body
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl EventSink for EventWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::StreamWrite("subscriber disconnected".into()))
    }
}

/// Open an event stream: the response head carries the framing headers and
/// its body yields whatever the returned writer sends.
///
/// `capacity` bounds the frames queued between the writer and the
/// connection; a slow subscriber blocks the writer once it is full.
pub fn open(capacity: usize) -> Result<(EventWriter, Response<EventBody>)> {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE)
        .header(CACHE_CONTROL, "no-cache")
        .header(CONNECTION, "keep-alive")
        .body(EventBody { rx })
        .map_err(|e| Error::Internal(format!("Failed to build event stream response: {}", e)))?;

    Ok((EventWriter { tx }, response))
}
