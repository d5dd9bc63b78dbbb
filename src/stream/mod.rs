//! Stream Transport
//!
//! Turns any byte-producing channel into a push-based event stream for a
//! single subscriber.
//!
//! # Backpressure
//!
//! Producers and the pump are connected by bounded channels of minimal
//! capacity. A producer whose subscriber is slow blocks on its next send
//! instead of queueing data; nothing is dropped or coalesced.
//!
//! ```text
//! producer ──(mpsc, cap 1)──▶ pump ──(frame + flush)──▶ EventWriter ──▶ hyper body
//! ```

mod pump;
mod source;
mod sse;

pub use pump::{pump, EventSink, PumpOutcome, PumpReport, StreamSession};
pub use source::{ByteSource, LineSource};
pub use sse::{frame, open, EventBody, EventWriter, EVENT_STREAM_CONTENT_TYPE};
