//! Counters module
//!
//! Durable, increment-only named counters.

mod backend;
mod store;

pub use backend::{decode_record, encode_value, CounterBackend, SledBackend};
pub use store::{Counter, CounterStore, FlushReport};
