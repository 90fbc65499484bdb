//! Per-chunk instrumentation hook.
//!
//! The controller can emit one [`ChunkRecord`] per `infer` call to an
//! optional [`ChunkSink`]. Nothing in the core consumes the records;
//! aggregation and display belong to external tooling.

use std::time::{Duration, Instant};

/// Timing record for one `infer` call.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRecord {
    /// Monotonically increasing call counter, starting at 0.
    pub chunk_index: u64,
    pub start: Instant,
    pub end: Instant,
    pub duration: Duration,
    /// Whether the call committed new state and returned audio.
    pub ok: bool,
}

/// Receiver for per-chunk records.
pub trait ChunkSink: Send {
    fn record(&mut self, record: ChunkRecord);
}

impl<F> ChunkSink for F
where
    F: FnMut(ChunkRecord) + Send,
{
    fn record(&mut self, record: ChunkRecord) {
        self(record)
    }
}
