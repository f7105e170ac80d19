use crate::config::StreamConfig;
use crate::stream::{Batch, DataPoint};
use std::mem;
use std::time::Instant;

/// Per-stream bounded accumulator. A flush takes the whole pending set in
/// one ownership transfer; the accumulator is reset before the next write is
/// accepted.
#[derive(Debug)]
pub struct StreamBuffer {
    name: String,
    config: StreamConfig,
    pending: Vec<DataPoint>,
    first_pending_at: Option<Instant>,
    taken_at: Option<Instant>,
}

impl StreamBuffer {
    pub fn new(name: impl Into<String>, config: StreamConfig) -> Self {
        let capacity = config.buf_size;
        Self {
            name: name.into(),
            config,
            pending: Vec::with_capacity(capacity),
            first_pending_at: None,
            taken_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> &[DataPoint] {
        &self.pending
    }

    /// Appends a point; returns the batch when this write fills the buffer.
    pub fn push(&mut self, point: DataPoint, now: Instant) -> Option<Batch> {
        if self.pending.is_empty() {
            self.first_pending_at = Some(now);
        }
        self.pending.push(point);
        if self.pending.len() >= self.config.buf_size {
            Some(self.take_batch())
        } else {
            None
        }
    }

    /// Flushes when `flush_period` has elapsed since the first unflushed
    /// point. A stale deadline over an empty accumulator is a no-op.
    pub fn poll_deadline(&mut self, now: Instant) -> Option<Batch> {
        let first_at = self.first_pending_at?;
        if self.pending.is_empty() {
            self.first_pending_at = None;
            return None;
        }
        if now.saturating_duration_since(first_at) >= self.config.flush_period {
            Some(self.take_batch())
        } else {
            None
        }
    }

    /// Unconditional flush, used on shutdown. Empty accumulators emit nothing.
    pub fn force_flush(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_batch())
        }
    }

    /// Puts points back after a flush whose handoff was rejected. Only valid
    /// while the accumulator is empty (the flush that produced them emptied
    /// it, and the router holds the map lock across flush and restore). The
    /// flush deadline is carried over from the rejected flush, so a batch
    /// already past its period is retried on the next poll rather than
    /// waiting out a fresh one.
    pub fn restore(&mut self, points: Vec<DataPoint>, now: Instant) {
        debug_assert!(self.pending.is_empty());
        if points.is_empty() {
            return;
        }
        self.pending = points;
        self.first_pending_at = Some(self.taken_at.take().unwrap_or(now));
    }

    fn take_batch(&mut self) -> Batch {
        self.taken_at = self.first_pending_at.take();
        Batch {
            stream: self.name.clone(),
            points: mem::take(&mut self.pending),
        }
    }
}
