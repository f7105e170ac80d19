use crate::config::{Config, StreamConfig};
use crate::stream::{Batch, DataPoint, IngestRecord, StreamBuffer};
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Cloneable producer handle onto the router.
pub type RouterHandle = Arc<StreamRouter>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    /// The serializer intake is at capacity. The point was not accepted;
    /// the producer decides whether to retry or drop.
    #[error("stream intake is overloaded")]
    Overloaded,
    #[error("router is shut down")]
    Closed,
    #[error("malformed ingest record: {0}")]
    Malformed(String),
}

/// Owns the stream name → buffer mapping and the bounded handoff to the
/// serializer. Buffers for unconfigured streams are created on first write
/// with the default config.
pub struct StreamRouter {
    streams: Mutex<HashMap<String, StreamBuffer>>,
    configs: HashMap<String, StreamConfig>,
    batch_tx: mpsc::Sender<Batch>,
}

impl StreamRouter {
    pub fn new(config: &Config, batch_tx: mpsc::Sender<Batch>) -> RouterHandle {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            configs: config.streams.clone(),
            batch_tx,
        })
    }

    /// Appends a point to the named stream's accumulator, flushing the
    /// stream synchronously when the write fills it. Never blocks: a full
    /// serializer intake fails the write with `Overloaded` and leaves the
    /// accumulator exactly as it was before the call.
    pub fn write(&self, stream: &str, point: DataPoint) -> Result<(), WriteError> {
        let now = Instant::now();
        let mut streams = self.streams.lock();
        let buffer = streams.entry(stream.to_string()).or_insert_with(|| {
            let config = self.configs.get(stream).cloned().unwrap_or_default();
            StreamBuffer::new(stream, config)
        });
        let Some(batch) = buffer.push(point, now) else {
            return Ok(());
        };
        match self.batch_tx.try_send(batch) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(mut batch)) => {
                // Undo the flush: the triggering point is rejected, the
                // points before it go back to pending.
                batch.points.pop();
                buffer.restore(batch.points, now);
                Err(WriteError::Overloaded)
            }
            Err(TrySendError::Closed(_)) => Err(WriteError::Closed),
        }
    }

    /// Parses a `{"stream": "...", ...}` JSON line and routes it.
    pub fn write_json(&self, line: &str) -> Result<(), WriteError> {
        let record: IngestRecord =
            serde_json::from_str(line).map_err(|e| WriteError::Malformed(e.to_string()))?;
        self.write(&record.stream, DataPoint::new(record.fields))
    }

    /// Flushes every stream whose flush period has elapsed. Batches that
    /// cannot be handed off are restored and retried on the next poll.
    pub fn poll_deadlines(&self, now: Instant) -> usize {
        let mut flushed = 0;
        let mut streams = self.streams.lock();
        for buffer in streams.values_mut() {
            let Some(batch) = buffer.poll_deadline(now) else {
                continue;
            };
            match self.batch_tx.try_send(batch) {
                Ok(()) => flushed += 1,
                Err(TrySendError::Full(batch)) => {
                    buffer.restore(batch.points, now);
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("serializer intake closed while flushing {}", buffer.name());
                    return flushed;
                }
            }
        }
        flushed
    }

    /// Forced flush of every non-empty accumulator, bypassing buf_size and
    /// flush_period. Used at shutdown so no point is silently dropped.
    pub fn drain(&self) -> Vec<Batch> {
        let mut streams = self.streams.lock();
        streams
            .values_mut()
            .filter_map(StreamBuffer::force_flush)
            .collect()
    }

    pub fn pending_len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map_or(0, StreamBuffer::pending_len)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }
}
