pub mod buffer;
pub mod router;

pub use buffer::StreamBuffer;
pub use router::{RouterHandle, StreamRouter, WriteError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// A timestamped key/value record bound to a stream at the router boundary.
/// Immutable once produced; owned by the stream buffer until flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub fields: Value,
}

impl DataPoint {
    pub fn new(fields: Value) -> Self {
        Self {
            timestamp_ms: current_time_ms(),
            fields,
        }
    }

    pub fn at(timestamp_ms: u64, fields: Value) -> Self {
        Self {
            timestamp_ms,
            fields,
        }
    }
}

/// Ordered group of points flushed together from one stream. Ownership
/// transfers from the stream buffer to the serializer on flush.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub stream: String,
    pub points: Vec<DataPoint>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Line-oriented ingest shape: `{"stream": "...", ...fields}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestRecord {
    pub stream: String,
    #[serde(flatten)]
    pub fields: Value,
}

pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
