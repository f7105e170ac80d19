use crate::channel::PacketChannel;
use crate::config::{Config, METRICS_STREAM};
use crate::packet::{Packet, QosLevel};
use crate::pipeline::PublishPipeline;
use crate::spill::SpillQueue;
use crate::stream::{current_time_ms, Batch};
use log::error;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;

/// Per-packet dispatch outcome. Callers see all three paths explicitly
/// instead of an exception channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    Spilled,
    /// Dropped: the channel was unavailable and spilling was disabled or
    /// failed. Counted, never raised.
    Rejected,
}

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Self-describing operational counters, published on the
/// `serializer_metrics` stream when it is configured. Counters are
/// cumulative since startup.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SerializerMetrics {
    sequence: u32,
    timestamp_ms: u64,
    pub batches_serialized: u64,
    pub total_sent_size: u64,
    pub total_spilled_size: u64,
    pub spilled_packets: u64,
    pub dropped_packets: u64,
    pub lost_files: u64,
    pub corrupt_records: u64,
}

/// Converts flushed batches into topic-bound QoS 1 packets, splitting on
/// `max_packet_size` without reordering points, and routes each packet to
/// the pipeline or, failing that, the spill queue.
pub struct Serializer {
    max_packet_size: usize,
    topics: HashMap<String, String>,
    metrics_enabled: bool,
    metrics: SerializerMetrics,
}

impl Serializer {
    pub fn new(config: &Config) -> Self {
        let topics = config
            .streams
            .iter()
            .filter_map(|(name, stream)| {
                stream.topic.as_ref().map(|topic| (name.clone(), topic.clone()))
            })
            .collect();
        Self {
            max_packet_size: config.agent.max_packet_size,
            topics,
            metrics_enabled: config.metrics_enabled(),
            metrics: SerializerMetrics::default(),
        }
    }

    /// The stream's configured topic, or a synthesized default.
    pub fn topic_for(&self, stream: &str) -> String {
        match self.topics.get(stream) {
            Some(topic) => topic.clone(),
            None => format!("/streams/{stream}"),
        }
    }

    /// Encodes a batch as one or more JSON-array packets. Points never
    /// reorder across a split boundary; a single point larger than
    /// `max_packet_size` still travels, alone.
    pub fn serialize(&mut self, batch: &Batch) -> Result<Vec<Packet>, SerializeError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let topic = self.topic_for(&batch.stream);
        let mut packets = Vec::new();
        let mut chunk: Vec<Vec<u8>> = Vec::new();
        let mut chunk_len = 2; // enclosing brackets
        for point in &batch.points {
            let bytes = serde_json::to_vec(point)?;
            let extra = bytes.len() + usize::from(!chunk.is_empty());
            if !chunk.is_empty() && chunk_len + extra > self.max_packet_size {
                packets.push(self.assemble(&topic, &mut chunk));
                chunk_len = 2;
            }
            chunk_len += bytes.len() + usize::from(!chunk.is_empty());
            chunk.push(bytes);
        }
        if !chunk.is_empty() {
            packets.push(self.assemble(&topic, &mut chunk));
        }
        self.metrics.batches_serialized += 1;
        Ok(packets)
    }

    /// Serializes and routes a batch: pipeline first, spill queue when the
    /// pipeline reports saturation or disconnect, rejection counter when
    /// neither can take the packet.
    pub fn dispatch<C: PacketChannel>(
        &mut self,
        batch: Batch,
        pipeline: &mut PublishPipeline<C>,
        mut spill: Option<&mut SpillQueue>,
    ) -> Result<Vec<Dispatch>, SerializeError> {
        let packets = self.serialize(&batch)?;
        let mut outcomes = Vec::with_capacity(packets.len());
        for packet in packets {
            outcomes.push(self.dispatch_packet(packet, pipeline, spill.as_deref_mut()));
        }
        Ok(outcomes)
    }

    /// Routes a single already-assembled packet. Used for the metrics packet,
    /// which bypasses batching but follows the same pipeline-then-spill path.
    pub fn dispatch_packet<C: PacketChannel>(
        &mut self,
        packet: Packet,
        pipeline: &mut PublishPipeline<C>,
        mut spill: Option<&mut SpillQueue>,
    ) -> Dispatch {
        let size = packet.payload.len() as u64;
        match pipeline.submit(packet, spill.as_deref_mut(), Instant::now()) {
            Ok(_) => {
                self.metrics.total_sent_size += size;
                Dispatch::Sent
            }
            Err(rejection) => {
                let packet = rejection.into_packet();
                self.spill_packet(&packet, spill.as_deref_mut(), size)
            }
        }
    }

    /// Emits the metrics stream payload, consumed exactly like any other
    /// stream's packet. None when the stream is not configured.
    pub fn metrics_packet(&mut self) -> Option<Packet> {
        if !self.metrics_enabled {
            return None;
        }
        self.metrics.sequence += 1;
        self.metrics.timestamp_ms = current_time_ms();
        let payload = match serde_json::to_vec(&[&self.metrics]) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to serialize metrics payload: {err}");
                return None;
            }
        };
        Some(Packet::new(
            self.topic_for(METRICS_STREAM),
            QosLevel::AtLeastOnce,
            payload,
        ))
    }

    pub fn metrics(&self) -> &SerializerMetrics {
        &self.metrics
    }

    /// Folds in counters owned by the spill queue before a metrics report.
    pub fn sync_queue_counters(&mut self, lost_files: u64, corrupt_records: u64) {
        self.metrics.lost_files = lost_files;
        self.metrics.corrupt_records = corrupt_records;
    }

    fn spill_packet(
        &mut self,
        packet: &Packet,
        spill: Option<&mut SpillQueue>,
        size: u64,
    ) -> Dispatch {
        match spill {
            Some(queue) => match queue.append(packet) {
                Ok(_) => {
                    self.metrics.spilled_packets += 1;
                    self.metrics.total_spilled_size += size;
                    Dispatch::Spilled
                }
                Err(err) => {
                    error!("failed to spill packet: {err}");
                    self.metrics.dropped_packets += 1;
                    Dispatch::Rejected
                }
            },
            None => {
                self.metrics.dropped_packets += 1;
                Dispatch::Rejected
            }
        }
    }

    fn assemble(&self, topic: &str, chunk: &mut Vec<Vec<u8>>) -> Packet {
        let body_len: usize = chunk.iter().map(Vec::len).sum();
        let mut payload = Vec::with_capacity(body_len + chunk.len() + 1);
        payload.push(b'[');
        for (idx, bytes) in chunk.iter().enumerate() {
            if idx > 0 {
                payload.push(b',');
            }
            payload.extend_from_slice(bytes);
        }
        payload.push(b']');
        chunk.clear();
        Packet::new(topic, QosLevel::AtLeastOnce, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DataPoint;
    use serde_json::{json, Value};

    fn test_config(max_packet_size: usize) -> Config {
        let raw = format!(
            "[agent]\nmax_packet_size = {max_packet_size}\nmax_inflight = 8\n\n[streams.gps]\nbuf_size = 4\ntopic = \"/device/1/gps\"\n"
        );
        Config::parse(&raw).unwrap()
    }

    fn batch(stream: &str, count: u64) -> Batch {
        Batch {
            stream: stream.to_string(),
            points: (0..count)
                .map(|n| DataPoint::at(n, json!({ "value": n })))
                .collect(),
        }
    }

    #[test]
    fn configured_topic_wins_over_synthesized() {
        let serializer = Serializer::new(&test_config(4096));
        assert_eq!(serializer.topic_for("gps"), "/device/1/gps");
        assert_eq!(serializer.topic_for("imu"), "/streams/imu");
    }

    #[test]
    fn small_batch_fits_one_packet() {
        let mut serializer = Serializer::new(&test_config(4096));
        let packets = serializer.serialize(&batch("gps", 3)).unwrap();
        assert_eq!(packets.len(), 1);
        let decoded: Vec<Value> = serde_json::from_slice(&packets[0].payload).unwrap();
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn oversized_batch_splits_preserving_order() {
        // each point encodes to ~30 bytes; force roughly two per packet
        let mut serializer = Serializer::new(&test_config(70));
        let packets = serializer.serialize(&batch("gps", 6)).unwrap();
        assert!(packets.len() >= 3);
        let mut seen = Vec::new();
        for packet in &packets {
            let points: Vec<Value> = serde_json::from_slice(&packet.payload).unwrap();
            for point in points {
                seen.push(point["value"].as_u64().unwrap());
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_batch_produces_no_packets() {
        let mut serializer = Serializer::new(&test_config(4096));
        let packets = serializer
            .serialize(&Batch {
                stream: "gps".into(),
                points: Vec::new(),
            })
            .unwrap();
        assert!(packets.is_empty());
    }

    #[test]
    fn metrics_stream_disabled_by_default() {
        let mut serializer = Serializer::new(&test_config(4096));
        assert!(serializer.metrics_packet().is_none());
    }
}
