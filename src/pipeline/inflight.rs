use crate::channel::AckId;
use crate::packet::Packet;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Where an inflight packet came from, which decides what happens to it on
/// ack (advance the spill cursor) and on disconnect (respill or leave on
/// disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOrigin {
    Live,
    Replay(u64),
}

#[derive(Debug, Clone)]
pub struct InflightEntry {
    pub packet: Packet,
    pub origin: PacketOrigin,
    pub sent_at: Instant,
}

/// Sent-but-unacknowledged packets, bounded by `max_inflight`. Entries leave
/// only on acknowledgement or on a disconnect drain.
#[derive(Debug)]
pub struct InflightTable {
    max_inflight: usize,
    entries: HashMap<AckId, InflightEntry>,
}

impl InflightTable {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            max_inflight,
            entries: HashMap::with_capacity(max_inflight),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_inflight
    }

    pub fn insert(&mut self, id: AckId, packet: Packet, origin: PacketOrigin, now: Instant) {
        debug_assert!(!self.is_full());
        self.entries.insert(
            id,
            InflightEntry {
                packet,
                origin,
                sent_at: now,
            },
        );
    }

    pub fn remove(&mut self, id: AckId) -> Option<InflightEntry> {
        self.entries.remove(&id)
    }

    pub fn has_replay(&self) -> bool {
        self.entries
            .values()
            .any(|entry| matches!(entry.origin, PacketOrigin::Replay(_)))
    }

    /// True when any entry has waited longer than `grace` for its ack.
    pub fn has_expired(&self, now: Instant, grace: Duration) -> bool {
        self.entries
            .values()
            .any(|entry| now.saturating_duration_since(entry.sent_at) >= grace)
    }

    pub fn drain(&mut self) -> Vec<InflightEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}
