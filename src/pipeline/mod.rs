pub mod inflight;

pub use inflight::{InflightEntry, InflightTable, PacketOrigin};

use crate::channel::{AckId, PacketChannel};
use crate::packet::Packet;
use crate::spill::{SpillError, SpillQueue};
use log::{debug, info, warn};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Disconnected,
    Replaying,
    Live,
}

/// Submit rejections carry the packet back so the caller can spill it, the
/// way a failed try-publish hands its request back.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("inflight limit reached")]
    Saturated(Packet),
    #[error("channel is disconnected")]
    Disconnected(Packet),
}

impl SubmitError {
    pub fn into_packet(self) -> Packet {
        match self {
            SubmitError::Saturated(packet) | SubmitError::Disconnected(packet) => packet,
        }
    }
}

/// Drives the abstract publish channel. Tracks in-flight acknowledgements,
/// replays the spill queue ahead of live traffic after a reconnect, and
/// rejects submissions synchronously when the inflight limit is reached.
///
/// FIFO delivery order is the binding invariant: while the queue holds
/// unsent records, fresh packets are diverted behind them (the serializer
/// spills on `Saturated`), so the receiver always observes spilled records
/// before anything serialized later.
pub struct PublishPipeline<C> {
    channel: C,
    state: PipelineState,
    inflight: InflightTable,
    ack_grace: Duration,
    dropped_packets: u64,
    ack_timeouts: u64,
}

impl<C: PacketChannel> PublishPipeline<C> {
    pub fn new(channel: C, max_inflight: usize, ack_grace: Duration) -> Self {
        Self {
            channel,
            state: PipelineState::Disconnected,
            inflight: InflightTable::new(max_inflight),
            ack_grace,
            dropped_packets: 0,
            ack_timeouts: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Packets dropped because the channel was down and spilling was
    /// disabled or failed.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    pub fn ack_timeouts(&self) -> u64 {
        self.ack_timeouts
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Channel came up. Replay spilled records before anything fresh; with
    /// no spill queue configured there is nothing to drain and the pipeline
    /// goes straight to live.
    pub fn handle_connect(
        &mut self,
        spill: Option<&mut SpillQueue>,
        now: Instant,
    ) -> Result<(), SpillError> {
        match spill {
            Some(queue) => {
                queue.rewind();
                self.state = PipelineState::Replaying;
                info!("channel connected, replaying spilled records");
                self.pump_replay(queue, now)?;
            }
            None => {
                self.state = PipelineState::Live;
                info!("channel connected");
            }
        }
        Ok(())
    }

    /// Sends a fresh packet, or rejects it synchronously: `Saturated` when
    /// the inflight limit is reached or a replay is still draining,
    /// `Disconnected` when the channel is down. Never blocks.
    pub fn submit(
        &mut self,
        packet: Packet,
        spill: Option<&mut SpillQueue>,
        now: Instant,
    ) -> Result<AckId, SubmitError> {
        match self.state {
            PipelineState::Disconnected => return Err(SubmitError::Disconnected(packet)),
            // replayed records go first; fresh packets queue up behind them
            PipelineState::Replaying => return Err(SubmitError::Saturated(packet)),
            PipelineState::Live => {}
        }
        if self.inflight.is_full() {
            return Err(SubmitError::Saturated(packet));
        }
        match self.channel.send(&packet) {
            Ok(id) => {
                self.inflight.insert(id, packet, PacketOrigin::Live, now);
                Ok(id)
            }
            Err(err) => {
                warn!("send failed: {err}");
                self.transition_disconnected(spill);
                Err(SubmitError::Disconnected(packet))
            }
        }
    }

    /// Acknowledgement arrived. Replay-originated packets advance the spill
    /// queue's low-water mark; freed headroom pumps further replay records.
    pub fn on_ack(
        &mut self,
        id: AckId,
        mut spill: Option<&mut SpillQueue>,
        now: Instant,
    ) -> Result<(), SpillError> {
        let Some(entry) = self.inflight.remove(id) else {
            debug!("ack for unknown packet id {id}");
            return Ok(());
        };
        if let PacketOrigin::Replay(sequence) = entry.origin {
            if let Some(queue) = spill.as_deref_mut() {
                queue.acknowledge(sequence)?;
            }
        }
        if let Some(queue) = spill {
            match self.state {
                PipelineState::Replaying => self.pump_replay(queue, now)?,
                PipelineState::Live if queue.has_unread() => {
                    // packets spilled while live (saturation) drain now
                    self.state = PipelineState::Replaying;
                    self.pump_replay(queue, now)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn on_disconnect(&mut self, spill: Option<&mut SpillQueue>) {
        self.transition_disconnected(spill);
    }

    /// Periodic sweep: a packet unacknowledged past the grace period drives
    /// the pipeline to `Disconnected` so the normal replay path retries it.
    /// Returns true when the sweep tripped.
    pub fn tick(&mut self, now: Instant, spill: Option<&mut SpillQueue>) -> bool {
        if self.state == PipelineState::Disconnected || self.inflight.is_empty() {
            return false;
        }
        if self.inflight.has_expired(now, self.ack_grace) {
            warn!("ack grace period exceeded, treating channel as disconnected");
            self.ack_timeouts += 1;
            self.transition_disconnected(spill);
            true
        } else {
            false
        }
    }

    fn pump_replay(&mut self, queue: &mut SpillQueue, now: Instant) -> Result<(), SpillError> {
        while !self.inflight.is_full() {
            match queue.read_next()? {
                Some(record) => match self.channel.send(&record.packet) {
                    Ok(id) => {
                        self.inflight.insert(
                            id,
                            record.packet,
                            PacketOrigin::Replay(record.sequence),
                            now,
                        );
                    }
                    Err(err) => {
                        // the unsent record stays below the cursor and is
                        // re-read on the next connect
                        warn!("send failed during replay: {err}");
                        self.transition_disconnected(Some(queue));
                        return Ok(());
                    }
                },
                None => {
                    if !self.inflight.has_replay() {
                        self.state = PipelineState::Live;
                        info!("spill queue drained, pipeline is live");
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn transition_disconnected(&mut self, mut spill: Option<&mut SpillQueue>) {
        if self.state != PipelineState::Disconnected {
            info!("pipeline disconnected");
        }
        self.state = PipelineState::Disconnected;
        for entry in self.inflight.drain() {
            match entry.origin {
                // still on disk past the low-water mark; the reconnect
                // rewind re-reads it
                PacketOrigin::Replay(_) => {}
                PacketOrigin::Live => match spill.as_deref_mut() {
                    Some(queue) => {
                        if let Err(err) = queue.append(&entry.packet) {
                            warn!("failed to respill unacked packet: {err}");
                            self.dropped_packets += 1;
                        }
                    }
                    None => self.dropped_packets += 1,
                },
            }
        }
    }
}
