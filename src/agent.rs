use crate::channel::{ChannelEvent, PacketChannel};
use crate::config::Config;
use crate::error::AgentError;
use crate::pipeline::PublishPipeline;
use crate::serializer::{Dispatch, Serializer};
use crate::spill::SpillQueue;
use crate::stream::{Batch, RouterHandle, StreamRouter};
use crate::telemetry::MetricsRegistry;
use log::{debug, info, warn};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::{select, signal, time};

/// Depth of the router → serializer handoff. A full channel is what producers
/// observe as `Overloaded`.
const BATCH_CHANNEL_CAPACITY: usize = 128;

const FLUSH_TICK: Duration = Duration::from_secs(1);
const METRICS_PERIOD: Duration = Duration::from_secs(10);

/// Synchronous heart of the agent: serializer, pipeline, and spill queue,
/// driven entirely by explicit calls so tests never need a runtime.
pub struct AgentCore<C> {
    serializer: Serializer,
    pipeline: PublishPipeline<C>,
    spill: Option<SpillQueue>,
    metrics: MetricsRegistry,
}

impl<C: PacketChannel> AgentCore<C> {
    pub fn new(config: &Config, channel: C) -> Result<Self, AgentError> {
        let spill = config
            .persistence
            .as_ref()
            .map(SpillQueue::open)
            .transpose()?;
        if spill.is_none() {
            warn!("persistence is not configured, packets will be dropped while disconnected");
        }
        Ok(Self {
            serializer: Serializer::new(config),
            pipeline: PublishPipeline::new(
                channel,
                config.agent.max_inflight,
                config.agent.ack_grace,
            ),
            spill,
            metrics: MetricsRegistry::new("fieldgate"),
        })
    }

    pub fn handle_batch(&mut self, batch: Batch) -> Result<(), AgentError> {
        let outcomes =
            self.serializer
                .dispatch(batch, &mut self.pipeline, self.spill.as_mut())?;
        for outcome in outcomes {
            let key = match outcome {
                Dispatch::Sent => "dispatch.sent",
                Dispatch::Spilled => "dispatch.spilled",
                Dispatch::Rejected => "dispatch.rejected",
            };
            self.metrics.inc_counter(key, 1);
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: ChannelEvent) -> Result<(), AgentError> {
        let now = Instant::now();
        match event {
            ChannelEvent::Connected => {
                self.metrics.inc_counter("channel.connects", 1);
                self.pipeline.handle_connect(self.spill.as_mut(), now)?;
            }
            ChannelEvent::PacketAcked(id) => {
                self.metrics.inc_counter("channel.acks", 1);
                self.pipeline.on_ack(id, self.spill.as_mut(), now)?;
            }
            ChannelEvent::Disconnected => {
                self.metrics.inc_counter("channel.disconnects", 1);
                self.pipeline.on_disconnect(self.spill.as_mut());
            }
        }
        Ok(())
    }

    /// Periodic sweep, paired with the router's deadline poll.
    pub fn tick(&mut self, now: Instant) {
        if self.pipeline.tick(now, self.spill.as_mut()) {
            self.metrics.inc_counter("pipeline.ack_timeouts", 1);
        }
    }

    /// Publishes the serializer's counters on the metrics stream (when
    /// configured) and logs the registry snapshot.
    pub fn emit_metrics(&mut self) {
        if let Some(queue) = &self.spill {
            let (lost, corrupt, files) = (
                queue.lost_files(),
                queue.corrupt_records(),
                queue.file_count() as u64,
            );
            self.serializer.sync_queue_counters(lost, corrupt);
            self.metrics.set_gauge("spill.files", files);
        }
        self.metrics
            .set_gauge("pipeline.inflight", self.pipeline.inflight_len() as u64);
        self.metrics
            .set_gauge("pipeline.dropped", self.pipeline.dropped_packets());
        if let Some(packet) = self.serializer.metrics_packet() {
            let outcome =
                self.serializer
                    .dispatch_packet(packet, &mut self.pipeline, self.spill.as_mut());
            debug!("metrics packet dispatched: {outcome:?}");
        }
        info!("{}", self.metrics.snapshot().render());
    }

    pub fn pipeline(&self) -> &PublishPipeline<C> {
        &self.pipeline
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Seals the spill queue. Buffered stream points must be drained through
    /// [`AgentCore::handle_batch`] before this.
    pub fn close(mut self) -> Result<(), AgentError> {
        if let Some(queue) = self.spill.take() {
            queue.close()?;
        }
        Ok(())
    }
}

/// Ties the stream router to the core and drives both from the runtime.
pub struct Agent<C> {
    core: AgentCore<C>,
    router: RouterHandle,
    batch_rx: mpsc::Receiver<Batch>,
}

impl<C: PacketChannel> Agent<C> {
    /// Builds the agent and hands back the producer-facing router handle.
    pub fn new(config: &Config, channel: C) -> Result<(Self, RouterHandle), AgentError> {
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let router = StreamRouter::new(config, batch_tx);
        let core = AgentCore::new(config, channel)?;
        let agent = Self {
            core,
            router: router.clone(),
            batch_rx,
        };
        Ok((agent, router))
    }

    /// Event loop: flushed batches, channel events, and the periodic ticks,
    /// until ctrl-c or the event source closes. On the way out every partial
    /// accumulator is force-flushed through the normal dispatch path so
    /// nothing is silently lost.
    pub async fn run(self, mut events: mpsc::Receiver<ChannelEvent>) -> Result<(), AgentError> {
        let Agent {
            mut core,
            router,
            mut batch_rx,
        } = self;
        let mut flush = time::interval(FLUSH_TICK);
        let mut metrics = time::interval(METRICS_PERIOD);
        loop {
            select! {
                batch = batch_rx.recv() => match batch {
                    Some(batch) => core.handle_batch(batch)?,
                    None => break,
                },
                event = events.recv() => match event {
                    Some(event) => core.handle_event(event)?,
                    None => {
                        warn!("channel driver stopped");
                        core.handle_event(ChannelEvent::Disconnected)?;
                        break;
                    }
                },
                _ = flush.tick() => {
                    let now = Instant::now();
                    router.poll_deadlines(now);
                    core.tick(now);
                }
                _ = metrics.tick() => core.emit_metrics(),
                _ = signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
            }
        }
        Self::drain_on_shutdown(&mut core, &router, &mut batch_rx)?;
        core.close()
    }

    /// Final flush: batches already handed off but not yet received, then
    /// every partial accumulator still held by the router.
    fn drain_on_shutdown(
        core: &mut AgentCore<C>,
        router: &RouterHandle,
        batch_rx: &mut mpsc::Receiver<Batch>,
    ) -> Result<(), AgentError> {
        while let Ok(batch) = batch_rx.try_recv() {
            core.handle_batch(batch)?;
        }
        for batch in router.drain() {
            core.handle_batch(batch)?;
        }
        Ok(())
    }
}
