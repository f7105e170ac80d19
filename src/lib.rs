//! Edge telemetry agent: per-stream batching, size-bounded serialization,
//! at-least-once publishing over an abstract channel, and a durable
//! spillover queue that is replayed ahead of live traffic after reconnects.

pub mod actions;
pub mod agent;
pub mod channel;
pub mod config;
pub mod error;
pub mod packet;
pub mod pipeline;
pub mod serializer;
pub mod spill;
pub mod stream;
pub mod telemetry;

pub use actions::{Action, ActionDispatcher, ActionStatus};
pub use agent::{Agent, AgentCore};
pub use channel::{AckId, ChannelError, ChannelEvent, PacketChannel};
pub use config::{Config, ConfigError};
pub use error::AgentError;
pub use packet::{Packet, QosLevel};
pub use pipeline::{PipelineState, PublishPipeline, SubmitError};
pub use serializer::{Dispatch, Serializer, SerializerMetrics};
pub use spill::{SpillError, SpillQueue};
pub use stream::{Batch, DataPoint, RouterHandle, StreamRouter, WriteError};
