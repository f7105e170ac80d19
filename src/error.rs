use crate::config::ConfigError;
use crate::serializer::SerializeError;
use crate::spill::SpillError;
use thiserror::Error;

/// Top-level failure surfaced by the agent runtime. Module-local errors are
/// composed transparently so callers see the original message.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Spill(#[from] SpillError),
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Fatal(String),
}

impl AgentError {
    pub fn fatal(message: impl Into<String>) -> Self {
        AgentError::Fatal(message.into())
    }
}
