use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Stream the serializer publishes its own counters on, when configured.
pub const METRICS_STREAM: &str = "serializer_metrics";
/// Stream action progress records are written to.
pub const ACTION_STATUS_STREAM: &str = "action_status";

const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_ACK_GRACE: Duration = Duration::from_secs(60);
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-stream batching configuration. Streams not present in the config file
/// are created on first write with `buf_size = 1` and the default flush
/// period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub buf_size: usize,
    pub flush_period: Duration,
    pub topic: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buf_size: 1,
            flush_period: DEFAULT_FLUSH_PERIOD,
            topic: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentLimits {
    pub max_packet_size: usize,
    pub max_inflight: usize,
    pub ack_grace: Duration,
}

/// Spill directory layout limits. Absence of the `[persistence]` block
/// disables spilling entirely: packets are dropped (and counted) while the
/// channel is down.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub path: PathBuf,
    pub max_file_size: u64,
    pub max_file_count: usize,
}

#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub whitelist: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub agent: AgentLimits,
    pub persistence: Option<PersistenceConfig>,
    pub streams: HashMap<String, StreamConfig>,
    pub actions: Option<ActionConfig>,
    #[cfg(feature = "mqtt")]
    pub mqtt: Option<MqttConfig>,
}

#[cfg(feature = "mqtt")]
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Topic incoming action requests are subscribed on.
    #[serde(default)]
    pub actions_topic: Option<String>,
}

#[cfg(feature = "mqtt")]
fn default_keep_alive_secs() -> u64 {
    30
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(raw)?;
        file.validate()
    }

    pub fn stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.get(name)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.streams.contains_key(METRICS_STREAM)
    }
}

/// On-disk TOML shape, converted into [`Config`] after validation.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    agent: AgentSection,
    #[serde(default)]
    persistence: Option<PersistenceSection>,
    #[serde(default)]
    streams: HashMap<String, StreamSection>,
    #[serde(default)]
    actions: Option<ActionsSection>,
    #[cfg(feature = "mqtt")]
    #[serde(default)]
    mqtt: Option<MqttConfig>,
}

#[derive(Debug, Deserialize)]
struct AgentSection {
    max_packet_size: usize,
    max_inflight: usize,
    #[serde(default)]
    ack_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PersistenceSection {
    path: PathBuf,
    max_file_size: u64,
    max_file_count: usize,
}

#[derive(Debug, Deserialize)]
struct StreamSection {
    buf_size: usize,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    flush_period_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ActionsSection {
    whitelist: Vec<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

impl ConfigFile {
    fn validate(self) -> Result<Config, ConfigError> {
        if self.agent.max_packet_size == 0 {
            return Err(ConfigError::ZeroPacketSize);
        }
        if self.agent.max_inflight == 0 {
            return Err(ConfigError::ZeroInflight);
        }
        let mut streams = HashMap::new();
        for (name, section) in self.streams {
            if section.buf_size == 0 {
                return Err(ConfigError::ZeroBufSize(name));
            }
            let flush_period = section
                .flush_period_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_FLUSH_PERIOD);
            streams.insert(
                name,
                StreamConfig {
                    buf_size: section.buf_size,
                    flush_period,
                    topic: section.topic,
                },
            );
        }
        let persistence = match self.persistence {
            Some(section) => {
                if section.max_file_size == 0 {
                    return Err(ConfigError::ZeroFileSize);
                }
                if section.max_file_count == 0 {
                    return Err(ConfigError::ZeroFileCount);
                }
                Some(PersistenceConfig {
                    path: section.path,
                    max_file_size: section.max_file_size,
                    max_file_count: section.max_file_count,
                })
            }
            None => None,
        };
        let actions = match self.actions {
            Some(section) => {
                // The action_status stream must be configured with an explicit
                // topic when actions are enabled; there is no default fallback.
                match streams.get(ACTION_STATUS_STREAM) {
                    Some(stream) if stream.topic.is_some() => {}
                    _ => return Err(ConfigError::MissingActionStatusTopic),
                }
                Some(ActionConfig {
                    whitelist: section.whitelist,
                    timeout: section
                        .timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_ACTION_TIMEOUT),
                })
            }
            None => None,
        };
        Ok(Config {
            agent: AgentLimits {
                max_packet_size: self.agent.max_packet_size,
                max_inflight: self.agent.max_inflight,
                ack_grace: self
                    .agent
                    .ack_grace_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_ACK_GRACE),
            },
            persistence,
            streams,
            actions,
            #[cfg(feature = "mqtt")]
            mqtt: self.mqtt,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("agent.max_packet_size must be at least 1")]
    ZeroPacketSize,
    #[error("agent.max_inflight must be at least 1")]
    ZeroInflight,
    #[error("stream {0}: buf_size must be at least 1")]
    ZeroBufSize(String),
    #[error("persistence.max_file_size must be at least 1")]
    ZeroFileSize,
    #[error("persistence.max_file_count must be at least 1")]
    ZeroFileCount,
    #[error("actions are enabled but the action_status stream has no topic")]
    MissingActionStatusTopic,
}
