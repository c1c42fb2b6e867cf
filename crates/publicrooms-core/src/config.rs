//! Directory configuration and backend selection
//!
//! The distribution backend is chosen by capability (`DistributionMode`),
//! not by parsing the storage URI: the storage connection string only picks
//! where the Room Record Store lives.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, DirectoryResult};
use crate::types::RoomId;

/// Default gossip topic for directory announcements
pub const DEFAULT_TOPIC: &str = "publicrooms/directory/v1";

/// Which Distribution Adapter the façade runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionMode {
    /// No distribution; the store is authoritative for this server only
    #[default]
    Local,
    /// Publish visible rooms into a DHT, resolve peer rooms from it on read
    Dht,
    /// Broadcast changes on a gossip topic and merge inbound peer changes
    PubSub,
}

impl std::fmt::Display for DistributionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistributionMode::Local => write!(f, "local"),
            DistributionMode::Dht => write!(f, "dht"),
            DistributionMode::PubSub => write!(f, "pubsub"),
        }
    }
}

impl std::str::FromStr for DistributionMode {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(DistributionMode::Local),
            "dht" => Ok(DistributionMode::Dht),
            "pubsub" | "gossip" => Ok(DistributionMode::PubSub),
            other => Err(DirectoryError::Configuration(format!(
                "unknown distribution mode: {other}"
            ))),
        }
    }
}

/// Where the Room Record Store persists
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// redb file at the given path
    File(PathBuf),
    /// In-memory redb database, lost on drop
    Memory,
}

impl DataSource {
    /// Parse a connection string
    ///
    /// Strings without a `scheme://` prefix are file paths. Schemes other
    /// than `redb` and `file` are rejected; no relational engine is bundled.
    pub fn parse(conn: &str) -> DirectoryResult<Self> {
        let conn = conn.trim();
        if conn.is_empty() || conn == "memory:" || conn == ":memory:" {
            return Ok(DataSource::Memory);
        }

        match conn.split_once("://") {
            Some(("redb" | "file", path)) if !path.is_empty() => {
                Ok(DataSource::File(PathBuf::from(path)))
            }
            Some(("memory", _)) => Ok(DataSource::Memory),
            Some((scheme, _)) if is_scheme(scheme) => Err(DirectoryError::Configuration(format!(
                "unsupported storage scheme '{scheme}' (expected redb:// or file://)"
            ))),
            _ => Ok(DataSource::File(PathBuf::from(conn))),
        }
    }
}

fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Configuration for a directory instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Storage connection string (see [`DataSource::parse`])
    pub data_source: String,
    /// Distribution backend
    pub mode: DistributionMode,
    /// This server's federation name; tags outbound entries for echo suppression
    pub server_name: String,
    /// Gossip topic name
    pub topic: String,
    /// DHT mode: merge resolved peer entries into reads
    pub include_federation: bool,
    /// DHT mode: peer room ids to resolve on read
    pub peer_rooms: Vec<RoomId>,
    /// DHT mode: maximum keys resolved per read
    pub max_peer_lookups: usize,
    /// Per-key DHT resolution timeout
    #[serde(with = "duration_ms")]
    pub lookup_timeout: Duration,
    /// Per-entry propagation timeout
    #[serde(with = "duration_ms")]
    pub publish_timeout: Duration,
    /// Capacity of the propagation queue
    pub propagation_queue: usize,
    /// Pubsub mode: periodic re-announcement of locally sourced rooms
    #[serde(with = "option_duration_ms")]
    pub republish_interval: Option<Duration>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            data_source: String::new(),
            mode: DistributionMode::Local,
            server_name: "localhost".to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            include_federation: true,
            peer_rooms: Vec::new(),
            max_peer_lookups: 64,
            lookup_timeout: Duration::from_secs(2),
            publish_timeout: Duration::from_secs(5),
            propagation_queue: 1024,
            republish_interval: None,
        }
    }
}

impl DirectoryConfig {
    /// Config for an in-memory, local-only directory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load a JSON config file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> DirectoryResult<Self> {
        let data = std::fs::read(path.as_ref()).map_err(|e| {
            DirectoryError::Configuration(format!(
                "cannot read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        serde_json::from_slice(&data).map_err(|e| DirectoryError::Configuration(e.to_string()))
    }

    /// Set the storage connection string
    pub fn with_data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = data_source.into();
        self
    }

    /// Set the distribution mode
    pub fn with_mode(mut self, mode: DistributionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set this server's federation name
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the gossip topic name
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Enable or disable federation-wide reads in DHT mode
    pub fn with_federation(mut self, include: bool) -> Self {
        self.include_federation = include;
        self
    }

    /// Seed the peer rooms resolved in DHT mode
    pub fn with_peer_rooms(mut self, rooms: impl IntoIterator<Item = RoomId>) -> Self {
        self.peer_rooms = rooms.into_iter().collect();
        self
    }

    /// Set the per-key DHT lookup timeout
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Set the per-entry propagation timeout
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Enable periodic republishing in pubsub mode
    pub fn with_republish_interval(mut self, interval: Duration) -> Self {
        self.republish_interval = Some(interval);
        self
    }

    /// Parsed storage location
    pub fn data_source(&self) -> DirectoryResult<DataSource> {
        DataSource::parse(&self.data_source)
    }

    /// Reject values the adapters cannot run with
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.server_name.trim().is_empty() {
            return Err(DirectoryError::Configuration(
                "server_name must not be empty".to_string(),
            ));
        }
        if self.mode == DistributionMode::PubSub && self.topic.trim().is_empty() {
            return Err(DirectoryError::Configuration(
                "pubsub mode requires a topic".to_string(),
            ));
        }
        if self.propagation_queue == 0 {
            return Err(DirectoryError::Configuration(
                "propagation_queue must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
