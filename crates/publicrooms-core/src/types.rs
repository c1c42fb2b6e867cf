//! Core types for the public rooms directory

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DirectoryError;

/// Federation-wide room identifier (`!opaque:server`)
///
/// Immutable once a room row has been created; used as the primary key of
/// the directory and as the input of the DHT key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Parse and validate a room identifier
    pub fn parse(s: impl Into<String>) -> Result<Self, DirectoryError> {
        let s = s.into();
        let valid = s
            .strip_prefix('!')
            .and_then(|rest| rest.split_once(':'))
            .is_some_and(|(opaque, server)| !opaque.is_empty() && !server.is_empty());
        if valid {
            Ok(Self(s))
        } else {
            Err(DirectoryError::InvalidRoomId(s))
        }
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Server part of the identifier (after the first `:`)
    pub fn server_name(&self) -> &str {
        self.0.split_once(':').map(|(_, server)| server).unwrap_or("")
    }
}

impl TryFrom<String> for RoomId {
    type Error = DirectoryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl FromStr for RoomId {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-room logical ordering token (event depth)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OrderingToken(pub u64);

impl fmt::Display for OrderingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last-applied position of a room
///
/// Ordered by token, then by `override_seq`, then by `retracted`
/// (`false < true`). Retracting the event at token `t` supersedes adding it,
/// and a replay of either is stale. Local directory writes keep the token of
/// the last applied event and bump `override_seq`, so they sort after every
/// write at that token but before any event at `t + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateMark {
    /// Ordering token of the last applied event
    pub token: OrderingToken,
    /// Local directory writes applied since that event; 0 for events
    pub override_seq: u32,
    /// Whether the last applied write retracted an event
    pub retracted: bool,
}

impl StateMark {
    /// Mark produced by adding an event at `token`
    pub fn added(token: OrderingToken) -> Self {
        Self {
            token,
            override_seq: 0,
            retracted: false,
        }
    }

    /// Mark produced by retracting the event at `token`
    pub fn retracted(token: OrderingToken) -> Self {
        Self {
            token,
            override_seq: 0,
            retracted: true,
        }
    }

    /// Mark for a local directory write on top of `current`
    ///
    /// Stays within the token of the last applied event so the room's next
    /// event still supersedes it.
    pub fn local_override(current: Option<&StateMark>) -> Self {
        let (token, seq) = current.map_or((OrderingToken(0), 0), |mark| {
            (mark.token, mark.override_seq)
        });
        Self {
            token,
            override_seq: seq.saturating_add(1),
            retracted: false,
        }
    }

    /// True if `self` should replace `current` (strictly newer, or no mark yet)
    pub fn supersedes(&self, current: Option<&StateMark>) -> bool {
        current.map_or(true, |current| self > current)
    }
}

impl Ord for StateMark {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then(self.override_seq.cmp(&other.override_seq))
            .then(self.retracted.cmp(&other.retracted))
    }
}

impl PartialOrd for StateMark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One row of the public rooms directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicRoom {
    /// Primary key
    pub room_id: RoomId,
    /// Whether the room is currently listed publicly
    pub visible: bool,
    /// Human-readable aliases
    pub aliases: BTreeSet<String>,
    /// Canonical alias, if any
    pub canonical_alias: Option<String>,
    /// Display name
    pub name: Option<String>,
    /// Display topic
    pub topic: Option<String>,
    /// Avatar content URL
    pub avatar_url: Option<String>,
    /// Joined member count, never negative
    pub num_joined_members: i64,
    /// History visibility is `world_readable`
    pub world_readable: bool,
    /// Guest access is `can_join`
    pub guest_can_join: bool,
}

impl PublicRoom {
    /// Create a fresh, hidden room with empty summary
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            visible: false,
            aliases: BTreeSet::new(),
            canonical_alias: None,
            name: None,
            topic: None,
            avatar_url: None,
            num_joined_members: 0,
            world_readable: false,
            guest_can_join: false,
        }
    }

    /// True if everything but `visible` matches
    pub fn same_summary(&self, other: &PublicRoom) -> bool {
        self.aliases == other.aliases
            && self.canonical_alias == other.canonical_alias
            && self.name == other.name
            && self.topic == other.topic
            && self.avatar_url == other.avatar_url
            && self.num_joined_members == other.num_joined_members
            && self.world_readable == other.world_readable
            && self.guest_can_join == other.guest_can_join
    }
}

/// Who performed the last applied write to a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomSource {
    /// Local event log or local directory write
    Local,
    /// A peer server, by federation name
    Peer(String),
}

/// Stored row: the public projection plus convergence bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    /// Public projection
    pub room: PublicRoom,
    /// Last applied mark; `None` until the first write
    pub mark: Option<StateMark>,
    /// Origin of the last applied write
    pub source: RoomSource,
}

impl RoomRecord {
    /// New, never-written record for a room
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room: PublicRoom::new(room_id),
            mark: None,
            source: RoomSource::Local,
        }
    }
}
