//! Distribution Adapters: how directory changes reach other servers
//!
//! ## Variants
//!
//! - [`LocalAdapter`] - no distribution, the store is authoritative
//! - [`DhtAdapter`] - publishes visible rooms into a DHT and resolves known
//!   peer rooms from it on read
//! - [`PubSubAdapter`] - broadcasts changes on a gossip topic and feeds
//!   inbound peer changes back through the Event Projector
//!
//! ## Message Flow
//!
//! ```text
//! Event Projector ── RoomChange ──► propagate() ──► propagation queue
//!                                                        │
//!                                         background task, publish timeout
//!                                                        ▼
//!                                          WireEntry::V1 { origin, entry }
//!                                                        │
//!                                              DHT put / topic publish
//! ```
//!
//! Propagation never blocks the caller and never fails a local write.

mod dht;
mod local;
mod propagation;
mod pubsub;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::config::DistributionMode;
use crate::error::DirectoryResult;
use crate::projector::RoomChange;
use crate::types::{PublicRoom, RoomId, StateMark};

pub use dht::DhtAdapter;
pub use local::LocalAdapter;
pub use pubsub::PubSubAdapter;

/// Behaviour shared by the three distribution variants
///
/// Selected once when the façade is opened; nothing else in the crate
/// inspects which variant is running.
pub trait DistributionAdapter: Send + Sync {
    /// Which variant this is
    fn mode(&self) -> DistributionMode;

    /// Hand a local change over for propagation
    ///
    /// Returns immediately. Failures are logged and counted, never returned.
    fn propagate(&self, change: RoomChange);

    /// Peer-sourced entries to layer over local reads
    ///
    /// Only visible entries for rooms not known locally are returned.
    /// Unresolvable peers are omitted.
    fn peer_entries(&self) -> BoxFuture<'_, Vec<DirectoryEntry>>;

    /// Remember room ids hosted by peers so reads can resolve them
    fn learn_peer_rooms(&self, _rooms: &[RoomId]) {}

    /// Counters for this adapter
    fn stats(&self) -> StatsSnapshot;
}

/// Externally published projection of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub room_id: RoomId,
    /// `false` marks a tombstone
    pub visible: bool,
    pub aliases: BTreeSet<String>,
    pub canonical_alias: Option<String>,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub avatar_url: Option<String>,
    pub num_joined_members: i64,
    pub world_readable: bool,
    pub guest_can_join: bool,
    /// Mark of the write that produced this entry
    pub mark: StateMark,
}

impl DirectoryEntry {
    /// Project a room at the given mark
    pub fn new(room: &PublicRoom, mark: StateMark) -> Self {
        Self {
            room_id: room.room_id.clone(),
            visible: room.visible,
            aliases: room.aliases.clone(),
            canonical_alias: room.canonical_alias.clone(),
            name: room.name.clone(),
            topic: room.topic.clone(),
            avatar_url: room.avatar_url.clone(),
            num_joined_members: room.num_joined_members,
            world_readable: room.world_readable,
            guest_can_join: room.guest_can_join,
            mark,
        }
    }

    /// True if the entry says the room is no longer listed
    pub fn is_tombstone(&self) -> bool {
        !self.visible
    }

    /// Split into the room snapshot and its mark
    pub fn into_parts(self) -> (PublicRoom, StateMark) {
        let room = PublicRoom {
            room_id: self.room_id,
            visible: self.visible,
            aliases: self.aliases,
            canonical_alias: self.canonical_alias,
            name: self.name,
            topic: self.topic,
            avatar_url: self.avatar_url,
            num_joined_members: self.num_joined_members.max(0),
            world_readable: self.world_readable,
            guest_can_join: self.guest_can_join,
        };
        (room, self.mark)
    }

    /// Just the room snapshot
    pub fn into_room(self) -> PublicRoom {
        self.into_parts().0
    }
}

impl From<&RoomChange> for DirectoryEntry {
    fn from(change: &RoomChange) -> Self {
        DirectoryEntry::new(&change.room, change.mark)
    }
}

/// Versioned envelope carried in DHT values and on the gossip topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireEntry {
    /// Version 1
    V1 {
        /// Federation name of the publishing server
        origin: String,
        /// The published entry
        entry: DirectoryEntry,
    },
}

impl WireEntry {
    /// Wrap an entry published by `origin`
    pub fn new(origin: impl Into<String>, entry: DirectoryEntry) -> Self {
        WireEntry::V1 {
            origin: origin.into(),
            entry,
        }
    }

    /// Encode with postcard
    pub fn encode(&self) -> DirectoryResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from postcard bytes
    pub fn decode(data: &[u8]) -> DirectoryResult<Self> {
        Ok(postcard::from_bytes(data)?)
    }

    /// Publishing server
    pub fn origin(&self) -> &str {
        match self {
            WireEntry::V1 { origin, .. } => origin,
        }
    }

    /// The carried entry
    pub fn entry(&self) -> &DirectoryEntry {
        match self {
            WireEntry::V1 { entry, .. } => entry,
        }
    }

    /// Split into origin and entry
    pub fn into_parts(self) -> (String, DirectoryEntry) {
        match self {
            WireEntry::V1 { origin, entry } => (origin, entry),
        }
    }

    /// Envelope version
    pub fn version(&self) -> u8 {
        match self {
            WireEntry::V1 { .. } => 1,
        }
    }
}

/// Live counters shared between an adapter and its background tasks
#[derive(Debug, Default)]
pub(crate) struct AdapterStats {
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub dropped: AtomicU64,
    pub peer_entries_applied: AtomicU64,
    pub stale_peer_entries: AtomicU64,
    pub echoes_suppressed: AtomicU64,
    pub lookup_failures: AtomicU64,
    pub malformed_messages: AtomicU64,
}

impl AdapterStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            published: load(&self.published),
            publish_failures: load(&self.publish_failures),
            dropped: load(&self.dropped),
            peer_entries_applied: load(&self.peer_entries_applied),
            stale_peer_entries: load(&self.stale_peer_entries),
            echoes_suppressed: load(&self.echoes_suppressed),
            lookup_failures: load(&self.lookup_failures),
            malformed_messages: load(&self.malformed_messages),
        }
    }
}

/// Point-in-time copy of an adapter's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Entries handed to the transport successfully
    pub published: u64,
    /// Publishes that failed or timed out
    pub publish_failures: u64,
    /// Changes dropped because the propagation queue was full
    pub dropped: u64,
    /// Peer entries applied to the store
    pub peer_entries_applied: u64,
    /// Peer entries discarded as not newer than local state
    pub stale_peer_entries: u64,
    /// Own messages received back and skipped
    pub echoes_suppressed: u64,
    /// DHT lookups that failed or timed out
    pub lookup_failures: u64,
    /// Inbound payloads that could not be decoded
    pub malformed_messages: u64,
}
