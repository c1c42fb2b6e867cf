//! DHT-assisted variant
//!
//! Writes publish the room's [`WireEntry`] under [`DhtKey::for_room`]; a room
//! leaving the directory publishes a tombstone, since DHT values can only be
//! superseded. Reads resolve a bounded set of known peer room ids
//! concurrently, each under its own timeout, and silently omit whatever
//! cannot be resolved.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::propagation::PropagationQueue;
use super::{AdapterStats, DirectoryEntry, DistributionAdapter, StatsSnapshot, WireEntry};
use crate::config::{DirectoryConfig, DistributionMode};
use crate::projector::RoomChange;
use crate::storage::RoomStore;
use crate::transport::{DhtClient, DhtKey};
use crate::types::RoomId;

/// Adapter that publishes into and resolves from a DHT
pub struct DhtAdapter {
    client: Arc<dyn DhtClient>,
    store: RoomStore,
    queue: PropagationQueue,
    stats: Arc<AdapterStats>,
    peer_rooms: RwLock<BTreeSet<RoomId>>,
    include_federation: bool,
    max_peer_lookups: usize,
    lookup_timeout: Duration,
}

impl DhtAdapter {
    /// Start the propagation worker and seed the peer room set from `config`
    pub fn start(
        client: Arc<dyn DhtClient>,
        store: RoomStore,
        config: &DirectoryConfig,
        cancel: CancellationToken,
    ) -> Self {
        let stats = Arc::new(AdapterStats::default());

        let publisher = client.clone();
        let origin = config.server_name.clone();
        let queue = PropagationQueue::spawn(
            config.propagation_queue,
            config.publish_timeout,
            stats.clone(),
            cancel,
            move |change: RoomChange| {
                let client = publisher.clone();
                let origin = origin.clone();
                async move {
                    let key = DhtKey::for_room(&change.room.room_id);
                    let value = WireEntry::new(origin, DirectoryEntry::from(&change)).encode()?;
                    client.put(key, value).await
                }
            },
        );

        info!(
            peer_rooms = config.peer_rooms.len(),
            include_federation = config.include_federation,
            "DHT distribution started"
        );

        Self {
            client,
            store,
            queue,
            stats,
            peer_rooms: RwLock::new(config.peer_rooms.iter().cloned().collect()),
            include_federation: config.include_federation,
            max_peer_lookups: config.max_peer_lookups,
            lookup_timeout: config.lookup_timeout,
        }
    }

    /// Room ids to resolve on the next read: unknown locally, capped
    fn lookup_set(&self) -> Vec<RoomId> {
        let candidates: Vec<RoomId> = self.peer_rooms.read().iter().cloned().collect();
        candidates
            .into_iter()
            .filter(|room_id| match self.store.record(room_id) {
                Ok(record) => record.is_none(),
                Err(e) => {
                    warn!(%room_id, error = ?e, "Local lookup failed, skipping peer room");
                    false
                }
            })
            .take(self.max_peer_lookups)
            .collect()
    }

    async fn resolve(&self, room_id: RoomId) -> Option<DirectoryEntry> {
        let key = DhtKey::for_room(&room_id);
        let bytes = match tokio::time::timeout(self.lookup_timeout, self.client.get(key)).await {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => {
                debug!(%room_id, %key, "No DHT entry for peer room");
                return None;
            }
            Ok(Err(e)) => {
                AdapterStats::bump(&self.stats.lookup_failures);
                warn!(%room_id, error = ?e, "DHT lookup failed, omitting room");
                return None;
            }
            Err(_) => {
                AdapterStats::bump(&self.stats.lookup_failures);
                warn!(%room_id, timeout = ?self.lookup_timeout, "DHT lookup timed out, omitting room");
                return None;
            }
        };

        let (origin, entry) = match WireEntry::decode(&bytes) {
            Ok(wire) => wire.into_parts(),
            Err(e) => {
                AdapterStats::bump(&self.stats.malformed_messages);
                warn!(%room_id, error = ?e, "Malformed DHT entry");
                return None;
            }
        };
        if entry.room_id != room_id {
            AdapterStats::bump(&self.stats.malformed_messages);
            warn!(%room_id, stored = %entry.room_id, origin = %origin, "DHT entry is for another room");
            return None;
        }
        if entry.is_tombstone() {
            debug!(%room_id, origin = %origin, "Peer room is no longer listed");
            return None;
        }
        Some(entry)
    }
}

impl DistributionAdapter for DhtAdapter {
    fn mode(&self) -> DistributionMode {
        DistributionMode::Dht
    }

    fn propagate(&self, change: RoomChange) {
        self.queue.enqueue(change);
    }

    fn peer_entries(&self) -> BoxFuture<'_, Vec<DirectoryEntry>> {
        Box::pin(async move {
            if !self.include_federation {
                return Vec::new();
            }
            let lookups = self.lookup_set();
            if lookups.is_empty() {
                return Vec::new();
            }

            let resolved = join_all(lookups.into_iter().map(|room_id| self.resolve(room_id))).await;
            let entries: Vec<DirectoryEntry> = resolved.into_iter().flatten().collect();
            debug!(resolved = entries.len(), "Resolved peer rooms from DHT");
            entries
        })
    }

    fn learn_peer_rooms(&self, rooms: &[RoomId]) {
        let mut peer_rooms = self.peer_rooms.write();
        let before = peer_rooms.len();
        peer_rooms.extend(rooms.iter().cloned());
        if peer_rooms.len() > before {
            debug!(added = peer_rooms.len() - before, "Learned peer rooms");
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
