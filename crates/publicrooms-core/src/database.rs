//! Database façade: one fixed contract over whichever distribution runs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Database                                                    │
//! │  ├── store: RoomStore             (redb, shared handle)      │
//! │  ├── projector: EventProjector    (events → store)           │
//! │  ├── adapter: dyn DistributionAdapter                        │
//! │  │   └── Local | Dht | PubSub, chosen once in open()         │
//! │  └── cancel: CancellationToken    (stops background tasks)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Local operations succeed or fail on the store alone. Distribution is a
//! side effect handed to the adapter after the local write has committed.
//!
//! Every operation is `async`; dropping the returned future cancels it and
//! discards any partial result.

use std::sync::Arc;

use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::config::{DirectoryConfig, DistributionMode};
use crate::distribution::{
    DhtAdapter, DistributionAdapter, LocalAdapter, PubSubAdapter, StatsSnapshot,
};
use crate::error::{DirectoryError, DirectoryResult};
use crate::event::RoomEvent;
use crate::projector::{EventProjector, RoomChange};
use crate::query::{merge_rooms, Page, RoomFilter};
use crate::storage::RoomStore;
use crate::transport::{DhtClient, PubSubClient};
use crate::types::{PublicRoom, RoomId};

/// Optional transport handles supplied at construction
#[derive(Clone, Default)]
pub struct DistributionHandles {
    /// Required in [`DistributionMode::Dht`]
    pub dht: Option<Arc<dyn DhtClient>>,
    /// Required in [`DistributionMode::PubSub`]
    pub pubsub: Option<Arc<dyn PubSubClient>>,
}

impl DistributionHandles {
    /// No handles; enough for local mode
    pub fn none() -> Self {
        Self::default()
    }

    /// Supply a DHT client
    pub fn with_dht(mut self, client: Arc<dyn DhtClient>) -> Self {
        self.dht = Some(client);
        self
    }

    /// Supply a pubsub client
    pub fn with_pubsub(mut self, client: Arc<dyn PubSubClient>) -> Self {
        self.pubsub = Some(client);
        self
    }
}

/// The public rooms directory of one server
pub struct Database {
    store: RoomStore,
    projector: EventProjector,
    adapter: Box<dyn DistributionAdapter>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

impl Database {
    /// Open the store and start the configured distribution adapter
    ///
    /// Fails with `Configuration` if the config is invalid or the selected
    /// mode's transport handle is missing, and with `StorageUnavailable` if
    /// the store cannot be opened.
    pub async fn open(config: DirectoryConfig, handles: DistributionHandles) -> DirectoryResult<Self> {
        config.validate()?;
        let source = config.data_source()?;

        let dht = match config.mode {
            DistributionMode::Dht => Some(handles.dht.ok_or_else(|| {
                DirectoryError::Configuration("dht mode requires a DHT client handle".to_string())
            })?),
            _ => None,
        };
        let pubsub = match config.mode {
            DistributionMode::PubSub => Some(handles.pubsub.ok_or_else(|| {
                DirectoryError::Configuration(
                    "pubsub mode requires a pubsub client handle".to_string(),
                )
            })?),
            _ => None,
        };

        let store = RoomStore::open(&source)?;
        let projector = EventProjector::new(store.clone());
        let cancel = CancellationToken::new();

        let adapter: Box<dyn DistributionAdapter> = match (dht, pubsub) {
            (Some(client), _) => Box::new(DhtAdapter::start(
                client,
                store.clone(),
                &config,
                cancel.clone(),
            )),
            (_, Some(client)) => Box::new(
                PubSubAdapter::start(client, projector.clone(), &config, cancel.clone()).await?,
            ),
            (None, None) => Box::new(LocalAdapter::new()),
        };

        info!(
            mode = %adapter.mode(),
            server_name = %config.server_name,
            "Public rooms directory opened"
        );

        Ok(Self {
            store,
            projector,
            adapter,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
        })
    }

    /// Open an in-memory, local-only directory
    pub async fn in_memory() -> DirectoryResult<Self> {
        Self::open(DirectoryConfig::in_memory(), DistributionHandles::none()).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Visibility
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether a room is listed; unknown rooms are not
    pub async fn get_room_visibility(&self, room_id: &RoomId) -> DirectoryResult<bool> {
        Ok(self.store.get(room_id)?.is_some_and(|room| room.visible))
    }

    /// Publish or unpublish a room in the directory
    pub async fn set_room_visibility(&self, visible: bool, room_id: &RoomId) -> DirectoryResult<()> {
        let change = self.projector.set_visibility(room_id, visible)?;
        self.forward(change);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Number of listed rooms
    pub async fn count_public_rooms(&self) -> DirectoryResult<i64> {
        self.count_public_rooms_matching("").await
    }

    /// Number of listed rooms matching `filter`
    ///
    /// Always equals the number of rows an exhaustive walk of
    /// [`get_public_rooms`](Self::get_public_rooms) with the same filter
    /// returns over one snapshot.
    pub async fn count_public_rooms_matching(&self, filter: &str) -> DirectoryResult<i64> {
        let filter = RoomFilter::new(filter);
        let local = self.store.count(&filter)?;
        let peers = self
            .adapter
            .peer_entries()
            .await
            .into_iter()
            .filter(|entry| entry.visible)
            .map(|entry| entry.into_room())
            .filter(|room| filter.matches(room))
            .count();
        Ok(local + peers as i64)
    }

    /// One page of listed rooms, ordered by joined members then room id
    ///
    /// A negative `offset` starts at zero; `limit <= 0` or an offset past the
    /// end yields an empty page.
    pub async fn get_public_rooms(
        &self,
        offset: i64,
        limit: i16,
        filter: &str,
    ) -> DirectoryResult<Vec<PublicRoom>> {
        let page = Page::new(offset, limit);
        if page.limit == 0 {
            return Ok(Vec::new());
        }
        let filter = RoomFilter::new(filter);

        let peers = self.adapter.peer_entries().await;
        if peers.is_empty() {
            return self.store.list(page, &filter);
        }

        // Every row of the merged page lies within the first offset+limit
        // local rows plus the peer rows.
        let head = Page {
            offset: 0,
            limit: page.end(),
        };
        let local = self.store.list(head, &filter)?;
        let merged = merge_rooms(local, peers.into_iter().map(|e| e.into_room()), &filter);
        debug!(rows = merged.len(), "Merged local and peer rooms");
        Ok(page.slice(merged))
    }

    /// A room's current projection, visible or not
    pub async fn room(&self, room_id: &RoomId) -> DirectoryResult<Option<PublicRoom>> {
        self.store.get(room_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event ingestion
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply one room event from the local event log
    pub async fn update_room_from_event(&self, event: &RoomEvent) -> DirectoryResult<()> {
        let change = self.projector.apply_event(event)?.into_change();
        self.forward(change);
        Ok(())
    }

    /// Apply a batch: every event in `to_remove` is retracted before any
    /// event in `to_add` is applied
    pub async fn update_room_from_events(
        &self,
        to_add: &[RoomEvent],
        to_remove: &[RoomEvent],
    ) -> DirectoryResult<()> {
        for change in self.projector.apply_events(to_add, to_remove)? {
            self.adapter.propagate(change);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Distribution
    // ═══════════════════════════════════════════════════════════════════════

    /// Tell the adapter about rooms hosted elsewhere (DHT mode resolves them on read)
    pub fn learn_peer_rooms(&self, rooms: impl IntoIterator<Item = RoomId>) {
        let rooms: Vec<RoomId> = rooms.into_iter().collect();
        self.adapter.learn_peer_rooms(&rooms);
    }

    /// Active distribution mode
    pub fn mode(&self) -> DistributionMode {
        self.adapter.mode()
    }

    /// Counters of the active adapter
    pub fn adapter_stats(&self) -> StatsSnapshot {
        self.adapter.stats()
    }

    /// Stop background distribution tasks
    ///
    /// Local operations keep working; further changes are no longer
    /// propagated. Also happens when the database is dropped.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping directory distribution");
            self.cancel.cancel();
        }
    }

    fn forward(&self, change: Option<RoomChange>) {
        if let Some(change) = change {
            self.adapter.propagate(change);
        }
    }
}
