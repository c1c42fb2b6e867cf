//! Local-only variant: nothing leaves this server

use futures::future::{self, BoxFuture, FutureExt};
use tracing::trace;

use super::{DirectoryEntry, DistributionAdapter, StatsSnapshot};
use crate::config::DistributionMode;
use crate::projector::RoomChange;

/// Adapter that keeps every change on this server
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAdapter;

impl LocalAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl DistributionAdapter for LocalAdapter {
    fn mode(&self) -> DistributionMode {
        DistributionMode::Local
    }

    fn propagate(&self, change: RoomChange) {
        trace!(room_id = %change.room.room_id, "Local mode, not propagating");
    }

    fn peer_entries(&self) -> BoxFuture<'_, Vec<DirectoryEntry>> {
        future::ready(Vec::new()).boxed()
    }

    fn stats(&self) -> StatsSnapshot {
        StatsSnapshot::default()
    }
}
