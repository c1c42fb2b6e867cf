//! Pubsub-assisted variant
//!
//! Outbound: each local change is broadcast as a [`WireEntry`] on the
//! configured topic. Inbound: a consumer task decodes every message and
//! routes it through [`EventProjector::apply_peer_snapshot`], so peer and
//! local writes converge under the same mark rule. Delivery order across
//! peers is never relied upon.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::propagation::PropagationQueue;
use super::{AdapterStats, DirectoryEntry, DistributionAdapter, StatsSnapshot, WireEntry};
use crate::config::{DirectoryConfig, DistributionMode};
use crate::error::DirectoryResult;
use crate::projector::{EventProjector, Projection, RoomChange};
use crate::transport::PubSubClient;

/// Adapter that gossips changes to every server on a shared topic
pub struct PubSubAdapter {
    queue: Arc<PropagationQueue>,
    stats: Arc<AdapterStats>,
}

impl PubSubAdapter {
    /// Subscribe to the topic and start the consumer, publisher and
    /// optional republish tasks
    pub async fn start(
        client: Arc<dyn PubSubClient>,
        projector: EventProjector,
        config: &DirectoryConfig,
        cancel: CancellationToken,
    ) -> DirectoryResult<Self> {
        let stats = Arc::new(AdapterStats::default());
        let inbound = client.subscribe(&config.topic).await?;

        let publisher = client.clone();
        let topic = config.topic.clone();
        let origin = config.server_name.clone();
        let queue = Arc::new(PropagationQueue::spawn(
            config.propagation_queue,
            config.publish_timeout,
            stats.clone(),
            cancel.clone(),
            move |change: RoomChange| {
                let client = publisher.clone();
                let topic = topic.clone();
                let origin = origin.clone();
                async move {
                    let message = WireEntry::new(origin, DirectoryEntry::from(&change)).encode()?;
                    client.publish(&topic, message).await
                }
            },
        ));

        tokio::spawn(consume(
            inbound,
            projector.clone(),
            config.server_name.clone(),
            stats.clone(),
            cancel.clone(),
        ));

        if let Some(interval) = config.republish_interval {
            tokio::spawn(republish(projector, queue.clone(), interval, cancel));
        }

        info!(
            topic = %config.topic,
            server_name = %config.server_name,
            republish = ?config.republish_interval,
            "Pubsub distribution started"
        );

        Ok(Self { queue, stats })
    }
}

impl DistributionAdapter for PubSubAdapter {
    fn mode(&self) -> DistributionMode {
        DistributionMode::PubSub
    }

    fn propagate(&self, change: RoomChange) {
        self.queue.enqueue(change);
    }

    fn peer_entries(&self) -> BoxFuture<'_, Vec<DirectoryEntry>> {
        // Peer entries are merged into the store as they arrive
        future::ready(Vec::new()).boxed()
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

async fn consume(
    mut inbound: BoxStream<'static, Vec<u8>>,
    projector: EventProjector,
    server_name: String,
    stats: Arc<AdapterStats>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbound.next() => match next {
                Some(message) => message,
                None => {
                    info!("Directory topic closed");
                    break;
                }
            },
        };

        let (origin, entry) = match WireEntry::decode(&message) {
            Ok(wire) => wire.into_parts(),
            Err(e) => {
                AdapterStats::bump(&stats.malformed_messages);
                warn!(error = ?e, len = message.len(), "Dropping malformed directory message");
                continue;
            }
        };

        if origin == server_name {
            AdapterStats::bump(&stats.echoes_suppressed);
            debug!(room_id = %entry.room_id, "Skipping own message");
            continue;
        }

        let room_id = entry.room_id.clone();
        let (room, mark) = entry.into_parts();
        match projector.apply_peer_snapshot(room, mark, &origin) {
            Ok(Projection::Applied(_)) => {
                AdapterStats::bump(&stats.peer_entries_applied);
                debug!(%room_id, origin = %origin, token = %mark.token, "Applied peer entry");
            }
            Ok(Projection::Stale) => {
                AdapterStats::bump(&stats.stale_peer_entries);
            }
            Err(e) => {
                warn!(%room_id, origin = %origin, error = ?e, "Failed to apply peer entry");
            }
        }
    }
    debug!("Directory consumer stopped");
}

/// Re-announce locally sourced visible rooms so late joiners converge
async fn republish(
    projector: EventProjector,
    queue: Arc<PropagationQueue>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let records = match projector.store().local_records() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = ?e, "Republish skipped, store unavailable");
                continue;
            }
        };

        let mut announced = 0usize;
        for record in records {
            let Some(mark) = record.mark else { continue };
            if !record.room.visible {
                continue;
            }
            queue.enqueue(RoomChange {
                room: record.room,
                mark,
                visibility_changed: false,
            });
            announced += 1;
        }
        debug!(announced, "Republished local rooms");
    }
}
