//! Fire-and-forget propagation queue
//!
//! A bounded channel drained by one background task. Enqueueing never
//! blocks: when the queue is full the change is dropped and counted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AdapterStats;
use crate::error::DirectoryResult;
use crate::projector::RoomChange;

pub(crate) struct PropagationQueue {
    tx: mpsc::Sender<RoomChange>,
    stats: Arc<AdapterStats>,
}

impl PropagationQueue {
    /// Start the worker; `publish` is called once per change under `timeout`
    pub fn spawn<F, Fut>(
        capacity: usize,
        timeout: Duration,
        stats: Arc<AdapterStats>,
        cancel: CancellationToken,
        publish: F,
    ) -> Self
    where
        F: Fn(RoomChange) -> Fut + Send + 'static,
        Fut: Future<Output = DirectoryResult<()>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<RoomChange>(capacity.max(1));
        let worker_stats = stats.clone();

        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(change) => change,
                        None => break,
                    },
                };

                let room_id = change.room.room_id.clone();
                let visible = change.room.visible;
                match tokio::time::timeout(timeout, publish(change)).await {
                    Ok(Ok(())) => {
                        AdapterStats::bump(&worker_stats.published);
                        debug!(%room_id, visible, "Propagated room");
                    }
                    Ok(Err(e)) => {
                        AdapterStats::bump(&worker_stats.publish_failures);
                        warn!(%room_id, error = ?e, "Propagation failed");
                    }
                    Err(_) => {
                        AdapterStats::bump(&worker_stats.publish_failures);
                        warn!(%room_id, ?timeout, "Propagation timed out");
                    }
                }
            }
            debug!("Propagation worker stopped");
        });

        Self { tx, stats }
    }

    pub fn enqueue(&self, change: RoomChange) {
        match self.tx.try_send(change) {
            Ok(()) => {}
            Err(TrySendError::Full(change)) => {
                AdapterStats::bump(&self.stats.dropped);
                warn!(room_id = %change.room.room_id, "Propagation queue full, dropping change");
            }
            Err(TrySendError::Closed(change)) => {
                AdapterStats::bump(&self.stats.dropped);
                debug!(room_id = %change.room.room_id, "Propagation stopped, dropping change");
            }
        }
    }
}
