//! Pubsub boundary: `publish(topic, message)` / `subscribe(topic)`

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::DirectoryResult;

/// Messages buffered per topic before slow subscribers lag
const TOPIC_CAPACITY: usize = 1024;

/// Client handle onto a publish/subscribe transport
///
/// Delivery order and exactly-once delivery are not guaranteed.
pub trait PubSubClient: Send + Sync {
    /// Publish `message` on `topic`
    fn publish(&self, topic: &str, message: Vec<u8>) -> BoxFuture<'_, DirectoryResult<()>>;

    /// Subscribe to `topic`; the stream ends when the subscription closes
    fn subscribe(&self, topic: &str) -> BoxFuture<'_, DirectoryResult<BoxStream<'static, Vec<u8>>>>;
}

/// In-process broadcast bus
///
/// Every subscriber of a topic receives every message published on it after
/// subscribing, the publisher included.
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl MemoryPubSub {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl PubSubClient for MemoryPubSub {
    fn publish(&self, topic: &str, message: Vec<u8>) -> BoxFuture<'_, DirectoryResult<()>> {
        let sender = self.sender(topic);
        let topic = topic.to_string();
        Box::pin(async move {
            if sender.send(message).is_err() {
                debug!(topic = %topic, "No subscribers on topic");
            }
            Ok(())
        })
    }

    fn subscribe(&self, topic: &str) -> BoxFuture<'_, DirectoryResult<BoxStream<'static, Vec<u8>>>> {
        let rx = self.sender(topic).subscribe();
        Box::pin(async move {
            let messages = stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => return Some((message, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Subscriber lagged behind on topic");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(messages.boxed())
        })
    }
}
