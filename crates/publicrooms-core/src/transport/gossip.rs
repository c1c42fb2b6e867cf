//! Pubsub boundary over iroh-gossip
//!
//! Each directory topic name maps to a gossip `TopicId` via blake3, so every
//! server configured with the same topic name joins the same swarm.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::api::{GossipReceiver, GossipSender};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::pubsub::PubSubClient;
use crate::error::{DirectoryError, DirectoryResult};

/// Directory entries are small; 64KB leaves room for long alias lists
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Gossip topic for a directory topic name
pub fn topic_id(topic: &str) -> TopicId {
    TopicId::from_bytes(*blake3::hash(topic.as_bytes()).as_bytes())
}

/// Production [`PubSubClient`] on an iroh endpoint with gossip
pub struct GossipPubSub {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    /// Static discovery provider for out-of-band peer addresses
    static_provider: StaticProvider,
    bootstrap: Vec<EndpointId>,
    senders: Mutex<HashMap<TopicId, Arc<Mutex<GossipSender>>>>,
}

impl GossipPubSub {
    /// Bind an endpoint and spawn the gossip protocol
    ///
    /// `bootstrap` peers are contacted when a topic is first subscribed.
    /// Pass a persistent `secret_key` to keep the same endpoint id across
    /// restarts.
    pub async fn bind(
        secret_key: Option<SecretKey>,
        bootstrap: Vec<EndpointId>,
    ) -> DirectoryResult<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| DirectoryError::PeerResolution(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();
        info!(bootstrap = bootstrap.len(), "Gossip router spawned");

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            bootstrap,
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// This node's endpoint id, for use as someone else's bootstrap peer
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// This node's full address
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Make a peer's address known without relying on discovery
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        info!(peer = %endpoint_addr.id, "Adding peer address to static discovery");
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    /// Stop the router and close the endpoint
    pub async fn shutdown(&self) {
        info!("Shutting down gossip transport");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
    }
}

impl PubSubClient for GossipPubSub {
    fn publish(&self, topic: &str, message: Vec<u8>) -> BoxFuture<'_, DirectoryResult<()>> {
        let topic_id = topic_id(topic);
        Box::pin(async move {
            let sender = self.senders.lock().await.get(&topic_id).cloned().ok_or_else(|| {
                DirectoryError::PeerResolution(format!("not subscribed to topic {topic_id:?}"))
            })?;

            debug!(topic = ?topic_id, len = message.len(), "Broadcasting entry");
            let result = sender
                .lock()
                .await
                .broadcast(message.into())
                .await
                .map_err(|e| DirectoryError::PeerResolution(format!("Failed to broadcast: {}", e)));
            result
        })
    }

    fn subscribe(&self, topic: &str) -> BoxFuture<'_, DirectoryResult<BoxStream<'static, Vec<u8>>>> {
        let topic_id = topic_id(topic);
        Box::pin(async move {
            info!(?topic_id, peers = self.bootstrap.len(), "Subscribing to topic");
            let gossip_topic = self
                .gossip
                .subscribe(topic_id, self.bootstrap.clone())
                .await
                .map_err(|e| DirectoryError::PeerResolution(format!("Failed to subscribe: {}", e)))?;

            let (sender, receiver) = gossip_topic.split();
            self.senders
                .lock()
                .await
                .insert(topic_id, Arc::new(Mutex::new(sender)));

            let messages: BoxStream<'static, Vec<u8>> =
                Box::pin(futures::stream::unfold(receiver, move |receiver| {
                    next_message(receiver, topic_id)
                }));
            Ok(messages)
        })
    }
}

/// Next payload from the topic, skipping membership events
async fn next_message(
    mut receiver: GossipReceiver,
    topic_id: TopicId,
) -> Option<(Vec<u8>, GossipReceiver)> {
    use iroh_gossip::api::Event;
    use n0_future::StreamExt;

    loop {
        match receiver.try_next().await {
            Ok(Some(event)) => match event {
                Event::Received(msg) => {
                    debug!(topic = ?topic_id, from = ?msg.delivered_from, "Received message");
                    return Some((msg.content.to_vec(), receiver));
                }
                Event::NeighborUp(peer) => {
                    info!(topic = ?topic_id, ?peer, "Neighbor joined");
                }
                Event::NeighborDown(peer) => {
                    info!(topic = ?topic_id, ?peer, "Neighbor left");
                }
                Event::Lagged => {
                    warn!(topic = ?topic_id, "Lagged behind on topic");
                }
            },
            Ok(None) => {
                debug!(topic = ?topic_id, "Topic subscription closed");
                return None;
            }
            Err(e) => {
                warn!(topic = ?topic_id, error = ?e, "Error receiving from topic");
                return None;
            }
        }
    }
}
