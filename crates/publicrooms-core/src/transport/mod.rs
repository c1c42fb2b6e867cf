//! Network boundary of the directory
//!
//! The adapters talk to peers only through [`DhtClient`] and
//! [`PubSubClient`]. In-memory implementations back the tests and
//! single-host simulations; [`GossipPubSub`] runs the pubsub boundary over
//! iroh-gossip.

pub mod dht;
pub mod gossip;
pub mod pubsub;

pub use dht::{DhtClient, DhtKey, MemoryDht};
pub use gossip::GossipPubSub;
pub use pubsub::{MemoryPubSub, PubSubClient};
