//! Public Rooms Directory Core Library
//!
//! A federated directory of publicly listed chat rooms with pluggable
//! distribution.
//!
//! ## Overview
//!
//! Each server keeps an authoritative local table of room visibility and
//! summary fields, built from its own room event log. Changes can be shared
//! with other servers through a DHT or a gossip topic, and every write,
//! local or peer-originated, converges under one rule: the newer per-room
//! ordering mark wins and ties keep the existing state.
//!
//! ## Components
//!
//! - **Room Record Store** ([`storage`]): redb tables of rooms plus a listing
//!   index in directory order
//! - **Event Projector** ([`projector`]): idempotent event application
//! - **Directory Query Engine** ([`query`]): filter, ordering, pagination
//! - **Distribution Adapters** ([`distribution`]): Local, DHT and Pubsub
//! - **Database Façade** ([`database`]): one contract over all of the above
//!
//! ## Quick Start
//!
//! ```ignore
//! use publicrooms_core::{Database, RoomEvent, RoomId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::in_memory().await?;
//!     let room_id = RoomId::parse("!abc:example.org")?;
//!
//!     db.update_room_from_event(&RoomEvent::join(room_id.clone(), 1, "@alice:example.org")).await?;
//!     db.update_room_from_event(&RoomEvent::visibility(room_id.clone(), 2, true)).await?;
//!
//!     for room in db.get_public_rooms(0, 10, "").await? {
//!         println!("{} ({} members)", room.room_id, room.num_joined_members);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod distribution;
pub mod error;
pub mod event;
pub mod projector;
pub mod query;
pub mod storage;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{DataSource, DirectoryConfig, DistributionMode, DEFAULT_TOPIC};
pub use database::{Database, DistributionHandles};
pub use distribution::{DirectoryEntry, DistributionAdapter, StatsSnapshot, WireEntry};
pub use error::{DirectoryError, DirectoryResult};
pub use event::{GuestAccess, HistoryVisibility, Membership, RoomEvent, RoomEventContent};
pub use projector::{EventProjector, Projection, RoomChange};
pub use query::{Page, RoomFilter};
pub use storage::RoomStore;
pub use transport::{DhtClient, DhtKey, GossipPubSub, MemoryDht, MemoryPubSub, PubSubClient};
pub use types::{OrderingToken, PublicRoom, RoomId, RoomRecord, RoomSource, StateMark};
