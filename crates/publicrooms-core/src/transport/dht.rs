//! DHT boundary: `put(key, value)` / `get(key)`

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::error::{DirectoryError, DirectoryResult};
use crate::types::RoomId;

/// Domain prefix mixed into every room key
const KEY_DOMAIN: &[u8] = b"publicrooms/v1/";

/// Deterministic DHT key of a room
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DhtKey([u8; 32]);

impl DhtKey {
    /// Key under which a room's entry is published
    pub fn for_room(room_id: &RoomId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(room_id.as_str().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtKey({})", &hex::encode(self.0)[..16])
    }
}

/// Client handle onto a distributed hash table
///
/// Values are opaque bytes. `put` supersedes any previous value; there is no
/// delete.
pub trait DhtClient: Send + Sync {
    /// Store `value` under `key`
    fn put(&self, key: DhtKey, value: Vec<u8>) -> BoxFuture<'_, DirectoryResult<()>>;

    /// Resolve `key`; `Ok(None)` if nothing is stored
    fn get(&self, key: DhtKey) -> BoxFuture<'_, DirectoryResult<Option<Vec<u8>>>>;
}

#[derive(Default)]
struct MemoryDhtInner {
    values: RwLock<HashMap<DhtKey, Vec<u8>>>,
    unreachable: RwLock<HashSet<DhtKey>>,
    get_delay: RwLock<Option<Duration>>,
}

/// In-process DHT shared by every clone of the handle
///
/// Supports fault injection: keys can be made unreachable and lookups
/// delayed.
#[derive(Clone, Default)]
pub struct MemoryDht {
    inner: Arc<MemoryDhtInner>,
}

impl MemoryDht {
    /// Create an empty DHT
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `key` fail
    pub fn fail_key(&self, key: DhtKey) {
        self.inner.unreachable.write().insert(key);
    }

    /// Undo [`fail_key`](Self::fail_key)
    pub fn heal_key(&self, key: DhtKey) {
        self.inner.unreachable.write().remove(&key);
    }

    /// Delay every `get` by `delay` (`None` to disable)
    pub fn set_get_delay(&self, delay: Option<Duration>) {
        *self.inner.get_delay.write() = delay;
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.inner.values.read().len()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_reachable(&self, key: &DhtKey) -> DirectoryResult<()> {
        if self.inner.unreachable.read().contains(key) {
            return Err(DirectoryError::PeerResolution(format!("key {key} unreachable")));
        }
        Ok(())
    }
}

impl DhtClient for MemoryDht {
    fn put(&self, key: DhtKey, value: Vec<u8>) -> BoxFuture<'_, DirectoryResult<()>> {
        Box::pin(async move {
            self.check_reachable(&key)?;
            self.inner.values.write().insert(key, value);
            Ok(())
        })
    }

    fn get(&self, key: DhtKey) -> BoxFuture<'_, DirectoryResult<Option<Vec<u8>>>> {
        Box::pin(async move {
            let delay = *self.inner.get_delay.read();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.check_reachable(&key)?;
            Ok(self.inner.values.read().get(&key).cloned())
        })
    }
}
