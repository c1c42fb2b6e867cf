//! Room Record Store backed by redb
//!
//! ## Storage Design
//!
//! - **Primary table**: `public_rooms` - keyed by room id, value is a
//!   postcard-encoded [`RoomRecord`]
//! - **Listing index**: `public_rooms_listing` - one key per *visible* room,
//!   `(u64::MAX - joined_members, room_id)`, so a forward scan yields the
//!   directory order without sorting
//!
//! Every mutation is a single read-modify-write transaction. redb admits one
//! writer at a time, which linearizes concurrent updates to the same room.
//! Reads run in their own read transaction and see one consistent snapshot.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition};
use tracing::{debug, info, warn};

use crate::config::DataSource;
use crate::error::{DirectoryError, DirectoryResult};
use crate::query::{Page, RoomFilter};
use crate::types::{PublicRoom, RoomId, RoomRecord, RoomSource};

/// Table for room rows (key: room id, value: postcard RoomRecord)
const ROOMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("public_rooms");

/// Index of visible rooms in directory order (key: inverted member count, room id)
const LISTING_INDEX: TableDefinition<(u64, &str), ()> =
    TableDefinition::new("public_rooms_listing");

/// Result of a read-modify-write on one room
#[derive(Debug, Clone)]
pub struct RecordUpdate<T> {
    /// Whatever the mutation closure returned
    pub outcome: T,
    /// Row before the mutation; `None` if the room was unknown
    pub before: Option<RoomRecord>,
    /// Row after the mutation
    pub after: RoomRecord,
}

impl<T> RecordUpdate<T> {
    /// True if the row was written
    ///
    /// An unknown room left untouched by the closure is not created.
    pub fn changed(&self) -> bool {
        match &self.before {
            Some(before) => before != &self.after,
            None => self.after != RoomRecord::new(self.after.room.room_id.clone()),
        }
    }

    /// Visibility before the mutation (unknown rooms count as hidden)
    pub fn was_visible(&self) -> bool {
        self.before.as_ref().is_some_and(|r| r.room.visible)
    }
}

/// Durable table of per-room visibility and summary fields
#[derive(Clone)]
pub struct RoomStore {
    db: Arc<RwLock<Database>>,
}

impl RoomStore {
    /// Open the store at the given location, creating tables as needed
    pub fn open(source: &DataSource) -> DirectoryResult<Self> {
        match source {
            DataSource::File(path) => Self::open_file(path),
            DataSource::Memory => Self::in_memory(),
        }
    }

    /// Open or create a redb file
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn open_file(path: impl AsRef<Path>) -> DirectoryResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)?;
        info!(path = %path.display(), "Opened room store");
        Self::init(db)
    }

    /// Create a store that lives only in memory
    pub fn in_memory() -> DirectoryResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        debug!("Opened in-memory room store");
        Self::init(db)
    }

    fn init(db: Database) -> DirectoryResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ROOMS_TABLE)?;
            let _ = write_txn.open_table(LISTING_INDEX)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Point reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the public projection of a room
    ///
    /// Returns `None` for unknown rooms; that is not an error.
    pub fn get(&self, room_id: &RoomId) -> DirectoryResult<Option<PublicRoom>> {
        Ok(self.record(room_id)?.map(|record| record.room))
    }

    /// Load the full stored row of a room
    pub fn record(&self, room_id: &RoomId) -> DirectoryResult<Option<RoomRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ROOMS_TABLE)?;

        match table.get(room_id.as_str())? {
            Some(v) => Ok(Some(decode_record(v.value())?)),
            None => Ok(None),
        }
    }

    /// All rows whose last applied write was local
    pub fn local_records(&self) -> DirectoryResult<Vec<RoomRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ROOMS_TABLE)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record = decode_record(value.value())?;
            if record.source == RoomSource::Local {
                records.push(record);
            }
        }
        Ok(records)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Read-modify-write one room inside a single transaction
    ///
    /// Unknown rooms start from a hidden, empty row. The row is written only
    /// if the closure changed it, so an unknown room the closure leaves
    /// untouched stays unknown. The room id is immutable and is restored
    /// if the closure touched it.
    pub fn update<T>(
        &self,
        room_id: &RoomId,
        f: impl FnOnce(&mut RoomRecord) -> T,
    ) -> DirectoryResult<RecordUpdate<T>> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let update = {
            let mut rooms = write_txn.open_table(ROOMS_TABLE)?;
            let mut index = write_txn.open_table(LISTING_INDEX)?;

            let before = match rooms.get(room_id.as_str())? {
                Some(v) => Some(decode_record(v.value())?),
                None => None,
            };
            let mut after = before
                .clone()
                .unwrap_or_else(|| RoomRecord::new(room_id.clone()));

            let outcome = f(&mut after);
            after.room.room_id = room_id.clone();
            after.room.num_joined_members = after.room.num_joined_members.max(0);

            let update = RecordUpdate {
                outcome,
                before,
                after,
            };
            if update.changed() {
                write_record(&mut rooms, &mut index, update.before.as_ref(), &update.after)?;
            }
            update
        };
        write_txn.commit()?;
        Ok(update)
    }

    /// Store a room snapshot
    ///
    /// Idempotent: upserting the same snapshot twice changes nothing the
    /// second time. Returns `true` if the row changed.
    pub fn upsert(&self, room: &PublicRoom) -> DirectoryResult<bool> {
        let update = self.update(&room.room_id, |record| {
            record.room = room.clone();
        })?;
        Ok(update.changed())
    }

    /// Set the visibility flag of a room, creating it if unknown
    ///
    /// Returns `true` if the flag changed.
    pub fn set_visibility(&self, room_id: &RoomId, visible: bool) -> DirectoryResult<bool> {
        let update = self.update(room_id, |record| {
            record.room.visible = visible;
        })?;
        Ok(update.was_visible() != update.after.room.visible)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Listing
    // ═══════════════════════════════════════════════════════════════════════

    /// Count visible rooms matching `filter`
    pub fn count(&self, filter: &RoomFilter) -> DirectoryResult<i64> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let index = read_txn.open_table(LISTING_INDEX)?;

        if filter.is_empty() {
            return Ok(index.len()? as i64);
        }

        let rooms = read_txn.open_table(ROOMS_TABLE)?;
        let mut count = 0i64;
        for entry in index.iter()? {
            let (key, _) = entry?;
            let (_, room_id) = key.value();
            if let Some(room) = load_listed(&rooms, room_id)? {
                if filter.matches(&room) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// List visible rooms matching `filter`, in directory order
    ///
    /// An offset past the end yields an empty sequence.
    pub fn list(&self, page: Page, filter: &RoomFilter) -> DirectoryResult<Vec<PublicRoom>> {
        if page.limit == 0 {
            return Ok(Vec::new());
        }

        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let index = read_txn.open_table(LISTING_INDEX)?;
        let rooms = read_txn.open_table(ROOMS_TABLE)?;

        let mut skipped = 0usize;
        let mut out = Vec::new();
        for entry in index.iter()? {
            let (key, _) = entry?;
            let (_, room_id) = key.value();
            let Some(room) = load_listed(&rooms, room_id)? else {
                continue;
            };
            if !filter.matches(&room) {
                continue;
            }
            if skipped < page.offset {
                skipped += 1;
                continue;
            }
            out.push(room);
            if out.len() >= page.limit {
                break;
            }
        }
        Ok(out)
    }
}

fn decode_record(bytes: &[u8]) -> DirectoryResult<RoomRecord> {
    postcard::from_bytes(bytes).map_err(|e| DirectoryError::Serialization(e.to_string()))
}

fn listing_key(room: &PublicRoom) -> (u64, &str) {
    let members = u64::try_from(room.num_joined_members).unwrap_or(0);
    (u64::MAX - members, room.room_id.as_str())
}

fn load_listed(
    rooms: &impl ReadableTable<&'static str, &'static [u8]>,
    room_id: &str,
) -> DirectoryResult<Option<PublicRoom>> {
    match rooms.get(room_id)? {
        Some(v) => Ok(Some(decode_record(v.value())?.room)),
        None => {
            warn!(room_id, "Listing index points at a missing room");
            Ok(None)
        }
    }
}

fn write_record(
    rooms: &mut Table<&'static str, &'static [u8]>,
    index: &mut Table<(u64, &'static str), ()>,
    before: Option<&RoomRecord>,
    after: &RoomRecord,
) -> DirectoryResult<()> {
    let data = postcard::to_allocvec(after)?;
    rooms.insert(after.room.room_id.as_str(), data.as_slice())?;

    if let Some(before) = before.filter(|b| b.room.visible) {
        index.remove(listing_key(&before.room))?;
    }
    if after.room.visible {
        index.insert(listing_key(&after.room), ())?;
    }
    Ok(())
}
