//! Directory query semantics: filtering, ordering and offset pagination
//!
//! Ordering is `num_joined_members` descending, then `room_id` ascending.
//! The filter is applied before pagination, so for a given filter value
//! `count` and an exhaustive walk of `list` always agree over one snapshot.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::types::{PublicRoom, RoomId};

/// Case-insensitive substring filter over name, topic and aliases
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFilter {
    needle: Option<String>,
}

impl RoomFilter {
    /// Filter from a user-supplied search term; blank matches everything
    pub fn new(term: &str) -> Self {
        let term = term.trim();
        Self {
            needle: (!term.is_empty()).then(|| term.to_lowercase()),
        }
    }

    /// Filter that matches every room
    pub fn all() -> Self {
        Self::default()
    }

    /// True if the filter matches every room
    pub fn is_empty(&self) -> bool {
        self.needle.is_none()
    }

    /// Does `room` match?
    pub fn matches(&self, room: &PublicRoom) -> bool {
        let Some(needle) = &self.needle else {
            return true;
        };
        let hit = |s: &str| s.to_lowercase().contains(needle.as_str());

        room.name.as_deref().is_some_and(hit)
            || room.topic.as_deref().is_some_and(hit)
            || room.canonical_alias.as_deref().is_some_and(hit)
            || room.aliases.iter().any(|alias| hit(alias.as_str()))
    }
}

/// Zero-based offset window into the directory ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Rows to skip
    pub offset: usize,
    /// Maximum rows to return
    pub limit: usize,
}

impl Page {
    /// Window from the façade's signed inputs
    ///
    /// Negative offsets start at zero; a non-positive limit yields an empty page.
    pub fn new(offset: i64, limit: i16) -> Self {
        Self {
            offset: usize::try_from(offset.max(0)).unwrap_or(usize::MAX),
            limit: usize::try_from(limit.max(0)).unwrap_or(0),
        }
    }

    /// Window covering every row
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }

    /// Rows needed from the head of the ordering to serve this page
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.limit)
    }

    /// Apply the window to an already ordered sequence
    pub fn slice<T>(&self, rows: Vec<T>) -> Vec<T> {
        rows.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

/// Directory ordering: members descending, then room id ascending
pub fn directory_order(a: &PublicRoom, b: &PublicRoom) -> Ordering {
    b.num_joined_members
        .cmp(&a.num_joined_members)
        .then_with(|| a.room_id.cmp(&b.room_id))
}

/// Sort rows into directory order
pub fn sort_rooms(rooms: &mut [PublicRoom]) {
    rooms.sort_by(directory_order);
}

/// Merge local rows with peer-sourced rows
///
/// Rows are de-duplicated by room id with local rows winning. Peer rows
/// that are hidden or fail the filter are dropped. The result is in
/// directory order and not yet paginated.
pub fn merge_rooms(
    local: Vec<PublicRoom>,
    peers: impl IntoIterator<Item = PublicRoom>,
    filter: &RoomFilter,
) -> Vec<PublicRoom> {
    let mut by_id: BTreeMap<RoomId, PublicRoom> = BTreeMap::new();
    for room in peers {
        if room.visible && filter.matches(&room) {
            by_id.insert(room.room_id.clone(), room);
        }
    }
    for room in local {
        by_id.insert(room.room_id.clone(), room);
    }

    let mut merged: Vec<PublicRoom> = by_id.into_values().collect();
    sort_rooms(&mut merged);
    merged
}
