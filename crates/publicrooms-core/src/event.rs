//! Room state events consumed from the local event log
//!
//! Only the fields the directory projects are modelled. Validation and
//! signing of federation events happen upstream; by the time an event
//! reaches the projector it is trusted.

use serde::{Deserialize, Serialize};

use crate::types::{OrderingToken, RoomId};

/// Membership state of a user in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    /// Joined
    Join,
    /// Left or kicked
    Leave,
    /// Invited
    Invite,
    /// Banned
    Ban,
    /// Knocking
    Knock,
}

impl Membership {
    fn joined(membership: Option<Membership>) -> i64 {
        i64::from(membership == Some(Membership::Join))
    }
}

/// History visibility setting of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryVisibility {
    /// Anyone can read history
    WorldReadable,
    /// Members since the event was sent
    Shared,
    /// Members since invite
    Invited,
    /// Members since join
    Joined,
}

/// Guest access setting of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestAccess {
    /// Guests may join
    CanJoin,
    /// Guests are refused
    Forbidden,
}

/// What a room event changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEventContent {
    /// Membership change of one user
    Membership {
        /// The user whose membership changed
        user_id: String,
        /// New membership
        membership: Membership,
        /// Membership before this event, if any
        #[serde(default)]
        prev_membership: Option<Membership>,
    },
    /// Directory visibility change
    Visibility {
        /// Whether the room is listed publicly
        visible: bool,
    },
    /// Room name
    Name {
        /// New name; empty or absent clears it
        #[serde(default)]
        name: Option<String>,
    },
    /// Room topic
    Topic {
        /// New topic; empty or absent clears it
        #[serde(default)]
        topic: Option<String>,
    },
    /// Aliases published for the room
    Aliases {
        /// The room's full alias set; replaces whatever was listed before
        aliases: Vec<String>,
    },
    /// Canonical alias
    CanonicalAlias {
        /// New canonical alias; absent clears it
        #[serde(default)]
        alias: Option<String>,
    },
    /// Room avatar
    Avatar {
        /// New avatar URL; absent clears it
        #[serde(default)]
        url: Option<String>,
    },
    /// History visibility
    HistoryVisibility {
        /// New setting
        visibility: HistoryVisibility,
    },
    /// Guest access
    GuestAccess {
        /// New setting
        access: GuestAccess,
    },
}

impl RoomEventContent {
    /// Change in joined members when this content is added to room state
    pub(crate) fn joined_delta(&self) -> i64 {
        match self {
            RoomEventContent::Membership {
                membership,
                prev_membership,
                ..
            } => Membership::joined(Some(*membership)) - Membership::joined(*prev_membership),
            _ => 0,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            RoomEventContent::Membership { .. } => "membership",
            RoomEventContent::Visibility { .. } => "visibility",
            RoomEventContent::Name { .. } => "name",
            RoomEventContent::Topic { .. } => "topic",
            RoomEventContent::Aliases { .. } => "aliases",
            RoomEventContent::CanonicalAlias { .. } => "canonical_alias",
            RoomEventContent::Avatar { .. } => "avatar",
            RoomEventContent::HistoryVisibility { .. } => "history_visibility",
            RoomEventContent::GuestAccess { .. } => "guest_access",
        }
    }
}

/// An ordered, append-only fact about a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEvent {
    /// Room the event belongs to
    pub room_id: RoomId,
    /// Event identifier, for logging
    #[serde(default)]
    pub event_id: String,
    /// Ordering token (event depth)
    pub token: OrderingToken,
    /// The state change
    pub content: RoomEventContent,
}

impl RoomEvent {
    /// Create an event
    pub fn new(room_id: RoomId, token: u64, content: RoomEventContent) -> Self {
        Self {
            event_id: format!("${}:{}", token, room_id.server_name()),
            room_id,
            token: OrderingToken(token),
            content,
        }
    }

    /// Join of `user_id` with no previous membership
    pub fn join(room_id: RoomId, token: u64, user_id: impl Into<String>) -> Self {
        Self::new(
            room_id,
            token,
            RoomEventContent::Membership {
                user_id: user_id.into(),
                membership: Membership::Join,
                prev_membership: None,
            },
        )
    }

    /// Leave of a previously joined `user_id`
    pub fn leave(room_id: RoomId, token: u64, user_id: impl Into<String>) -> Self {
        Self::new(
            room_id,
            token,
            RoomEventContent::Membership {
                user_id: user_id.into(),
                membership: Membership::Leave,
                prev_membership: Some(Membership::Join),
            },
        )
    }

    /// Directory visibility change
    pub fn visibility(room_id: RoomId, token: u64, visible: bool) -> Self {
        Self::new(room_id, token, RoomEventContent::Visibility { visible })
    }

    /// Room name change
    pub fn name(room_id: RoomId, token: u64, name: impl Into<String>) -> Self {
        Self::new(
            room_id,
            token,
            RoomEventContent::Name {
                name: Some(name.into()),
            },
        )
    }

    /// Room topic change
    pub fn topic(room_id: RoomId, token: u64, topic: impl Into<String>) -> Self {
        Self::new(
            room_id,
            token,
            RoomEventContent::Topic {
                topic: Some(topic.into()),
            },
        )
    }
}
