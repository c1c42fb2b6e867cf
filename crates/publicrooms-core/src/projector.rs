//! Event Projector: room events to idempotent store mutations
//!
//! Every write, local or peer-originated, goes through the same rule: it is
//! applied only if its [`StateMark`] is strictly newer than the room's
//! last-applied mark. Redelivery, out-of-order batches and gossip echoes all
//! collapse to no-ops under that rule, so delivery order across peers never
//! matters.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::DirectoryResult;
use crate::event::{GuestAccess, HistoryVisibility, RoomEvent, RoomEventContent};
use crate::storage::{RecordUpdate, RoomStore};
use crate::types::{PublicRoom, RoomId, RoomSource, StateMark};

/// A locally applied change that peers should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomChange {
    /// Room state after the change
    pub room: PublicRoom,
    /// Mark of the change
    pub mark: StateMark,
    /// True if `visible` flipped
    pub visibility_changed: bool,
}

/// Outcome of projecting one write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// Discarded: the mark was not newer than the room's last-applied mark
    Stale,
    /// Applied; carries the change to propagate, if any
    Applied(Option<RoomChange>),
}

impl Projection {
    /// True if the write was applied
    pub fn is_applied(&self) -> bool {
        matches!(self, Projection::Applied(_))
    }

    /// The change to hand to the distribution adapter
    pub fn into_change(self) -> Option<RoomChange> {
        match self {
            Projection::Applied(change) => change,
            Projection::Stale => None,
        }
    }
}

/// Translates room events into Room Record Store mutations
#[derive(Clone)]
pub struct EventProjector {
    store: RoomStore,
}

impl EventProjector {
    /// Create a projector writing into `store`
    pub fn new(store: RoomStore) -> Self {
        Self { store }
    }

    /// The store this projector writes into
    pub fn store(&self) -> &RoomStore {
        &self.store
    }

    /// Apply one event from the local event log
    pub fn apply_event(&self, event: &RoomEvent) -> DirectoryResult<Projection> {
        self.project(event, false)
    }

    /// Retract one event (it left the room's current state)
    pub fn retract_event(&self, event: &RoomEvent) -> DirectoryResult<Projection> {
        self.project(event, true)
    }

    /// Apply a batch: every retraction first, then every addition
    ///
    /// Within each set events are applied in token order. A room vacated and
    /// re-occupied in one batch therefore ends in the add-state whenever the
    /// add is newer. Returns one change per room that needs propagating.
    pub fn apply_events(
        &self,
        to_add: &[RoomEvent],
        to_remove: &[RoomEvent],
    ) -> DirectoryResult<Vec<RoomChange>> {
        let mut changes: BTreeMap<RoomId, RoomChange> = BTreeMap::new();

        for (events, retract) in [(to_remove, true), (to_add, false)] {
            let mut ordered: Vec<&RoomEvent> = events.iter().collect();
            ordered.sort_by_key(|event| event.token);

            for event in ordered {
                if let Some(change) = self.project(event, retract)?.into_change() {
                    let visibility_changed = change.visibility_changed
                        || changes
                            .get(&change.room.room_id)
                            .is_some_and(|prev| prev.visibility_changed);
                    changes.insert(
                        change.room.room_id.clone(),
                        RoomChange {
                            visibility_changed,
                            ..change
                        },
                    );
                }
            }
        }

        Ok(changes.into_values().collect())
    }

    /// Local directory write of the visibility flag
    ///
    /// The new mark sorts after everything already applied to the room but
    /// before the room's next event, so peers order it correctly and later
    /// events are never shadowed. Setting the current value is a no-op, and
    /// hiding an unknown room does not create it.
    pub fn set_visibility(
        &self,
        room_id: &RoomId,
        visible: bool,
    ) -> DirectoryResult<Option<RoomChange>> {
        let update = self.store.update(room_id, |record| {
            if record.room.visible == visible {
                return None;
            }
            let mark = StateMark::local_override(record.mark.as_ref());
            record.room.visible = visible;
            record.mark = Some(mark);
            record.source = RoomSource::Local;
            Some(mark)
        })?;

        let Some(mark) = update.outcome else {
            debug!(%room_id, visible, "Visibility already set");
            return Ok(None);
        };
        info!(
            %room_id,
            visible,
            token = %mark.token,
            seq = mark.override_seq,
            "Room visibility set"
        );
        Ok(change_of(&update, mark))
    }

    /// Apply a snapshot learned from a peer
    ///
    /// Same convergence rule as local events: newer mark wins, ties keep the
    /// existing state. Peer writes are never re-propagated.
    pub fn apply_peer_snapshot(
        &self,
        room: PublicRoom,
        mark: StateMark,
        origin: &str,
    ) -> DirectoryResult<Projection> {
        let room_id = room.room_id.clone();
        let update = self.store.update(&room_id, |record| {
            if !mark.supersedes(record.mark.as_ref()) {
                return false;
            }
            record.room = room;
            record.mark = Some(mark);
            record.source = RoomSource::Peer(origin.to_string());
            true
        })?;

        if !update.outcome {
            debug!(%room_id, origin, token = %mark.token, "Discarded stale peer snapshot");
            return Ok(Projection::Stale);
        }
        if update.was_visible() != update.after.room.visible {
            info!(
                %room_id,
                origin,
                visible = update.after.room.visible,
                "Peer changed room visibility"
            );
        }
        Ok(Projection::Applied(None))
    }

    fn project(&self, event: &RoomEvent, retract: bool) -> DirectoryResult<Projection> {
        let mark = if retract {
            StateMark::retracted(event.token)
        } else {
            StateMark::added(event.token)
        };

        let update = self.store.update(&event.room_id, |record| {
            if !mark.supersedes(record.mark.as_ref()) {
                return false;
            }
            apply_content(&mut record.room, &event.content, retract);
            record.mark = Some(mark);
            record.source = RoomSource::Local;
            true
        })?;

        if !update.outcome {
            debug!(
                room_id = %event.room_id,
                event_id = %event.event_id,
                token = %event.token,
                "Discarded stale event"
            );
            return Ok(Projection::Stale);
        }

        debug!(
            room_id = %event.room_id,
            event_id = %event.event_id,
            kind = event.content.kind(),
            token = %event.token,
            retract,
            "Applied event"
        );
        let change = change_of(&update, mark);
        if let Some(change) = change.as_ref().filter(|c| c.visibility_changed) {
            info!(
                room_id = %event.room_id,
                visible = change.room.visible,
                "Room visibility changed"
            );
        }
        Ok(Projection::Applied(change))
    }
}

/// Change to propagate: visibility flipped, or a visible room's summary moved
fn change_of<T>(update: &RecordUpdate<T>, mark: StateMark) -> Option<RoomChange> {
    let after = &update.after.room;
    let visibility_changed = update.was_visible() != after.visible;
    let summary_changed = update
        .before
        .as_ref()
        .map_or(true, |before| !before.room.same_summary(after));

    (visibility_changed || (after.visible && summary_changed)).then(|| RoomChange {
        room: after.clone(),
        mark,
        visibility_changed,
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

fn apply_content(room: &mut PublicRoom, content: &RoomEventContent, retract: bool) {
    match content {
        RoomEventContent::Membership { .. } => {
            let delta = content.joined_delta();
            let delta = if retract { -delta } else { delta };
            room.num_joined_members = room.num_joined_members.saturating_add(delta).max(0);
        }
        RoomEventContent::Visibility { visible } => {
            room.visible = !retract && *visible;
        }
        RoomEventContent::Name { name } => {
            room.name = if retract { None } else { non_empty(name) };
        }
        RoomEventContent::Topic { topic } => {
            room.topic = if retract { None } else { non_empty(topic) };
        }
        RoomEventContent::Avatar { url } => {
            room.avatar_url = if retract { None } else { non_empty(url) };
        }
        RoomEventContent::CanonicalAlias { alias } => {
            room.canonical_alias = if retract { None } else { non_empty(alias) };
        }
        RoomEventContent::Aliases { aliases } => {
            let carried = aliases.iter().filter(|a| !a.is_empty()).cloned();
            if retract {
                for alias in carried {
                    room.aliases.remove(&alias);
                }
            } else {
                room.aliases = carried.collect();
            }
        }
        RoomEventContent::HistoryVisibility { visibility } => {
            room.world_readable = !retract && *visibility == HistoryVisibility::WorldReadable;
        }
        RoomEventContent::GuestAccess { access } => {
            room.guest_can_join = !retract && *access == GuestAccess::CanJoin;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Membership;
    use crate::types::OrderingToken;

    fn projector() -> EventProjector {
        EventProjector::new(RoomStore::in_memory().unwrap())
    }

    fn room() -> RoomId {
        RoomId::parse("!abc:example.org").unwrap()
    }

    fn stored(p: &EventProjector) -> PublicRoom {
        p.store().get(&room()).unwrap().unwrap()
    }

    #[test]
    fn test_first_event_creates_hidden_room() {
        let p = projector();
        p.apply_event(&RoomEvent::join(room(), 1, "@a:example.org"))
            .unwrap();

        let r = stored(&p);
        assert!(!r.visible);
        assert_eq!(r.num_joined_members, 1);
    }

    #[test]
    fn test_reapplying_same_event_is_stale() {
        let p = projector();
        let join = RoomEvent::join(room(), 1, "@a:example.org");

        assert!(p.apply_event(&join).unwrap().is_applied());
        let once = p.store().record(&room()).unwrap();
        assert_eq!(p.apply_event(&join).unwrap(), Projection::Stale);
        assert_eq!(p.store().record(&room()).unwrap(), once);
        assert_eq!(stored(&p).num_joined_members, 1);
    }

    #[test]
    fn test_older_event_is_discarded() {
        let p = projector();
        p.apply_event(&RoomEvent::name(room(), 5, "New")).unwrap();
        let result = p.apply_event(&RoomEvent::name(room(), 3, "Old")).unwrap();

        assert_eq!(result, Projection::Stale);
        assert_eq!(stored(&p).name.as_deref(), Some("New"));
    }

    #[test]
    fn test_visibility_transition_is_propagated() {
        let p = projector();
        let change = p
            .apply_event(&RoomEvent::visibility(room(), 1, true))
            .unwrap()
            .into_change()
            .unwrap();

        assert!(change.visibility_changed);
        assert!(change.room.visible);
        assert_eq!(change.mark, StateMark::added(OrderingToken(1)));
    }

    #[test]
    fn test_hidden_summary_change_is_not_propagated() {
        let p = projector();
        let projection = p.apply_event(&RoomEvent::name(room(), 1, "Quiet")).unwrap();
        assert_eq!(projection, Projection::Applied(None));
    }

    #[test]
    fn test_visible_summary_change_is_propagated() {
        let p = projector();
        p.apply_event(&RoomEvent::visibility(room(), 1, true)).unwrap();
        let change = p
            .apply_event(&RoomEvent::topic(room(), 2, "Now with topic"))
            .unwrap()
            .into_change()
            .unwrap();

        assert!(!change.visibility_changed);
        assert_eq!(change.room.topic.as_deref(), Some("Now with topic"));
    }

    #[test]
    fn test_retraction_reverts_fields() {
        let p = projector();
        let name = RoomEvent::name(room(), 1, "Named");
        let join = RoomEvent::join(room(), 2, "@a:example.org");
        p.apply_event(&name).unwrap();
        p.apply_event(&join).unwrap();

        assert!(p.retract_event(&join).unwrap().is_applied());
        assert_eq!(stored(&p).num_joined_members, 0);

        // Retracting at an older token than the last applied mark is stale
        assert_eq!(p.retract_event(&name).unwrap(), Projection::Stale);
        // Retracting the same event twice is stale
        assert_eq!(p.retract_event(&join).unwrap(), Projection::Stale);
    }

    #[test]
    fn test_member_count_never_negative() {
        let p = projector();
        p.apply_event(&RoomEvent::leave(room(), 1, "@ghost:example.org"))
            .unwrap();
        assert_eq!(stored(&p).num_joined_members, 0);
    }

    #[test]
    fn test_batch_removes_before_adds() {
        let p = projector();
        p.apply_event(&RoomEvent::visibility(room(), 1, true)).unwrap();

        let remove = RoomEvent::visibility(room(), 2, true);
        let add = RoomEvent::visibility(room(), 3, true);
        // Positions in the arguments don't matter; removes always go first
        p.apply_events(&[add], &[remove]).unwrap();

        assert!(stored(&p).visible);
    }

    #[test]
    fn test_batch_newer_remove_wins() {
        let p = projector();
        let remove = RoomEvent::visibility(room(), 6, true);
        let add = RoomEvent::visibility(room(), 5, true);

        p.apply_events(&[add], &[remove]).unwrap();
        assert!(!stored(&p).visible);
    }

    #[test]
    fn test_batch_applies_each_set_in_token_order() {
        let p = projector();
        let adds = vec![
            RoomEvent::join(room(), 3, "@c:example.org"),
            RoomEvent::join(room(), 1, "@a:example.org"),
            RoomEvent::join(room(), 2, "@b:example.org"),
        ];
        p.apply_events(&adds, &[]).unwrap();
        assert_eq!(stored(&p).num_joined_members, 3);
    }

    #[test]
    fn test_batch_reports_one_change_per_room() {
        let p = projector();
        let adds = vec![
            RoomEvent::visibility(room(), 1, true),
            RoomEvent::name(room(), 2, "Busy"),
        ];
        let changes = p.apply_events(&adds, &[]).unwrap();

        assert_eq!(changes.len(), 1);
        assert!(changes[0].visibility_changed);
        assert_eq!(changes[0].room.name.as_deref(), Some("Busy"));
    }

    #[test]
    fn test_set_visibility_overrides_within_token() {
        let p = projector();
        p.apply_event(&RoomEvent::join(room(), 7, "@a:example.org"))
            .unwrap();

        let change = p.set_visibility(&room(), true).unwrap().unwrap();
        assert_eq!(change.mark.token, OrderingToken(7));
        assert_eq!(change.mark.override_seq, 1);
        assert!(p.set_visibility(&room(), true).unwrap().is_none());

        let hidden = p.set_visibility(&room(), false).unwrap().unwrap();
        assert!(hidden.mark > change.mark);
    }

    #[test]
    fn test_event_after_set_visibility_applies() {
        let p = projector();
        p.apply_event(&RoomEvent::join(room(), 5, "@a:example.org"))
            .unwrap();
        p.set_visibility(&room(), true).unwrap();

        let next = p
            .apply_event(&RoomEvent::join(room(), 6, "@b:example.org"))
            .unwrap();
        assert!(next.is_applied());
        let r = stored(&p);
        assert_eq!(r.num_joined_members, 2);
        assert!(r.visible);

        // Replay of the event the override sits on stays stale
        let replay = p
            .apply_event(&RoomEvent::join(room(), 5, "@a:example.org"))
            .unwrap();
        assert_eq!(replay, Projection::Stale);
    }

    #[test]
    fn test_hiding_unknown_room_does_not_create_it() {
        let p = projector();
        assert!(p.set_visibility(&room(), false).unwrap().is_none());
        assert!(p.store().get(&room()).unwrap().is_none());
    }

    #[test]
    fn test_peer_snapshot_uses_same_rule() {
        let p = projector();
        p.apply_event(&RoomEvent::name(room(), 4, "Local")).unwrap();

        let mut snapshot = PublicRoom::new(room());
        snapshot.visible = true;
        snapshot.name = Some("Peer".to_string());

        let tie = p
            .apply_peer_snapshot(snapshot.clone(), StateMark::added(OrderingToken(4)), "peer.org")
            .unwrap();
        assert_eq!(tie, Projection::Stale);
        assert_eq!(stored(&p).name.as_deref(), Some("Local"));

        let newer = p
            .apply_peer_snapshot(snapshot, StateMark::added(OrderingToken(5)), "peer.org")
            .unwrap();
        assert!(newer.is_applied());
        let record = p.store().record(&room()).unwrap().unwrap();
        assert_eq!(record.room.name.as_deref(), Some("Peer"));
        assert_eq!(record.source, RoomSource::Peer("peer.org".to_string()));
    }

    fn aliases(token: u64, names: &[&str]) -> RoomEvent {
        RoomEvent::new(
            room(),
            token,
            RoomEventContent::Aliases {
                aliases: names.iter().map(|n| n.to_string()).collect(),
            },
        )
    }

    #[test]
    fn test_aliases_event_replaces_set() {
        let p = projector();
        p.apply_event(&aliases(1, &["#old:example.org", "#keep:example.org"]))
            .unwrap();
        p.apply_event(&aliases(2, &["#keep:example.org", "#new:example.org"]))
            .unwrap();

        let listed: Vec<_> = stored(&p).aliases.into_iter().collect();
        assert_eq!(listed, ["#keep:example.org", "#new:example.org"]);
    }

    #[test]
    fn test_retracting_latest_aliases_removes_them() {
        let p = projector();
        let event = aliases(3, &["#gone:example.org"]);
        p.apply_event(&event).unwrap();
        assert!(p.retract_event(&event).unwrap().is_applied());
        assert!(stored(&p).aliases.is_empty());
    }

    #[test]
    fn test_history_and_guest_flags() {
        let p = projector();
        p.apply_event(&RoomEvent::new(
            room(),
            1,
            RoomEventContent::HistoryVisibility {
                visibility: HistoryVisibility::WorldReadable,
            },
        ))
        .unwrap();
        p.apply_event(&RoomEvent::new(
            room(),
            2,
            RoomEventContent::GuestAccess {
                access: GuestAccess::CanJoin,
            },
        ))
        .unwrap();
        p.apply_event(&RoomEvent::new(
            room(),
            3,
            RoomEventContent::Membership {
                user_id: "@a:example.org".to_string(),
                membership: Membership::Invite,
                prev_membership: None,
            },
        ))
        .unwrap();

        let r = stored(&p);
        assert!(r.world_readable);
        assert!(r.guest_can_join);
        assert_eq!(r.num_joined_members, 0);
    }
}
