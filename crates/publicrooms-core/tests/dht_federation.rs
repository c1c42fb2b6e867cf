//! DHT federation tests
//!
//! Two servers share an in-process DHT. The publishing server puts its
//! visible rooms; the reading server resolves the peer room ids it knows
//! about and merges them into its listing. Faults are injected on single
//! keys to check that unresolvable peers are omitted, not reported.

use std::sync::Arc;
use std::time::Duration;

use publicrooms_core::{
    Database, DhtClient, DhtKey, DirectoryConfig, DistributionHandles, DistributionMode,
    MemoryDht, RoomEvent, RoomId,
};
use tokio::time::sleep;

fn room(s: &str) -> RoomId {
    RoomId::parse(s).unwrap()
}

async fn node(dht: &MemoryDht, config: DirectoryConfig) -> Database {
    Database::open(
        config.with_mode(DistributionMode::Dht),
        DistributionHandles::none().with_dht(Arc::new(dht.clone())),
    )
    .await
    .unwrap()
}

async fn publisher(dht: &MemoryDht) -> Database {
    node(dht, DirectoryConfig::in_memory().with_server_name("peer.org")).await
}

async fn publish(db: &Database, id: &RoomId, name: &str, members: u64) {
    let mut adds = vec![RoomEvent::name(id.clone(), 1, name)];
    for n in 0..members {
        adds.push(RoomEvent::join(id.clone(), 2 + n, format!("@u{n}:peer.org")));
    }
    db.update_room_from_events(&adds, &[]).await.unwrap();
    db.set_room_visibility(true, id).await.unwrap();
}

/// Wait until the DHT holds a value for `id` with the expected visibility
async fn wait_published(dht: &MemoryDht, id: &RoomId, visible: bool) {
    for _ in 0..200 {
        if let Ok(Some(bytes)) = dht.get(DhtKey::for_room(id)).await {
            let wire = publicrooms_core::WireEntry::decode(&bytes).unwrap();
            if wire.entry().visible == visible {
                return;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("{id} was never published with visible={visible}");
}

// ============================================================================
// Publishing
// ============================================================================

/// Visible rooms are put under their room key; unpublishing writes a tombstone
#[tokio::test]
async fn test_publish_and_tombstone() {
    let dht = MemoryDht::new();
    let peer = publisher(&dht).await;
    let id = room("!lobby:peer.org");

    publish(&peer, &id, "Lobby", 2).await;
    wait_published(&dht, &id, true).await;

    peer.set_room_visibility(false, &id).await.unwrap();
    wait_published(&dht, &id, false).await;
    assert_eq!(dht.len(), 1);
}

// ============================================================================
// Federated Reads
// ============================================================================

/// Known peer rooms are merged into the local listing in directory order
#[tokio::test]
async fn test_reads_merge_peer_rooms() {
    let dht = MemoryDht::new();
    let peer = publisher(&dht).await;
    let lobby = room("!lobby:peer.org");
    publish(&peer, &lobby, "Lobby", 3).await;
    wait_published(&dht, &lobby, true).await;

    let local = node(
        &dht,
        DirectoryConfig::in_memory()
            .with_server_name("home.org")
            .with_peer_rooms([lobby.clone()]),
    )
    .await;
    let mine = room("!mine:home.org");
    local
        .update_room_from_events(
            &[
                RoomEvent::visibility(mine.clone(), 1, true),
                RoomEvent::join(mine.clone(), 2, "@me:home.org"),
            ],
            &[],
        )
        .await
        .unwrap();

    let listed = local.get_public_rooms(0, 10, "").await.unwrap();
    let ids: Vec<_> = listed.iter().map(|r| r.room_id.as_str()).collect();
    assert_eq!(ids, ["!lobby:peer.org", "!mine:home.org"]);
    assert_eq!(local.count_public_rooms().await.unwrap(), 2);

    // Filter applies to peer rows too
    assert_eq!(local.count_public_rooms_matching("lobby").await.unwrap(), 1);
    let page = local.get_public_rooms(1, 1, "").await.unwrap();
    assert_eq!(page[0].room_id, mine);
}

/// A peer room unpublished later drops out of federated reads
#[tokio::test]
async fn test_tombstoned_peer_room_is_dropped() {
    let dht = MemoryDht::new();
    let peer = publisher(&dht).await;
    let lobby = room("!lobby:peer.org");
    publish(&peer, &lobby, "Lobby", 1).await;
    wait_published(&dht, &lobby, true).await;

    let local = node(&dht, DirectoryConfig::in_memory().with_server_name("home.org")).await;
    local.learn_peer_rooms([lobby.clone()]);
    assert_eq!(local.count_public_rooms().await.unwrap(), 1);

    peer.set_room_visibility(false, &lobby).await.unwrap();
    wait_published(&dht, &lobby, false).await;
    assert_eq!(local.count_public_rooms().await.unwrap(), 0);
    assert!(local.get_public_rooms(0, 10, "").await.unwrap().is_empty());
}

/// A room known locally is never overridden by its DHT entry
#[tokio::test]
async fn test_local_rooms_take_precedence() {
    let dht = MemoryDht::new();
    let peer = publisher(&dht).await;
    let shared = room("!shared:peer.org");
    publish(&peer, &shared, "Peer copy", 9).await;
    wait_published(&dht, &shared, true).await;

    let local = node(
        &dht,
        DirectoryConfig::in_memory()
            .with_server_name("home.org")
            .with_peer_rooms([shared.clone()]),
    )
    .await;
    // Known locally but hidden: stays hidden
    local
        .update_room_from_event(&RoomEvent::name(shared.clone(), 1, "Local copy"))
        .await
        .unwrap();

    assert_eq!(local.count_public_rooms().await.unwrap(), 0);
    assert!(local.get_public_rooms(0, 10, "").await.unwrap().is_empty());
}

/// With federation disabled reads stay local
#[tokio::test]
async fn test_federation_can_be_disabled() {
    let dht = MemoryDht::new();
    let peer = publisher(&dht).await;
    let lobby = room("!lobby:peer.org");
    publish(&peer, &lobby, "Lobby", 1).await;
    wait_published(&dht, &lobby, true).await;

    let local = node(
        &dht,
        DirectoryConfig::in_memory()
            .with_server_name("home.org")
            .with_federation(false)
            .with_peer_rooms([lobby]),
    )
    .await;
    assert_eq!(local.count_public_rooms().await.unwrap(), 0);
}

// ============================================================================
// Omission on Failure
// ============================================================================

/// An unreachable peer entry is omitted; local rooms and other peers remain
#[tokio::test]
async fn test_unreachable_peer_is_omitted() {
    let dht = MemoryDht::new();
    let peer = publisher(&dht).await;
    let good = room("!good:peer.org");
    let bad = room("!bad:peer.org");
    publish(&peer, &good, "Good", 1).await;
    publish(&peer, &bad, "Bad", 1).await;
    wait_published(&dht, &good, true).await;
    wait_published(&dht, &bad, true).await;

    let local = node(
        &dht,
        DirectoryConfig::in_memory()
            .with_server_name("home.org")
            .with_peer_rooms([good.clone(), bad.clone()]),
    )
    .await;
    let mine = room("!mine:home.org");
    local.set_room_visibility(true, &mine).await.unwrap();

    dht.fail_key(DhtKey::for_room(&bad));

    let listed = local.get_public_rooms(0, 10, "").await.unwrap();
    let mut ids: Vec<_> = listed.iter().map(|r| r.room_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, ["!good:peer.org", "!mine:home.org"]);
    assert!(local.adapter_stats().lookup_failures >= 1);
}

/// A slow DHT degrades to local-only results within the lookup timeout
#[tokio::test]
async fn test_slow_dht_is_bounded() {
    let dht = MemoryDht::new();
    let peer = publisher(&dht).await;
    let lobby = room("!lobby:peer.org");
    publish(&peer, &lobby, "Lobby", 1).await;
    wait_published(&dht, &lobby, true).await;

    let local = node(
        &dht,
        DirectoryConfig::in_memory()
            .with_server_name("home.org")
            .with_lookup_timeout(Duration::from_millis(50))
            .with_peer_rooms([lobby]),
    )
    .await;
    let mine = room("!mine:home.org");
    local.set_room_visibility(true, &mine).await.unwrap();

    dht.set_get_delay(Some(Duration::from_secs(10)));
    let listed = tokio::time::timeout(Duration::from_secs(2), local.get_public_rooms(0, 10, ""))
        .await
        .expect("read blocked on the DHT")
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].room_id, mine);
}

/// Local writes succeed even when every publish fails
#[tokio::test]
async fn test_failed_publish_does_not_fail_local_write() {
    let dht = MemoryDht::new();
    let local = node(&dht, DirectoryConfig::in_memory().with_server_name("home.org")).await;
    let mine = room("!mine:home.org");
    dht.fail_key(DhtKey::for_room(&mine));

    local.set_room_visibility(true, &mine).await.unwrap();
    assert!(local.get_room_visibility(&mine).await.unwrap());

    for _ in 0..200 {
        if local.adapter_stats().publish_failures == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(local.adapter_stats().publish_failures, 1);
    assert!(dht.is_empty());
}
