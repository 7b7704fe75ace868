// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync List Tests
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   End-to-end list behaviour of the sliding sync service over an in-memory
//   room store.
//
// =============================================================================

mod common;

use common::*;
use matrixon_sliding_proxy::{
    ruma::RoomId,
    service::sync::{RequestFilters, RequestList, RoomSubscription, SortKey},
    Request,
};

/// Test: a bumped room moves from the bottom of the window to the top
#[tokio::test]
async fn test_bump_moves_room_to_top() {
    let h = Harness::new();
    let rooms = h.create_rooms(&["r1", "r2", "r3", "r4"]).await;

    let res = h.sync(None, list_request(vec![[0, 3]])).await.unwrap();
    assert_eq!(res.lists["a"].count, 4);
    assert_eq!(
        res.list_ops("a"),
        &[sync_op(
            0,
            3,
            &[rooms[3].clone(), rooms[2].clone(), rooms[1].clone(), rooms[0].clone()]
        )]
    );
    assert_eq!(res.rooms.len(), 4);

    h.send_message(&rooms[0]).await;
    let res = h
        .sync(Some(&res.pos), list_request(vec![[0, 3]]))
        .await
        .unwrap();
    assert_eq!(res.list_ops("a"), &[delete_op(3), insert_op(0, &rooms[0])]);

    // only the bumped room has news, and it is incremental
    assert_eq!(res.rooms.len(), 1);
    let update = &res.rooms[&rooms[0]];
    assert_eq!(update.initial, None);
    assert_eq!(update.timeline.len(), 1);
    assert_eq!(update.timeline[0].event_type, "m.room.message");
}

/// Test: a room from outside the window enters at the top and pushes the
/// last row out
#[tokio::test]
async fn test_room_enters_window_from_outside() {
    let h = Harness::new();
    let rooms = h.create_rooms(&["a", "b", "c", "d", "e", "f"]).await;

    let res = h.sync(None, list_request(vec![[0, 2]])).await.unwrap();
    assert_eq!(
        res.list_ops("a"),
        &[sync_op(0, 2, &[rooms[5].clone(), rooms[4].clone(), rooms[3].clone()])]
    );

    h.send_message(&rooms[0]).await;
    let res = h
        .sync(Some(&res.pos), list_request(vec![[0, 2]]))
        .await
        .unwrap();
    assert_eq!(res.list_ops("a"), &[delete_op(2), insert_op(0, &rooms[0])]);
    assert!(res.rooms.contains_key(&rooms[0]));
}

/// Test: shrinking the window invalidates exactly the dropped rows
#[tokio::test]
async fn test_shrinking_window() {
    let h = Harness::new();
    let names: Vec<String> = (0..10).map(|i| format!("room{i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    h.create_rooms(&names).await;

    let res = h.sync(None, list_request(vec![[0, 20]])).await.unwrap();
    assert_eq!(res.lists["a"].count, 10);

    let res = h
        .sync(Some(&res.pos), list_request(vec![[2, 6]]))
        .await
        .unwrap();
    assert_eq!(res.list_ops("a"), &[invalidate_op(0, 1), invalidate_op(7, 9)]);
    assert!(res.rooms.is_empty());
}

/// Test: growing the window past the end of the list sends nothing
#[tokio::test]
async fn test_expanding_window_beyond_count() {
    let h = Harness::new();
    let names: Vec<String> = (0..10).map(|i| format!("room{i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    h.create_rooms(&names).await;

    let res = h.sync(None, list_request(vec![[0, 10]])).await.unwrap();
    let res = h
        .sync(Some(&res.pos), list_request(vec![[0, 20]]))
        .await
        .unwrap();

    assert_eq!(res.lists["a"].count, 10);
    assert!(res.list_ops("a").is_empty());
}

/// Test: changing the sort resyncs the window in the new order
#[tokio::test]
async fn test_sort_change_resyncs_window() {
    let h = Harness::new();
    // recency order is d, c, b, a
    let rooms = h.create_rooms(&["a", "b", "c", "d"]).await;

    let res = h.sync(None, list_request(vec![[0, 3]])).await.unwrap();
    let res = h
        .sync(
            Some(&res.pos),
            sorted_list_request(vec![[0, 3]], vec![SortKey::ByName]),
        )
        .await
        .unwrap();

    assert_eq!(
        res.list_ops("a"),
        &[invalidate_op(0, 3), sync_op(0, 3, &rooms)]
    );
    assert_eq!(h.service.get_metrics().list_fallbacks, 1);
}

/// Test: ranges beyond the room count are clamped, then resynced on sort change
#[tokio::test]
async fn test_ranges_outside_total_rooms() {
    let h = Harness::new();
    let rooms = h.create_rooms(&["a", "b", "c"]).await;

    let res = h
        .sync(None, list_request(vec![[0, 1], [8, 9]]))
        .await
        .unwrap();
    assert_eq!(res.lists["a"].count, 3);
    assert_eq!(
        res.list_ops("a"),
        &[sync_op(0, 1, &[rooms[2].clone(), rooms[1].clone()])]
    );

    let res = h
        .sync(
            Some(&res.pos),
            sorted_list_request(vec![[0, 1], [8, 9]], vec![SortKey::ByName]),
        )
        .await
        .unwrap();
    assert_eq!(
        res.list_ops("a"),
        &[invalidate_op(0, 1), sync_op(0, 1, &[rooms[0].clone(), rooms[1].clone()])]
    );
}

/// Test: identical lists move in lockstep through odd range changes
#[tokio::test]
async fn test_multiple_identical_lists() {
    let h = Harness::new();
    let names: Vec<String> = (0..10).map(|i| format!("room{i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let mut rooms = h.create_rooms(&names).await;
    rooms.reverse();

    let res = h
        .sync(None, lists_request(&[("a", vec![[0, 20]]), ("b", vec![[0, 20]])]))
        .await
        .unwrap();
    for list in ["a", "b"] {
        assert_eq!(res.list_ops(list), &[sync_op(0, 9, &rooms)]);
    }

    let res = h
        .sync(
            Some(&res.pos),
            lists_request(&[("a", vec![[2, 15]]), ("b", vec![[2, 15]])]),
        )
        .await
        .unwrap();
    for list in ["a", "b"] {
        assert_eq!(res.list_ops(list), &[invalidate_op(0, 1)]);
    }

    let res = h
        .sync(
            Some(&res.pos),
            lists_request(&[("a", vec![[0, 16]]), ("b", vec![[0, 16]])]),
        )
        .await
        .unwrap();
    for list in ["a", "b"] {
        assert_eq!(res.list_ops(list), &[sync_op(0, 1, &rooms[0..2])]);
    }

    let res = h
        .sync(
            Some(&res.pos),
            lists_request(&[("a", vec![[0, 20]]), ("b", vec![[0, 20]])]),
        )
        .await
        .unwrap();
    assert_eq!(res.total_ops(), 0);
}

/// Test: each list bumps only on its own event types
#[tokio::test]
async fn test_bump_event_types_per_list() {
    let h = Harness::new();
    let rooms = h.create_rooms(&["r1", "r2", "r3", "r4"]).await;

    let mut request = lists_request(&[("messages", vec![[0, 3]]), ("reactions", vec![[0, 3]])]);
    if let Some(list) = request.lists.get_mut("reactions") {
        list.bump_event_types = Some(vec!["m.reaction".to_string()]);
    }

    let res = h.sync(None, request.clone()).await.unwrap();
    assert_eq!(res.list_ops("messages").len(), 1);
    assert_eq!(res.list_ops("reactions").len(), 1);

    h.send(&rooms[0], "m.reaction").await;
    let res = h.sync(Some(&res.pos), request.clone()).await.unwrap();
    assert!(res.list_ops("messages").is_empty());
    assert_eq!(
        res.list_ops("reactions"),
        &[delete_op(3), insert_op(0, &rooms[0])]
    );

    h.send_message(&rooms[1]).await;
    let res = h.sync(Some(&res.pos), request).await.unwrap();
    // r2 sat at index 2 in the message-bumped list
    assert_eq!(
        res.list_ops("messages"),
        &[delete_op(2), insert_op(0, &rooms[1])]
    );
    assert!(res.list_ops("reactions").is_empty());
}

/// Test: events from before the user joined never bump the room
#[tokio::test]
async fn test_bump_ignores_events_before_membership() {
    let h = Harness::new();
    let a = h.create_room("a").await;
    let b = h.create_room("b").await;

    // A message with a far-future timestamp, sent before the user joined.
    let late = RoomId::parse("!late:localhost").unwrap();
    let ts = h.tick();
    h.store
        .append_event(&late, h.event("m.room.message", None, 1_000_000))
        .await;
    h.join_room(&late, "late", ts + 1).await;

    let res = h.sync(None, list_request(vec![[0, 2]])).await.unwrap();
    assert_eq!(
        res.list_ops("a"),
        &[sync_op(0, 2, &[late.clone(), b.clone(), a.clone()])]
    );
    // the pre-join message is not part of the timeline either
    assert!(res.rooms[&late]
        .timeline
        .iter()
        .all(|e| e.origin_server_ts != 1_000_000));

    h.send_message(&a).await;
    let res = h
        .sync(Some(&res.pos), list_request(vec![[0, 2]]))
        .await
        .unwrap();
    assert_eq!(res.list_ops("a"), &[delete_op(2), insert_op(0, &a)]);
}

/// Test: a room reached by several lists and a subscription gets the union
#[tokio::test]
async fn test_room_subscription_union() {
    let h = Harness::new();
    let room = h.create_room("shared").await;
    h.send_message(&room).await;
    h.send_message(&room).await;

    let mut request = Request {
        timeout: Some(0),
        ..Default::default()
    };
    request.lists.insert(
        "one".to_string(),
        RequestList {
            ranges: Some(vec![[0, 0]]),
            room_subscription: RoomSubscription {
                timeline_limit: Some(1),
                required_state: Some(vec![("m.room.member".to_string(), "*".to_string())]),
                include_heroes: None,
            },
            ..Default::default()
        },
    );
    request.lists.insert(
        "two".to_string(),
        RequestList {
            ranges: Some(vec![[0, 0]]),
            room_subscription: RoomSubscription {
                timeline_limit: Some(2),
                required_state: Some(vec![("m.room.name".to_string(), "".to_string())]),
                include_heroes: None,
            },
            ..Default::default()
        },
    );

    let res = h.sync(None, request).await.unwrap();
    let update = &res.rooms[&room];
    assert_eq!(update.initial, Some(true));
    assert_eq!(update.timeline.len(), 2);
    assert!(update.limited);
    assert_eq!(update.required_state.len(), 1);
    assert_eq!(update.required_state[0].event_type, "m.room.member");
    assert_eq!(update.name.as_deref(), Some("shared"));

    // a larger explicit subscription changes the effective one: a fresh payload
    let mut subscribe = Request {
        timeout: Some(0),
        ..Default::default()
    };
    subscribe.room_subscriptions.insert(
        room.clone(),
        RoomSubscription {
            timeline_limit: Some(3),
            ..Default::default()
        },
    );
    let res = h.sync(Some(&res.pos), subscribe).await.unwrap();
    let update = &res.rooms[&room];
    assert_eq!(update.initial, Some(true));
    assert_eq!(update.timeline.len(), 3);
}

/// Test: subscriptions to rooms the user cannot see are never reported
#[tokio::test]
async fn test_invisible_room_subscription_is_ignored() {
    let h = Harness::new();
    h.create_room("mine").await;

    let mut request = list_request(vec![[0, 0]]);
    request.room_subscriptions.insert(
        RoomId::parse("!secret:localhost").unwrap(),
        RoomSubscription::default(),
    );

    let res = h.sync(None, request).await.unwrap();
    assert_eq!(res.rooms.len(), 1);
    assert!(!res
        .rooms
        .contains_key(&RoomId::parse("!secret:localhost").unwrap()));
}

/// Test: slow_get_all_rooms tracks the whole list
#[tokio::test]
async fn test_slow_get_all_rooms() {
    let h = Harness::new();
    let rooms = h.create_rooms(&["a", "b", "c"]).await;

    let mut request = Request {
        timeout: Some(0),
        ..Default::default()
    };
    request.lists.insert(
        "all".to_string(),
        RequestList {
            slow_get_all_rooms: Some(true),
            sort: Some(vec![SortKey::ByName]),
            ..Default::default()
        },
    );

    let res = h.sync(None, request.clone()).await.unwrap();
    assert_eq!(res.list_ops("all"), &[sync_op(0, 2, &rooms)]);

    let d = h.create_room("d").await;
    let res = h.sync(Some(&res.pos), request).await.unwrap();
    assert_eq!(res.lists["all"].count, 4);
    assert_eq!(res.list_ops("all"), &[sync_op(3, 3, &[d])]);
}

/// Test: filters and the global encrypted-room exclusion shape the list
#[tokio::test]
async fn test_filters_and_encrypted_exclusion() {
    let h = Harness::new();
    let plain = h.create_room("plain").await;
    let secret = h.create_room("secret").await;
    h.store
        .update_room(&h.user, &secret, |r| r.is_encrypted = true)
        .await;

    let mut request = list_request(vec![[0, 9]]);
    if let Some(list) = request.lists.get_mut("a") {
        list.filters = Some(RequestFilters {
            is_encrypted: Some(true),
            ..Default::default()
        });
    }
    let res = h.sync(None, request).await.unwrap();
    assert_eq!(res.list_ops("a"), &[sync_op(0, 0, &[secret.clone()])]);

    let mut exclude = list_request(vec![[0, 9]]);
    exclude.exclude_encrypted_rooms = Some(true);
    if let Some(list) = exclude.lists.get_mut("a") {
        list.filters = Some(RequestFilters::default());
    }
    let res = h.sync(Some(&res.pos), exclude).await.unwrap();
    assert_eq!(res.lists["a"].count, 1);
    assert_eq!(
        res.list_ops("a"),
        &[delete_op(0), insert_op(0, &plain)]
    );
}

/// Test: the same request with the latest token produces no ops
#[tokio::test]
async fn test_repeated_request_is_idempotent() {
    let h = Harness::new();
    h.create_rooms(&["a", "b", "c"]).await;

    let request = lists_request(&[("a", vec![[0, 1]]), ("b", vec![[1, 5]])]);
    let mut res = h.sync(None, request.clone()).await.unwrap();
    for _ in 0..3 {
        res = h.sync(Some(&res.pos), request.clone()).await.unwrap();
        assert_eq!(res.total_ops(), 0);
        assert!(res.rooms.is_empty());
        assert_eq!(res.lists["b"].count, 3);
    }
}

/// Test: a room that leaves the list is removed from the window
#[tokio::test]
async fn test_room_removed_from_list() {
    let h = Harness::new();
    let rooms = h.create_rooms(&["a", "b", "c", "d"]).await;

    let res = h.sync(None, list_request(vec![[0, 1]])).await.unwrap();
    assert_eq!(
        res.list_ops("a"),
        &[sync_op(0, 1, &[rooms[3].clone(), rooms[2].clone()])]
    );

    // leaving the top room pulls the next one into the window
    h.store.remove_room(&h.user, &rooms[3]).await;
    let res = h
        .sync(Some(&res.pos), list_request(vec![[0, 1]]))
        .await
        .unwrap();
    assert_eq!(res.lists["a"].count, 3);
    assert_eq!(res.list_ops("a"), &[delete_op(0), insert_op(1, &rooms[1])]);
}
