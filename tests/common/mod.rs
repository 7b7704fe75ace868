// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Test Harness
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// =============================================================================

#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Once,
};

use matrixon_sliding_proxy::{
    ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId},
    service::sync::{
        Op, Range, RequestList, RoomEvent, RoomMetadata, SortKey,
    },
    MemoryRoomStore, Request, Response, Result, SlidingSyncConfig, SlidingSyncService,
    SyncUpdate,
};
use serde_json::json;

static INIT: Once = Once::new();

/// Initialize test logging (call once per test process)
pub fn init_test_env() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    });
}

pub struct Harness {
    pub store: Arc<MemoryRoomStore>,
    pub service: Arc<SlidingSyncService>,
    pub user: OwnedUserId,
    clock: AtomicU64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SlidingSyncConfig::default())
    }

    pub fn with_config(config: SlidingSyncConfig) -> Self {
        init_test_env();
        let store = Arc::new(MemoryRoomStore::new());
        let service = Arc::new(SlidingSyncService::new(store.clone(), config));
        Self {
            store,
            service,
            user: UserId::parse("@alice:localhost").unwrap(),
            clock: AtomicU64::new(0),
        }
    }

    /// Monotonic fake `origin_server_ts`.
    pub fn tick(&self) -> u64 {
        (self.clock.fetch_add(1, Ordering::SeqCst) + 1) * 1000
    }

    pub fn event(&self, event_type: &str, state_key: Option<&str>, ts: u64) -> RoomEvent {
        RoomEvent {
            event_id: format!("$event{ts}"),
            event_type: event_type.to_string(),
            state_key: state_key.map(str::to_string),
            sender: self.user.clone(),
            origin_server_ts: ts,
            stream_position: 0,
            content: json!({ "membership": "join", "body": format!("at {ts}") }),
        }
    }

    /// Join a fresh room named `name`. Its recency is the join time.
    pub async fn create_room(&self, name: &str) -> OwnedRoomId {
        let room_id = RoomId::parse(format!("!{name}:localhost")).unwrap();
        self.join_room(&room_id, name, self.tick()).await;
        room_id
    }

    pub async fn join_room(&self, room_id: &RoomId, name: &str, ts: u64) {
        let member = self.event("m.room.member", Some(self.user.as_str()), ts);
        let position = self.store.append_event(room_id, member).await;
        self.store
            .upsert_room(
                &self.user,
                RoomMetadata {
                    name: Some(name.to_string()),
                    visible_since: position,
                    membership_ts: ts,
                    ..RoomMetadata::new(room_id.to_owned())
                },
            )
            .await;
        self.service
            .notify(&self.user, SyncUpdate::membership_change(room_id))
            .await;
    }

    /// Create rooms in order; the last one is the most recent.
    pub async fn create_rooms(&self, names: &[&str]) -> Vec<OwnedRoomId> {
        let mut rooms = Vec::new();
        for name in names {
            rooms.push(self.create_room(name).await);
        }
        rooms
    }

    pub async fn send(&self, room_id: &RoomId, event_type: &str) {
        let event = self.event(event_type, None, self.tick());
        self.store.append_event(room_id, event).await;
        self.service
            .notify(&self.user, SyncUpdate::new_event(room_id, event_type))
            .await;
    }

    pub async fn send_message(&self, room_id: &RoomId) {
        self.send(room_id, "m.room.message").await;
    }

    pub async fn sync(&self, pos: Option<&str>, request: Request) -> Result<Response> {
        self.service
            .sliding_sync(&self.user, "conn", pos, request)
            .await
    }
}

/// A request with the given lists, each with `ranges`, and no long-poll.
pub fn lists_request(lists: &[(&str, Vec<[i64; 2]>)]) -> Request {
    let mut request = Request {
        timeout: Some(0),
        ..Default::default()
    };
    for (name, ranges) in lists {
        request.lists.insert(
            name.to_string(),
            RequestList {
                ranges: Some(ranges.clone()),
                ..Default::default()
            },
        );
    }
    request
}

pub fn list_request(ranges: Vec<[i64; 2]>) -> Request {
    lists_request(&[("a", ranges)])
}

pub fn sorted_list_request(ranges: Vec<[i64; 2]>, sort: Vec<SortKey>) -> Request {
    let mut request = list_request(ranges);
    if let Some(list) = request.lists.get_mut("a") {
        list.sort = Some(sort);
    }
    request
}

pub fn sync_op(start: usize, end: usize, rooms: &[OwnedRoomId]) -> Op {
    Op::Sync {
        range: Range(start, end),
        room_ids: rooms.to_vec(),
    }
}

pub fn invalidate_op(start: usize, end: usize) -> Op {
    Op::Invalidate {
        range: Range(start, end),
    }
}

pub fn insert_op(index: usize, room_id: &OwnedRoomId) -> Op {
    Op::Insert {
        index,
        room_id: room_id.clone(),
    }
}

pub fn delete_op(index: usize) -> Op {
    Op::Delete { index }
}
