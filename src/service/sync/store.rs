// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Store Module
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
//   Read-only view of the event and room-metadata store the engine consumes,
//   plus an in-memory implementation for embedders and tests.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::Result;

/// The user's membership in a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    #[default]
    Join,
    Invite,
    Knock,
    Leave,
    Ban,
}

/// Per-user room metadata used for filtering and sorting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: OwnedRoomId,
    pub name: Option<String>,
    pub is_encrypted: bool,
    pub is_dm: bool,
    pub room_type: Option<String>,
    pub membership: Membership,
    /// Stream position of the user's membership event. Events before it are
    /// not visible to the user.
    pub visible_since: u64,
    /// `origin_server_ts` of the user's membership event.
    pub membership_ts: u64,
    pub tags: Vec<String>,
    pub spaces: Vec<OwnedRoomId>,
    pub notification_count: u64,
    pub highlight_count: u64,
}

impl RoomMetadata {
    /// A joined, unnamed, unencrypted room visible from the start.
    pub fn new(room_id: OwnedRoomId) -> Self {
        Self {
            room_id,
            name: None,
            is_encrypted: false,
            is_dm: false,
            room_type: None,
            membership: Membership::Join,
            visible_since: 0,
            membership_ts: 0,
            tags: Vec::new(),
            spaces: Vec::new(),
            notification_count: 0,
            highlight_count: 0,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.room_id.as_str())
    }
}

/// A timeline event as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub sender: OwnedUserId,
    pub origin_server_ts: u64,
    /// Position in the global event stream. Strictly increasing.
    #[serde(skip)]
    pub stream_position: u64,
    pub content: serde_json::Value,
}

/// Event and room metadata source. The engine never writes to it.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Rooms the user can currently see, including invites.
    async fn current_visible_rooms(&self, user_id: &UserId) -> Result<Vec<RoomMetadata>>;

    /// Timeline events of `room_id` with stream position `>= since`, ascending.
    async fn events_since(&self, room_id: &RoomId, since: u64) -> Result<Vec<RoomEvent>>;

    /// Current state events of `room_id`.
    async fn current_state(&self, room_id: &RoomId) -> Result<Vec<RoomEvent>>;

    /// Highest stream position handed out so far.
    async fn latest_stream_position(&self) -> Result<u64>;
}

/// In-memory `RoomStore`.
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    rooms: RwLock<HashMap<OwnedUserId, BTreeMap<OwnedRoomId, RoomMetadata>>>,
    timelines: RwLock<HashMap<OwnedRoomId, Vec<RoomEvent>>>,
    stream_position: AtomicU64,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the user's view of a room.
    pub async fn upsert_room(&self, user_id: &UserId, room: RoomMetadata) {
        debug!("🔧 Upserting room {} for {}", room.room_id, user_id);
        self.rooms
            .write()
            .await
            .entry(user_id.to_owned())
            .or_default()
            .insert(room.room_id.clone(), room);
    }

    /// Apply `f` to the user's metadata for `room_id`. Returns false if absent.
    pub async fn update_room<F>(&self, user_id: &UserId, room_id: &RoomId, f: F) -> bool
    where
        F: FnOnce(&mut RoomMetadata),
    {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(user_id).and_then(|r| r.get_mut(room_id)) {
            Some(room) => {
                f(room);
                true
            }
            None => false,
        }
    }

    pub async fn remove_room(&self, user_id: &UserId, room_id: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms
            .get_mut(user_id)
            .map(|r| r.remove(room_id).is_some())
            .unwrap_or(false)
    }

    /// Append an event, assigning it the next stream position, which is returned.
    pub async fn append_event(&self, room_id: &RoomId, mut event: RoomEvent) -> u64 {
        let position = self.stream_position.fetch_add(1, Ordering::SeqCst) + 1;
        event.stream_position = position;
        debug!(
            "🔧 Appending {} to {} at position {}",
            event.event_type, room_id, position
        );
        self.timelines
            .write()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .push(event);
        position
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn current_visible_rooms(&self, user_id: &UserId) -> Result<Vec<RoomMetadata>> {
        let rooms = self.rooms.read().await;
        Ok(rooms
            .get(user_id)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn events_since(&self, room_id: &RoomId, since: u64) -> Result<Vec<RoomEvent>> {
        let timelines = self.timelines.read().await;
        Ok(timelines
            .get(room_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.stream_position >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn current_state(&self, room_id: &RoomId) -> Result<Vec<RoomEvent>> {
        let timelines = self.timelines.read().await;
        let mut state: BTreeMap<(String, String), RoomEvent> = BTreeMap::new();
        for event in timelines.get(room_id).into_iter().flatten() {
            if let Some(state_key) = &event.state_key {
                state.insert((event.event_type.clone(), state_key.clone()), event.clone());
            }
        }
        Ok(state.into_values().collect())
    }

    async fn latest_stream_position(&self) -> Result<u64> {
        Ok(self.stream_position.load(Ordering::SeqCst))
    }
}
