// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Response Module
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
//   Response model of a sliding sync turn and the builders for per-room
//   payloads.
//
// =============================================================================

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};

use super::{
    ops::Op,
    request::RoomSubscription,
    store::{RoomEvent, RoomMetadata},
};

/// Maximum number of heroes reported for a room.
const MAX_HEROES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub pos: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,

    #[serde(default)]
    pub lists: BTreeMap<String, ListResponse>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rooms: BTreeMap<OwnedRoomId, RoomUpdate>,
}

impl Response {
    /// Ops of `list`, empty when the list is unknown.
    pub fn list_ops(&self, list: &str) -> &[Op] {
        self.lists
            .get(list)
            .map(|l| l.ops.as_slice())
            .unwrap_or_default()
    }

    pub fn total_ops(&self) -> usize {
        self.lists.values().map(|l| l.ops.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub count: usize,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<Op>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Set when this payload replaces whatever the client held for the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dm: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heroes: Option<Vec<OwnedUserId>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_state: Vec<RoomEvent>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timeline: Vec<RoomEvent>,

    /// More events exist than `timeline_limit` allowed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub limited: bool,

    #[serde(default)]
    pub notification_count: u64,

    #[serde(default)]
    pub highlight_count: u64,
}

/// Whether `event` is selected by a `(type, state_key)` pattern list.
pub fn matches_required_state(pairs: &[(String, String)], event: &RoomEvent) -> bool {
    let Some(state_key) = &event.state_key else {
        return false;
    };
    pairs.iter().any(|(event_type, key)| {
        (event_type == "*" || *event_type == event.event_type) && (key == "*" || key == state_key)
    })
}

/// Last `limit` events, and whether older ones were cut.
fn tail(events: &[RoomEvent], limit: u64) -> (Vec<RoomEvent>, bool) {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let skip = events.len().saturating_sub(limit);
    (events[skip..].to_vec(), skip > 0)
}

/// Joined members other than `user_id`, for rooms without a name.
fn heroes(state: &[RoomEvent], user_id: &UserId) -> Vec<OwnedUserId> {
    state
        .iter()
        .filter(|e| e.event_type == "m.room.member")
        .filter(|e| e.content.get("membership").and_then(|m| m.as_str()) == Some("join"))
        .filter_map(|e| e.state_key.as_deref())
        .filter(|key| *key != user_id.as_str())
        .filter_map(|key| UserId::parse(key).ok())
        .take(MAX_HEROES)
        .collect()
}

impl RoomUpdate {
    /// Full payload for a room the client starts tracking or whose
    /// subscription changed. `visible` holds the events the user may see.
    pub fn initial(
        room: &RoomMetadata,
        state: &[RoomEvent],
        visible: &[RoomEvent],
        subscription: &RoomSubscription,
        default_timeline_limit: u64,
        user_id: &UserId,
    ) -> Self {
        let (timeline, limited) = tail(visible, subscription.timeline_limit_or(default_timeline_limit));
        let pairs = subscription.required_state_pairs();

        RoomUpdate {
            name: room.name.clone(),
            initial: Some(true),
            is_dm: Some(room.is_dm),
            heroes: subscription
                .include_heroes
                .unwrap_or(false)
                .then(|| heroes(state, user_id)),
            required_state: state
                .iter()
                .filter(|e| matches_required_state(pairs, e))
                .cloned()
                .collect(),
            timeline,
            limited,
            notification_count: room.notification_count,
            highlight_count: room.highlight_count,
        }
    }

    /// Payload for an already tracked room: new events only.
    pub fn incremental(
        room: &RoomMetadata,
        new_events: &[RoomEvent],
        subscription: &RoomSubscription,
        default_timeline_limit: u64,
    ) -> Self {
        let (timeline, limited) =
            tail(new_events, subscription.timeline_limit_or(default_timeline_limit));
        let pairs = subscription.required_state_pairs();

        RoomUpdate {
            name: None,
            initial: None,
            is_dm: None,
            heroes: None,
            required_state: new_events
                .iter()
                .filter(|e| matches_required_state(pairs, e))
                .cloned()
                .collect(),
            timeline,
            limited,
            notification_count: room.notification_count,
            highlight_count: room.highlight_count,
        }
    }
}
