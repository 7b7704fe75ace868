// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Ordering Module
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
//   Filtering and sorting of the user's rooms into a list order. Recency is
//   computed only from events inside the user's visibility window.
//
// =============================================================================

use std::{cmp::Ordering, collections::HashMap};

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};

use super::{
    request::{RequestFilters, RequestList},
    store::{Membership, RoomEvent, RoomMetadata},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Most recently bumped first.
    ByRecency,
    /// Display name, case-insensitive, ascending.
    ByName,
    ByNotificationCount,
    ByHighlightCount,
}

/// Inputs shared by every list of a turn.
pub struct OrderingContext<'a> {
    pub rooms: &'a [RoomMetadata],
    /// Events per room from the user's visibility start onwards.
    pub events: &'a HashMap<OwnedRoomId, Vec<RoomEvent>>,
    pub exclude_encrypted_rooms: bool,
    pub default_bump_event_types: &'a [String],
}

/// Whether `event_type` bumps a room. An empty set bumps on everything.
fn is_bump_event(bump_event_types: &[String], event_type: &str) -> bool {
    bump_event_types.is_empty() || bump_event_types.iter().any(|t| t == event_type)
}

/// Latest visible bump timestamp of a room, never earlier than the user's
/// own membership event.
pub fn recency(room: &RoomMetadata, events: &[RoomEvent], bump_event_types: &[String]) -> u64 {
    events
        .iter()
        .filter(|e| e.stream_position >= room.visible_since)
        .filter(|e| is_bump_event(bump_event_types, &e.event_type))
        .map(|e| e.origin_server_ts)
        .fold(room.membership_ts, u64::max)
}

fn matches_any<T: PartialEq>(wanted: &Option<Vec<T>>, have: impl Fn(&T) -> bool) -> bool {
    match wanted {
        Some(values) if !values.is_empty() => values.iter().any(have),
        _ => true,
    }
}

/// Whether `room` satisfies every configured predicate.
pub fn matches_filters(room: &RoomMetadata, filters: &RequestFilters) -> bool {
    if filters.is_dm.is_some_and(|dm| dm != room.is_dm) {
        return false;
    }
    if filters
        .is_encrypted
        .is_some_and(|encrypted| encrypted != room.is_encrypted)
    {
        return false;
    }
    if filters
        .is_invite
        .is_some_and(|invite| invite != (room.membership == Membership::Invite))
    {
        return false;
    }
    if !matches_any(&filters.room_types, |t| *t == room.room_type) {
        return false;
    }
    if let Some(not_room_types) = &filters.not_room_types {
        if not_room_types.contains(&room.room_type) {
            return false;
        }
    }
    if let Some(pattern) = &filters.room_name_like {
        let name = room.display_name().to_lowercase();
        if !name.contains(&pattern.to_lowercase()) {
            return false;
        }
    }
    if !matches_any(&filters.tags, |tag| room.tags.contains(tag)) {
        return false;
    }
    if let Some(not_tags) = &filters.not_tags {
        if room.tags.iter().any(|tag| not_tags.contains(tag)) {
            return false;
        }
    }
    matches_any(&filters.spaces, |space| room.spaces.contains(space))
}

struct Candidate<'a> {
    room: &'a RoomMetadata,
    recency: u64,
    name: String,
}

fn compare(a: &Candidate<'_>, b: &Candidate<'_>, sort: &[SortKey]) -> Ordering {
    sort.iter()
        .map(|key| match key {
            SortKey::ByRecency => b.recency.cmp(&a.recency),
            SortKey::ByName => a.name.cmp(&b.name),
            SortKey::ByNotificationCount => {
                b.room.notification_count.cmp(&a.room.notification_count)
            }
            SortKey::ByHighlightCount => b.room.highlight_count.cmp(&a.room.highlight_count),
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or_else(|| a.room.room_id.cmp(&b.room.room_id))
}

/// Filter and sort the user's rooms for one list. Deterministic and total:
/// the room ID breaks every remaining tie.
pub fn order_rooms(ctx: &OrderingContext<'_>, list: &RequestList) -> Vec<OwnedRoomId> {
    let sort = list.sort_keys();
    let bump_event_types = list
        .bump_event_types
        .as_deref()
        .unwrap_or(ctx.default_bump_event_types);

    let mut candidates: Vec<Candidate<'_>> = ctx
        .rooms
        .iter()
        .filter(|room| !matches!(room.membership, Membership::Leave | Membership::Ban))
        .filter(|room| !(ctx.exclude_encrypted_rooms && room.is_encrypted))
        .filter(|room| list.filters.as_ref().map_or(true, |f| matches_filters(room, f)))
        .map(|room| Candidate {
            room,
            recency: recency(
                room,
                ctx.events.get(&room.room_id).map(Vec::as_slice).unwrap_or_default(),
                bump_event_types,
            ),
            name: room.display_name().to_lowercase(),
        })
        .collect();

    candidates.sort_by(|a, b| compare(a, b, &sort));
    candidates
        .into_iter()
        .map(|c| c.room.room_id.clone())
        .collect()
}
