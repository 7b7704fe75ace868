// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Request Module
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
//   Client request model and the sticky request merger. Every sticky field is
//   an Option so that an omitted field can be told apart from a field reset
//   to zero or false.
//
// =============================================================================

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};

use super::{ordering::SortKey, ranges::SliceRanges};

/// Per-room subscription options, also used as a list's template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSubscription {
    /// `(event type, state key)` pairs; `*` matches anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_state: Option<Vec<(String, String)>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_limit: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_heroes: Option<bool>,
}

impl RoomSubscription {
    fn apply_delta(&mut self, delta: &RoomSubscription) {
        if let Some(required_state) = &delta.required_state {
            self.required_state = Some(required_state.clone());
        }
        if let Some(timeline_limit) = delta.timeline_limit {
            self.timeline_limit = Some(timeline_limit);
        }
        if let Some(include_heroes) = delta.include_heroes {
            self.include_heroes = Some(include_heroes);
        }
    }

    /// Union of two subscriptions: the larger timeline limit, every required
    /// state pair of either side (first-seen order), heroes if either wants them.
    pub fn union(&self, other: &RoomSubscription) -> RoomSubscription {
        let required_state = match (&self.required_state, &other.required_state) {
            (None, None) => None,
            (a, b) => {
                let mut pairs: Vec<(String, String)> = Vec::new();
                for pair in a.iter().flatten().chain(b.iter().flatten()) {
                    if !pairs.contains(pair) {
                        pairs.push(pair.clone());
                    }
                }
                Some(pairs)
            }
        };

        RoomSubscription {
            required_state,
            timeline_limit: self.timeline_limit.max(other.timeline_limit),
            include_heroes: match (self.include_heroes, other.include_heroes) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(false) || b.unwrap_or(false)),
            },
        }
    }

    pub fn timeline_limit_or(&self, default: u64) -> u64 {
        self.timeline_limit.unwrap_or(default)
    }

    pub fn required_state_pairs(&self) -> &[(String, String)] {
        self.required_state.as_deref().unwrap_or_default()
    }
}

/// Predicates over room metadata. Every configured field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dm: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_encrypted: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_invite: Option<bool>,

    /// `None` entries match rooms without a type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_types: Option<Vec<Option<String>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_room_types: Option<Vec<Option<String>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name_like: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spaces: Option<Vec<OwnedRoomId>>,
}

/// One named list as the client configured it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<SliceRanges>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortKey>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<RequestFilters>,

    /// Subscription template for every room inside this list's ranges.
    #[serde(flatten)]
    pub room_subscription: RoomSubscription,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bump_event_types: Option<Vec<String>>,

    /// Ignore `ranges` and track the whole list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_get_all_rooms: Option<bool>,
}

impl RequestList {
    fn apply_delta(&mut self, delta: &RequestList) {
        if let Some(ranges) = &delta.ranges {
            self.ranges = Some(ranges.clone());
        }
        if let Some(sort) = &delta.sort {
            self.sort = Some(sort.clone());
        }
        // Filters are replaced as a whole.
        if let Some(filters) = &delta.filters {
            self.filters = Some(filters.clone());
        }
        self.room_subscription.apply_delta(&delta.room_subscription);
        if let Some(bump_event_types) = &delta.bump_event_types {
            self.bump_event_types = Some(bump_event_types.clone());
        }
        if let Some(slow_get_all_rooms) = delta.slow_get_all_rooms {
            self.slow_get_all_rooms = Some(slow_get_all_rooms);
        }
    }

    pub fn sort_keys(&self) -> Vec<SortKey> {
        match &self.sort {
            Some(sort) if !sort.is_empty() => sort.clone(),
            _ => vec![SortKey::ByRecency],
        }
    }

    pub fn wants_all_rooms(&self) -> bool {
        self.slow_get_all_rooms.unwrap_or(false)
    }
}

/// A sliding sync request. As stored on a connection this is the sticky
/// request: `txn_id`, `timeout` and `unsubscribe_rooms` are never kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,

    /// Long-poll timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, RequestList>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub room_subscriptions: BTreeMap<OwnedRoomId, RoomSubscription>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsubscribe_rooms: Vec<OwnedRoomId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_encrypted_rooms: Option<bool>,
}

/// Result of merging a delta into the sticky request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub request: Request,
    pub subscribed: Vec<OwnedRoomId>,
    pub unsubscribed: Vec<OwnedRoomId>,
}

impl Request {
    /// Merge `delta` into this sticky request without modifying either.
    pub fn apply_delta(&self, delta: &Request) -> MergeOutcome {
        let mut merged = Request {
            txn_id: None,
            timeout: None,
            lists: self.lists.clone(),
            room_subscriptions: self.room_subscriptions.clone(),
            unsubscribe_rooms: Vec::new(),
            exclude_encrypted_rooms: self.exclude_encrypted_rooms,
        };

        if let Some(flag) = delta.exclude_encrypted_rooms {
            merged.exclude_encrypted_rooms = Some(flag);
        }

        for (name, list) in &delta.lists {
            merged
                .lists
                .entry(name.clone())
                .or_default()
                .apply_delta(list);
        }

        let mut subscribed = Vec::new();
        for (room_id, subscription) in &delta.room_subscriptions {
            // Subscribing and unsubscribing in one delta cancels out.
            if delta.unsubscribe_rooms.contains(room_id) {
                continue;
            }
            match merged.room_subscriptions.get_mut(room_id) {
                Some(existing) => existing.apply_delta(subscription),
                None => {
                    merged
                        .room_subscriptions
                        .insert(room_id.clone(), subscription.clone());
                    subscribed.push(room_id.clone());
                }
            }
        }

        let mut unsubscribed = Vec::new();
        for room_id in &delta.unsubscribe_rooms {
            if delta.room_subscriptions.contains_key(room_id) {
                continue;
            }
            if merged.room_subscriptions.remove(room_id).is_some() {
                unsubscribed.push(room_id.clone());
            }
        }

        MergeOutcome {
            request: merged,
            subscribed,
            unsubscribed,
        }
    }

    pub fn excludes_encrypted_rooms(&self) -> bool {
        self.exclude_encrypted_rooms.unwrap_or(false)
    }
}
