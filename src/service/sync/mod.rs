// =============================================================================
// Matrixon Matrix NextServer - Sync Module
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
//   Sliding sync: request merging, room ordering, range tracking, list op
//   generation and the per-connection session manager.
//
// =============================================================================

pub mod connection;
pub mod ops;
pub mod ordering;
pub mod ranges;
pub mod request;
pub mod response;
pub mod sliding_sync;
pub mod store;

pub use ops::{ClientView, ListState, Op, Reconciler};
pub use ordering::SortKey;
pub use ranges::{Range, RangeSet};
pub use request::{Request, RequestFilters, RequestList, RoomSubscription};
pub use response::{ListResponse, Response, RoomUpdate};
pub use sliding_sync::{MetricsSnapshot, SlidingSyncService, SyncUpdate, SyncUpdateType};
pub use store::{MemoryRoomStore, Membership, RoomEvent, RoomMetadata, RoomStore};
