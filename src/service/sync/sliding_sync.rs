// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Module
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
//   Session manager of the sliding sync proxy. Resolves connections from
//   position tokens, runs one turn per request against a working copy of the
//   connection state, long-polls when nothing changed and commits the result
//   atomically.
//
// Performance Targets:
//   • Turns on different connections never contend on a shared lock
//   • No lock held while a turn waits for updates
//
// Features:
//   • Sticky request merging
//   • Per-list incremental ops with bounded moves
//   • Room subscriptions unioned across lists
//   • Per-user wake-ups for long-polling turns
//   • Idle connection eviction
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use futures::future::try_join_all;
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

use super::{
    connection::{Connection, ConnectionKey, ConnectionState, TurnTicket},
    ops::{ListState, Reconciler},
    ordering::{order_rooms, OrderingContext},
    ranges::RangeSet,
    request::{Request, RoomSubscription},
    response::{ListResponse, Response, RoomUpdate},
    store::{RoomEvent, RoomMetadata, RoomStore},
};
use crate::{config::SlidingSyncConfig, Error, Result};

/// Capacity of each per-user wake-up channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Sync update notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncUpdate {
    pub update_type: SyncUpdateType,

    /// Affected room, if the update is about one
    pub room_id: Option<OwnedRoomId>,

    pub event_type: Option<String>,
}

/// Types of sync updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncUpdateType {
    /// New room event
    NewEvent,

    /// State change
    StateChange,

    /// Membership change
    MembershipChange,

    /// Receipt change, may alter notification counts
    ReceiptChange,
}

impl SyncUpdate {
    pub fn new_event(room_id: &RoomId, event_type: &str) -> Self {
        Self {
            update_type: SyncUpdateType::NewEvent,
            room_id: Some(room_id.to_owned()),
            event_type: Some(event_type.to_owned()),
        }
    }

    pub fn membership_change(room_id: &RoomId) -> Self {
        Self {
            update_type: SyncUpdateType::MembershipChange,
            room_id: Some(room_id.to_owned()),
            event_type: Some("m.room.member".to_owned()),
        }
    }

    /// Whether a turn over `visible` rooms must recompute for this update.
    fn is_relevant(&self, visible: &HashSet<OwnedRoomId>) -> bool {
        match (&self.update_type, &self.room_id) {
            (SyncUpdateType::MembershipChange, _) | (_, None) => true,
            (_, Some(room_id)) => visible.contains(room_id),
        }
    }
}

/// Performance metrics
#[derive(Debug, Default)]
pub struct SlidingSyncMetrics {
    /// Total connections
    pub total_connections: AtomicU64,

    /// Active connections
    pub active_connections: AtomicU64,

    /// Total requests
    pub total_requests: AtomicU64,

    /// Requests rejected with an error
    pub failed_requests: AtomicU64,

    /// Response time of the last turn (microseconds)
    pub last_response_time: AtomicU64,

    /// List ops emitted
    pub ops_emitted: AtomicU64,

    /// Lists resynced with INVALIDATE + SYNC
    pub list_fallbacks: AtomicU64,

    /// Rooms synchronized
    pub rooms_synchronized: AtomicU64,

    /// Timeline events sent
    pub timeline_events_sent: AtomicU64,
}

/// Point-in-time copy of [`SlidingSyncMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_response_time: u64,
    pub ops_emitted: u64,
    pub list_fallbacks: u64,
    pub rooms_synchronized: u64,
    pub timeline_events_sent: u64,
}

/// Result of one computation over the current store contents.
struct TurnOutcome {
    lists: BTreeMap<String, ListState>,
    list_responses: BTreeMap<String, ListResponse>,
    tracked_rooms: BTreeMap<OwnedRoomId, RoomSubscription>,
    rooms: BTreeMap<OwnedRoomId, RoomUpdate>,
    stream_position: u64,
    visible: HashSet<OwnedRoomId>,
    fallbacks: u64,
}

impl TurnOutcome {
    fn has_changes(&self, previous: &ConnectionState) -> bool {
        !self.rooms.is_empty()
            || self.list_responses.iter().any(|(name, list)| {
                !list.ops.is_empty()
                    || previous.lists.get(name).map(ListState::count) != Some(list.count)
            })
    }
}

enum Wake {
    Update,
    TimedOut,
    /// A newer turn arrived on the connection.
    Superseded,
}

fn superseded(conn_id: &str) -> Error {
    Error::Superseded(format!("a newer request arrived on connection {conn_id}"))
}

/// Sliding sync session manager
pub struct SlidingSyncService {
    /// Connection arena. Only held for lookup and insertion.
    connections: RwLock<HashMap<ConnectionKey, Arc<Connection>>>,

    /// Change broadcasters for long-polling turns
    change_broadcasters: RwLock<HashMap<OwnedUserId, broadcast::Sender<SyncUpdate>>>,

    store: Arc<dyn RoomStore>,

    reconciler: Reconciler,

    /// Performance metrics collector
    metrics: Arc<SlidingSyncMetrics>,

    /// Last issued position token
    position: AtomicU64,

    config: SlidingSyncConfig,
}

impl SlidingSyncService {
    /// Create with custom configuration
    pub fn new(store: Arc<dyn RoomStore>, config: SlidingSyncConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            change_broadcasters: RwLock::new(HashMap::new()),
            store,
            reconciler: Reconciler::new(config.max_list_moves, config.strict_invariants),
            metrics: Arc::new(SlidingSyncMetrics::default()),
            position: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &SlidingSyncConfig {
        &self.config
    }

    /// Handle one sliding sync request.
    ///
    /// Without `pos` a fresh connection is started, replacing any connection
    /// with the same `conn_id`. With `pos` the request continues the
    /// connection that issued that token. A rejected turn never changes the
    /// connection, and neither does a turn whose future is dropped. A turn
    /// that is still running when a newer one arrives on the same connection
    /// gives up with `Superseded` and leaves the connection to the newer one.
    #[instrument(level = "debug", skip(self, request))]
    pub async fn sliding_sync(
        &self,
        user_id: &UserId,
        conn_id: &str,
        pos: Option<&str>,
        request: Request,
    ) -> Result<Response> {
        let start_time = Instant::now();
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        debug!("🔄 Sliding sync request for {} on connection {}", user_id, conn_id);

        let result = self.run_turn(user_id, conn_id, pos, request).await;

        let elapsed = start_time.elapsed();
        self.metrics
            .last_response_time
            .store(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
        match &result {
            Ok(response) => info!(
                "✅ Sliding sync completed in {:?} for {} (pos {}, {} ops, {} rooms)",
                elapsed,
                user_id,
                response.pos,
                response.total_ops(),
                response.rooms.len()
            ),
            Err(e) => {
                self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
                warn!("⚠️ Sliding sync rejected for {}: {}", user_id, e);
            }
        }
        result
    }

    async fn run_turn(
        &self,
        user_id: &UserId,
        conn_id: &str,
        pos: Option<&str>,
        request: Request,
    ) -> Result<Response> {
        self.validate_request(&request)?;

        // A fresh connection only enters the arena once its first turn commits.
        let connection = match pos {
            None => {
                self.check_connection_limit(&ConnectionKey::new(user_id, conn_id))
                    .await?;
                Arc::new(Connection::new(ConnectionKey::new(user_id, conn_id)))
            }
            Some(pos) => self.get_connection(user_id, conn_id, pos).await?,
        };

        // Announce before queueing so a parked older turn steps aside.
        let mut ticket = connection.announce_turn();
        let mut turn = connection.begin_turn().await;
        // Subscribe before reading anything so no update slips between the
        // computation and the wait.
        let mut updates = self.subscribe(user_id).await;

        let previous = connection.snapshot().await;
        if let Some(pos) = pos {
            if previous.pos.as_deref() != Some(pos) {
                return Err(Error::UnknownPosition(format!(
                    "position {pos} is not the latest on connection {conn_id}"
                )));
            }
        }
        connection.touch();

        let merge = previous.sticky.apply_delta(&request);
        if !merge.subscribed.is_empty() || !merge.unsubscribed.is_empty() {
            debug!(
                "🏠 Room subscriptions: +{:?} -{:?}",
                merge.subscribed, merge.unsubscribed
            );
        }
        let must_respond =
            previous.is_new() || merge.request != previous.sticky || request.txn_id.is_some();
        let deadline = tokio::time::Instant::now() + self.config.long_poll_timeout(request.timeout);

        let outcome = loop {
            let outcome = self.compute(user_id, &previous, &merge.request).await?;
            if must_respond || outcome.has_changes(&previous) {
                break outcome;
            }

            // Park without the turn lock; only a newer turn can take it.
            drop(turn);
            match Self::wait_for_update(&mut updates, &outcome.visible, deadline, &mut ticket)
                .await
            {
                Wake::Superseded => return Err(superseded(conn_id)),
                Wake::Update => {
                    turn = connection.begin_turn().await;
                    debug!("🔄 Woken by an update, recomputing");
                }
                Wake::TimedOut => {
                    turn = connection.begin_turn().await;
                    break outcome;
                }
            }
        };

        if ticket.is_superseded() {
            return Err(superseded(conn_id));
        }

        let pos = self.next_position();
        let response = Response {
            pos: pos.clone(),
            txn_id: request.txn_id,
            lists: outcome.list_responses,
            rooms: outcome.rooms,
        };
        connection
            .commit(ConnectionState {
                sticky: merge.request,
                lists: outcome.lists,
                tracked_rooms: outcome.tracked_rooms,
                pos: Some(pos),
                stream_position: outcome.stream_position,
            })
            .await;
        drop(turn);
        if previous.is_new() {
            self.register_connection(&connection).await?;
        }

        self.update_metrics(&response, outcome.fallbacks);
        Ok(response)
    }

    /// Reject malformed requests before any state is touched.
    fn validate_request(&self, request: &Request) -> Result<()> {
        let max = self.config.max_timeline_limit;
        for (name, list) in &request.lists {
            if let Some(ranges) = &list.ranges {
                RangeSet::parse(ranges)
                    .map_err(|e| Error::BadRequest(format!("list {name}: {e}")))?;
            }
            if list.room_subscription.timeline_limit.is_some_and(|l| l > max) {
                return Err(Error::BadRequest(format!(
                    "list {name}: timeline limit exceeds maximum of {max}"
                )));
            }
        }
        for (room_id, subscription) in &request.room_subscriptions {
            if subscription.timeline_limit.is_some_and(|l| l > max) {
                return Err(Error::BadRequest(format!(
                    "room {room_id}: timeline limit exceeds maximum of {max}"
                )));
            }
        }
        Ok(())
    }

    fn ensure_below_limit(
        &self,
        connections: &HashMap<ConnectionKey, Arc<Connection>>,
        key: &ConnectionKey,
    ) -> Result<()> {
        // Restarting an existing connection does not count against the limit.
        let others = connections
            .keys()
            .filter(|k| k.user_id == key.user_id && *k != key)
            .count();
        if others >= self.config.max_connections_per_user {
            return Err(Error::LimitExceeded(format!(
                "maximum of {} sliding sync connections reached",
                self.config.max_connections_per_user
            )));
        }
        Ok(())
    }

    /// Check connection limits for user
    async fn check_connection_limit(&self, key: &ConnectionKey) -> Result<()> {
        self.ensure_below_limit(&*self.connections.read().await, key)
    }

    /// Put a connection whose first turn committed into the arena, replacing
    /// any existing one under the same key.
    async fn register_connection(&self, connection: &Arc<Connection>) -> Result<()> {
        let key = connection.key().clone();
        let mut connections = self.connections.write().await;
        self.ensure_below_limit(&connections, &key)?;

        debug!("🔧 Registering connection {} for {}", key.conn_id, key.user_id);
        if connections.insert(key, Arc::clone(connection)).is_none() {
            self.metrics.active_connections.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.total_connections.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get_connection(
        &self,
        user_id: &UserId,
        conn_id: &str,
        pos: &str,
    ) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .await
            .get(&ConnectionKey::new(user_id, conn_id))
            .cloned()
            .ok_or_else(|| {
                Error::ExpiredSession(format!("no connection {conn_id} for position {pos}"))
            })
    }

    /// Compute lists and room payloads against the current store contents.
    async fn compute(
        &self,
        user_id: &UserId,
        previous: &ConnectionState,
        sticky: &Request,
    ) -> Result<TurnOutcome> {
        let stream_position = self.store.latest_stream_position().await?;
        let rooms = self.store.current_visible_rooms(user_id).await?;
        let events = self.visible_events(&rooms, stream_position).await?;

        let ctx = OrderingContext {
            rooms: &rooms,
            events: &events,
            exclude_encrypted_rooms: sticky.excludes_encrypted_rooms(),
            default_bump_event_types: &self.config.default_bump_event_types,
        };

        let mut lists = BTreeMap::new();
        let mut list_responses = BTreeMap::new();
        let mut fallbacks = 0;
        let mut wanted: BTreeMap<OwnedRoomId, RoomSubscription> = BTreeMap::new();

        for (name, list) in &sticky.lists {
            let order = order_rooms(&ctx, list);
            let requested = if list.wants_all_rooms() {
                RangeSet::all(order.len())
            } else {
                RangeSet::parse(list.ranges.as_deref().unwrap_or_default())?
            };
            let sort = list.sort_keys();
            let prev = previous.lists.get(name);
            let force_resync = prev.is_some_and(|p| p.sort != sort);

            let reconciliation =
                self.reconciler
                    .reconcile(prev, order, &requested, sort, force_resync)?;
            if reconciliation.fell_back {
                fallbacks += 1;
            }
            debug!(
                "📋 List {}: {} rooms, {} ops",
                name,
                reconciliation.next.count(),
                reconciliation.ops.len()
            );

            for room_id in reconciliation.next.visible_rooms() {
                merge_subscription(&mut wanted, room_id, &list.room_subscription);
            }
            list_responses.insert(
                name.clone(),
                ListResponse {
                    count: reconciliation.next.count(),
                    ops: reconciliation.ops,
                },
            );
            lists.insert(name.clone(), reconciliation.next);
        }

        let by_id: HashMap<&OwnedRoomId, &RoomMetadata> =
            rooms.iter().map(|r| (&r.room_id, r)).collect();
        for (room_id, subscription) in &sticky.room_subscriptions {
            if by_id.contains_key(room_id) {
                merge_subscription(&mut wanted, room_id, subscription);
            } else {
                debug!("🏠 Skipping subscription to invisible room {}", room_id);
            }
        }

        let room_payloads = self
            .room_payloads(user_id, previous, &wanted, &by_id, &events)
            .await?;

        Ok(TurnOutcome {
            lists,
            list_responses,
            tracked_rooms: wanted,
            rooms: room_payloads,
            stream_position,
            visible: rooms.iter().map(|r| r.room_id.clone()).collect(),
            fallbacks,
        })
    }

    /// Events each room's user may see, up to `stream_position`.
    async fn visible_events(
        &self,
        rooms: &[RoomMetadata],
        stream_position: u64,
    ) -> Result<HashMap<OwnedRoomId, Vec<RoomEvent>>> {
        let fetched = try_join_all(rooms.iter().map(|room| async move {
            let mut events = self
                .store
                .events_since(&room.room_id, room.visible_since)
                .await?;
            events.retain(|e| e.stream_position <= stream_position);
            Ok::<_, Error>((room.room_id.clone(), events))
        }))
        .await?;
        Ok(fetched.into_iter().collect())
    }

    async fn room_payloads(
        &self,
        user_id: &UserId,
        previous: &ConnectionState,
        wanted: &BTreeMap<OwnedRoomId, RoomSubscription>,
        by_id: &HashMap<&OwnedRoomId, &RoomMetadata>,
        events: &HashMap<OwnedRoomId, Vec<RoomEvent>>,
    ) -> Result<BTreeMap<OwnedRoomId, RoomUpdate>> {
        let default_limit = self.config.default_timeline_limit;
        let mut payloads = BTreeMap::new();
        let mut initial = Vec::new();

        for (room_id, subscription) in wanted {
            let Some(room) = by_id.get(room_id) else {
                continue;
            };
            let visible = events.get(room_id).map(Vec::as_slice).unwrap_or_default();

            if previous.tracked_rooms.get(room_id) != Some(subscription) {
                initial.push((*room, subscription, visible));
                continue;
            }

            let new_events: Vec<RoomEvent> = visible
                .iter()
                .filter(|e| e.stream_position > previous.stream_position)
                .cloned()
                .collect();
            if !new_events.is_empty() {
                payloads.insert(
                    room_id.clone(),
                    RoomUpdate::incremental(room, &new_events, subscription, default_limit),
                );
            }
        }

        let states = try_join_all(
            initial
                .iter()
                .map(|(room, _, _)| self.store.current_state(&room.room_id)),
        )
        .await?;
        for ((room, subscription, visible), state) in initial.into_iter().zip(states) {
            payloads.insert(
                room.room_id.clone(),
                RoomUpdate::initial(room, &state, visible, subscription, default_limit, user_id),
            );
        }

        Ok(payloads)
    }

    async fn subscribe(&self, user_id: &UserId) -> broadcast::Receiver<SyncUpdate> {
        if let Some(sender) = self.change_broadcasters.read().await.get(user_id) {
            return sender.subscribe();
        }
        self.change_broadcasters
            .write()
            .await
            .entry(user_id.to_owned())
            .or_insert_with(|| broadcast::channel(UPDATE_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    async fn wait_for_update(
        updates: &mut broadcast::Receiver<SyncUpdate>,
        visible: &HashSet<OwnedRoomId>,
        deadline: tokio::time::Instant,
        ticket: &mut TurnTicket,
    ) -> Wake {
        loop {
            let received = tokio::select! {
                _ = ticket.superseded() => return Wake::Superseded,
                received = tokio::time::timeout_at(deadline, updates.recv()) => received,
            };
            match received {
                Err(_) => return Wake::TimedOut,
                Ok(Ok(update)) if update.is_relevant(visible) => return Wake::Update,
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!("🔄 Missed {} updates, recomputing", skipped);
                    return Wake::Update;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    tokio::select! {
                        _ = ticket.superseded() => return Wake::Superseded,
                        _ = tokio::time::sleep_until(deadline) => return Wake::TimedOut,
                    }
                }
            }
        }
    }

    /// Wake long-polling turns of `user_id`. Returns how many turns were listening.
    pub async fn notify(&self, user_id: &UserId, update: SyncUpdate) -> usize {
        match self.change_broadcasters.read().await.get(user_id) {
            Some(sender) => sender.send(update).unwrap_or(0),
            None => 0,
        }
    }

    fn next_position(&self) -> String {
        (self.position.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Sticky request of a connection, if it exists.
    pub async fn sticky_request(&self, user_id: &UserId, conn_id: &str) -> Option<Request> {
        let connection = self
            .connections
            .read()
            .await
            .get(&ConnectionKey::new(user_id, conn_id))
            .cloned()?;
        Some(connection.snapshot().await.sticky)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    fn update_metrics(&self, response: &Response, fallbacks: u64) {
        self.metrics
            .ops_emitted
            .fetch_add(response.total_ops() as u64, Ordering::Relaxed);
        self.metrics
            .list_fallbacks
            .fetch_add(fallbacks, Ordering::Relaxed);
        self.metrics
            .rooms_synchronized
            .fetch_add(response.rooms.len() as u64, Ordering::Relaxed);

        let timeline_events: u64 = response
            .rooms
            .values()
            .map(|room| room.timeline.len() as u64)
            .sum();
        self.metrics
            .timeline_events_sent
            .fetch_add(timeline_events, Ordering::Relaxed);
    }

    // ========== Maintenance ==========

    /// Clean up idle connections
    pub async fn cleanup_idle_connections(&self) -> usize {
        let timeout = self.config.connection_timeout();
        let mut connections = self.connections.write().await;
        let before = connections.len();

        connections.retain(|key, connection| {
            let idle = connection.idle_for() <= timeout;
            if !idle {
                debug!("🧹 Evicting idle connection {} of {}", key.conn_id, key.user_id);
            }
            idle
        });

        let removed = before - connections.len();
        self.metrics
            .active_connections
            .fetch_sub(removed as u64, Ordering::Relaxed);

        let users: HashSet<&OwnedUserId> = connections.keys().map(|k| &k.user_id).collect();
        self.change_broadcasters
            .write()
            .await
            .retain(|user_id, sender| users.contains(user_id) || sender.receiver_count() > 0);

        debug!(
            "🧹 Cleaned up idle sliding sync connections, {} active remaining",
            connections.len()
        );
        removed
    }

    /// Run [`Self::cleanup_idle_connections`] every `cleanup_interval_secs`.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.cleanup_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = service.cleanup_idle_connections().await;
                if removed > 0 {
                    info!("🧹 Evicted {} idle sliding sync connections", removed);
                }
            }
        })
    }

    /// Get performance metrics
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let m = &self.metrics;
        MetricsSnapshot {
            total_connections: m.total_connections.load(Ordering::Relaxed),
            active_connections: m.active_connections.load(Ordering::Relaxed),
            total_requests: m.total_requests.load(Ordering::Relaxed),
            failed_requests: m.failed_requests.load(Ordering::Relaxed),
            last_response_time: m.last_response_time.load(Ordering::Relaxed),
            ops_emitted: m.ops_emitted.load(Ordering::Relaxed),
            list_fallbacks: m.list_fallbacks.load(Ordering::Relaxed),
            rooms_synchronized: m.rooms_synchronized.load(Ordering::Relaxed),
            timeline_events_sent: m.timeline_events_sent.load(Ordering::Relaxed),
        }
    }
}

fn merge_subscription(
    wanted: &mut BTreeMap<OwnedRoomId, RoomSubscription>,
    room_id: &OwnedRoomId,
    subscription: &RoomSubscription,
) {
    wanted
        .entry(room_id.clone())
        .and_modify(|existing| *existing = existing.union(subscription))
        .or_insert_with(|| subscription.clone());
}
