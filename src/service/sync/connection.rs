// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Connection Module
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
//   Per-connection state. Each connection is its own lockable unit: a turn
//   lock queues requests against the connection and a short-lived state lock
//   guards the committed snapshot. Every arriving turn is announced, so a
//   parked older turn can step aside for it.
//
// =============================================================================

use std::{
    collections::BTreeMap,
    sync::Mutex as StdMutex,
    time::{Duration, Instant},
};

use ruma::{OwnedRoomId, OwnedUserId, UserId};
use tokio::sync::{watch, Mutex, MutexGuard};

use super::{
    ops::ListState,
    request::{Request, RoomSubscription},
};

/// Identifies a connection: one user may run several.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub user_id: OwnedUserId,
    pub conn_id: String,
}

impl ConnectionKey {
    pub fn new(user_id: &UserId, conn_id: &str) -> Self {
        Self {
            user_id: user_id.to_owned(),
            conn_id: conn_id.to_owned(),
        }
    }
}

/// Everything a connection has acknowledged to its client.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub sticky: Request,
    pub lists: BTreeMap<String, ListState>,
    /// Rooms the client holds a payload for, with the subscription it was built from.
    pub tracked_rooms: BTreeMap<OwnedRoomId, RoomSubscription>,
    /// Last issued position token. `None` until the first turn commits.
    pub pos: Option<String>,
    /// Store position covered by the last commit.
    pub stream_position: u64,
}

impl ConnectionState {
    pub fn is_new(&self) -> bool {
        self.pos.is_none()
    }
}

#[derive(Debug)]
pub struct Connection {
    key: ConnectionKey,
    turn: Mutex<()>,
    state: Mutex<ConnectionState>,
    last_activity: StdMutex<Instant>,
    /// Number of turns that have arrived on this connection.
    arrivals: watch::Sender<u64>,
}

/// Marks one turn's place in the arrival order of its connection.
#[derive(Debug)]
pub struct TurnTicket {
    number: u64,
    arrivals: watch::Receiver<u64>,
}

impl TurnTicket {
    /// A newer turn arrived on the connection.
    pub fn is_superseded(&self) -> bool {
        *self.arrivals.borrow() != self.number
    }

    /// Resolves once a newer turn arrives.
    pub async fn superseded(&mut self) {
        let number = self.number;
        let closed = self.arrivals.wait_for(|n| *n != number).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

impl Connection {
    pub fn new(key: ConnectionKey) -> Self {
        Self {
            key,
            turn: Mutex::new(()),
            state: Mutex::new(ConnectionState::default()),
            last_activity: StdMutex::new(Instant::now()),
            arrivals: watch::channel(0).0,
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Register an arriving turn. Older turns holding a ticket see it as
    /// superseded from now on.
    pub fn announce_turn(&self) -> TurnTicket {
        let mut number = 0;
        self.arrivals.send_modify(|n| {
            *n += 1;
            number = *n;
        });
        TurnTicket {
            number,
            arrivals: self.arrivals.subscribe(),
        }
    }

    /// Wait for earlier turns on this connection to finish.
    pub async fn begin_turn(&self) -> MutexGuard<'_, ()> {
        self.turn.lock().await
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> ConnectionState {
        self.state.lock().await.clone()
    }

    /// Replace the committed state in one step.
    pub async fn commit(&self, next: ConnectionState) {
        *self.state.lock().await = next;
        self.touch();
    }

    pub fn touch(&self) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }
}
