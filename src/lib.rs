// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Proxy Library Crate
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Sliding sync proxy core: turns successive client requests into minimal
//   SYNC / INSERT / DELETE / INVALIDATE updates over sorted, filtered and
//   ranged room lists.
//
// =============================================================================

pub mod config;
pub mod service;
pub mod utils;

use std::{path::Path, sync::Arc};

use tokio::task::JoinHandle;
use tracing::{debug, info};

// Re-export common types
pub use ruma;
pub use tokio;
pub use tracing;

pub use matrixon_common as common;
pub use matrixon_common::{ErrorPayload, MatrixonError as Error, Result};

pub use config::SlidingSyncConfig;
pub use service::sync::{
    MemoryRoomStore, Request, Response, RoomStore, SlidingSyncService, SyncUpdate,
};

/// Load the configuration, install logging from its `log` directive and
/// start the service together with its idle-connection cleanup task.
///
/// Must be called from within a Tokio runtime. An already installed global
/// subscriber is kept.
pub fn start(
    store: Arc<dyn RoomStore>,
    config_path: Option<&Path>,
) -> Result<(Arc<SlidingSyncService>, JoinHandle<()>)> {
    let config = SlidingSyncConfig::load(config_path)?;
    if !utils::logging::init_tracing(&config.log) {
        debug!("🔧 Global tracing subscriber already installed, keeping it");
    }

    let service = Arc::new(SlidingSyncService::new(store, config));
    let cleanup = service.spawn_cleanup_task();
    info!("🚀 Sliding sync proxy started");
    Ok((service, cleanup))
}
