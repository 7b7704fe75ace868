// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Configuration Module
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
//   Tunables of the sliding sync proxy. Loaded from built-in defaults, then
//   an optional TOML file, then MATRIXON_SLIDING_* environment variables.
//
// =============================================================================

use std::{path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

/// Environment prefix for overrides, e.g. `MATRIXON_SLIDING_MAX_LIST_MOVES=8`.
pub const ENV_PREFIX: &str = "MATRIXON_SLIDING_";

/// Sliding sync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlidingSyncConfig {
    /// Maximum concurrent connections per user
    pub max_connections_per_user: usize,

    /// Idle time after which a connection is evicted
    pub connection_timeout_secs: u64,

    /// Interval of the idle eviction task
    pub cleanup_interval_secs: u64,

    /// Long-poll timeout when the request carries none
    pub default_timeout_ms: u64,

    /// Upper bound on any requested long-poll timeout
    pub max_timeout_ms: u64,

    /// Largest `timeline_limit` a client may ask for
    pub max_timeline_limit: u64,

    /// `timeline_limit` for subscriptions that set none
    pub default_timeline_limit: u64,

    /// DELETE/INSERT pairs per list per turn before resyncing the list
    pub max_list_moves: usize,

    /// Event types that bump a room unless a list overrides them
    pub default_bump_event_types: Vec<String>,

    /// Fail the turn when an op script does not replay cleanly
    pub strict_invariants: bool,

    /// `tracing` filter directive
    pub log: String,
}

impl Default for SlidingSyncConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 10,
            connection_timeout_secs: 1800,
            cleanup_interval_secs: 300,
            default_timeout_ms: 30_000,
            max_timeout_ms: 60_000,
            max_timeline_limit: 100,
            default_timeline_limit: 20,
            max_list_moves: 5,
            default_bump_event_types: vec![
                "m.room.message".to_string(),
                "m.room.encrypted".to_string(),
                "m.sticker".to_string(),
            ],
            strict_invariants: false,
            log: "warn".to_string(),
        }
    }
}

impl SlidingSyncConfig {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            info!("🔧 Loading sliding sync config from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(format!("failed to load config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections_per_user == 0 {
            return Err(Error::Config(
                "max_connections_per_user cannot be 0".into(),
            ));
        }
        if self.connection_timeout_secs == 0 {
            return Err(Error::Config("connection_timeout_secs cannot be 0".into()));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(Error::Config("cleanup_interval_secs cannot be 0".into()));
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            return Err(Error::Config(
                "default_timeout_ms cannot exceed max_timeout_ms".into(),
            ));
        }
        if self.default_timeline_limit > self.max_timeline_limit {
            return Err(Error::Config(
                "default_timeline_limit cannot exceed max_timeline_limit".into(),
            ));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Long-poll duration for a request asking for `requested_ms`.
    pub fn long_poll_timeout(&self, requested_ms: Option<u64>) -> Duration {
        Duration::from_millis(
            requested_ms
                .unwrap_or(self.default_timeout_ms)
                .min(self.max_timeout_ms),
        )
    }
}
