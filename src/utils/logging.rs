// =============================================================================
// Matrixon Matrix NextServer - Logging Setup Module
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
//   Global tracing subscriber for embedders of the proxy.
//
// =============================================================================

use tracing_subscriber::{prelude::*, EnvFilter};

/// Build the filter for `directive`, falling back to `warn` when it does not parse.
pub fn env_filter(directive: &str) -> EnvFilter {
    match EnvFilter::try_new(directive) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Invalid log filter {directive:?}, falling back to warn: {e}");
            EnvFilter::new("warn")
        }
    }
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(directive: &str) -> bool {
    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter(directive))
        .with(tracing_subscriber::fmt::Layer::new());

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
