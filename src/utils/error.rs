// =============================================================================
// Matrixon Matrix NextServer - Invariant Checking Module
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
//   Runtime invariant checks. In strict mode a violation fails the turn,
//   otherwise it is logged and the caller recovers.
//
// =============================================================================

use tracing::error;

use crate::{Error, Result};

/// Check `holds`. A violation is always logged; it becomes an
/// `InvariantViolation` error only when `strict` is set.
pub fn check_invariant(strict: bool, holds: bool, context: &str) -> Result<()> {
    if holds {
        return Ok(());
    }
    error!("❌ Invariant violated: {}", context);
    if strict {
        return Err(Error::InvariantViolation(context.to_owned()));
    }
    Ok(())
}
