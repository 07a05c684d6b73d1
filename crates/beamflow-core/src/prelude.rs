/*!
 * Prelude module for Beamflow Core.
 *
 * This module re-exports commonly used types and functions from the
 * beamflow core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Metadata, SharedValue, Value};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
