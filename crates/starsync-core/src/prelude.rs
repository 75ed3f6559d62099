/*!
 * Prelude module for starsync core.
 *
 * Re-exports commonly used types and functions from the core crate to make
 * them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Metadata, Value};

// Re-export event types
pub use crate::event::{Event, EventBus, SharedEventBus, SubscriptionId};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{spawn_and_log, spawn_task, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
