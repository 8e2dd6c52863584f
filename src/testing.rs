//! Hooks for deterministic teardown in tests.

use crate::backend;

/// Returns true if no backend exists, neither referenced nor in the unused cache.
pub fn backends_empty() -> bool {
    backend::backends_empty()
}

/// Schedules every backend in the unused cache for destruction.
pub fn clear_unused() {
    backend::clear_unused()
}
