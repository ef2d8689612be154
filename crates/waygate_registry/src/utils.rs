//! # Utility Functions
//!
//! Small helpers shared by every Waygate component. Kept deliberately tiny:
//! the only thing all components genuinely share is how they read the clock.

// ============================================================================
// Utility Functions
// ============================================================================

/// Returns the current Unix timestamp in milliseconds.
///
/// All record timestamps (`created_at`, `last_write_at`, `last_heartbeat_at`)
/// use this function so that liveness math compares like with like. Code that
/// needs testable expiry arithmetic should take a `now` parameter and only
/// call this at the outermost layer.
///
/// # Panics
///
/// Panics if the system clock is set to a time before the Unix epoch
/// (January 1, 1970). This should never happen in practice on modern systems.
pub fn current_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
