//! Configuration constants for the session-locked runner
//!
//! This module centralizes the timing parameters that govern session
//! liveness and loop cadence.

use std::time::Duration;

// ============================================================================
// Session Lifecycle
// ============================================================================

/// How long a session stays live after it is created or bumped
///
/// Sessions whose expiration has passed are treated as dead: their tasks
/// become eligible for pickup by other runners on the next rebalance. The
/// database's UTC clock is authoritative for this comparison, so the value
/// only needs to cover the longest expected gap between keep-alive bumps
/// plus clock skew between application hosts.
pub const SESSION_TTL: Duration = Duration::from_secs(120); // 2 minutes

/// How often the keep-alive loop bumps the session
///
/// Must stay below `SESSION_TTL / 2` so that a single missed or delayed bump
/// cannot let a live runner's session expire under load. The builder for
/// `RunnerConfig` enforces this relationship.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Work Loop
// ============================================================================

/// Upper bound on the random sleep taken before the first work tick
///
/// Instances deployed together tend to start at the same instant and would
/// otherwise collide on the serializing work lock on their first fetch. Each
/// runner sleeps a uniformly random duration in `[0, STARTUP_JITTER_MAX]`
/// before entering its work loop.
pub const STARTUP_JITTER_MAX: Duration = Duration::from_secs(10);
