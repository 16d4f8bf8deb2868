//! Stable exit codes for `stepwise` CLI commands.

/// Command succeeded; for `stepwise run --task`, every step completed or was skipped.
pub const OK: i32 = 0;
/// Command failed due to invalid config, a capability failure, cancellation or other errors.
pub const FAILED: i32 = 1;
/// The plan could not be normalized, even after repair.
pub const INVALID_PLAN: i32 = 2;
/// The run finished but a step was blocked.
pub const INCOMPLETE: i32 = 3;
