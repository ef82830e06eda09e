//! Stable exit codes for `repairloop` commands.

/// The run reached `SUCCESS`, or `status` printed a report.
pub const OK: i32 = 0;
/// The run reached `FAILED`.
pub const FAILED: i32 = 1;
/// Configuration, I/O or other unexpected errors; no run outcome was recorded.
pub const FATAL: i32 = 2;
/// Interrupted by SIGINT/SIGTERM; the run is resumable.
pub const INTERRUPTED: i32 = 130;
