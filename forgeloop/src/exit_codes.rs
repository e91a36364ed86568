//! Stable exit codes for the `forgeloop` binary.

/// The run terminated with a successful outcome, or a non-run command succeeded.
pub const OK: i32 = 0;
/// Invalid input or configuration, or an environment failure (no shell,
/// unusable workspace, generator unavailable without fallback).
pub const INVALID: i32 = 1;
/// The iteration budget was spent without a termination signal.
pub const EXHAUSTED: i32 = 2;
/// The run terminated without success (critical error or termination phrase).
pub const TERMINATED_FAILURE: i32 = 3;
/// The run was interrupted by Ctrl-C.
pub const CANCELLED: i32 = 4;
