//! Stable exit codes for the `provisioner` CLI.

/// The job succeeded, or the command needed no job.
pub const OK: i32 = 0;
/// The job failed or was canceled, or the command itself failed.
pub const FAILED: i32 = 1;
/// The workspace already has an operation in flight.
pub const BUSY: i32 = 2;
