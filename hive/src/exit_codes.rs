//! Stable exit codes for hive CLI commands.

/// Command succeeded; a summoned agent finished `done`.
pub const OK: i32 = 0;
/// Invalid layout/config or another error.
pub const INVALID: i32 = 1;
/// A summoned agent was reaped before completing.
pub const REAPED: i32 = 2;
/// A summoned agent stopped to wait for input.
pub const WAITING: i32 = 3;
