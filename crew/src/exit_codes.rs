//! Stable exit codes for the `crew` binary.

/// Every selected issue completed.
pub const OK: i32 = 0;
/// Fatal configuration error (missing token, bad arguments, unusable work dir).
pub const CONFIG: i32 = 1;
/// At least one pipeline run ended incomplete.
pub const INCOMPLETE: i32 = 2;
