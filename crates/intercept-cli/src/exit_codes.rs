//! Process exit codes. These are part of the public contract.

pub const SUCCESS: i32 = 0;
pub const FATAL_RESULT: i32 = 1; // A fatal-severity result fired and --break is on
pub const CONFIG_ERROR: i32 = 2; // Bad bundle, bad flags, unwritable output
pub const INTEGRITY_ERROR: i32 = 3; // --checksum mismatch
pub const FETCH_ERROR: i32 = 4; // Remote bundle could not be fetched

/// Exit code for an error that reached `main`.
pub fn for_error(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<intercept_core::InterceptError>()
        .map_or(CONFIG_ERROR, intercept_core::InterceptError::exit_code)
}
