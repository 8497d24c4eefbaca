//! Process-wide debugging toggles for deterministic race testing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Microseconds to sleep inside the client request handler while its lock is
/// held. 0 means no sleep.
static HANDLE_CLI_REQ_SLEEP_US: AtomicU64 = AtomicU64::new(0);

/// When true, the per-peer reconnection backoff timer is bypassed.
static DISABLE_RECONN_BACKOFF: AtomicBool = AtomicBool::new(false);

/// Sets the client request handler sleep, in microseconds.
pub fn set_handle_cli_req_sleep_us(us: u64) {
    HANDLE_CLI_REQ_SLEEP_US.store(us, Ordering::Relaxed);
}

/// Current client request handler sleep, in microseconds.
pub fn handle_cli_req_sleep_us() -> u64 {
    HANDLE_CLI_REQ_SLEEP_US.load(Ordering::Relaxed)
}

/// Enables or disables the reconnection backoff bypass.
pub fn set_disable_reconn_backoff(disable: bool) {
    DISABLE_RECONN_BACKOFF.store(disable, Ordering::Relaxed);
}

/// True if the reconnection backoff timer is currently bypassed.
pub fn reconn_backoff_disabled() -> bool {
    DISABLE_RECONN_BACKOFF.load(Ordering::Relaxed)
}
