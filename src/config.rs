//! Tunables for the session engine (spec §4.7, §5, §10.2).
//!
//! Every `Duration` the engine waits on is named here; nothing in
//! `session` hardcodes a timeout literal.

use std::time::Duration;

/// Timing configuration for a [`crate::Session`]. `Default` matches the
/// values named throughout the protocol notes.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Upper bound on GATT connect + service discovery.
    pub connect_timeout: Duration,
    /// Upper bound on the CCCD descriptor-write completion callback.
    pub descriptor_write_timeout: Duration,
    /// Upper bound on a single characteristic write's completion callback.
    pub write_completion_timeout: Duration,
    /// Upper bound on waiting for a correlated response frame.
    pub response_wait_timeout: Duration,
    /// Upper bound on sending a TT-Series heartbeat reply.
    pub heartbeat_reply_timeout: Duration,
    /// Minimum delay enforced between two TT-Series commands.
    pub command_pacing: Duration,
    /// Delay between consecutive ≤20-byte write chunks.
    pub chunk_pacing: Duration,
    /// Status-polling interval while connected, G-Series.
    pub polling_interval_g_series: Duration,
    /// Status-polling interval while connected, TT-Series.
    pub polling_interval_tt_series: Duration,
    /// Attempts for the initial-connect and polling status query retries.
    pub connect_query_attempts: u32,
    /// Delay between connect-time status query retries.
    pub connect_query_retry_delay: Duration,
    /// Attempts for a single polling cycle's status query.
    pub polling_query_attempts: u32,
    /// Delay before the re-query issued after a G-Series result code 0x11.
    pub verify_retry_delay: Duration,
    /// Window after a successful command during which an UNKNOWN query
    /// result is overridden by the last commanded state.
    pub unknown_debounce_window: Duration,
    /// How long a cached lock-state observation remains valid as a fallback
    /// for `query_lock_status` when a fresh probe fails.
    pub cached_state_validity: Duration,
    /// Number of consecutive parse failures that stop the polling loop
    /// (commands remain allowed).
    pub max_consecutive_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            connect_timeout: Duration::from_secs(15),
            descriptor_write_timeout: Duration::from_secs(3),
            write_completion_timeout: Duration::from_secs(5),
            response_wait_timeout: Duration::from_secs(8),
            heartbeat_reply_timeout: Duration::from_secs(3),
            command_pacing: Duration::from_millis(500),
            chunk_pacing: Duration::from_millis(100),
            polling_interval_g_series: Duration::from_secs(5),
            polling_interval_tt_series: Duration::from_secs(10),
            connect_query_attempts: 3,
            connect_query_retry_delay: Duration::from_secs(1),
            polling_query_attempts: 2,
            verify_retry_delay: Duration::from_millis(1500),
            unknown_debounce_window: Duration::from_secs(2),
            cached_state_validity: Duration::from_secs(30),
            max_consecutive_failures: 5,
        }
    }
}
