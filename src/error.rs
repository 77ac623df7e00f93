//! The single error type returned by every fallible operation in this crate.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Semantic error kinds a caller of [`crate::Session`] can observe.
///
/// Codec-level parsing never panics and rarely returns `Err` directly —
/// malformed frames are handled by returning `None` from the codec and
/// letting the session engine decide whether that degrades to a cached
/// fallback or one of the variants below (see `session` module docs).
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("command failed{}", code.map(|c| format!(" (code {:#04x})", c)).unwrap_or_default())]
    CommandFailed { code: Option<u8> },

    #[error("operation '{operation}' timed out")]
    Timeout { operation: &'static str },

    #[error("device not found: {address}")]
    DeviceNotFound { address: String },

    #[error("permission denied: {permission}")]
    PermissionDenied { permission: String },

    #[error("unsupported protocol")]
    UnsupportedProtocol,

    #[error("decoding error: {reason}")]
    Decoding { reason: String },
}

impl Error {
    pub fn command_failed(code: u8) -> Self {
        Error::CommandFailed { code: Some(code) }
    }

    pub fn command_failed_unknown() -> Self {
        Error::CommandFailed { code: None }
    }

    pub fn decoding(reason: impl Into<String>) -> Self {
        Error::Decoding { reason: reason.into() }
    }

    pub fn timeout(operation: &'static str) -> Self {
        Error::Timeout { operation }
    }
}

/// A lighter-weight label attached to [`Error::Timeout`] describing which
/// suspension point (§5 of the protocol notes) expired.
pub mod operation {
    pub const CONNECT: &str = "connect";
    pub const DESCRIPTOR_WRITE: &str = "descriptor_write";
    pub const WRITE_COMPLETION: &str = "write_completion";
    pub const RESPONSE_WAIT: &str = "response_wait";
    pub const HEARTBEAT_REPLY: &str = "heartbeat_reply";
}
