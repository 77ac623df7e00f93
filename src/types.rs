//! Data model shared by the codecs and the session engine (spec §3).

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::selector::ProtocolVariant;

/// A 16-byte AES-128 key.
pub type AesKey = [u8; 16];

/// Observable lock state. `Unknown` is a legitimate transient value, not an
/// error — see the debounce rule in the session engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockState {
    Locked,
    Unlocked,
    Unknown,
}

/// Per-session connection lifecycle. `Disconnected` and `Error` are
/// terminal: recovering from either requires building a new [`crate::Session`].
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// A point-in-time snapshot of everything a caller typically wants to show
/// in a UI.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceStatus {
    pub lock_state: LockState,
    /// `None` means the battery level has never been observed.
    pub battery_percent: Option<u8>,
    pub is_connected: bool,
    pub rssi: Option<i16>,
    pub last_updated_epoch_ms: u64,
}

/// Immutable credential bundle. The protocol variant is implied by which
/// constructor built it; there is no separate "kind" field to fall out of
/// sync with the payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Credentials {
    GSeries {
        key: AesKey,
        password: Option<String>,
        created_at: Instant,
    },
    TtSeries {
        /// 8 ASCII decimal digits, or `"00000000"` for auto-detect.
        lock_id: String,
        /// 1-6 ASCII decimal digits.
        password: String,
        key: Option<AesKey>,
        created_at: Instant,
    },
}

/// Sentinel TT-Series lock-id meaning "auto-detect from the advertised name".
pub const TT_AUTO_DETECT_LOCK_ID: &str = "00000000";

impl Credentials {
    /// Builds G-Series credentials. `password`, if present, must be 4-16
    /// characters.
    pub fn g_series(key: AesKey, password: Option<String>) -> Result<Self> {
        if let Some(ref p) = password {
            if !(4..=16).contains(&p.len()) {
                return Err(Error::InvalidCredentials(format!(
                    "G-Series password must be 4-16 characters, got {}",
                    p.len()
                )));
            }
        }
        Ok(Credentials::GSeries { key, password, created_at: Instant::now() })
    }

    /// Builds TT-Series credentials. `lock_id` must be 8 ASCII digits (or
    /// the auto-detect sentinel); `password` must be 1-6 ASCII digits.
    pub fn tt_series(lock_id: String, password: String, key: Option<AesKey>) -> Result<Self> {
        if lock_id.len() != 8 || !lock_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidCredentials(format!(
                "TT-Series lock-id must be 8 ASCII digits, got {:?}",
                lock_id
            )));
        }
        if !(1..=6).contains(&password.len()) || !password.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidCredentials(format!(
                "TT-Series password must be 1-6 ASCII digits, got {:?}",
                password
            )));
        }
        Ok(Credentials::TtSeries { lock_id, password, key, created_at: Instant::now() })
    }

    pub fn variant(&self) -> ProtocolVariant {
        match self {
            Credentials::GSeries { .. } => ProtocolVariant::GSeries,
            Credentials::TtSeries { .. } => ProtocolVariant::TtSeries,
        }
    }

    /// Rejects credentials older than `max_age`. Callers decide the
    /// validity window; the crate has no opinion beyond exposing `created_at`.
    pub fn check_not_expired(&self, max_age: Duration) -> Result<()> {
        let created_at = match self {
            Credentials::GSeries { created_at, .. } => *created_at,
            Credentials::TtSeries { created_at, .. } => *created_at,
        };
        if created_at.elapsed() > max_age {
            return Err(Error::InvalidCredentials("credentials exceed the configured validity window".into()));
        }
        Ok(())
    }

    /// `true` when this is TT-Series credentials carrying the auto-detect
    /// sentinel lock-id.
    pub fn needs_lock_id_detection(&self) -> bool {
        matches!(self, Credentials::TtSeries { lock_id, .. } if lock_id == TT_AUTO_DETECT_LOCK_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn g_series_password_length_bounds() {
        let key = [0u8; 16];
        assert!(Credentials::g_series(key, Some("abc".into())).is_err());
        assert!(Credentials::g_series(key, Some("abcd".into())).is_ok());
        assert!(Credentials::g_series(key, Some("a".repeat(16))).is_ok());
        assert!(Credentials::g_series(key, Some("a".repeat(17))).is_err());
        assert!(Credentials::g_series(key, None).is_ok());
    }

    #[test]
    fn tt_series_lock_id_must_be_eight_digits() {
        assert!(Credentials::tt_series("1234567".into(), "1".into(), None).is_err());
        assert!(Credentials::tt_series("123456789".into(), "1".into(), None).is_err());
        assert!(Credentials::tt_series("1234abcd".into(), "1".into(), None).is_err());
        assert!(Credentials::tt_series("12345678".into(), "1".into(), None).is_ok());
    }

    #[test]
    fn tt_series_password_must_be_one_to_six_digits() {
        assert!(Credentials::tt_series("12345678".into(), "".into(), None).is_err());
        assert!(Credentials::tt_series("12345678".into(), "1234567".into(), None).is_err());
        assert!(Credentials::tt_series("12345678".into(), "123456".into(), None).is_ok());
    }

    #[test]
    fn auto_detect_sentinel_is_recognized() {
        let creds = Credentials::tt_series(TT_AUTO_DETECT_LOCK_ID.into(), "1234".into(), None).unwrap();
        assert!(creds.needs_lock_id_detection());

        let creds = Credentials::tt_series("83181001".into(), "1234".into(), None).unwrap();
        assert!(!creds.needs_lock_id_detection());
    }
}
