//! Protocol selection (C8, spec §4.8/§6).
//!
//! Pure functions only: no I/O, no state. The session engine and any outer
//! facade call these to decide which codec variant a device speaks.

use crate::types::Credentials;

/// Which wire protocol a session should speak.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVariant {
    GSeries,
    TtSeries,
}

const G_SERIES_NAME_HINTS: &[&str] = &["g4-", "g-lock", "gseries", "imz", "bander"];

/// Selects the protocol variant for a device. An explicit credentials
/// variant always wins over name inference; `scanned_name` only matters
/// when the caller needs name-based auto-detection (see
/// [`detect_lock_id_from_name`]) and is otherwise unused here, since the
/// credentials already carry an explicit variant tag.
pub fn select_protocol(credentials: &Credentials, _scanned_name: Option<&str>) -> ProtocolVariant {
    credentials.variant()
}

/// Recognizes a TT-Series lock-id encoded directly as the advertised name:
/// exactly 8 ASCII decimal digits. Returns `None` for anything else,
/// including names that merely contain digits.
pub fn detect_lock_id_from_name(name: &str) -> Option<String> {
    if name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit()) {
        Some(name.to_string())
    } else {
        None
    }
}

/// Secondary signal: does `name` contain one of the known G-Series hint
/// substrings? Case-insensitive, since advertised names vary in casing.
pub fn looks_like_g_series_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    G_SERIES_NAME_HINTS.iter().any(|hint| lower.contains(hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_eight_digit_names_as_lock_ids() {
        assert_eq!(detect_lock_id_from_name("83181001"), Some("83181001".to_string()));
        assert_eq!(detect_lock_id_from_name("8318100"), None);
        assert_eq!(detect_lock_id_from_name("831810012"), None);
        assert_eq!(detect_lock_id_from_name("8318100a"), None);
    }

    #[test]
    fn recognizes_g_series_hint_words_case_insensitively() {
        assert!(looks_like_g_series_name("BANDER-V11"));
        assert!(looks_like_g_series_name("my-g-lock-42"));
        assert!(!looks_like_g_series_name("totarget-a7"));
    }

    #[test]
    fn credentials_variant_always_wins_over_name() {
        let creds = Credentials::tt_series("12345678".into(), "1234".into(), None).unwrap();
        assert_eq!(select_protocol(&creds, Some("bander-hint")), ProtocolVariant::TtSeries);
    }
}
