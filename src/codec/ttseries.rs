//! TT-Series ("TOTARGET A7") frame codec (spec §3, §4.4).

use crate::crypto::{crc8_maxim, decrypt_zero_padded, encrypt_zero_padded};
use crate::types::AesKey;

pub const ENC_PLAIN: u8 = 0x01;
pub const ENC_AES: u8 = 0x11;

pub const CMD_CALIBRATE_TIME: u8 = 0x20;
pub const CMD_CHECK_VERSION: u8 = 0x21;
pub const CMD_SET_WORK_MODE: u8 = 0x29;
pub const CMD_CHECK_STATUS: u8 = 0x12;
pub const CMD_LOCK: u8 = 0x31;
pub const CMD_UNLOCK: u8 = 0x37;

pub const ASYNC_HEARTBEAT: u8 = 0x01;
pub const ASYNC_BROKE: u8 = 0x03;
pub const ASYNC_ROD_CUT: u8 = 0x04;
pub const ASYNC_OPENED: u8 = 0x05;

pub const RESP_CHECK_OK: u8 = 0x62;
pub const RESP_LOCK_SUCCESS: u8 = 0x80;
pub const RESP_LOCK_AGAIN: u8 = 0x81;
pub const RESP_UNLOCK_SUCCESS: u8 = 0x90;
pub const RESP_UNLOCK_AGAIN: u8 = 0x91;
pub const RESP_UNLOCK_WRONG_PASSWORD: u8 = 0x93;

pub const WORK_MODE_SLEEP: u8 = 0x30;
pub const WORK_MODE_REALTIME: u8 = 0x31;

const STATUS_CLASS_OPEN: u8 = 0x10;
const STATUS_CLASS_STANDBY: u8 = 0x20;
const STATUS_CLASS_NOT_READY: u8 = 0x30;
const STATUS_CLASS_SEALED: u8 = 0x40;
const STATUS_CLASS_LOCAL_SEALED: u8 = 0x50;
const STATUS_CLASS_UNSEALED: u8 = 0x60;
const STATUS_CLASS_ALARM: u8 = 0x70;
const STATUS_CLASS_CANCEL_ALARM: u8 = 0x90;
const STATUS_CLASS_ABNORMAL: u8 = 0xA0;

const ALARM_ROD_CUT: u8 = 0x01;
const ALARM_OPENED: u8 = 0x02;
const ALARM_SHELL: u8 = 0x04;
const ALARM_EMERGENCY: u8 = 0x08;

/// Converts an 8-digit decimal lock-id string to its 4-byte wire encoding:
/// `(first 4 digits as u16 BE) || (last 4 digits as u16 BE)`.
pub fn lock_id_to_bytes(lock_id: &str) -> Option<[u8; 4]> {
    if lock_id.len() != 8 || !lock_id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let high: u16 = lock_id[0..4].parse().ok()?;
    let low: u16 = lock_id[4..8].parse().ok()?;
    let mut out = [0u8; 4];
    out[0..2].copy_from_slice(&high.to_be_bytes());
    out[2..4].copy_from_slice(&low.to_be_bytes());
    Some(out)
}

/// Inverse of [`lock_id_to_bytes`].
pub fn lock_id_from_bytes(bytes: &[u8; 4]) -> String {
    let high = u16::from_be_bytes([bytes[0], bytes[1]]);
    let low = u16::from_be_bytes([bytes[2], bytes[3]]);
    format!("{high:04}{low:04}")
}

/// Encodes a password as exactly 6 ASCII bytes, right-padded with `'0'`.
fn password_bytes(password: &str) -> [u8; 6] {
    let mut out = [b'0'; 6];
    let bytes = password.as_bytes();
    let n = bytes.len().min(6);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn business_with_lock_id_password_datetime(cmd: u8, lock_id: &str, password: &str, datetime: [u8; 6]) -> Option<Vec<u8>> {
    let id = lock_id_to_bytes(lock_id)?;
    let pass = password_bytes(password);
    let mut out = Vec::with_capacity(1 + 4 + 6 + 6);
    out.push(cmd);
    out.extend_from_slice(&id);
    out.extend_from_slice(&pass);
    out.extend_from_slice(&datetime);
    Some(out)
}

pub fn business_lock(lock_id: &str, password: &str, datetime: [u8; 6]) -> Option<Vec<u8>> {
    business_with_lock_id_password_datetime(CMD_LOCK, lock_id, password, datetime)
}

pub fn business_unlock(lock_id: &str, password: &str, datetime: [u8; 6]) -> Option<Vec<u8>> {
    business_with_lock_id_password_datetime(CMD_UNLOCK, lock_id, password, datetime)
}

pub fn business_check_status(lock_id: &str, password: &str, datetime: [u8; 6]) -> Option<Vec<u8>> {
    business_with_lock_id_password_datetime(CMD_CHECK_STATUS, lock_id, password, datetime)
}

pub fn business_calibrate_time(datetime: [u8; 6]) -> Vec<u8> {
    let mut out = vec![CMD_CALIBRATE_TIME];
    out.extend_from_slice(&datetime);
    out
}

pub fn business_check_version(datetime: [u8; 6]) -> Vec<u8> {
    let mut out = vec![CMD_CHECK_VERSION];
    out.extend_from_slice(&datetime);
    out
}

pub fn business_set_work_mode(lock_id: &str, sleep: bool) -> Option<Vec<u8>> {
    let id = lock_id_to_bytes(lock_id)?;
    let mode = if sleep { WORK_MODE_SLEEP } else { WORK_MODE_REALTIME };
    let mut out = vec![CMD_SET_WORK_MODE];
    out.extend_from_slice(&id);
    out.push(mode);
    Some(out)
}

pub fn business_heartbeat_reply(lock_id: &str, datetime: [u8; 6]) -> Option<Vec<u8>> {
    let id = lock_id_to_bytes(lock_id)?;
    let mut out = vec![ASYNC_HEARTBEAT];
    out.extend_from_slice(&id);
    out.extend_from_slice(&datetime);
    Some(out)
}

fn build_frame(enc: u8, len: u8, wire_body: &[u8]) -> Vec<u8> {
    let mut mid = Vec::with_capacity(2 + wire_body.len());
    mid.push(enc);
    mid.push(len);
    mid.extend_from_slice(wire_body);
    let crc = crc8_maxim(&mid);
    mid.push(crc);
    mid
}

/// Builds an unencrypted frame. `business` is carried on the wire verbatim.
pub fn build_plain(business: &[u8]) -> Vec<u8> {
    build_frame(ENC_PLAIN, business.len() as u8, business)
}

/// Builds an AES-128-ECB encrypted frame. LEN is the *business-data*
/// length, not the on-wire (padded) body length.
pub fn build_encrypted(business: &[u8], key: &AesKey) -> Vec<u8> {
    let body = encrypt_zero_padded(business, key).expect("AesKey is always exactly 16 bytes");
    build_frame(ENC_AES, business.len() as u8, &body)
}

/// A successfully framed, decrypted-if-needed response payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedFrame {
    pub content: Vec<u8>,
}

/// Parses a frame previously extracted by [`crate::reassembly`]. CRC-8
/// mismatches are logged, not rejected — some devices emit incorrect CRCs
/// (spec §4.4, §7).
pub fn parse_response(bytes: &[u8], key: Option<&AesKey>) -> Option<ParsedFrame> {
    if bytes.len() < 3 {
        return None;
    }
    let enc = bytes[0];
    let len = bytes[1] as usize;
    let body_start = 2;

    let wire_body_len = match enc {
        ENC_AES => len.div_ceil(16) * 16,
        ENC_PLAIN => len,
        _ => return None,
    };

    let crc_pos = body_start + wire_body_len;
    if bytes.len() < crc_pos + 1 {
        return None;
    }

    let expected_crc = crc8_maxim(&bytes[..crc_pos]);
    if expected_crc != bytes[crc_pos] {
        log::warn!(
            target: "codec::ttseries",
            "CRC-8 mismatch on response frame (expected {:#04x}, got {:#04x}); accepting anyway",
            expected_crc, bytes[crc_pos]
        );
    }

    let wire_body = &bytes[body_start..crc_pos];
    let content = match enc {
        ENC_AES => {
            let key = key?;
            let decrypted = decrypt_zero_padded(wire_body, key).ok()?;
            if decrypted.len() < len {
                return None;
            }
            decrypted[..len].to_vec()
        }
        _ => wire_body.to_vec(),
    };

    Some(ParsedFrame { content })
}

/// `true` when `cmd_byte` (the first byte of decoded business data) names
/// an asynchronous device-initiated message rather than a command reply.
pub fn is_async_message(cmd_byte: u8) -> bool {
    matches!(cmd_byte, ASYNC_HEARTBEAT | ASYNC_BROKE | ASYNC_ROD_CUT | ASYNC_OPENED)
}

/// The decoded shape of a Lock / Unlock / Check-status reply.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusReply {
    pub response_code: u8,
    pub lock_id: String,
    pub battery_percent: u8,
    pub lock_status_byte: u8,
    pub op_source: u8,
    pub datetime: [u8; 6],
}

/// Decodes `CMD(1) || LockId(4) || Battery(1) || LockStatus(1) || Reserved(1)
/// || OpSource(1) || DateTime(6)`, bounds-checked against `content`.
pub fn decode_status_reply(content: &[u8]) -> Option<StatusReply> {
    if content.len() < 15 {
        return None;
    }
    let lock_id_bytes: [u8; 4] = content[1..5].try_into().ok()?;
    let datetime: [u8; 6] = content[9..15].try_into().ok()?;
    Some(StatusReply {
        response_code: content[0],
        lock_id: lock_id_from_bytes(&lock_id_bytes),
        battery_percent: content[5],
        lock_status_byte: content[6],
        op_source: content[8],
        datetime,
    })
}

/// A lock-status byte's alarm-class low-nibble bitset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlarmFlags(pub u8);

impl AlarmFlags {
    pub fn rod_cut(self) -> bool {
        self.0 & ALARM_ROD_CUT != 0
    }
    pub fn opened(self) -> bool {
        self.0 & ALARM_OPENED != 0
    }
    pub fn shell(self) -> bool {
        self.0 & ALARM_SHELL != 0
    }
    pub fn emergency(self) -> bool {
        self.0 & ALARM_EMERGENCY != 0
    }
}

/// The meaning of a `LockStatus` byte's high-nibble class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StatusOutcome {
    Locked,
    Unlocked,
    Unknown,
    Alarm(AlarmFlags),
}

/// Classifies a `LockStatus` byte per spec §3.
pub fn interpret_status(lock_status: u8) -> StatusOutcome {
    match lock_status & 0xF0 {
        STATUS_CLASS_SEALED | STATUS_CLASS_LOCAL_SEALED => StatusOutcome::Locked,
        STATUS_CLASS_UNSEALED | STATUS_CLASS_OPEN => StatusOutcome::Unlocked,
        STATUS_CLASS_ALARM => StatusOutcome::Alarm(AlarmFlags(lock_status & 0x0F)),
        STATUS_CLASS_STANDBY | STATUS_CLASS_NOT_READY | STATUS_CLASS_CANCEL_ALARM | STATUS_CLASS_ABNORMAL | _ => {
            StatusOutcome::Unknown
        }
    }
}

/// The meaning of a Lock/Unlock/Check-status reply's leading response code.
///
/// `already: true` on `LockConfirmed`/`UnlockConfirmed` marks the `_AGAIN`
/// codes (0x81/0x91) — the device reports an idempotent re-apply of a state
/// it was already in, distinct from a fresh transition (0x80/0x90). Spec §6
/// reserves `Session::lock`/`unlock`'s `Ok(false)` for exactly this case.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResponseOutcome {
    CheckOk,
    LockConfirmed { already: bool },
    UnlockConfirmed { already: bool },
    AuthenticationFailed,
    CommandFailed(u8),
}

/// Classifies a reply's response code per spec §3.
pub fn interpret_response_code(code: u8) -> ResponseOutcome {
    match code {
        RESP_CHECK_OK => ResponseOutcome::CheckOk,
        RESP_LOCK_SUCCESS => ResponseOutcome::LockConfirmed { already: false },
        RESP_LOCK_AGAIN => ResponseOutcome::LockConfirmed { already: true },
        RESP_UNLOCK_SUCCESS => ResponseOutcome::UnlockConfirmed { already: false },
        RESP_UNLOCK_AGAIN => ResponseOutcome::UnlockConfirmed { already: true },
        RESP_UNLOCK_WRONG_PASSWORD => ResponseOutcome::AuthenticationFailed,
        other => ResponseOutcome::CommandFailed(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: AesKey = *b"1234567890123456";
    const DATETIME: [u8; 6] = [0x24, 0x01, 0x02, 0x03, 0x04, 0x05];

    #[test]
    fn lock_id_round_trips_through_wire_bytes() {
        let bytes = lock_id_to_bytes("83181001").unwrap();
        assert_eq!(bytes, [0x20, 0x7E, 0x03, 0xE9]);
        assert_eq!(lock_id_from_bytes(&bytes), "83181001");
    }

    #[test]
    fn lock_id_rejects_non_digit_or_wrong_length() {
        assert!(lock_id_to_bytes("1234567").is_none());
        assert!(lock_id_to_bytes("123456789").is_none());
        assert!(lock_id_to_bytes("1234abcd").is_none());
    }

    #[test]
    fn password_is_right_padded_with_zero_digits() {
        assert_eq!(password_bytes("1"), *b"100000");
        assert_eq!(password_bytes("123456"), *b"123456");
    }

    #[test]
    fn build_lock_matches_the_reference_byte_layout() {
        let business = business_lock("83181001", "123456", DATETIME).unwrap();
        assert_eq!(
            business,
            vec![0x31, 0x20, 0x7E, 0x03, 0xE9, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x24, 0x01, 0x02, 0x03, 0x04, 0x05]
        );

        let frame = build_plain(&business);
        assert_eq!(frame[0], ENC_PLAIN);
        assert_eq!(frame[1], 17);
        assert_eq!(frame.len(), 2 + 17 + 1);
        let crc = crc8_maxim(&frame[..frame.len() - 1]);
        assert_eq!(*frame.last().unwrap(), crc);
    }

    #[test]
    fn build_encrypted_len_field_is_unpadded_business_length() {
        let business = business_lock("83181001", "123456", DATETIME).unwrap();
        let frame = build_encrypted(&business, &KEY);
        assert_eq!(frame[0], ENC_AES);
        assert_eq!(frame[1], business.len() as u8);
        let padded = business.len().div_ceil(16) * 16;
        assert_eq!(frame.len(), 2 + padded + 1);
    }

    #[test]
    fn round_trip_plain_frame_recovers_business_data() {
        let business = business_check_status("83181001", "123456", DATETIME).unwrap();
        let frame = build_plain(&business);
        let parsed = parse_response(&frame, None).unwrap();
        assert_eq!(parsed.content, business);
    }

    #[test]
    fn round_trip_encrypted_frame_recovers_business_data() {
        let business = business_lock("83181001", "123456", DATETIME).unwrap();
        let frame = build_encrypted(&business, &KEY);
        let parsed = parse_response(&frame, Some(&KEY)).unwrap();
        assert_eq!(parsed.content, business);
    }

    #[test]
    fn interpret_status_matches_scenarios() {
        assert_eq!(interpret_status(0x40), StatusOutcome::Locked);
        assert_eq!(interpret_status(0x60), StatusOutcome::Unlocked);
        assert_eq!(interpret_status(0x72), StatusOutcome::Alarm(AlarmFlags(0x02)));
        assert!(matches!(interpret_status(0x72), StatusOutcome::Alarm(f) if f.opened()));
        assert_eq!(interpret_status(0x30), StatusOutcome::Unknown);
    }

    #[test]
    fn interpret_response_code_classifies_known_codes() {
        assert_eq!(interpret_response_code(RESP_CHECK_OK), ResponseOutcome::CheckOk);
        assert_eq!(interpret_response_code(RESP_LOCK_SUCCESS), ResponseOutcome::LockConfirmed { already: false });
        assert_eq!(interpret_response_code(RESP_LOCK_AGAIN), ResponseOutcome::LockConfirmed { already: true });
        assert_eq!(interpret_response_code(RESP_UNLOCK_SUCCESS), ResponseOutcome::UnlockConfirmed { already: false });
        assert_eq!(interpret_response_code(RESP_UNLOCK_AGAIN), ResponseOutcome::UnlockConfirmed { already: true });
        assert_eq!(interpret_response_code(RESP_UNLOCK_WRONG_PASSWORD), ResponseOutcome::AuthenticationFailed);
        assert_eq!(interpret_response_code(0x82), ResponseOutcome::CommandFailed(0x82));
    }

    #[test]
    fn is_async_message_recognizes_upstream_opcodes() {
        assert!(is_async_message(ASYNC_HEARTBEAT));
        assert!(is_async_message(ASYNC_BROKE));
        assert!(!is_async_message(CMD_LOCK));
    }

    #[test]
    fn decode_status_reply_reads_fixed_layout() {
        let mut content = vec![RESP_LOCK_SUCCESS];
        content.extend_from_slice(&[0x20, 0x7E, 0x03, 0xE9]);
        content.push(77);
        content.push(0x40);
        content.push(0x00);
        content.push(0x01);
        content.extend_from_slice(&DATETIME);

        let reply = decode_status_reply(&content).unwrap();
        assert_eq!(reply.response_code, RESP_LOCK_SUCCESS);
        assert_eq!(reply.lock_id, "83181001");
        assert_eq!(reply.battery_percent, 77);
        assert_eq!(reply.lock_status_byte, 0x40);
        assert_eq!(reply.op_source, 0x01);
        assert_eq!(reply.datetime, DATETIME);
    }
}
