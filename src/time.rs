//! Time/serial/nonce helpers shared by both codecs (spec §4.2).
//!
//! The G-Series monotonic serial counter is, per the protocol notes, a
//! process-wide stateful singleton. We keep that shape but make the clock an
//! injectable [`SerialClock`] trait so tests can supply deterministic values
//! instead of reading the wall clock.

use std::sync::{Mutex, OnceLock};

use chrono::{Datelike, Timelike};

fn bcd_byte(value: u32) -> u8 {
    (((value / 10) % 10) as u8) << 4 | (value % 10) as u8
}

/// Encodes `[YY MM DD hh mm ss]` as BCD bytes, each field `(tens<<4)|ones`.
pub fn bcd6_from_parts(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> [u8; 6] {
    [
        bcd_byte((year.rem_euclid(100)) as u32),
        bcd_byte(month),
        bcd_byte(day),
        bcd_byte(hour),
        bcd_byte(minute),
        bcd_byte(second),
    ]
}

/// Returns the current local time as a 6-byte BCD timestamp.
pub fn now_bcd6() -> [u8; 6] {
    let now = chrono::Local::now();
    bcd6_from_parts(
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
    )
}

/// Supplies the 6 bytes behind `serial_next()`. Implementations must track
/// monotonicity themselves; the default wall-clock implementation logs (not
/// fails) when it observes a non-increasing value.
pub trait SerialClock: Send + Sync {
    fn next(&self) -> [u8; 6];
}

struct WallClockSerial {
    last: Mutex<[u8; 6]>,
}

impl SerialClock for WallClockSerial {
    fn next(&self) -> [u8; 6] {
        let value = now_bcd6();
        let mut last = self.last.lock().expect("serial clock mutex poisoned");
        if *last != [0u8; 6] && value <= *last {
            log::warn!(
                target: "time",
                "G-Series serial counter did not advance (prev {:02x?}, now {:02x?})",
                *last, value
            );
        }
        *last = value;
        value
    }
}

static DEFAULT_SERIAL_CLOCK: OnceLock<WallClockSerial> = OnceLock::new();

/// The process-wide wall-clock [`SerialClock`] singleton. `codec::gseries`
/// builders fall back to this when no clock is explicitly injected.
pub(crate) fn default_serial_clock() -> &'static dyn SerialClock {
    DEFAULT_SERIAL_CLOCK.get_or_init(|| WallClockSerial { last: Mutex::new([0u8; 6]) })
}

/// Returns the next 6-byte serial value from the process-wide wall-clock
/// counter. Use [`SerialClock`] directly (e.g. in `codec::gseries` builders
/// taking an injected clock) to avoid the global in tests.
pub fn serial_next() -> [u8; 6] {
    default_serial_clock().next()
}

/// Returns 4 bytes of anti-replay padding. Not cryptographically sensitive;
/// the wire protocol treats this purely as a replay-detection nonce.
pub fn nonce_random() -> [u8; 4] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_encodes_each_field_as_bcd_nibbles() {
        let bytes = bcd6_from_parts(2024, 1, 2, 3, 4, 5);
        assert_eq!(bytes, [0x24, 0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn bcd_wraps_year_to_two_digits() {
        let bytes = bcd6_from_parts(2099, 12, 31, 23, 59, 59);
        assert_eq!(bytes, [0x99, 0x12, 0x31, 0x23, 0x59, 0x59]);
    }

    #[test]
    fn nonce_is_four_bytes() {
        let nonce = nonce_random();
        assert_eq!(nonce.len(), 4);
    }

    struct FixedClock(std::sync::Mutex<u8>);
    impl SerialClock for FixedClock {
        fn next(&self) -> [u8; 6] {
            let mut n = self.0.lock().unwrap();
            *n += 1;
            [0, 0, 0, 0, 0, *n]
        }
    }

    #[test]
    fn injected_clock_is_independent_of_the_global_one() {
        let clock = FixedClock(std::sync::Mutex::new(0));
        assert_eq!(clock.next(), [0, 0, 0, 0, 0, 1]);
        assert_eq!(clock.next(), [0, 0, 0, 0, 0, 2]);
    }
}
