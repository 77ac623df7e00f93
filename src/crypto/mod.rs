//! Crypto primitives shared by both codecs (spec §4.1).
//!
//! Nothing here knows about frame layout; `codec::gseries` and
//! `codec::ttseries` are the only callers.

mod aes_ecb;
mod crc16_ccitt;
mod crc8_maxim;
mod sun_check;

pub use aes_ecb::{decrypt_zero_padded, encrypt_zero_padded, KeyLeniency};
pub use crc16_ccitt::crc16_ccitt;
pub use crc8_maxim::crc8_maxim;
pub use sun_check::sun_check;
