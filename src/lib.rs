//! Core wire protocols and session engine for BLE lock control.
//!
//! This crate speaks two device families over a GATT write/notify channel:
//!
//! * **G-Series** ("Bander V11") — AES-128 encrypted envelopes inside a
//!   `0xF1 0x1F ... 0xF2 0x2F` framed command and a `0xF3 0x3F ... 0xF4 0x4F`
//!   framed response, plus an occasional 3-byte short ACK.
//! * **TT-Series** ("TOTARGET A7") — a compact `ENC LEN BODY CRC8` frame
//!   that is either sent in the clear or AES-128-ECB encrypted.
//!
//! BLE scanning, platform GATT discovery/permissions, and any SDK facade are
//! deliberately outside this crate: callers provide a [`transport::Transport`]
//! implementation and this crate does the rest — codec, reassembly, and the
//! per-device [`session::Session`] state machine.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod reassembly;
pub mod selector;
pub mod session;
pub mod time;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use selector::{select_protocol, ProtocolVariant};
pub use session::Session;
pub use types::{ConnectionState, Credentials, DeviceStatus, LockState};
