//! The narrow GATT capability surface the session engine depends on (C6,
//! spec §4.6). BLE scanning, platform discovery, and permission handling
//! live outside this crate; callers implement [`Transport`] over whatever
//! platform BLE stack they have.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// Effective BLE write payload size; larger writes are chunked by
/// [`Transport::write`] implementations.
pub const MAX_WRITE_CHUNK: usize = 20;

/// Nordic UART Service base UUID prefix, preferred during discovery.
pub const NORDIC_UART_SERVICE_PREFIX: &str = "6e400001";

/// CCCD descriptor UUID (0x2902) used to enable notifications.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// Services a discovery pass must skip: generic-access/attribute,
/// device-info, battery, current-time, immediate-alert, and DFU.
pub const SKIPPED_SERVICE_PREFIXES: &[&str] = &[
    "00001800", // generic access
    "00001801", // generic attribute
    "0000180a", // device information
    "0000180f", // battery service
    "00001805", // current time service
    "00001802", // immediate alert
    "0000fe59", // Nordic DFU (SDK secure bootloader)
    "8ec90001", // Nordic legacy DFU
];

/// The service/characteristic triple the session writes to and listens on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GattEndpoint {
    pub service_uuid: Uuid,
    pub write_characteristic_uuid: Uuid,
    pub notify_characteristic_uuid: Uuid,
}

/// A link-level change reported out-of-band by the transport. The session
/// translates these into [`crate::ConnectionState`] transitions; on
/// `Dropped` it tears down polling and fails any pending response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Dropped { error: Option<String> },
}

/// The capability contract the session engine (C7) consumes. Implementors
/// own the real GATT link; this crate only calls these methods and
/// interprets their results.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the GATT link and runs service discovery, returning the
    /// chosen write/notify endpoint. Discovery must skip the services named
    /// in [`SKIPPED_SERVICE_PREFIXES`] and prefer a Nordic UART Service match.
    async fn connect(&self) -> Result<GattEndpoint>;

    /// Enables local notifications and writes the CCCD descriptor, waiting
    /// for the descriptor-write completion callback.
    async fn enable_notifications(&self, endpoint: &GattEndpoint) -> Result<()>;

    /// Writes `bytes` to the endpoint's write characteristic. Payloads over
    /// [`MAX_WRITE_CHUNK`] are chunked with an inter-chunk delay by the
    /// implementation. `with_response` selects GATT write-with-response
    /// (awaits completion) vs write-without-response (returns immediately).
    async fn write(&self, endpoint: &GattEndpoint, bytes: &[u8], with_response: bool) -> Result<()>;

    /// The stream of inbound notification payloads, in arrival order.
    fn inbound(&self) -> tokio_stream::wrappers::ReceiverStream<Vec<u8>>;

    /// Out-of-band link-level change notifications (connection drops,
    /// transport-detected errors). The session subscribes to this
    /// alongside `inbound` rather than polling a getter.
    fn connection_events(&self) -> tokio_stream::wrappers::ReceiverStream<ConnectionEvent>;

    /// Idempotent teardown of the GATT link.
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cccd_uuid_matches_the_standard_descriptor() {
        assert_eq!(CCCD_UUID.to_string(), "00002902-0000-1000-8000-00805f9b34fb");
    }
}
