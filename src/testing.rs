//! In-memory test doubles (C12, spec §10.4). Enabled under `#[cfg(test)]`
//! or the `testing` feature so integration tests elsewhere in the
//! workspace can depend on this crate's fakes without duplicating them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{ConnectionEvent, GattEndpoint, Transport};

/// A channel-backed [`Transport`] double. Tests drive it by pushing bytes
/// into `inbound` and reading what the session wrote via `written`.
pub struct FakeTransport {
    endpoint: GattEndpoint,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    written: Mutex<Vec<Vec<u8>>>,
    write_count: AtomicUsize,
    write_notify: Notify,
    connect_should_fail: Mutex<bool>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(16);
        FakeTransport {
            endpoint: GattEndpoint {
                service_uuid: Uuid::nil(),
                write_characteristic_uuid: Uuid::from_u128(1),
                notify_characteristic_uuid: Uuid::from_u128(2),
            },
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            written: Mutex::new(Vec::new()),
            write_count: AtomicUsize::new(0),
            write_notify: Notify::new(),
            connect_should_fail: Mutex::new(false),
        }
    }

    /// Pushes a notification payload to the session as if the device sent it.
    pub async fn push_notification(&self, bytes: Vec<u8>) {
        let _ = self.inbound_tx.send(bytes).await;
    }

    /// Simulates a link drop.
    pub async fn drop_link(&self, error: Option<String>) {
        let _ = self.events_tx.send(ConnectionEvent::Dropped { error }).await;
    }

    /// Returns every frame written so far, in order.
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.written.lock().expect("fake transport mutex poisoned").clone()
    }

    /// Makes the next `connect()` call fail, simulating a discovery timeout.
    pub fn fail_next_connect(&self) {
        *self.connect_should_fail.lock().expect("fake transport mutex poisoned") = true;
    }

    /// Waits (without consuming virtual time, so it composes with
    /// `start_paused` tests) until at least `n` writes have been recorded.
    /// Used by session-engine tests to synchronize a scripted reply with the
    /// command that should trigger it, instead of racing on write timing.
    pub async fn wait_for_write_count(&self, n: usize) {
        loop {
            if self.write_count.load(Ordering::Acquire) >= n {
                return;
            }
            self.write_notify.notified().await;
            // Loop back around: notify_one may have fired for a count that
            // still isn't `n` yet, or this waiter may have raced a stored
            // permit from a prior write.
        }
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<GattEndpoint> {
        let mut should_fail = self.connect_should_fail.lock().expect("fake transport mutex poisoned");
        if *should_fail {
            *should_fail = false;
            return Err(Error::ConnectionFailed("fake transport: forced failure".into()));
        }
        Ok(self.endpoint.clone())
    }

    async fn enable_notifications(&self, _endpoint: &GattEndpoint) -> Result<()> {
        Ok(())
    }

    async fn write(&self, _endpoint: &GattEndpoint, bytes: &[u8], _with_response: bool) -> Result<()> {
        self.written.lock().expect("fake transport mutex poisoned").push(bytes.to_vec());
        self.write_count.fetch_add(1, Ordering::AcqRel);
        self.write_notify.notify_one();
        Ok(())
    }

    fn inbound(&self) -> ReceiverStream<Vec<u8>> {
        let rx = self.inbound_rx.lock().expect("fake transport mutex poisoned").take()
            .expect("FakeTransport::inbound() called more than once");
        ReceiverStream::new(rx)
    }

    fn connection_events(&self) -> ReceiverStream<ConnectionEvent> {
        let rx = self.events_rx.lock().expect("fake transport mutex poisoned").take()
            .expect("FakeTransport::connection_events() called more than once");
        ReceiverStream::new(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Lets a test hand a [`Session`](crate::session::Session) its own `Arc`
/// clone of a [`FakeTransport`] while keeping a second handle to drive
/// notifications/link-drops and inspect writes after construction.
#[async_trait]
impl Transport for std::sync::Arc<FakeTransport> {
    async fn connect(&self) -> Result<GattEndpoint> {
        (**self).connect().await
    }

    async fn enable_notifications(&self, endpoint: &GattEndpoint) -> Result<()> {
        (**self).enable_notifications(endpoint).await
    }

    async fn write(&self, endpoint: &GattEndpoint, bytes: &[u8], with_response: bool) -> Result<()> {
        (**self).write(endpoint, bytes, with_response).await
    }

    fn inbound(&self) -> ReceiverStream<Vec<u8>> {
        (**self).inbound()
    }

    fn connection_events(&self) -> ReceiverStream<ConnectionEvent> {
        (**self).connection_events()
    }

    async fn disconnect(&self) -> Result<()> {
        (**self).disconnect().await
    }
}

/// A [`crate::time::SerialClock`] that returns caller-supplied values in
/// order, for deterministic encrypted-frame tests.
pub struct ScriptedSerialClock {
    values: Mutex<std::collections::VecDeque<[u8; 6]>>,
}

impl ScriptedSerialClock {
    pub fn new(values: impl IntoIterator<Item = [u8; 6]>) -> Self {
        ScriptedSerialClock { values: Mutex::new(values.into_iter().collect()) }
    }
}

impl crate::time::SerialClock for ScriptedSerialClock {
    fn next(&self) -> [u8; 6] {
        self.values.lock().expect("scripted clock mutex poisoned").pop_front().unwrap_or([0; 6])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_transport_records_writes_and_replays_notifications() {
        let transport = FakeTransport::new();
        let endpoint = transport.connect().await.unwrap();
        transport.write(&endpoint, &[1, 2, 3], true).await.unwrap();
        assert_eq!(transport.written_frames(), vec![vec![1, 2, 3]]);

        transport.push_notification(vec![9, 9]).await;
        use tokio_stream::StreamExt;
        let mut inbound = transport.inbound();
        assert_eq!(inbound.next().await, Some(vec![9, 9]));
    }

    #[tokio::test]
    async fn forced_connect_failure_happens_once() {
        let transport = FakeTransport::new();
        transport.fail_next_connect();
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
    }
}
