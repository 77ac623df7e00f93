//! Per-device session state machine (C7, spec §4.7, §5).
//!
//! Each [`Session`] owns one reassembly buffer, one pending-response slot,
//! and two background tasks: an inbound pump (notifications + link-drop
//! events) and a status-polling loop. Commands are serialized by an async
//! mutex; at most one may be in flight.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::codec::{gseries, ttseries};
use crate::config::SessionConfig;
use crate::error::{operation, Error, Result};
use crate::reassembly::ReassemblyBuffer;
use crate::selector::{detect_lock_id_from_name, ProtocolVariant};
use crate::transport::{ConnectionEvent, GattEndpoint, Transport};
use crate::types::{AesKey, ConnectionState, Credentials, DeviceStatus, LockState, TT_AUTO_DETECT_LOCK_ID};

/// A frame that satisfied the pending-response slot, still tagged with
/// which codec produced it (a `Session` only ever speaks one protocol, so
/// callers match on the arm they expect and treat the other as a bug).
enum CorrelatedFrame {
    GSeries(gseries::ParsedResponse),
    TtSeries(Vec<u8>),
}

struct Shared<T: Transport + 'static> {
    transport: T,
    credentials: Credentials,
    config: SessionConfig,
    variant: ProtocolVariant,

    endpoint: Mutex<Option<GattEndpoint>>,
    reassembly: Mutex<ReassemblyBuffer>,
    pending: Mutex<Option<oneshot::Sender<CorrelatedFrame>>>,
    command_lock: tokio::sync::Mutex<()>,
    last_command_at: Mutex<Option<Instant>>,

    lock_state_tx: watch::Sender<LockState>,
    connection_state_tx: watch::Sender<ConnectionState>,

    cached_lock_state: Mutex<Option<(LockState, Instant)>>,
    last_commanded_state: Mutex<Option<(LockState, Instant)>>,
    consecutive_failures: AtomicU32,
    polling_enabled: AtomicBool,

    detected_lock_id: Mutex<Option<String>>,
    battery: Mutex<Option<u8>>,

    pump_handle: Mutex<Option<JoinHandle<()>>>,
    polling_handle: Mutex<Option<JoinHandle<()>>>,
}

/// A live BLE lock connection speaking either G-Series or TT-Series.
///
/// Cheaply cloneable: clones share the same background tasks and
/// observable state (it's an `Arc` handle, not a second session).
pub struct Session<T: Transport + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport + 'static> Clone for Session<T> {
    fn clone(&self) -> Self {
        Session { shared: self.shared.clone() }
    }
}

impl<T: Transport + 'static> Session<T> {
    /// Builds a session for `credentials` over `transport`. `scanned_name`
    /// is consulted only when `credentials` carries the TT-Series
    /// auto-detect sentinel lock-id; an explicit lock-id always wins.
    pub fn new(transport: T, credentials: Credentials, config: SessionConfig, scanned_name: Option<&str>) -> Self {
        let variant = credentials.variant();

        let detected_lock_id = match &credentials {
            Credentials::TtSeries { lock_id, .. } if lock_id == TT_AUTO_DETECT_LOCK_ID => {
                scanned_name.and_then(detect_lock_id_from_name)
            }
            _ => None,
        };

        let reassembly = match variant {
            ProtocolVariant::GSeries => ReassemblyBuffer::g_series(),
            ProtocolVariant::TtSeries => ReassemblyBuffer::tt_series(),
        };

        let (lock_state_tx, _) = watch::channel(LockState::Unknown);
        let (connection_state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            transport,
            credentials,
            config,
            variant,
            endpoint: Mutex::new(None),
            reassembly: Mutex::new(reassembly),
            pending: Mutex::new(None),
            command_lock: tokio::sync::Mutex::new(()),
            last_command_at: Mutex::new(None),
            lock_state_tx,
            connection_state_tx,
            cached_lock_state: Mutex::new(None),
            last_commanded_state: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            polling_enabled: AtomicBool::new(true),
            detected_lock_id: Mutex::new(detected_lock_id),
            battery: Mutex::new(None),
            pump_handle: Mutex::new(None),
            polling_handle: Mutex::new(None),
        });

        Session { shared }
    }

    /// Runs the full connect sequence (spec §4.7): connect, discover,
    /// enable notifications, start the inbound pump, calibrate time
    /// (TT-Series), populate initial state, start polling, publish
    /// `Connected`.
    pub async fn connect(&self) -> Result<()> {
        self.publish_connection_state(ConnectionState::Connecting);

        let endpoint = tokio::time::timeout(self.shared.config.connect_timeout, self.shared.transport.connect())
            .await
            .map_err(|_| Error::timeout(operation::CONNECT))??;
        *self.shared.endpoint.lock().expect("endpoint mutex poisoned") = Some(endpoint.clone());

        tokio::time::timeout(
            self.shared.config.descriptor_write_timeout,
            self.shared.transport.enable_notifications(&endpoint),
        )
        .await
        .map_err(|_| Error::timeout(operation::DESCRIPTOR_WRITE))??;

        self.spawn_inbound_pump();

        if self.shared.variant == ProtocolVariant::TtSeries {
            if let Err(e) = self.calibrate_time().await {
                log::warn!(target: "session", "TT-Series calibrate-time failed at connect (non-fatal): {e}");
            }
        }

        self.query_with_retry(self.shared.config.connect_query_attempts, self.shared.config.connect_query_retry_delay)
            .await;

        self.spawn_polling_task();

        self.publish_connection_state(ConnectionState::Connected);
        Ok(())
    }

    /// Stops polling, cancels any in-flight wait, and disconnects the
    /// transport. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_background_tasks();
        self.fail_pending();
        self.shared.transport.disconnect().await?;
        self.publish_connection_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// `true` on confirmed success.
    pub async fn lock(&self) -> Result<bool> {
        self.set_lock_state(true).await
    }

    /// `true` on confirmed success.
    pub async fn unlock(&self) -> Result<bool> {
        self.set_lock_state(false).await
    }

    /// Falls back to the last valid cached state (within
    /// `config.cached_state_validity`) if the live probe fails.
    pub async fn query_lock_status(&self) -> Result<LockState> {
        match self.probe_lock_status().await {
            Ok(state) => Ok(state),
            Err(e) => self.cached_lock_state_if_fresh().ok_or(e),
        }
    }

    pub async fn query_device_status(&self) -> Result<DeviceStatus> {
        let lock_state = self.query_lock_status().await?;
        Ok(DeviceStatus {
            lock_state,
            battery_percent: self.battery_level(),
            is_connected: *self.shared.connection_state_tx.borrow() == ConnectionState::Connected,
            rssi: None,
            last_updated_epoch_ms: epoch_ms_now(),
        })
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection_state_tx.subscribe()
    }

    pub fn lock_state(&self) -> watch::Receiver<LockState> {
        self.shared.lock_state_tx.subscribe()
    }

    /// TT-Series only: sends `CALIBRATE_TIME`. Errors are non-fatal at
    /// connect time; callers invoking this directly get the real result.
    pub async fn calibrate_time(&self) -> Result<()> {
        self.require_tt_series()?;
        let business = ttseries::business_calibrate_time(crate::time::now_bcd6());
        let frame = self.tt_series_build_frame(&business)?;
        self.send_fire_and_forget(frame).await
    }

    /// TT-Series only.
    pub async fn get_version(&self) -> Result<String> {
        self.require_tt_series()?;
        let business = ttseries::business_check_version(crate::time::now_bcd6());
        let frame = self.tt_series_build_frame(&business)?;
        let content = self.expect_tt_series(self.send_command_and_wait(frame).await?)?;
        Ok(String::from_utf8_lossy(&content).trim_end_matches('\0').to_string())
    }

    /// TT-Series only.
    pub async fn set_work_mode(&self, sleep: bool) -> Result<()> {
        self.require_tt_series()?;
        let (lock_id, _password, _key) = self.tt_series_creds()?;
        let business = ttseries::business_set_work_mode(&lock_id, sleep)
            .ok_or_else(|| Error::decoding("invalid TT-Series lock-id for set-work-mode"))?;
        let frame = self.tt_series_build_frame(&business)?;
        self.send_fire_and_forget(frame).await
    }

    /// TT-Series only: the lock-id resolved at construction time, whether
    /// supplied explicitly or detected from the advertised name.
    pub fn detected_lock_id(&self) -> Option<String> {
        self.shared.detected_lock_id.lock().expect("detected_lock_id mutex poisoned").clone()
    }

    pub fn battery_level(&self) -> Option<u8> {
        *self.shared.battery.lock().expect("battery mutex poisoned")
    }

    // ---- internals -----------------------------------------------------

    fn require_tt_series(&self) -> Result<()> {
        if self.shared.variant == ProtocolVariant::TtSeries {
            Ok(())
        } else {
            Err(Error::UnsupportedProtocol)
        }
    }

    fn g_series_key(&self) -> Result<AesKey> {
        match &self.shared.credentials {
            Credentials::GSeries { key, .. } => Ok(*key),
            _ => Err(Error::UnsupportedProtocol),
        }
    }

    fn tt_series_creds(&self) -> Result<(String, String, Option<AesKey>)> {
        match &self.shared.credentials {
            Credentials::TtSeries { lock_id, password, key, .. } => {
                let effective_lock_id = if lock_id == TT_AUTO_DETECT_LOCK_ID {
                    self.detected_lock_id().ok_or_else(|| {
                        Error::DeviceNotFound { address: "TT-Series lock-id not yet auto-detected".into() }
                    })?
                } else {
                    lock_id.clone()
                };
                Ok((effective_lock_id, password.clone(), *key))
            }
            _ => Err(Error::UnsupportedProtocol),
        }
    }

    fn tt_series_build_frame(&self, business: &[u8]) -> Result<Vec<u8>> {
        let (_, _, key) = self.tt_series_creds()?;
        Ok(match key {
            Some(k) => ttseries::build_encrypted(business, &k),
            None => ttseries::build_plain(business),
        })
    }

    fn expect_tt_series(&self, frame: CorrelatedFrame) -> Result<Vec<u8>> {
        match frame {
            CorrelatedFrame::TtSeries(content) => Ok(content),
            CorrelatedFrame::GSeries(_) => Err(Error::decoding("received a G-Series frame on a TT-Series session")),
        }
    }

    fn expect_g_series(&self, frame: CorrelatedFrame) -> Result<gseries::ParsedResponse> {
        match frame {
            CorrelatedFrame::GSeries(parsed) => Ok(parsed),
            CorrelatedFrame::TtSeries(_) => Err(Error::decoding("received a TT-Series frame on a G-Series session")),
        }
    }

    async fn set_lock_state(&self, locked: bool) -> Result<bool> {
        match self.shared.variant {
            ProtocolVariant::GSeries => self.g_series_set_lock_state(locked).await,
            ProtocolVariant::TtSeries => self.tt_series_set_lock_state(locked).await,
        }
    }

    async fn g_series_set_lock_state(&self, locked: bool) -> Result<bool> {
        let key = self.g_series_key()?;
        let frame = if locked { gseries::build_lock(&key) } else { gseries::build_unlock(&key) };
        let parsed = self.expect_g_series(self.send_command_and_wait(frame).await?)?;

        let result_code = match &parsed {
            gseries::ParsedResponse::ShortAck { code } => Some(*code),
            gseries::ParsedResponse::Frame { content } => content.first().copied(),
        };

        match result_code {
            Some(gseries::RESULT_SUCCESS) => {
                self.commit_commanded_state(if locked { LockState::Locked } else { LockState::Unlocked });
                Ok(true)
            }
            Some(gseries::RESULT_POSSIBLY_SUCCEEDED) => self.verify_g_series_after_possible_success(locked).await,
            Some(code) => Err(Error::command_failed(code)),
            None => Err(Error::decoding("empty G-Series response body")),
        }
    }

    async fn verify_g_series_after_possible_success(&self, locked: bool) -> Result<bool> {
        tokio::time::sleep(self.shared.config.verify_retry_delay).await;
        let expected = if locked { LockState::Locked } else { LockState::Unlocked };
        let observed = self.probe_lock_status().await?;
        if observed == expected {
            self.commit_commanded_state(expected);
            Ok(true)
        } else {
            Err(Error::command_failed_unknown())
        }
    }

    async fn tt_series_set_lock_state(&self, locked: bool) -> Result<bool> {
        let (lock_id, password, key) = self.tt_series_creds()?;
        let datetime = crate::time::now_bcd6();
        let business = if locked {
            ttseries::business_lock(&lock_id, &password, datetime)
        } else {
            ttseries::business_unlock(&lock_id, &password, datetime)
        }
        .ok_or_else(|| Error::decoding("invalid TT-Series lock-id/password"))?;

        let frame = match key {
            Some(k) => ttseries::build_encrypted(&business, &k),
            None => ttseries::build_plain(&business),
        };

        let content = self.expect_tt_series(self.send_command_and_wait(frame).await?)?;
        let reply = ttseries::decode_status_reply(&content).ok_or_else(|| Error::decoding("malformed TT-Series reply"))?;
        self.update_from_status_reply(&reply);

        match ttseries::interpret_response_code(reply.response_code) {
            ttseries::ResponseOutcome::LockConfirmed { already } if locked => {
                self.commit_commanded_state(LockState::Locked);
                Ok(!already)
            }
            ttseries::ResponseOutcome::UnlockConfirmed { already } if !locked => {
                self.commit_commanded_state(LockState::Unlocked);
                Ok(!already)
            }
            ttseries::ResponseOutcome::AuthenticationFailed => Err(Error::AuthenticationFailed),
            ttseries::ResponseOutcome::CommandFailed(code) => Err(Error::command_failed(code)),
            _ => Err(Error::command_failed_unknown()),
        }
    }

    /// A single live status probe (no cache fallback, no retry).
    async fn probe_lock_status(&self) -> Result<LockState> {
        let state = match self.shared.variant {
            ProtocolVariant::GSeries => {
                let key = self.g_series_key()?;
                let frame = gseries::build_query_status(&key);
                let parsed = self.expect_g_series(self.send_command_and_wait(frame).await?)?;
                let content = match parsed {
                    gseries::ParsedResponse::Frame { content } => content,
                    gseries::ParsedResponse::ShortAck { .. } => {
                        return Err(Error::decoding("got a short ACK in reply to a status query"))
                    }
                };
                match gseries::extract_lock_state(&content) {
                    gseries::ParamLockState::Locked => LockState::Locked,
                    gseries::ParamLockState::Unlocked => LockState::Unlocked,
                    gseries::ParamLockState::Unknown => LockState::Unknown,
                }
            }
            ProtocolVariant::TtSeries => {
                let (lock_id, password, _key) = self.tt_series_creds()?;
                let datetime = crate::time::now_bcd6();
                let business = ttseries::business_check_status(&lock_id, &password, datetime)
                    .ok_or_else(|| Error::decoding("invalid TT-Series lock-id/password"))?;
                let frame = self.tt_series_build_frame(&business)?;
                let content = self.expect_tt_series(self.send_command_and_wait(frame).await?)?;
                let reply =
                    ttseries::decode_status_reply(&content).ok_or_else(|| Error::decoding("malformed TT-Series reply"))?;
                self.update_from_status_reply(&reply);
                match ttseries::interpret_status(reply.lock_status_byte) {
                    ttseries::StatusOutcome::Locked => LockState::Locked,
                    ttseries::StatusOutcome::Unlocked => LockState::Unlocked,
                    ttseries::StatusOutcome::Unknown | ttseries::StatusOutcome::Alarm(_) => LockState::Unknown,
                }
            }
        };

        let state = self.apply_unknown_debounce(state);
        self.publish_lock_state(state);
        self.cache_lock_state(state);
        Ok(state)
    }

    fn update_from_status_reply(&self, reply: &ttseries::StatusReply) {
        *self.shared.battery.lock().expect("battery mutex poisoned") = Some(reply.battery_percent);
        *self.shared.detected_lock_id.lock().expect("detected_lock_id mutex poisoned") = Some(reply.lock_id.clone());
    }

    /// Within `unknown_debounce_window` of a successful command, an
    /// UNKNOWN probe result is overridden by the commanded state.
    fn apply_unknown_debounce(&self, state: LockState) -> LockState {
        if state != LockState::Unknown {
            return state;
        }
        let last = self.shared.last_commanded_state.lock().expect("last_commanded_state mutex poisoned");
        match *last {
            Some((commanded, at)) if at.elapsed() <= self.shared.config.unknown_debounce_window => commanded,
            _ => state,
        }
    }

    fn commit_commanded_state(&self, state: LockState) {
        let now = Instant::now();
        *self.shared.last_commanded_state.lock().expect("last_commanded_state mutex poisoned") = Some((state, now));
        self.publish_lock_state(state);
        self.cache_lock_state(state);
    }

    fn publish_lock_state(&self, state: LockState) {
        self.shared.lock_state_tx.send_replace(state);
    }

    fn cache_lock_state(&self, state: LockState) {
        *self.shared.cached_lock_state.lock().expect("cached_lock_state mutex poisoned") = Some((state, Instant::now()));
    }

    fn cached_lock_state_if_fresh(&self) -> Option<LockState> {
        let cached = self.shared.cached_lock_state.lock().expect("cached_lock_state mutex poisoned");
        match *cached {
            Some((state, at)) if at.elapsed() <= self.shared.config.cached_state_validity => Some(state),
            _ => None,
        }
    }

    fn publish_connection_state(&self, state: ConnectionState) {
        self.shared.connection_state_tx.send_replace(state);
    }

    /// Retries a lock-status probe up to `attempts` times, `delay` apart.
    /// Errors are swallowed; this only ever best-effort-refreshes the
    /// cached/observable state (used at connect time and by polling).
    async fn query_with_retry(&self, attempts: u32, delay: std::time::Duration) {
        for attempt in 0..attempts.max(1) {
            match self.probe_lock_status().await {
                Ok(_) => return,
                Err(e) => {
                    log::debug!(target: "session", "status query attempt {attempt} failed: {e}");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    fn endpoint(&self) -> Result<GattEndpoint> {
        self.shared.endpoint.lock().expect("endpoint mutex poisoned").clone().ok_or(Error::NotConnected)
    }

    /// Enforces the minimum inter-command delay. TT-Series only (spec §5);
    /// G-Series has no command-pacing requirement, only inter-chunk pacing.
    async fn enforce_command_pacing(&self) {
        if self.shared.variant != ProtocolVariant::TtSeries {
            return;
        }
        let wait_until = {
            let last = self.shared.last_command_at.lock().expect("last_command_at mutex poisoned");
            last.map(|at| at + self.shared.config.command_pacing)
        };
        if let Some(until) = wait_until {
            let now = Instant::now();
            if until > now {
                tokio::time::sleep(until - now).await;
            }
        }
    }

    fn record_command_sent(&self) {
        *self.shared.last_command_at.lock().expect("last_command_at mutex poisoned") = Some(Instant::now());
    }

    /// Sends `frame` without installing a pending-response slot or waiting
    /// for a reply (used for CALIBRATE_TIME, SET_WORK_MODE, heartbeat
    /// replies — operations with no defined synchronous reply).
    async fn send_fire_and_forget(&self, frame: Vec<u8>) -> Result<()> {
        let _guard = self.shared.command_lock.lock().await;
        self.enforce_command_pacing().await;
        let endpoint = self.endpoint()?;
        self.record_command_sent();
        tokio::time::timeout(self.shared.config.heartbeat_reply_timeout, self.shared.transport.write(&endpoint, &frame, false))
            .await
            .map_err(|_| Error::timeout(operation::HEARTBEAT_REPLY))??;
        Ok(())
    }

    /// Sends `frame`, installs the single pending-response slot, and waits
    /// up to `response_wait_timeout` for a correlated reply.
    async fn send_command_and_wait(&self, frame: Vec<u8>) -> Result<CorrelatedFrame> {
        let _guard = self.shared.command_lock.lock().await;
        self.enforce_command_pacing().await;

        let (tx, rx) = oneshot::channel();
        *self.shared.pending.lock().expect("pending mutex poisoned") = Some(tx);

        let endpoint = self.endpoint()?;
        self.record_command_sent();

        let write_result = tokio::time::timeout(
            self.shared.config.write_completion_timeout,
            self.shared.transport.write(&endpoint, &frame, true),
        )
        .await;

        match write_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.shared.pending.lock().expect("pending mutex poisoned").take();
                return Err(e);
            }
            Err(_elapsed) => {
                self.shared.pending.lock().expect("pending mutex poisoned").take();
                return Err(Error::timeout(operation::WRITE_COMPLETION));
            }
        }

        match tokio::time::timeout(self.shared.config.response_wait_timeout, rx).await {
            Ok(Ok(correlated)) => Ok(correlated),
            Ok(Err(_canceled)) => Err(Error::NotConnected),
            Err(_elapsed) => {
                self.shared.pending.lock().expect("pending mutex poisoned").take();
                Err(Error::timeout(operation::RESPONSE_WAIT))
            }
        }
    }

    fn fail_pending(&self) {
        if let Some(tx) = self.shared.pending.lock().expect("pending mutex poisoned").take() {
            // Dropping the sender surfaces `Err(_canceled)` to the waiter,
            // which `send_command_and_wait` already maps to `Error::NotConnected`.
            drop(tx);
        }
    }

    fn stop_background_tasks(&self) {
        if let Some(handle) = self.shared.pump_handle.lock().expect("pump_handle mutex poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.shared.polling_handle.lock().expect("polling_handle mutex poisoned").take() {
            handle.abort();
        }
    }

    fn spawn_inbound_pump(&self) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut inbound = shared.transport.inbound();
            let mut events = shared.transport.connection_events();
            loop {
                tokio::select! {
                    chunk = inbound.next() => {
                        match chunk {
                            Some(bytes) => Self::handle_inbound_chunk(&shared, bytes).await,
                            None => break,
                        }
                    }
                    event = events.next() => {
                        match event {
                            Some(ConnectionEvent::Dropped { error }) => {
                                Self::handle_link_drop(&shared, error);
                                break;
                            }
                            None => {}
                        }
                    }
                }
            }
        });
        *self.shared.pump_handle.lock().expect("pump_handle mutex poisoned") = Some(handle);
    }

    fn spawn_polling_task(&self) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let interval = match session.shared.variant {
                    ProtocolVariant::GSeries => session.shared.config.polling_interval_g_series,
                    ProtocolVariant::TtSeries => session.shared.config.polling_interval_tt_series,
                };
                tokio::time::sleep(interval).await;
                if !session.shared.polling_enabled.load(Ordering::Acquire) {
                    break;
                }
                session.query_with_retry(session.shared.config.polling_query_attempts, session.shared.config.verify_retry_delay).await;
            }
        });
        *self.shared.polling_handle.lock().expect("polling_handle mutex poisoned") = Some(handle);
    }

    async fn handle_inbound_chunk(shared: &Arc<Shared<T>>, chunk: Vec<u8>) {
        let mut frames = Vec::new();
        {
            let mut reassembly = shared.reassembly.lock().expect("reassembly mutex poisoned");
            reassembly.push(&chunk);
            while let Some(frame) = reassembly.try_extract_frame() {
                frames.push(frame);
            }
        }
        for frame in frames {
            Self::dispatch_frame(shared, frame).await;
        }
    }

    async fn dispatch_frame(shared: &Arc<Shared<T>>, frame: Vec<u8>) {
        match shared.variant {
            ProtocolVariant::GSeries => Self::dispatch_g_series_frame(shared, frame),
            ProtocolVariant::TtSeries => Self::dispatch_tt_series_frame(shared, frame).await,
        }
    }

    fn dispatch_g_series_frame(shared: &Arc<Shared<T>>, frame: Vec<u8>) {
        let key = match &shared.credentials {
            Credentials::GSeries { key, .. } => Some(*key),
            _ => None,
        };
        match gseries::parse_response(&frame, key.as_ref()) {
            Some(parsed) => {
                Self::reset_failure_counter(shared);
                Self::fulfil_pending(shared, CorrelatedFrame::GSeries(parsed));
            }
            None => Self::record_parse_failure(shared),
        }
    }

    async fn dispatch_tt_series_frame(shared: &Arc<Shared<T>>, frame: Vec<u8>) {
        let key = match &shared.credentials {
            Credentials::TtSeries { key, .. } => *key,
            _ => None,
        };
        let Some(parsed) = ttseries::parse_response(&frame, key.as_ref()) else {
            Self::record_parse_failure(shared);
            return;
        };
        Self::reset_failure_counter(shared);

        match parsed.content.first().copied() {
            Some(cmd) if ttseries::is_async_message(cmd) => {
                Self::handle_tt_series_async_message(shared, cmd, &parsed.content).await;
            }
            _ => Self::fulfil_pending(shared, CorrelatedFrame::TtSeries(parsed.content)),
        }
    }

    async fn handle_tt_series_async_message(shared: &Arc<Shared<T>>, cmd: u8, content: &[u8]) {
        if cmd != ttseries::ASYNC_HEARTBEAT {
            log::warn!(target: "session", "TT-Series async alarm message (opcode {cmd:#04x})");
            return;
        }

        let lock_id = content.get(1..5).and_then(|b| <[u8; 4]>::try_from(b).ok()).map(|b| ttseries::lock_id_from_bytes(&b));
        let Some(lock_id) = lock_id else {
            log::warn!(target: "session", "TT-Series heartbeat had no usable lock-id; not replying");
            return;
        };

        let Some(business) = ttseries::business_heartbeat_reply(&lock_id, crate::time::now_bcd6()) else {
            return;
        };

        let frame = match &shared.credentials {
            Credentials::TtSeries { key: Some(k), .. } => ttseries::build_encrypted(&business, k),
            _ => ttseries::build_plain(&business),
        };

        let endpoint = shared.endpoint.lock().expect("endpoint mutex poisoned").clone();
        if let Some(endpoint) = endpoint {
            let result = tokio::time::timeout(shared.config.heartbeat_reply_timeout, shared.transport.write(&endpoint, &frame, false)).await;
            if !matches!(result, Ok(Ok(()))) {
                log::warn!(target: "session", "TT-Series heartbeat reply failed (non-fatal)");
            }
        }
    }

    fn fulfil_pending(shared: &Arc<Shared<T>>, frame: CorrelatedFrame) {
        if let Some(tx) = shared.pending.lock().expect("pending mutex poisoned").take() {
            let _ = tx.send(frame);
        } else {
            log::debug!(target: "session", "dropped an unsolicited frame (no pending command)");
        }
    }

    fn record_parse_failure(shared: &Arc<Shared<T>>) {
        let failures = shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        log::warn!(target: "session", "frame parse failure #{failures}");
        if failures > shared.config.max_consecutive_failures {
            log::error!(target: "session", "too many consecutive parse failures; stopping the polling loop");
            shared.polling_enabled.store(false, Ordering::Release);
        }
    }

    fn reset_failure_counter(shared: &Arc<Shared<T>>) {
        shared.consecutive_failures.store(0, Ordering::Release);
    }

    fn handle_link_drop(shared: &Arc<Shared<T>>, error: Option<String>) {
        shared.polling_enabled.store(false, Ordering::Release);
        if let Some(tx) = shared.pending.lock().expect("pending mutex poisoned").take() {
            drop(tx);
        }
        let state = match error {
            Some(msg) => ConnectionState::Error(msg),
            None => ConnectionState::Disconnected,
        };
        shared.connection_state_tx.send_replace(state);
    }
}

impl<T: Transport + 'static> Drop for Session<T> {
    fn drop(&mut self) {
        // Arc clones (the polling task holds one) keep `Shared` alive past
        // this point; only abort tasks once the last handle drops.
        if Arc::strong_count(&self.shared) == 1 {
            if let Some(handle) = self.shared.pump_handle.lock().expect("pump_handle mutex poisoned").take() {
                handle.abort();
            }
            if let Some(handle) = self.shared.polling_handle.lock().expect("polling_handle mutex poisoned").take() {
                handle.abort();
            }
        }
    }
}

fn epoch_ms_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;

    fn g_series_credentials() -> Credentials {
        Credentials::g_series(*b"1234567890123456", None).unwrap()
    }

    fn tt_series_credentials() -> Credentials {
        Credentials::tt_series("83181001".into(), "123456".into(), None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn g_series_connect_reaches_connected_state_even_without_a_reply() {
        let mut config = SessionConfig::default();
        config.connect_query_attempts = 1;
        config.connect_query_retry_delay = std::time::Duration::from_millis(1);

        let transport = FakeTransport::new();
        let session = Session::new(transport, g_series_credentials(), config, None);
        let states = session.connection_state();
        assert_eq!(*states.borrow(), ConnectionState::Disconnected);

        // The fake transport never answers the initial status query, so the
        // response-wait timeout must elapse before connect() proceeds;
        // `start_paused` fast-forwards virtual time through that wait.
        session.connect().await.unwrap();
        assert_eq!(*session.connection_state().borrow(), ConnectionState::Connected);
    }

    #[test]
    fn unknown_debounce_overrides_unknown_within_window() {
        let transport = FakeTransport::new();
        let session = Session::new(transport, g_series_credentials(), SessionConfig::default(), None);
        session.commit_commanded_state(LockState::Locked);
        assert_eq!(session.apply_unknown_debounce(LockState::Unknown), LockState::Locked);
        assert_eq!(session.apply_unknown_debounce(LockState::Unlocked), LockState::Unlocked);
    }

    #[test]
    fn cached_state_expires_after_validity_window() {
        let transport = FakeTransport::new();
        let mut config = SessionConfig::default();
        config.cached_state_validity = std::time::Duration::from_millis(0);
        let session = Session::new(transport, g_series_credentials(), config, None);
        session.cache_lock_state(LockState::Locked);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(session.cached_lock_state_if_fresh(), None);
    }

    #[test]
    fn tt_series_auto_detect_uses_scanned_name() {
        let transport = FakeTransport::new();
        let creds = Credentials::tt_series(TT_AUTO_DETECT_LOCK_ID.into(), "1234".into(), None).unwrap();
        let session = Session::new(transport, creds, SessionConfig::default(), Some("83181001"));
        assert_eq!(session.detected_lock_id(), Some("83181001".to_string()));
    }

    #[test]
    fn tt_series_explicit_lock_id_is_not_overridden() {
        let transport = FakeTransport::new();
        let session = Session::new(transport, tt_series_credentials(), SessionConfig::default(), Some("99999999"));
        assert_eq!(session.detected_lock_id(), None);
        let (lock_id, _, _) = session.tt_series_creds().unwrap();
        assert_eq!(lock_id, "83181001");
    }

    fn encrypted_response(cmd: u16, content: &[u8], key: &AesKey) -> Vec<u8> {
        let mut frame = gseries::build_encrypted(cmd, content, key);
        let len = frame.len();
        frame[0..2].copy_from_slice(&gseries::RESP_HEADER);
        frame[len - 2..].copy_from_slice(&gseries::RESP_TAIL);
        frame
    }

    #[tokio::test(start_paused = true)]
    async fn g_series_lock_retries_and_succeeds_after_result_code_0x11() {
        let mut config = SessionConfig::default();
        config.connect_query_attempts = 1;
        config.connect_query_retry_delay = std::time::Duration::from_millis(1);
        config.verify_retry_delay = std::time::Duration::from_millis(10);
        config.polling_interval_g_series = std::time::Duration::from_secs(60);

        let key: AesKey = *b"1234567890123456";
        let transport = Arc::new(FakeTransport::new());
        let session = Session::new(transport.clone(), g_series_credentials(), config, None);
        session.connect().await.unwrap();
        let base = transport.written_frames().len();

        let responder = {
            let transport = transport.clone();
            tokio::spawn(async move {
                // First write is the lock command; reply "possibly succeeded".
                transport.wait_for_write_count(base + 1).await;
                transport.push_notification(vec![0x20, 0xF1, gseries::RESULT_POSSIBLY_SUCCEEDED]).await;

                // Second write is the verify re-query; confirm Locked.
                transport.wait_for_write_count(base + 2).await;
                let content = vec![0x01, gseries::PARAM_LOCK_STATE, 0x01, 0x31];
                transport.push_notification(encrypted_response(gseries::QUERY_PARAMS, &content, &key)).await;
            })
        };

        let result = session.lock().await;
        responder.await.unwrap();

        assert_eq!(result.unwrap(), true);
        assert_eq!(*session.lock_state().borrow(), LockState::Locked);
        assert_eq!(transport.written_frames().len(), base + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_after_max_consecutive_parse_failures() {
        let mut config = SessionConfig::default();
        config.connect_query_attempts = 1;
        config.connect_query_retry_delay = std::time::Duration::from_millis(1);
        config.polling_interval_g_series = std::time::Duration::from_millis(10);
        config.polling_query_attempts = 1;
        config.response_wait_timeout = std::time::Duration::from_millis(50);
        config.max_consecutive_failures = 2;

        let transport = Arc::new(FakeTransport::new());
        let session = Session::new(transport.clone(), g_series_credentials(), config, None);
        session.connect().await.unwrap();

        // Every polling tick's status query gets answered with a frame that
        // has a header and tail but no body, which `parse_response` rejects
        // as too short. Three such failures push the counter past the
        // configured max of two.
        for _ in 0..3 {
            let before = transport.written_frames().len();
            transport.wait_for_write_count(before + 1).await;
            let mut garbage = Vec::new();
            garbage.extend_from_slice(&gseries::RESP_HEADER);
            garbage.extend_from_slice(&gseries::RESP_TAIL);
            transport.push_notification(garbage).await;
        }

        // Let the inbound pump drain the last notification before asserting.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!session.shared.polling_enabled.load(Ordering::Acquire));
    }
}
