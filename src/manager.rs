//! Concurrent session negotiation for many devices over one shared socket.
//!
//! The manager owns every negotiator, the table routing inbound responses to
//! them, per-device failure counters and the watchers of running batches.
//! All of it lives behind a single lock that is never held across an `.await`.

use crate::batch::{BatchEntry, BatchPacketBuilder};
use crate::cache::{SessionCache, SessionMaterial};
use crate::device::DeviceInfo;
use crate::error::{Result, TuyaError};
use crate::negotiation;
use crate::negotiator::{Negotiator, NegotiatorState, Outcome};
use crate::protocol::{self, NEGOTIATION_PORT};
use crate::transport::{Transport, UdpTransport};
use futures_core::Stream;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline used when a caller's timeout does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Settings of a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Local address to bind to
    pub bind_addr: String,
    /// Local UDP port (default: 6669)
    pub port: u16,
    /// Destination of requests for devices without a known IP
    pub broadcast_addr: IpAddr,
    /// Batch deadline used when none is given
    pub timeout: Duration,
    /// Consecutive failures after which a device is reported offline
    pub offline_threshold: u32,
    /// Size of the receive buffer, and the largest datagram accepted
    pub recv_buffer_size: usize,
    /// Capacity of the event channel
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: NEGOTIATION_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            timeout: Duration::from_secs(5),
            offline_threshold: 3,
            recv_buffer_size: 4096,
            event_capacity: 64,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_addr<S: Into<String>>(mut self, addr: S) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_broadcast_addr(mut self, addr: IpAddr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_offline_threshold(mut self, threshold: u32) -> Self {
        self.offline_threshold = threshold.max(1);
        self
    }

    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .map_err(|e| TuyaError::Transport(format!("invalid bind address: {}", e)))
    }
}

/// Notifications for the control layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    Success {
        device_id: String,
        session_key: [u8; 16],
        device_random: [u8; 16],
        ip: IpAddr,
        port: u16,
    },
    Error {
        device_id: String,
        reason: TuyaError,
    },
    /// The failure counter reached the offline threshold.
    Offline { device_id: String },
}

impl NegotiationEvent {
    pub fn device_id(&self) -> &str {
        match self {
            NegotiationEvent::Success { device_id, .. }
            | NegotiationEvent::Error { device_id, .. }
            | NegotiationEvent::Offline { device_id } => device_id,
        }
    }
}

/// Per-device results of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, TuyaError)>,
    /// Devices whose protocol version does not negotiate sessions
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn error_for(&self, device_id: &str) -> Option<&TuyaError> {
        self.failed
            .iter()
            .find(|(id, _)| id == device_id)
            .map(|(_, e)| e)
    }

    fn record(&mut self, completion: Completion) {
        match completion.error {
            None => self.succeeded.push(completion.device_id),
            Some(e) => self.failed.push((completion.device_id, e)),
        }
    }
}

#[derive(Debug, Clone)]
struct Completion {
    device_id: String,
    error: Option<TuyaError>,
}

struct BatchWatch {
    /// Device id -> CRC of the request this batch issued
    pending: HashMap<String, u32>,
    tx: mpsc::UnboundedSender<Completion>,
}

#[derive(Default)]
struct ManagerState {
    negotiators: HashMap<String, Negotiator>,
    routes: HashMap<u32, String>,
    failures: HashMap<String, u32>,
    batches: HashMap<u64, BatchWatch>,
    next_batch: u64,
    announce_sequence: u32,
}

impl ManagerState {
    fn forget_routes(&mut self, device_id: &str) {
        self.routes.retain(|_, id| id.as_str() != device_id);
    }

    /// Hands a completion to every batch waiting on `device_id`; a watcher
    /// whose pending set empties is released, closing its channel.
    fn notify(&mut self, device_id: &str, error: Option<TuyaError>) {
        self.batches.retain(|_, watch| {
            if watch.pending.remove(device_id).is_some() {
                let _ = watch.tx.send(Completion {
                    device_id: device_id.to_string(),
                    error: error.clone(),
                });
            }
            !watch.pending.is_empty()
        });
    }
}

/// Negotiates v3.5 sessions with many devices at once.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    state: Mutex<ManagerState>,
    cache: SessionCache,
    event_tx: broadcast::Sender<NegotiationEvent>,
    cancel_token: CancellationToken,
    listening: AtomicBool,
}

impl Manager {
    /// Binds a UDP socket per `config` and starts the receive loop.
    pub async fn bind(config: ManagerConfig) -> Result<Self> {
        let transport = UdpTransport::bind(&config)?;
        info!("Negotiation manager listening on {}", transport.local_addr()?);
        let manager = Self::with_transport(Arc::new(transport), config);
        manager.listen();
        Ok(manager)
    }

    /// A manager over an existing transport. Responses are only processed
    /// once [`listen`](Self::listen) runs or through [`route_response`](Self::route_response).
    pub fn with_transport(transport: Arc<dyn Transport>, config: ManagerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                config,
                state: Mutex::new(ManagerState::default()),
                cache: SessionCache::new(),
                event_tx,
                cancel_token: CancellationToken::new(),
                listening: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &SessionCache {
        &self.inner.cache
    }

    pub fn session(&self, device_id: &str) -> Option<SessionMaterial> {
        self.inner.cache.get(device_id)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NegotiationEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Returns a Stream of negotiation events.
    pub fn stream(&self) -> impl Stream<Item = NegotiationEvent> + use<> {
        let mut rx = self.inner.event_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    /// Registers a negotiator for `device` and returns `true` if it is new.
    ///
    /// For a known id the existing negotiator is kept; its device details are
    /// refreshed unless a request is in flight.
    pub fn create(&self, device: DeviceInfo) -> bool {
        let mut state = self.inner.state.lock();
        match state.negotiators.get_mut(&device.id) {
            Some(negotiator) => {
                if negotiator.state() != NegotiatorState::RequestSent {
                    negotiator.update_device(device);
                }
                false
            }
            None => {
                debug!("Negotiator created for {}", device.id);
                state
                    .negotiators
                    .insert(device.id.clone(), Negotiator::new(device));
                true
            }
        }
    }

    /// Cancels and drops the negotiator of `device_id`. Batches waiting on it
    /// see a [`TuyaError::Cancelled`] completion; no event is emitted.
    pub fn remove(&self, device_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(mut negotiator) = state.negotiators.remove(device_id) else {
            warn!("Attempted to remove unknown negotiator {}", device_id);
            return false;
        };
        negotiator.cleanup();
        state.forget_routes(device_id);
        state.failures.remove(device_id);
        state.notify(device_id, Some(TuyaError::Cancelled));
        info!("Negotiator for {} removed", device_id);
        true
    }

    /// Negotiates with every device in `devices` under one shared deadline
    /// (`timeout`, or the configured default).
    ///
    /// Requests go to the device's `ip:port`, or to the broadcast address when
    /// the IP is unknown. Members still pending at the deadline fail with
    /// [`TuyaError::Timeout`].
    pub async fn start_batch_negotiation(
        &self,
        devices: Vec<DeviceInfo>,
        timeout: Option<Duration>,
    ) -> BatchReport {
        let timeout = timeout.unwrap_or(self.inner.config.timeout);
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        let mut report = BatchReport::default();

        let (batch_id, outgoing, mut rx) = {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let mut seen = HashSet::new();
            let mut pending = HashMap::new();
            let mut outgoing = Vec::new();

            for device in devices {
                if !seen.insert(device.id.clone()) {
                    continue;
                }
                if !device.supports_negotiation() {
                    debug!(
                        "Skipping {}: protocol {:?} does not negotiate sessions",
                        device.id, device.version
                    );
                    report.skipped.push(device.id);
                    continue;
                }

                let id = device.id.clone();
                let target = device.target(self.inner.config.broadcast_addr);
                let negotiator = state
                    .negotiators
                    .entry(id.clone())
                    .or_insert_with(|| Negotiator::new(device.clone()));
                negotiator.update_device(device);
                negotiator.cleanup();

                match negotiator.build_request() {
                    Ok((frame, crc)) => {
                        state.routes.retain(|_, owner| owner.as_str() != id);
                        state.routes.insert(crc, id.clone());
                        pending.insert(id.clone(), crc);
                        outgoing.push((id, crc, frame, target));
                    }
                    Err(e) => {
                        warn!("Failed to build request for {}: {}", id, e);
                        report.failed.push((id, e));
                    }
                }
            }

            let batch_id = state.next_batch;
            state.next_batch = state.next_batch.wrapping_add(1);
            if !pending.is_empty() {
                state.batches.insert(batch_id, BatchWatch { pending, tx });
            }
            (batch_id, outgoing, rx)
        };

        info!(
            "Batch {}: negotiating with {} device(s), {} skipped",
            batch_id,
            outgoing.len(),
            report.skipped.len()
        );

        for (id, crc, frame, target) in outgoing {
            match self.inner.transport.send_to(&frame, target).await {
                Ok(len) => debug!("Sent negotiation request for {} to {}: {} bytes", id, target, len),
                Err(e) => {
                    warn!("Failed to send negotiation request for {} to {}: {}", id, target, e);
                    let mut guard = self.inner.state.lock();
                    self.inner.fail_request(&mut guard, &id, crc, e);
                }
            }
        }

        loop {
            tokio::select! {
                _ = self.inner.cancel_token.cancelled() => break,
                received = tokio::time::timeout_at(deadline, rx.recv()) => match received {
                    Ok(Some(completion)) => report.record(completion),
                    // every member settled and the watcher was released
                    Ok(None) => break,
                    Err(_) => break,
                },
            }
        }

        let expired = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let mut expired = Vec::new();
            if let Some(watch) = state.batches.remove(&batch_id) {
                for (id, crc) in watch.pending {
                    let reason = if self.inner.cancel_token.is_cancelled() {
                        TuyaError::Cancelled
                    } else {
                        TuyaError::Timeout
                    };
                    if !self.inner.fail_request(state, &id, crc, reason.clone()) {
                        debug!("Request for {} was superseded before the deadline", id);
                    }
                    if let Some(negotiator) = state.negotiators.get_mut(&id)
                        && negotiator.state() == NegotiatorState::Failed
                    {
                        negotiator.cleanup();
                    }
                    expired.push((id, reason));
                }
            }
            expired
        };

        while let Ok(completion) = rx.try_recv() {
            report.record(completion);
        }
        report.failed.extend(expired);

        info!(
            "Batch {} finished: {} succeeded, {} failed, {} skipped",
            batch_id,
            report.succeeded.len(),
            report.failed.len(),
            report.skipped.len()
        );
        report
    }

    /// Negotiates with one device and returns the committed session.
    pub async fn negotiate(
        &self,
        device: DeviceInfo,
        timeout: Option<Duration>,
    ) -> Result<SessionMaterial> {
        let id = device.id.clone();
        let version = device.version;
        let report = self.start_batch_negotiation(vec![device], timeout).await;

        if report.succeeded.iter().any(|d| d == &id) {
            return self
                .inner
                .cache
                .get(&id)
                .ok_or_else(|| TuyaError::DeviceNotFound(id.clone()));
        }
        if let Some(e) = report.error_for(&id) {
            return Err(e.clone());
        }
        Err(TuyaError::UnsupportedVersion(
            version.map(|v| v.to_string()).unwrap_or_default(),
        ))
    }

    /// Dispatches an inbound datagram to the negotiator that owns it.
    ///
    /// The routing key is read from the response's sequence field, where
    /// devices echo the CRC of the request they answer.
    ///
    /// Returns `false` when the datagram matched no outstanding request, failed
    /// its CRC check, or reached a negotiator that is no longer waiting. Such
    /// datagrams are dropped without touching any state.
    pub async fn route_response(&self, data: &[u8], source: SocketAddr) -> bool {
        let Some(key) = protocol::routing_crc(data) else {
            debug!("Dropping {} bytes from {}: not a Tuya frame", data.len(), source);
            return false;
        };

        let finish = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(device_id) = state.routes.get(&key).cloned() else {
                debug!("Dropping frame from {}: no request with CRC 0x{:08X}", source, key);
                return false;
            };
            let Some(negotiator) = state.negotiators.get_mut(&device_id) else {
                state.routes.remove(&key);
                return false;
            };
            let Some(outcome) = negotiator.process_response(data, source) else {
                return false;
            };
            state.routes.remove(&key);
            self.inner.settle(state, &device_id, outcome)
        };

        if let Some((frame, target)) = finish {
            if let Err(e) = self.inner.transport.send_to(&frame, target).await {
                warn!("Failed to send negotiation finish to {}: {}", target, e);
            }
        }
        true
    }

    /// Broadcasts one batch packet asking `device_ids` to renegotiate.
    /// Returns the entries sent, with the random handed to each device.
    pub async fn announce_renegotiation(&self, device_ids: &[String]) -> Result<Vec<BatchEntry>> {
        let entries: Vec<BatchEntry> = device_ids.iter().map(BatchEntry::new).collect();
        let sequence = {
            let mut state = self.inner.state.lock();
            state.announce_sequence = state.announce_sequence.wrapping_add(1);
            state.announce_sequence
        };
        let frame = BatchPacketBuilder::broadcast().build(sequence, &entries)?;
        let target = SocketAddr::new(self.inner.config.broadcast_addr, NEGOTIATION_PORT);

        let len = self.inner.transport.send_to(&frame, target).await?;
        debug!(
            "Announced renegotiation to {} device(s) via {}: {} bytes",
            entries.len(),
            target,
            len
        );
        Ok(entries)
    }

    /// Starts the background receive loop. Further calls are no-ops.
    pub fn listen(&self) {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return;
        }

        let transport = self.inner.transport.clone();
        let token = self.inner.cancel_token.child_token();
        let weak = Arc::downgrade(&self.inner);
        let buf_size = self.inner.config.recv_buffer_size.max(64);

        tokio::spawn(async move {
            let mut buf = vec![0u8; buf_size];
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = transport.recv_from(&mut buf) => match received {
                        Ok((len, source)) => {
                            let Some(inner) = weak.upgrade() else { break };
                            Manager { inner }.route_response(&buf[..len], source).await;
                        }
                        Err(e) => {
                            warn!("Receive error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
            debug!("Receive loop stopped");
        });
    }

    /// Stops the receive loop and cancels every request in flight.
    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
        let mut state = self.inner.state.lock();
        let in_flight: Vec<String> = state.batches.values().flat_map(|w| w.pending.keys().cloned()).collect();
        for id in &in_flight {
            if let Some(negotiator) = state.negotiators.get_mut(id) {
                negotiator.cleanup();
            }
            state.notify(id, Some(TuyaError::Cancelled));
        }
        state.routes.clear();
        state.batches.clear();
        info!("Negotiation manager shut down");
    }

    pub fn failure_count(&self, device_id: &str) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of requests awaiting a response.
    pub fn route_count(&self) -> usize {
        self.inner.state.lock().routes.len()
    }

    /// Number of negotiators with a request in flight.
    pub fn pending_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .negotiators
            .values()
            .filter(|n| n.state() == NegotiatorState::RequestSent)
            .count()
    }

    pub fn state_of(&self, device_id: &str) -> Option<NegotiatorState> {
        self.inner
            .state
            .lock()
            .negotiators
            .get(device_id)
            .map(|n| n.state())
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.inner.state.lock().negotiators.keys().cloned().collect()
    }
}

impl ManagerInner {
    fn emit(&self, event: NegotiationEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Fails the request `crc` of `device_id` if it is still the one in flight.
    fn fail_request(&self, state: &mut ManagerState, device_id: &str, crc: u32, reason: TuyaError) -> bool {
        let outcome = state
            .negotiators
            .get_mut(device_id)
            .filter(|n| n.request_crc() == Some(crc))
            .and_then(|n| n.fail(reason));
        match outcome {
            Some(outcome) => {
                state.routes.remove(&crc);
                self.settle(state, device_id, outcome);
                true
            }
            None => false,
        }
    }

    /// Applies a negotiator outcome: cache, counters, events and batch
    /// completions. Returns the finish frame to send on success.
    fn settle(
        &self,
        state: &mut ManagerState,
        device_id: &str,
        outcome: Outcome,
    ) -> Option<(Vec<u8>, SocketAddr)> {
        state.forget_routes(device_id);
        match outcome {
            Outcome::Established(material) => {
                state.failures.remove(device_id);
                info!("Session established with {} ({})", device_id, material.peer);

                let finish = state.negotiators.get(device_id).and_then(|n| {
                    match negotiation::build_finish(
                        &n.device().local_key,
                        &material.session_key,
                        &material.device_random,
                    ) {
                        Ok(frame) => Some((frame, material.peer)),
                        Err(e) => {
                            warn!("Failed to build negotiation finish for {}: {}", device_id, e);
                            None
                        }
                    }
                });

                let event = NegotiationEvent::Success {
                    device_id: device_id.to_string(),
                    session_key: material.session_key,
                    device_random: material.device_random,
                    ip: material.peer.ip(),
                    port: material.peer.port(),
                };
                // subscribers may read the cache as soon as they see the event
                self.cache.insert(material);
                self.emit(event);
                state.notify(device_id, None);
                finish
            }
            Outcome::Failed(reason) => {
                let count = state.failures.entry(device_id.to_string()).or_insert(0);
                *count += 1;
                let count = *count;
                debug!("Negotiation with {} failed ({}): {}", device_id, count, reason);

                self.emit(NegotiationEvent::Error {
                    device_id: device_id.to_string(),
                    reason: reason.clone(),
                });
                if count == self.config.offline_threshold {
                    warn!("Device {} offline after {} failed negotiations", device_id, count);
                    self.emit(NegotiationEvent::Offline {
                        device_id: device_id.to_string(),
                    });
                }
                state.notify(device_id, Some(reason));
                None
            }
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        // Trigger cancellation for background tasks.
        self.cancel_token.cancel();
    }
}
