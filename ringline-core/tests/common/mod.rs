//! Shared fakes for controller tests
#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use ringline_core::{
    AcceptResponse, Call, CallController, CallId, CallRecordClient, CallSignal, CallStatus,
    CallEvent, CallType, ControllerEvent, IceCandidate, MediaNegotiator, NegotiatorConfig, NegotiatorEvent,
    ParticipantId, PeerTransport, RecordError, SessionDescription, SignalingChannel,
    SignalingError, SignalingEvent, StaticDeviceProvider, TransportError, TransportEvent,
    TransportEventSink, TransportFactory, TransportState,
};
use ringline_core::{
    LocalMediaStream, LocalTrack, MediaConstraints, MediaDeviceProvider, MediaError, RelayEvent,
};
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};

/// Signaling channel that records every sent signal
pub struct RecordingChannel {
    participant: ParticipantId,
    connected: AtomicBool,
    sent: Mutex<Vec<CallSignal>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    send_parked: Notify,
}

impl RecordingChannel {
    pub fn new(participant: &str) -> Self {
        Self {
            participant: ParticipantId::new(participant),
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            send_gate: Mutex::new(None),
            send_parked: Notify::new(),
        }
    }

    /// Park the next `send` until the returned gate is notified
    pub fn hold_send(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Wait until a send is parked on the gate
    pub async fn wait_send_parked(&self) {
        self.send_parked.notified().await;
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<CallSignal> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|s| s.kind().to_string())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl SignalingChannel for RecordingChannel {
    async fn send(&self, signal: CallSignal) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let gate = self.send_gate.lock().take();
        if let Some(gate) = gate {
            self.send_parked.notify_one();
            gate.notified().await;
        }
        self.sent.lock().push(signal);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn participant(&self) -> &ParticipantId {
        &self.participant
    }
}

/// Device provider whose acquisition can be parked
pub struct GatedDevices {
    inner: StaticDeviceProvider,
    gate: Mutex<Option<Arc<Notify>>>,
    parked: Notify,
}

impl GatedDevices {
    pub fn new() -> Self {
        Self {
            inner: StaticDeviceProvider::with_default_devices(),
            gate: Mutex::new(None),
            parked: Notify::new(),
        }
    }

    /// Park the next `acquire` until the returned gate is notified
    pub fn hold_acquire(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Wait until an acquisition is parked on the gate
    pub async fn wait_parked(&self) {
        self.parked.notified().await;
    }
}

impl Deref for GatedDevices {
    type Target = StaticDeviceProvider;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[async_trait]
impl MediaDeviceProvider for GatedDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, MediaError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            self.parked.notify_one();
            gate.notified().await;
        }
        self.inner.acquire(constraints).await
    }

    async fn release(&self, stream: LocalMediaStream) {
        self.inner.release(stream).await;
    }
}

/// Record service operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordOp {
    Create,
    Accept,
    Reject,
    End,
}

/// In-memory record service
pub struct FakeRecords {
    local: ParticipantId,
    next_id: AtomicUsize,
    failing: Mutex<HashSet<RecordOp>>,
    accept_status: Mutex<CallStatus>,
    log: Mutex<Vec<String>>,
    history: Mutex<Vec<Call>>,
    create_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeRecords {
    pub fn new(local: &str) -> Self {
        Self {
            local: ParticipantId::new(local),
            next_id: AtomicUsize::new(1),
            failing: Mutex::new(HashSet::new()),
            accept_status: Mutex::new(CallStatus::Accepted),
            log: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            create_gate: Mutex::new(None),
        }
    }

    /// Park `create_call` until the returned gate is notified
    pub fn hold_create(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.create_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail(&self, op: RecordOp) {
        self.failing.lock().insert(op);
    }

    pub fn heal(&self, op: RecordOp) {
        self.failing.lock().remove(&op);
    }

    pub fn heal_all(&self) {
        self.failing.lock().clear();
    }

    pub fn set_accept_status(&self, status: CallStatus) {
        *self.accept_status.lock() = status;
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn push_history(&self, call: Call) {
        self.history.lock().push(call);
    }

    fn check(&self, op: RecordOp, entry: String) -> Result<(), RecordError> {
        self.log.lock().push(entry);
        if self.failing.lock().contains(&op) {
            return Err(RecordError::Status {
                status: 500,
                body: "boom".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CallRecordClient for FakeRecords {
    async fn create_call(
        &self,
        receiver: &ParticipantId,
        call_type: CallType,
    ) -> Result<Call, RecordError> {
        self.check(RecordOp::Create, format!("create:{receiver}"))?;
        let gate = self.create_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let id = format!("call-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        Ok(Call::pending(id, self.local.clone(), receiver.clone(), call_type))
    }

    async fn accept_call(&self, call_id: &CallId) -> Result<AcceptResponse, RecordError> {
        self.check(RecordOp::Accept, format!("accept:{call_id}"))?;
        Ok(AcceptResponse {
            call_id: call_id.clone(),
            status: *self.accept_status.lock(),
        })
    }

    async fn reject_call(&self, call_id: &CallId) -> Result<(), RecordError> {
        self.check(RecordOp::Reject, format!("reject:{call_id}"))
    }

    async fn end_call(&self, call_id: &CallId) -> Result<(), RecordError> {
        self.check(RecordOp::End, format!("end:{call_id}"))
    }

    async fn get_history(&self) -> Result<Vec<Call>, RecordError> {
        Ok(self.history.lock().clone())
    }

    async fn get_call(&self, call_id: &CallId) -> Result<Call, RecordError> {
        self.history
            .lock()
            .iter()
            .find(|call| &call.id == call_id)
            .cloned()
            .ok_or(RecordError::Status {
                status: 404,
                body: "not found".to_string(),
            })
    }
}

/// Transport operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    Create,
    Offer,
    Answer,
    Remote,
    Candidate,
}

#[derive(Default)]
pub struct TransportLog {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub remote_candidates: Mutex<Vec<IceCandidate>>,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
    failing: Mutex<HashSet<TransportOp>>,
    sinks: Mutex<Vec<TransportEventSink>>,
}

impl TransportLog {
    fn check(&self, op: TransportOp) -> Result<(), TransportError> {
        if self.failing.lock().contains(&op) {
            Err(TransportError::Backend(format!("{op:?} failed")))
        } else {
            Ok(())
        }
    }
}

/// Factory for scripted in-memory transports
#[derive(Default, Clone)]
pub struct FakeTransportFactory {
    pub log: Arc<TransportLog>,
}

impl FakeTransportFactory {
    pub fn fail(&self, op: TransportOp) {
        self.log.failing.lock().insert(op);
    }

    pub fn heal_all(&self) {
        self.log.failing.lock().clear();
    }

    /// Emit an event as the most recently created transport
    pub fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.log.sinks.lock().last() {
            sink.emit(event);
        }
    }

    /// Emit an event as the transport created `index`-th (0-based)
    pub fn emit_from(&self, index: usize, event: TransportEvent) {
        if let Some(sink) = self.log.sinks.lock().get(index) {
            sink.emit(event);
        }
    }
}

struct FakeTransport {
    log: Arc<TransportLog>,
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, _track: &LocalTrack) -> Result<(), TransportError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.log.check(TransportOp::Offer)?;
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.log.check(TransportOp::Answer)?;
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.log.check(TransportOp::Remote)?;
        self.log.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.log.check(TransportOp::Candidate)?;
        self.log.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _config: &NegotiatorConfig,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        self.log.check(TransportOp::Create)?;
        self.log.created.fetch_add(1, Ordering::SeqCst);
        self.log.sinks.lock().push(events);
        Ok(Box::new(FakeTransport {
            log: Arc::clone(&self.log),
        }))
    }
}

/// Controller wired to fakes
pub struct Harness {
    pub controller: Arc<CallController>,
    pub channel: Arc<RecordingChannel>,
    pub records: Arc<FakeRecords>,
    pub devices: Arc<GatedDevices>,
    pub transports: FakeTransportFactory,
    pub transport_rx: mpsc::UnboundedReceiver<NegotiatorEvent>,
}

impl Harness {
    pub fn new(local: &str) -> Self {
        let channel = Arc::new(RecordingChannel::new(local));
        let records = Arc::new(FakeRecords::new(local));
        let devices = Arc::new(GatedDevices::new());
        let transports = FakeTransportFactory::default();
        let (negotiator, transport_rx) = MediaNegotiator::new(
            NegotiatorConfig::default(),
            Arc::new(transports.clone()),
        )
        .unwrap();
        let controller = CallController::new(
            channel.clone(),
            records.clone(),
            devices.clone(),
            negotiator,
        );
        Self {
            controller,
            channel,
            records,
            devices,
            transports,
            transport_rx,
        }
    }

    /// Deliver a relay frame
    pub async fn relay(&self, event: RelayEvent) {
        self.controller
            .dispatch(ControllerEvent::Signaling(SignalingEvent::Relay(event)))
            .await
            .unwrap();
    }

    /// Deliver a channel event
    pub async fn signaling(&self, event: SignalingEvent) {
        self.controller
            .dispatch(ControllerEvent::Signaling(event))
            .await
            .unwrap();
    }

    /// Dispatch every queued transport event
    pub async fn pump_transport(&mut self) {
        while let Ok(event) = self.transport_rx.try_recv() {
            self.controller
                .dispatch(ControllerEvent::Transport(event))
                .await
                .unwrap();
        }
    }

    /// Emit a local candidate from the current transport and dispatch it
    pub async fn local_candidate(&mut self, candidate: &str) {
        self.transports
            .emit(TransportEvent::LocalCandidate(IceCandidate::new(candidate)));
        self.pump_transport().await;
    }

    pub async fn transport_state(&mut self, state: TransportState) {
        self.transports.emit(TransportEvent::StateChanged(state));
        self.pump_transport().await;
    }

    /// No capture or transport is held
    pub fn assert_released(&self) {
        assert_eq!(self.devices.live_streams(), 0, "capture leaked");
        assert_eq!(self.controller.live_transports(), 0, "transport leaked");
    }
}

/// Incoming-call frame from `caller` to `receiver`
pub fn incoming(call_id: &str, caller: &str, receiver: &str, call_type: CallType) -> RelayEvent {
    RelayEvent::IncomingCall {
        call: Call::pending(
            call_id,
            ParticipantId::new(caller),
            ParticipantId::new(receiver),
            call_type,
        ),
        offer: SessionDescription::offer("v=0 remote-offer"),
    }
}

pub fn signal(signal: CallSignal) -> RelayEvent {
    RelayEvent::CallSignal(signal)
}

/// Everything broadcast so far
pub fn drain(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
