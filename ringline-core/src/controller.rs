//! Call lifecycle controller
//!
//! [`CallController`] is the only component that owns call state. It drives
//! the local phase machine, orders work across the record service, the
//! signaling channel, the device provider and the negotiator, and releases
//! every resource it acquired on every path back to `Idle`.
//!
//! ```text
//!                 initiate_call                call-accepted / answer
//!     Idle ─────────────────────▶ Calling ─────────────────────────┐
//!      │                            │ call-rejected, end, failure   │
//!      │ incoming-call              ▼                               ▼
//!      └──────────────▶ Ringing ─▶ Ending ─▶ Idle      Connecting ─▶ InCall
//!                         │ accept_call                  ▲            │
//!                         └──────────────────────────────┘            │
//!                              hangup, call-ended, end_call, failure  │
//!                         Ending ◀─────────────────────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! State sits behind one async mutex that is never held across an external
//! await. Every call attempt has a generation number; after each suspension
//! point a transition re-checks it and, if the attempt was superseded,
//! releases what it acquired and returns [`CallError::Cancelled`]. Teardown
//! moves to `Ending`, bumps the generation, takes the media slot, releases it
//! and only then enters `Idle`.
//!
//! # Candidate gating
//!
//! Local candidates are held until the far end holds a remote description:
//! the caller releases them after applying the answer, the callee after
//! sending its answer.

use crate::identity::ParticipantId;
use crate::media::{LocalMediaStream, MediaDeviceProvider, MediaError};
use crate::negotiator::{
    MediaNegotiator, NegotiationError, NegotiatorEvent, PeerSession, TransportError,
    TransportEvent, TransportState,
};
use crate::record::{CallRecordClient, RecordError};
use crate::signaling::{RelayEvent, SignalingChannel, SignalingError, SignalingEvent};
use crate::types::{
    Call, CallEvent, CallId, CallPhase, CallSignal, CallState, CallStatus, CallType, EndReason,
    IceCandidate, MediaConstraints, SessionDescription, SignalPayload,
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

/// Call lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A call already occupies the controller
    #[error("A call is already in progress (phase {0})")]
    Busy(CallPhase),

    /// Operation needs a local stream
    #[error("No local media stream")]
    NoLocalMedia,

    /// The attempt was ended or replaced while in flight
    #[error("Call attempt was cancelled")]
    Cancelled,

    /// Record service accepted with an unexpected status
    #[error("Record service answered accept with status {0:?}")]
    UnexpectedStatus(CallStatus),

    /// Media acquisition failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Negotiation failed
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// Record service failed
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Signaling failed
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// User intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Place a call
    Initiate {
        /// Who to call
        receiver: ParticipantId,
        /// Voice or video
        call_type: CallType,
    },
    /// Accept the ringing call
    Accept,
    /// Decline the ringing call
    Reject,
    /// Hang up
    End,
    /// Flip the local audio track
    ToggleMute,
    /// Flip the local video track
    ToggleVideo,
}

/// Everything the controller reacts to
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// User intent
    Command(Command),
    /// Relay traffic
    Signaling(SignalingEvent),
    /// Peer transport notification
    Transport(NegotiatorEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordUpdate {
    Keep,
    Close,
}

struct ActiveMedia {
    stream: LocalMediaStream,
    session: Arc<PeerSession>,
}

struct Inner {
    phase: CallPhase,
    generation: u64,
    call: Option<Call>,
    pending_offer: Option<SessionDescription>,
    media: Option<ActiveMedia>,
    state: CallState,
    held_candidates: Vec<IceCandidate>,
    candidates_released: bool,
}

impl Inner {
    fn call_id(&self) -> Option<&CallId> {
        self.call.as_ref().map(|call| &call.id)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.phase.is_active()
    }
}

/// Two-party call lifecycle controller
pub struct CallController {
    local_id: ParticipantId,
    signaling: Arc<dyn SignalingChannel>,
    records: Arc<dyn CallRecordClient>,
    devices: Arc<dyn MediaDeviceProvider>,
    negotiator: MediaNegotiator,
    inner: Mutex<Inner>,
    // Orders offer/answer delivery against the hangup sent by `end_call`
    outbound: Mutex<()>,
    events: broadcast::Sender<CallEvent>,
}

impl CallController {
    /// Create a controller for the participant the signaling channel is keyed by
    pub fn new(
        signaling: Arc<dyn SignalingChannel>,
        records: Arc<dyn CallRecordClient>,
        devices: Arc<dyn MediaDeviceProvider>,
        negotiator: MediaNegotiator,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(100);
        Arc::new(Self {
            local_id: signaling.participant().clone(),
            signaling,
            records,
            devices,
            negotiator,
            inner: Mutex::new(Inner {
                phase: CallPhase::Idle,
                generation: 0,
                call: None,
                pending_offer: None,
                media: None,
                state: CallState::default(),
                held_candidates: Vec::new(),
                candidates_released: false,
            }),
            outbound: Mutex::new(()),
            events,
        })
    }

    /// Feed relay and transport events into [`CallController::dispatch`], one at a time
    pub fn spawn(
        self: &Arc<Self>,
        mut signaling_rx: mpsc::Receiver<SignalingEvent>,
        mut transport_rx: mpsc::UnboundedReceiver<NegotiatorEvent>,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(event) = signaling_rx.recv() => ControllerEvent::Signaling(event),
                    Some(event) = transport_rx.recv() => ControllerEvent::Transport(event),
                    else => break,
                };
                if let Err(e) = controller.dispatch(event).await {
                    tracing::warn!(error = %e, "Controller event failed");
                }
            }
            tracing::debug!("Controller event loop finished");
        })
    }

    /// Single entry point for commands, relay traffic and transport events
    ///
    /// # Errors
    ///
    /// Returns the command's error; relay and transport events never fail
    pub async fn dispatch(&self, event: ControllerEvent) -> Result<(), CallError> {
        match event {
            ControllerEvent::Command(command) => match command {
                Command::Initiate {
                    receiver,
                    call_type,
                } => self.initiate_call(receiver, call_type).await.map(|_| ()),
                Command::Accept => self.accept_call().await,
                Command::Reject => self.reject_call().await,
                Command::End => self.end_call().await,
                Command::ToggleMute => self.toggle_mute().await.map(|_| ()),
                Command::ToggleVideo => self.toggle_video().await.map(|_| ()),
            },
            ControllerEvent::Signaling(event) => {
                self.handle_signaling(event).await;
                Ok(())
            }
            ControllerEvent::Transport(event) => {
                self.handle_transport(event).await;
                Ok(())
            }
        }
    }

    /// Local participant
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Current phase
    pub async fn phase(&self) -> CallPhase {
        self.inner.lock().await.phase
    }

    /// Presentation flags
    pub async fn call_state(&self) -> CallState {
        self.inner.lock().await.state
    }

    /// Call record of the active call, if any
    pub async fn current_call(&self) -> Option<Call> {
        self.inner.lock().await.call.clone()
    }

    /// Outbound call waiting for an answer
    pub async fn is_calling(&self) -> bool {
        self.phase().await == CallPhase::Calling
    }

    /// Inbound call waiting for a local decision
    pub async fn is_ringing(&self) -> bool {
        self.phase().await == CallPhase::Ringing
    }

    /// Live peer transports (0 or 1)
    pub fn live_transports(&self) -> usize {
        self.negotiator.live_transports()
    }

    /// Records involving the local participant
    ///
    /// # Errors
    ///
    /// Returns error if the record service fails
    pub async fn history(&self) -> Result<Vec<Call>, CallError> {
        Ok(self.records.get_history().await?)
    }

    /// Look up one record
    ///
    /// # Errors
    ///
    /// Returns error if the record service fails
    pub async fn call_record(&self, call_id: &CallId) -> Result<Call, CallError> {
        Ok(self.records.get_call(call_id).await?)
    }

    /// Place a call
    ///
    /// Moves to `Calling` immediately, then acquires media, creates the
    /// transport and the record, and sends the offer. Any failure tears the
    /// attempt down to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Busy`] unless idle; otherwise the first failure
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn initiate_call(
        &self,
        receiver: ParticipantId,
        call_type: CallType,
    ) -> Result<Call, CallError> {
        let generation = {
            let mut inner = self.inner.lock().await;
            if inner.phase != CallPhase::Idle {
                tracing::debug!(phase = %inner.phase, "Refusing to place a second call");
                return Err(CallError::Busy(inner.phase));
            }
            inner.generation += 1;
            self.set_phase(&mut inner, CallPhase::Calling);
            inner.generation
        };

        match self.place_call(generation, &receiver, call_type).await {
            Ok(call) => Ok(call),
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
            Err(e) => {
                self.fail(generation, &e).await;
                Err(e)
            }
        }
    }

    async fn place_call(
        &self,
        generation: u64,
        receiver: &ParticipantId,
        call_type: CallType,
    ) -> Result<Call, CallError> {
        let session = self
            .prepare_media(generation, &call_type.constraints())
            .await?;

        let call = self.records.create_call(receiver, call_type).await?;
        {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation) {
                drop(inner);
                tracing::debug!(call_id = %call.id, "Attempt ended before the record was stored");
                self.close_record(&call).await;
                return Err(CallError::Cancelled);
            }
            inner.call = Some(call.clone());
        }
        tracing::info!(call_id = %call.id, receiver = %receiver, "Call record created");

        let offer = self.negotiator.create_offer(&session).await?;
        {
            let _outbound = self.outbound.lock().await;
            self.ensure_current(generation).await?;
            self.signaling
                .send(CallSignal::offer(call.id.clone(), offer))
                .await?;
        }
        self.ensure_current(generation).await?;

        self.emit(CallEvent::OutgoingCall { call: call.clone() });
        Ok(call)
    }

    /// Accept the ringing call
    ///
    /// No-op outside `Ringing`. On failure nothing is sent to the far end and
    /// the controller returns to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns the first failure of acquisition, negotiation, record accept
    /// or answer delivery
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (generation, call, offer) = {
            let mut inner = self.inner.lock().await;
            if inner.phase != CallPhase::Ringing {
                tracing::debug!(phase = %inner.phase, "Accept ignored outside Ringing");
                return Ok(());
            }
            let (Some(call), Some(offer)) = (inner.call.clone(), inner.pending_offer.take())
            else {
                tracing::warn!("Ringing without a stored call or offer");
                return Ok(());
            };
            self.set_phase(&mut inner, CallPhase::Connecting);
            (inner.generation, call, offer)
        };

        match self.answer_call(generation, &call, offer).await {
            Ok(()) => Ok(()),
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
            Err(e) => {
                self.fail(generation, &e).await;
                Err(e)
            }
        }
    }

    async fn answer_call(
        &self,
        generation: u64,
        call: &Call,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        let session = self
            .prepare_media(generation, &call.call_type.constraints())
            .await?;

        self.negotiator
            .apply_remote_description(&session, offer)
            .await?;
        let answer = self.negotiator.create_answer(&session).await?;
        self.ensure_current(generation).await?;

        let response = self.records.accept_call(&call.id).await?;
        if response.status != CallStatus::Accepted {
            return Err(CallError::UnexpectedStatus(response.status));
        }
        let outbound = self.outbound.lock().await;
        {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation) {
                return Err(CallError::Cancelled);
            }
            if let Some(call) = inner.call.as_mut() {
                if let Err(e) = call.transition(CallStatus::Accepted, Utc::now()) {
                    tracing::debug!(error = %e, "Local record already past pending");
                }
            }
        }
        self.signaling
            .send(CallSignal::answer(call.id.clone(), answer))
            .await?;
        drop(outbound);

        self.enter_in_call(generation).await
    }

    /// Decline the ringing call
    ///
    /// No-op outside `Ringing`. The controller returns to `Idle` even if the
    /// record service fails.
    ///
    /// # Errors
    ///
    /// Returns the record service failure
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let (generation, call_id) = {
            let inner = self.inner.lock().await;
            if inner.phase != CallPhase::Ringing {
                tracing::debug!(phase = %inner.phase, "Reject ignored outside Ringing");
                return Ok(());
            }
            (inner.generation, inner.call_id().cloned())
        };

        let result = match &call_id {
            Some(call_id) => self.records.reject_call(call_id).await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Record reject failed");
        }

        self.teardown(Some(generation), EndReason::Declined, RecordUpdate::Keep)
            .await;
        result.map_err(CallError::from)
    }

    /// Hang up
    ///
    /// In `Ringing` this declines the call. Outside the active phases it is
    /// a no-op. Sends `hangup` to the far end when a call record exists.
    ///
    /// # Errors
    ///
    /// Only the decline path can fail
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        // Held until teardown has bumped the generation
        let outbound = self.outbound.lock().await;
        let (generation, call_id) = {
            let inner = self.inner.lock().await;
            match inner.phase {
                CallPhase::Calling | CallPhase::Connecting | CallPhase::InCall => {
                    (inner.generation, inner.call_id().cloned())
                }
                CallPhase::Ringing => {
                    drop(inner);
                    drop(outbound);
                    return self.reject_call().await;
                }
                CallPhase::Idle | CallPhase::Ending => {
                    tracing::debug!(phase = %inner.phase, "End ignored without an active call");
                    return Ok(());
                }
            }
        };

        if let Some(call_id) = call_id {
            if let Err(e) = self.signaling.send(CallSignal::hangup(call_id)).await {
                tracing::warn!(error = %e, "Failed to send hangup");
            }
        }

        self.teardown(Some(generation), EndReason::LocalHangup, RecordUpdate::Close)
            .await;
        drop(outbound);
        Ok(())
    }

    /// Flip the local audio track; returns whether audio is now muted
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoLocalMedia`] without a local stream
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let mut inner = self.inner.lock().await;
        let Some(media) = inner.media.as_ref() else {
            return Err(CallError::NoLocalMedia);
        };
        let Some(track) = media.stream.audio_track() else {
            return Ok(inner.state.is_muted);
        };
        let muted = track.is_enabled();
        track.set_enabled(!muted);
        inner.state.is_muted = muted;
        tracing::debug!(muted, "Audio toggled");
        self.emit(CallEvent::StateChanged(inner.state));
        Ok(muted)
    }

    /// Flip the local video track; returns whether video is now enabled
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoLocalMedia`] without a local stream
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let mut inner = self.inner.lock().await;
        let Some(media) = inner.media.as_ref() else {
            return Err(CallError::NoLocalMedia);
        };
        let Some(track) = media.stream.video_track() else {
            return Ok(inner.state.is_video_enabled);
        };
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        inner.state.is_video_enabled = enabled;
        tracing::debug!(enabled, "Video toggled");
        self.emit(CallEvent::StateChanged(inner.state));
        Ok(enabled)
    }

    #[tracing::instrument(skip(self, event), fields(local = %self.local_id))]
    async fn handle_signaling(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => tracing::debug!("Relay link up"),
            SignalingEvent::Disconnected { reason } => {
                let generation = {
                    let inner = self.inner.lock().await;
                    match inner.phase {
                        CallPhase::Connecting | CallPhase::InCall => inner.generation,
                        // Pending calls survive a reconnect
                        _ => return,
                    }
                };
                tracing::warn!(%reason, "Relay link lost during call");
                self.teardown(Some(generation), EndReason::ChannelLost, RecordUpdate::Close)
                    .await;
            }
            SignalingEvent::Relay(event) => self.handle_relay(event).await,
        }
    }

    async fn handle_relay(&self, event: RelayEvent) {
        match event {
            RelayEvent::IncomingCall { call, offer } => self.on_incoming_call(call, offer).await,
            RelayEvent::CallAccepted { call_id, answer } => {
                let Some(generation) = self
                    .matching_generation(&call_id, &[CallPhase::Calling])
                    .await
                else {
                    return;
                };
                match answer {
                    Some(answer) => self.apply_answer(generation, answer).await,
                    None => {
                        let mut inner = self.inner.lock().await;
                        if inner.generation == generation {
                            self.set_phase(&mut inner, CallPhase::Connecting);
                        }
                    }
                }
            }
            RelayEvent::CallRejected { call_id } => {
                if let Some(generation) = self
                    .matching_generation(&call_id, &[CallPhase::Calling])
                    .await
                {
                    self.teardown(Some(generation), EndReason::Rejected, RecordUpdate::Keep)
                        .await;
                }
            }
            RelayEvent::CallEnded { call_id } => self.on_remote_hangup(&call_id).await,
            RelayEvent::CallSignal(signal) => self.on_call_signal(signal).await,
        }
    }

    async fn on_incoming_call(&self, call: Call, offer: SessionDescription) {
        let mut inner = self.inner.lock().await;
        if inner.phase != CallPhase::Idle {
            tracing::info!(call_id = %call.id, phase = %inner.phase, "Ignoring incoming call while busy");
            return;
        }
        if call.receiver_id != self.local_id || call.status.is_terminal() {
            tracing::debug!(call_id = %call.id, status = ?call.status, "Ignoring incoming call not addressed to us");
            return;
        }
        inner.generation += 1;
        inner.call = Some(call.clone());
        inner.pending_offer = Some(offer);
        tracing::info!(call_id = %call.id, caller = %call.caller_id, "Incoming call");
        self.set_phase(&mut inner, CallPhase::Ringing);
        self.emit(CallEvent::IncomingCall { call });
    }

    async fn on_remote_hangup(&self, call_id: &CallId) {
        let active = [
            CallPhase::Calling,
            CallPhase::Ringing,
            CallPhase::Connecting,
            CallPhase::InCall,
        ];
        if let Some(generation) = self.matching_generation(call_id, &active).await {
            self.teardown(Some(generation), EndReason::RemoteHangup, RecordUpdate::Close)
                .await;
        }
    }

    async fn on_call_signal(&self, signal: CallSignal) {
        let CallSignal { call_id, payload } = signal;
        match payload {
            SignalPayload::Offer(offer) => {
                let mut inner = self.inner.lock().await;
                if inner.phase == CallPhase::Ringing
                    && inner.call_id() == Some(&call_id)
                    && inner.pending_offer.is_none()
                {
                    inner.pending_offer = Some(offer);
                } else {
                    tracing::debug!(%call_id, "Discarding unexpected offer");
                }
            }
            SignalPayload::Answer(answer) => {
                let generation = {
                    let inner = self.inner.lock().await;
                    let outgoing = inner
                        .call
                        .as_ref()
                        .is_some_and(|call| call.is_outgoing_for(&self.local_id));
                    let waiting = matches!(inner.phase, CallPhase::Calling | CallPhase::Connecting);
                    if !(outgoing && waiting && inner.call_id() == Some(&call_id)) {
                        tracing::debug!(%call_id, phase = %inner.phase, "Discarding unexpected answer");
                        return;
                    }
                    inner.generation
                };
                self.apply_answer(generation, answer).await;
            }
            SignalPayload::IceCandidate(candidate) => {
                self.on_remote_candidate(&call_id, candidate).await;
            }
            SignalPayload::Hangup => self.on_remote_hangup(&call_id).await,
        }
    }

    async fn on_remote_candidate(&self, call_id: &CallId, candidate: IceCandidate) {
        let (generation, session) = {
            let inner = self.inner.lock().await;
            let connected = matches!(inner.phase, CallPhase::Connecting | CallPhase::InCall);
            match (&inner.media, connected && inner.call_id() == Some(call_id)) {
                (Some(media), true) => (inner.generation, Arc::clone(&media.session)),
                _ => {
                    tracing::debug!(%call_id, phase = %inner.phase, "Discarding remote candidate");
                    return;
                }
            }
        };

        match self.negotiator.add_ice_candidate(&session, candidate).await {
            Ok(()) => {}
            Err(NegotiationError::NoRemoteDescription | NegotiationError::Closed) => {
                tracing::debug!(%call_id, "Discarding candidate the transport cannot take yet");
            }
            Err(e) => {
                self.fail(generation, &CallError::from(e)).await;
            }
        }
    }

    async fn apply_answer(&self, generation: u64, answer: SessionDescription) {
        let session = {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation) {
                return;
            }
            let Some(media) = inner.media.as_ref() else {
                tracing::debug!("Answer arrived before local media was ready");
                return;
            };
            let session = Arc::clone(&media.session);
            self.set_phase(&mut inner, CallPhase::Connecting);
            session
        };

        if let Err(e) = self
            .negotiator
            .apply_remote_description(&session, answer)
            .await
        {
            self.fail(generation, &CallError::from(e)).await;
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation) {
                tracing::debug!("Answer applied to a superseded attempt");
                return;
            }
            if let Some(call) = inner.call.as_mut() {
                if let Err(e) = call.transition(CallStatus::Accepted, Utc::now()) {
                    tracing::debug!(error = %e, "Local record already past pending");
                }
            }
        }
        if let Err(e) = self.enter_in_call(generation).await {
            tracing::debug!(error = %e, "Answer applied to a superseded attempt");
        }
    }

    async fn enter_in_call(&self, generation: u64) -> Result<(), CallError> {
        let (call_id, held) = {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation) {
                return Err(CallError::Cancelled);
            }
            let Some(call_id) = inner.call_id().cloned() else {
                return Err(CallError::Cancelled);
            };
            self.set_phase(&mut inner, CallPhase::InCall);
            inner.state.is_in_call = true;
            inner.candidates_released = true;
            self.emit(CallEvent::Connected {
                call_id: call_id.clone(),
            });
            self.emit(CallEvent::StateChanged(inner.state));
            (call_id, std::mem::take(&mut inner.held_candidates))
        };

        tracing::debug!(%call_id, held = held.len(), "Releasing local candidates");
        for candidate in held {
            self.send_candidate(&call_id, candidate).await;
        }
        Ok(())
    }

    async fn send_candidate(&self, call_id: &CallId, candidate: IceCandidate) {
        if let Err(e) = self
            .signaling
            .send(CallSignal::ice_candidate(call_id.clone(), candidate))
            .await
        {
            tracing::debug!(%call_id, error = %e, "Failed to send local candidate");
        }
    }

    #[tracing::instrument(skip(self, event), fields(session = %event.session))]
    async fn handle_transport(&self, event: NegotiatorEvent) {
        let NegotiatorEvent { session, event } = event;
        let mut inner = self.inner.lock().await;
        let current = inner.media.as_ref().map(|media| media.session.id());
        if current != Some(session) {
            tracing::debug!(current = ?current, "Discarding event from a stale transport");
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let released = inner.candidates_released;
                let call_id = inner.call_id().cloned();
                match call_id {
                    Some(call_id) if released => {
                        drop(inner);
                        self.send_candidate(&call_id, candidate).await;
                    }
                    _ => inner.held_candidates.push(candidate),
                }
            }
            TransportEvent::RemoteTrack(kind) => {
                tracing::debug!(%kind, "Remote media arrived");
                if !inner.state.has_remote_stream {
                    inner.state.has_remote_stream = true;
                    self.emit(CallEvent::StateChanged(inner.state));
                }
            }
            TransportEvent::StateChanged(TransportState::Failed) => {
                let generation = inner.generation;
                drop(inner);
                self.fail(
                    generation,
                    &CallError::Negotiation(NegotiationError::Transport(TransportError::Backend(
                        "connectivity failed".to_string(),
                    ))),
                )
                .await;
            }
            TransportEvent::StateChanged(state) => {
                tracing::debug!(?state, "Transport state changed");
            }
        }
    }

    /// Acquire local media and a transport carrying it, then install both in
    /// the media slot
    async fn prepare_media(
        &self,
        generation: u64,
        constraints: &MediaConstraints,
    ) -> Result<Arc<PeerSession>, CallError> {
        let stream = self.devices.acquire(constraints).await?;
        if !self.inner.lock().await.is_current(generation) {
            self.devices.release(stream).await;
            return Err(CallError::Cancelled);
        }

        let session = match self.negotiator.create_transport().await {
            Ok(session) => session,
            Err(e) => {
                self.devices.release(stream).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.negotiator.add_stream(&session, &stream).await {
            self.negotiator.close(&session).await;
            self.devices.release(stream).await;
            return Err(e.into());
        }

        let mut inner = self.inner.lock().await;
        if !inner.is_current(generation) {
            drop(inner);
            self.negotiator.close(&session).await;
            self.devices.release(stream).await;
            return Err(CallError::Cancelled);
        }
        inner.state.has_local_stream = true;
        inner.state.is_muted = false;
        inner.state.is_video_enabled = stream.video_track().is_some();
        inner.media = Some(ActiveMedia {
            stream,
            session: Arc::clone(&session),
        });
        self.emit(CallEvent::StateChanged(inner.state));
        Ok(session)
    }

    async fn ensure_current(&self, generation: u64) -> Result<(), CallError> {
        if self.inner.lock().await.is_current(generation) {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }

    async fn matching_generation(&self, call_id: &CallId, phases: &[CallPhase]) -> Option<u64> {
        let inner = self.inner.lock().await;
        if phases.contains(&inner.phase) && inner.call_id() == Some(call_id) {
            Some(inner.generation)
        } else {
            tracing::debug!(%call_id, current = ?inner.call_id(), phase = %inner.phase, "Discarding relay event for another call");
            None
        }
    }

    async fn fail(&self, generation: u64, error: &CallError) {
        tracing::warn!(error = %error, "Call failed; tearing down");
        self.teardown(
            Some(generation),
            EndReason::Failed(error.to_string()),
            RecordUpdate::Close,
        )
        .await;
    }

    /// Best effort: stop the far end ringing or close our side of the record
    async fn close_record(&self, call: &Call) {
        if call.status.is_terminal() {
            return;
        }
        let declining =
            call.status == CallStatus::Pending && !call.is_outgoing_for(&self.local_id);
        let result = if declining {
            self.records.reject_call(&call.id).await
        } else {
            self.records.end_call(&call.id).await
        };
        if let Err(e) = result {
            tracing::warn!(call_id = %call.id, error = %e, "Best-effort record update failed");
        }
    }

    async fn teardown(&self, expected: Option<u64>, reason: EndReason, update: RecordUpdate) {
        let (media, call, generation) = {
            let mut inner = self.inner.lock().await;
            if expected.is_some_and(|generation| generation != inner.generation) {
                tracing::debug!(?reason, "Teardown for a superseded attempt skipped");
                return;
            }
            if !inner.phase.is_active() {
                return;
            }
            self.set_phase(&mut inner, CallPhase::Ending);
            inner.generation += 1;
            inner.pending_offer = None;
            inner.held_candidates.clear();
            inner.candidates_released = false;
            (inner.media.take(), inner.call.take(), inner.generation)
        };

        if let Some(media) = media {
            self.negotiator.close(&media.session).await;
            self.devices.release(media.stream).await;
        }

        let mut call = call;
        if let Some(call) = call.as_mut() {
            if update == RecordUpdate::Close {
                self.close_record(call).await;
            }
            let next = match (&reason, call.status) {
                (EndReason::Rejected | EndReason::Declined, CallStatus::Pending) => {
                    Some(CallStatus::Rejected)
                }
                (_, CallStatus::Pending) => Some(CallStatus::Missed),
                (_, CallStatus::Accepted) => Some(CallStatus::Ended),
                _ => None,
            };
            if let Some(next) = next {
                if let Err(e) = call.transition(next, Utc::now()) {
                    tracing::debug!(error = %e, "Local record status unchanged");
                }
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.generation == generation && inner.phase == CallPhase::Ending {
                inner.state = CallState::default();
                self.set_phase(&mut inner, CallPhase::Idle);
                self.emit(CallEvent::StateChanged(inner.state));
            }
        }
        tracing::info!(?reason, call_id = ?call.as_ref().map(|c| c.id.as_str()), "Call ended");
        self.emit(CallEvent::CallEnded { call, reason });
    }

    fn set_phase(&self, inner: &mut Inner, to: CallPhase) {
        let from = inner.phase;
        if from == to {
            return;
        }
        inner.phase = to;
        tracing::info!(%from, %to, "Call phase changed");
        self.emit(CallEvent::PhaseChanged { from, to });
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
