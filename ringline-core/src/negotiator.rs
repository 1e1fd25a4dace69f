//! Session negotiation and peer transport ownership
//!
//! [`MediaNegotiator`] translates call-level actions into session-description
//! and transport primitives. It knows nothing about call records. The actual
//! media path is behind the [`PeerTransport`] seam; [`TransportFactory`]
//! builds one per call.
//!
//! # Ownership
//!
//! At most one transport is live per negotiator. [`MediaNegotiator::create_transport`]
//! fails with [`NegotiationError::TransportBusy`] until the previous
//! [`PeerSession`] has been closed. A session dropped without
//! [`MediaNegotiator::close`] stays counted as live, so leaks show up in
//! [`MediaNegotiator::live_transports`].
//!
//! # Signaling order
//!
//! ```text
//!   Stable ──create_offer──▶ HaveLocalOffer ──remote answer──▶ Stable
//!   Stable ──remote offer──▶ HaveRemoteOffer ──create_answer──▶ Stable
//!   any ──close──▶ Closed
//! ```

use crate::media::{LocalMediaStream, LocalTrack};
use crate::types::{IceCandidate, MediaKind, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Backend transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Backend rejected the operation
    #[error("Transport backend error: {0}")]
    Backend(String),

    /// Backend already closed
    #[error("Transport closed")]
    Closed,
}

/// Negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Configuration error
    #[error("Invalid negotiator configuration: {0}")]
    InvalidConfig(String),

    /// A transport is already live
    #[error("A peer transport is already live")]
    TransportBusy,

    /// Session was closed
    #[error("Peer session is closed")]
    Closed,

    /// Operation not allowed in the current signaling state
    #[error("Cannot {operation} in signaling state {state:?}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        state: SignalingState,
    },

    /// Candidate arrived before any remote description
    #[error("No remote description set")]
    NoRemoteDescription,

    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Offer/answer state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer applied, waiting for the answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet created
    HaveRemoteOffer,
    /// Session closed
    Closed,
}

/// Connectivity state reported by a transport backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Not started
    New,
    /// Checking connectivity
    Connecting,
    /// Media can flow
    Connected,
    /// Temporarily lost
    Disconnected,
    /// Gave up
    Failed,
    /// Closed locally
    Closed,
}

/// Network traversal assist server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// `stun:`/`turn:` URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Negotiator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatorConfig {
    /// Traversal servers handed to every transport (never empty)
    pub ice_servers: Vec<IceServer>,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
        }
    }
}

impl NegotiatorConfig {
    /// Check the server list
    ///
    /// # Errors
    ///
    /// Returns error if the list is empty or a URL has an unknown scheme
    pub fn validate(&self) -> Result<(), NegotiationError> {
        if self.ice_servers.is_empty() {
            return Err(NegotiationError::InvalidConfig(
                "at least one ICE server is required".to_string(),
            ));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(NegotiationError::InvalidConfig(
                    "ICE server without URLs".to_string(),
                ));
            }
            for url in &server.urls {
                let known = ["stun:", "stuns:", "turn:", "turns:"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme));
                if !known {
                    return Err(NegotiationError::InvalidConfig(format!(
                        "unsupported ICE server URL: {url}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Identifier of one peer session, unique per negotiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Asynchronous transport notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Local candidate discovered
    LocalCandidate(IceCandidate),
    /// Far end media arrived
    RemoteTrack(MediaKind),
    /// Connectivity changed
    StateChanged(TransportState),
}

/// Transport notification tagged with its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorEvent {
    /// Session that produced the event
    pub session: SessionId,
    /// What happened
    pub event: TransportEvent,
}

/// Handle given to a transport backend for reporting events
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<NegotiatorEvent>,
}

impl TransportEventSink {
    #[cfg(test)]
    pub(crate) fn detached(session: u64) -> (Self, mpsc::UnboundedReceiver<NegotiatorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                session: SessionId(session),
                tx,
            },
            rx,
        )
    }

    /// Session the sink reports for
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Report an event; silently dropped once the negotiator is gone
    pub fn emit(&self, event: TransportEvent) {
        if self
            .tx
            .send(NegotiatorEvent {
                session: self.session,
                event,
            })
            .is_err()
        {
            tracing::trace!(session = %self.session, "Negotiator event receiver dropped");
        }
    }
}

/// Peer transport backend
///
/// One instance carries the media of one call. Implementations report
/// candidates, remote tracks and connectivity through the
/// [`TransportEventSink`] they were created with.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Create an offer without applying it
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer without applying it
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a local description
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Apply the far end's description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Add a far end candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Release the media path
    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds peer transports
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport with no tracks attached
    async fn create(
        &self,
        config: &NegotiatorConfig,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}

#[derive(Debug)]
struct NegotiationState {
    signaling: SignalingState,
    has_remote_description: bool,
}

/// One peer transport plus its negotiation bookkeeping
pub struct PeerSession {
    id: SessionId,
    transport: Box<dyn PeerTransport>,
    negotiation: Mutex<NegotiationState>,
    tracks: Mutex<Vec<LocalTrack>>,
    closed: AtomicBool,
    live: Arc<AtomicUsize>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("signaling", &self.signaling_state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerSession {
    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current offer/answer state
    pub fn signaling_state(&self) -> SignalingState {
        self.negotiation.lock().signaling
    }

    /// Whether a remote description has been applied
    pub fn has_remote_description(&self) -> bool {
        self.negotiation.lock().has_remote_description
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Local tracks attached so far
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.lock().clone()
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: SignalingState,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let state = self.signaling_state();
        if state == expected {
            Ok(())
        } else {
            Err(NegotiationError::InvalidState { operation, state })
        }
    }

    fn set_signaling(&self, next: SignalingState) {
        let mut negotiation = self.negotiation.lock();
        if negotiation.signaling != SignalingState::Closed {
            negotiation.signaling = next;
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if !self.is_closed() {
            tracing::warn!(session = %self.id, "Peer session dropped without close; transport leaked");
        }
    }
}

/// Session-description and transport coordinator
pub struct MediaNegotiator {
    config: NegotiatorConfig,
    factory: Arc<dyn TransportFactory>,
    live: Arc<AtomicUsize>,
    next_session: AtomicU64,
    events_tx: mpsc::UnboundedSender<NegotiatorEvent>,
}

impl MediaNegotiator {
    /// Create a negotiator and the receiver for its transport events
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        config: NegotiatorConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NegotiatorEvent>), NegotiationError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                config,
                factory,
                live: Arc::new(AtomicUsize::new(0)),
                next_session: AtomicU64::new(1),
                events_tx,
            },
            events_rx,
        ))
    }

    /// Configuration in use
    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Number of sessions created and not yet closed
    pub fn live_transports(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Create a new transport with no tracks
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::TransportBusy`] while another session is
    /// live, or the backend error if creation fails
    #[tracing::instrument(skip(self))]
    pub async fn create_transport(&self) -> Result<Arc<PeerSession>, NegotiationError> {
        if self
            .live
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Refusing to create a second live transport");
            return Err(NegotiationError::TransportBusy);
        }

        let id = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        let sink = TransportEventSink {
            session: id,
            tx: self.events_tx.clone(),
        };

        match self.factory.create(&self.config, sink).await {
            Ok(transport) => {
                tracing::debug!(session = %id, "Peer transport created");
                Ok(Arc::new(PeerSession {
                    id,
                    transport,
                    negotiation: Mutex::new(NegotiationState {
                        signaling: SignalingState::Stable,
                        has_remote_description: false,
                    }),
                    tracks: Mutex::new(Vec::new()),
                    closed: AtomicBool::new(false),
                    live: Arc::clone(&self.live),
                }))
            }
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(session = %id, error = %e, "Peer transport creation failed");
                Err(e.into())
            }
        }
    }

    /// Attach every track of a local stream
    ///
    /// # Errors
    ///
    /// Returns error if the session is closed or the backend refuses a track
    #[tracing::instrument(skip(self, session, stream), fields(session = %session.id(), stream_id = %stream.id()))]
    pub async fn add_stream(
        &self,
        session: &PeerSession,
        stream: &LocalMediaStream,
    ) -> Result<(), NegotiationError> {
        for track in stream.tracks() {
            session.ensure_open()?;
            session.transport.add_track(track).await?;
            session.tracks.lock().push(track.clone());
            tracing::trace!(track_id = %track.id(), kind = %track.kind(), "Track attached");
        }
        Ok(())
    }

    /// Create an offer and apply it locally
    ///
    /// # Errors
    ///
    /// Returns error if the session is not `Stable` or the backend fails
    #[tracing::instrument(skip(self, session), fields(session = %session.id()))]
    pub async fn create_offer(
        &self,
        session: &PeerSession,
    ) -> Result<SessionDescription, NegotiationError> {
        session.expect_state("create an offer", SignalingState::Stable)?;
        let offer = session.transport.create_offer().await?;
        session.ensure_open()?;
        session
            .transport
            .set_local_description(offer.clone())
            .await?;
        session.set_signaling(SignalingState::HaveLocalOffer);
        tracing::debug!(sdp_len = offer.sdp.len(), "Local offer applied");
        Ok(offer)
    }

    /// Create an answer to the applied remote offer and apply it locally
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer is pending or the backend fails
    #[tracing::instrument(skip(self, session), fields(session = %session.id()))]
    pub async fn create_answer(
        &self,
        session: &PeerSession,
    ) -> Result<SessionDescription, NegotiationError> {
        session.expect_state("create an answer", SignalingState::HaveRemoteOffer)?;
        let answer = session.transport.create_answer().await?;
        session.ensure_open()?;
        session
            .transport
            .set_local_description(answer.clone())
            .await?;
        session.set_signaling(SignalingState::Stable);
        tracing::debug!(sdp_len = answer.sdp.len(), "Local answer applied");
        Ok(answer)
    }

    /// Apply the far end's description
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Closed`] after close, `InvalidState` when
    /// the description type does not fit the current state
    #[tracing::instrument(skip(self, session, description), fields(session = %session.id(), sdp_type = ?description.sdp_type))]
    pub async fn apply_remote_description(
        &self,
        session: &PeerSession,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        session.ensure_open()?;
        let state = session.signaling_state();
        let next = match (state, description.sdp_type) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
            (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
            (SignalingState::HaveLocalOffer, SdpType::Pranswer) => SignalingState::HaveLocalOffer,
            _ => {
                return Err(NegotiationError::InvalidState {
                    operation: "apply a remote description",
                    state,
                })
            }
        };

        session.transport.set_remote_description(description).await?;
        {
            let mut negotiation = session.negotiation.lock();
            negotiation.has_remote_description = true;
        }
        session.set_signaling(next);
        tracing::debug!(state = ?next, "Remote description applied");
        Ok(())
    }

    /// Add a far end candidate
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::NoRemoteDescription`] for candidates that
    /// precede the remote description; they are not queued
    #[tracing::instrument(skip(self, session, candidate), fields(session = %session.id()))]
    pub async fn add_ice_candidate(
        &self,
        session: &PeerSession,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        session.ensure_open()?;
        if !session.has_remote_description() {
            return Err(NegotiationError::NoRemoteDescription);
        }
        session.transport.add_ice_candidate(candidate).await?;
        tracing::trace!("Remote candidate added");
        Ok(())
    }

    /// Stop attached tracks and release the transport
    ///
    /// Safe to call more than once; only the first call has an effect.
    #[tracing::instrument(skip(self, session), fields(session = %session.id()))]
    pub async fn close(&self, session: &PeerSession) {
        if session.closed.swap(true, Ordering::SeqCst) {
            tracing::trace!("Session already closed");
            return;
        }

        session.set_signaling(SignalingState::Closed);
        let tracks = std::mem::take(&mut *session.tracks.lock());
        for track in &tracks {
            track.stop();
        }

        if let Err(e) = session.transport.close().await {
            // Continue releasing even if the backend complains
            tracing::warn!(error = %e, "Transport close reported an error");
        }
        session.live.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(tracks = tracks.len(), "Peer session closed");
    }
}
