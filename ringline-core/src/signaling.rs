//! Relay signaling channel
//!
//! The relay is a persistent, identity-keyed channel. Every frame in either
//! direction is a JSON object `{"event": "<name>", "data": {...}}` where
//! `<name>` is one of `incoming-call`, `call-accepted`, `call-rejected`,
//! `call-ended` or `call-signal`. Only `call-signal` frames are sent by
//! clients; the others are pushed by the relay.
//!
//! [`SignalingChannel`] is the seam the controller talks to.
//! [`WsSignalingChannel`] binds it to a WebSocket relay and reconnects on its
//! own, reporting [`SignalingEvent::Connected`] and
//! [`SignalingEvent::Disconnected`] as the link comes and goes.

use crate::identity::ParticipantId;
use crate::types::{Call, CallId, CallSignal, SessionDescription};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Channel is not connected to the relay
    #[error("Signaling channel not connected")]
    NotConnected,

    /// Relay URL unusable
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    /// Frame could not be encoded
    #[error("Failed to encode frame: {0}")]
    Encode(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Frame exchanged with the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// Someone is calling the local participant
    IncomingCall {
        /// Pending call record
        call: Call,
        /// Caller's session offer
        offer: SessionDescription,
    },
    /// The far end accepted an outgoing call
    CallAccepted {
        /// Accepted call
        #[serde(rename = "callId")]
        call_id: CallId,
        /// Far end's answer, when the relay forwards it with the acceptance
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<SessionDescription>,
    },
    /// The far end declined an outgoing call
    CallRejected {
        /// Rejected call
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    /// The far end ended or cancelled the call
    CallEnded {
        /// Ended call
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    /// Negotiation message
    CallSignal(CallSignal),
}

impl RelayEvent {
    /// Call the frame refers to
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::IncomingCall { call, .. } => &call.id,
            Self::CallAccepted { call_id, .. }
            | Self::CallRejected { call_id }
            | Self::CallEnded { call_id } => call_id,
            Self::CallSignal(signal) => &signal.call_id,
        }
    }
}

/// Inbound channel traffic
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Link to the relay is up
    Connected,
    /// Link to the relay dropped
    Disconnected {
        /// Why
        reason: String,
    },
    /// Relay frame
    Relay(RelayEvent),
}

/// Persistent identity-keyed channel to the relay
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a negotiation message
    ///
    /// Returns [`SignalingError::NotConnected`] while the link is down.
    async fn send(&self, signal: CallSignal) -> Result<(), SignalingError>;

    /// Whether the link is currently up
    fn is_connected(&self) -> bool;

    /// Identity this channel is keyed by
    fn participant(&self) -> &ParticipantId;
}

/// Relay connection parameters
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// `ws://` or `wss://` relay endpoint
    pub relay_url: Url,
    /// Local participant
    pub participant: ParticipantId,
    /// First reconnect delay
    pub reconnect_min: Duration,
    /// Reconnect delay cap
    pub reconnect_max: Duration,
}

impl SignalingConfig {
    /// Config with default reconnect bounds
    pub fn new(relay_url: Url, participant: ParticipantId) -> Self {
        Self {
            relay_url,
            participant,
            reconnect_min: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
        }
    }

    /// Relay URL with the identity query attached
    pub fn connect_url(&self) -> Url {
        let mut url = self.relay_url.clone();
        url.query_pairs_mut()
            .append_pair("userId", self.participant.as_str());
        url
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.reconnect_min
            .saturating_mul(1u32 << exponent)
            .min(self.reconnect_max)
    }
}

struct Outbound {
    text: String,
    ack: oneshot::Sender<Result<(), SignalingError>>,
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`SignalingChannel`] over a WebSocket relay
pub struct WsSignalingChannel {
    participant: ParticipantId,
    connected: Arc<AtomicBool>,
    outbound: mpsc::Sender<Outbound>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsSignalingChannel {
    /// Start the channel
    ///
    /// Returns immediately; the link is established in the background and
    /// reported as [`SignalingEvent::Connected`] on the returned receiver.
    ///
    /// # Errors
    ///
    /// Returns error if the relay URL is not `ws://` or `wss://`
    #[tracing::instrument(skip(config), fields(relay = %config.relay_url, participant = %config.participant))]
    pub fn connect(
        config: SignalingConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SignalingEvent>), SignalingError> {
        match config.relay_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SignalingError::InvalidUrl(format!(
                    "unsupported scheme {other:?}"
                )))
            }
        }

        let connected = Arc::new(AtomicBool::new(false));
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(256);

        let channel = Arc::new(Self {
            participant: config.participant.clone(),
            connected: Arc::clone(&connected),
            outbound: outbound_tx,
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::run(config, connected, outbound_rx, events_tx));
        *channel.task.lock() = Some(handle);

        Ok((channel, events_rx))
    }

    /// Stop the background connection
    pub fn shutdown(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!(participant = %self.participant, "Signaling channel shut down");
    }

    async fn run(
        config: SignalingConfig,
        connected: Arc<AtomicBool>,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        events_tx: mpsc::Sender<SignalingEvent>,
    ) {
        let url = config.connect_url();
        let mut attempt: u32 = 0;

        loop {
            match connect_async(url.as_str()).await {
                Ok((ws, _response)) => {
                    attempt = 0;
                    connected.store(true, Ordering::SeqCst);
                    tracing::info!(relay = %config.relay_url, "Signaling channel connected");
                    if events_tx.send(SignalingEvent::Connected).await.is_err() {
                        return;
                    }

                    let end = Self::session(ws, &mut outbound_rx, &events_tx).await;
                    connected.store(false, Ordering::SeqCst);
                    match end {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(%reason, "Signaling channel disconnected");
                            if events_tx
                                .send(SignalingEvent::Disconnected { reason })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "Relay connection failed");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = config.backoff(attempt);
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to relay");

            // Sends while the link is down fail fast
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    outbound = outbound_rx.recv() => match outbound {
                        Some(outbound) => {
                            let _ = outbound.ack.send(Err(SignalingError::NotConnected));
                        }
                        None => return,
                    },
                }
            }
        }
    }

    async fn session(
        ws: WsStream,
        outbound_rx: &mut mpsc::Receiver<Outbound>,
        events_tx: &mpsc::Sender<SignalingEvent>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => text.to_string(),
                            Err(_) => {
                                tracing::debug!(len = data.len(), "Dropping non-UTF-8 binary frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            return SessionEnd::Lost("closed by relay".to_string())
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    };

                    match serde_json::from_str::<RelayEvent>(&text) {
                        Ok(event) => {
                            tracing::trace!(call_id = %event.call_id(), "Relay frame received");
                            if events_tx.send(SignalingEvent::Relay(event)).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, len = text.len(), "Ignoring unrecognized relay frame");
                        }
                    }
                }
                outbound = outbound_rx.recv() => match outbound {
                    Some(Outbound { text, ack }) => {
                        let result = write
                            .send(Message::Text(text.into()))
                            .await
                            .map_err(|e| SignalingError::TransportError(e.to_string()));
                        let failure = result.as_ref().err().map(ToString::to_string);
                        let _ = ack.send(result);
                        if let Some(reason) = failure {
                            return SessionEnd::Lost(reason);
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                },
            }
        }
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    #[tracing::instrument(skip(self, signal), fields(call_id = %signal.call_id, kind = %signal.kind()))]
    async fn send(&self, signal: CallSignal) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = serde_json::to_string(&RelayEvent::CallSignal(signal))
            .map_err(|e| SignalingError::Encode(e.to_string()))?;
        let (ack, ack_rx) = oneshot::channel();
        self.outbound
            .send(Outbound { text, ack })
            .await
            .map_err(|_| SignalingError::NotConnected)?;
        ack_rx.await.map_err(|_| SignalingError::NotConnected)?
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn participant(&self) -> &ParticipantId {
        &self.participant
    }
}
