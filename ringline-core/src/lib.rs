//! Ringline - two-party call signaling and media negotiation
//!
//! This library drives one-to-one voice and video calls between participants
//! of a shared service. It features:
//!
//! - **Call lifecycle**: a single controller owns the local phase machine
//!   (`Idle`, `Calling`, `Ringing`, `Connecting`, `InCall`) and releases media
//!   and transports on every path back to `Idle`
//! - **Relay signaling**: offers, answers, candidates and hangups travel over
//!   a persistent identity-keyed WebSocket relay
//! - **Call records**: a REST record service assigns call identifiers and
//!   tracks record status
//! - **WebRTC transport**: peer connections via the `webrtc` crate
//!   (feature `webrtc-backend`)
//!
//! # Examples
//!
//! ```rust,no_run
//! use ringline_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut config = ClientConfig::default();
//! config.participant = ParticipantId::parse("alice")?;
//! config.validate()?;
//!
//! let (channel, signaling_events) = WsSignalingChannel::connect(config.signaling_config())?;
//! let records = Arc::new(HttpCallRecordClient::new(
//!     config.api_base_url.clone(),
//!     config.access_token.clone(),
//!     config.request_timeout(),
//! )?);
//! let (negotiator, transport_events) = MediaNegotiator::new(
//!     config.negotiator_config(),
//!     Arc::new(WebRtcTransportFactory::new()),
//! )?;
//!
//! let controller = CallController::new(
//!     channel,
//!     records,
//!     Arc::new(StaticDeviceProvider::with_default_devices()),
//!     negotiator,
//! );
//! controller.spawn(signaling_events, transport_events);
//!
//! controller
//!     .initiate_call(ParticipantId::parse("bob")?, CallType::Video)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Call, signal and state types
pub mod types;

/// Participant identity
pub mod identity;

/// Local capture media
pub mod media;

/// Session negotiation and peer transport ownership
pub mod negotiator;

/// `webrtc` crate peer transport
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_transport;

/// Relay signaling channel
pub mod signaling;

/// Call record service client
pub mod record;

/// Client configuration
pub mod config;

/// Call lifecycle controller
pub mod controller;

// Re-export main types at crate root
pub use config::{ClientConfig, ConfigError};
pub use controller::{CallController, CallError, Command, ControllerEvent};
pub use identity::ParticipantId;
pub use media::{
    AudioDevice, LocalMediaStream, LocalTrack, MediaDeviceProvider, MediaError,
    StaticDeviceProvider, VideoDevice,
};
pub use negotiator::{
    IceServer, MediaNegotiator, NegotiationError, NegotiatorConfig, NegotiatorEvent, PeerSession,
    PeerTransport, SessionId, SignalingState, TransportError, TransportEvent, TransportEventSink,
    TransportFactory, TransportState,
};
pub use record::{AcceptResponse, CallRecordClient, CreateCallRequest, HttpCallRecordClient, RecordError};
pub use signaling::{
    RelayEvent, SignalingChannel, SignalingConfig, SignalingError, SignalingEvent,
    WsSignalingChannel,
};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ClientConfig;
    pub use crate::controller::{CallController, CallError, Command};
    pub use crate::identity::ParticipantId;
    pub use crate::media::{MediaDeviceProvider, StaticDeviceProvider};
    pub use crate::negotiator::{MediaNegotiator, NegotiatorConfig};
    pub use crate::record::{CallRecordClient, HttpCallRecordClient};
    pub use crate::signaling::{SignalingChannel, WsSignalingChannel};
    pub use crate::types::{Call, CallEvent, CallId, CallPhase, CallState, CallType};
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_transport::WebRtcTransportFactory;
}
