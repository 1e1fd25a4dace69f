//! Peer transport backed by the `webrtc` crate

use crate::media::LocalTrack;
use crate::negotiator::{
    NegotiatorConfig, PeerTransport, TransportError, TransportEvent, TransportEventSink,
    TransportFactory, TransportState,
};
use crate::types::{IceCandidate, MediaKind, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "ringline";

fn backend(e: impl std::fmt::Display) -> TransportError {
    TransportError::Backend(e.to_string())
}

/// Builds [`WebRtcTransport`]s with the default codec and interceptor set
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    #[tracing::instrument(skip(self, config, events), fields(session = %events.session()))]
    async fn create(
        &self,
        config: &NegotiatorConfig,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        Ok(Box::new(WebRtcTransport::new(config, events).await?))
    }
}

/// One `RTCPeerConnection` and the sample tracks attached to it
///
/// Each sample track is paired with the [`LocalTrack`] it carries; samples
/// for a disabled track are dropped before they reach the connection.
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    tracks: Mutex<Vec<(LocalTrack, Arc<TrackLocalStaticSample>)>>,
}

impl WebRtcTransport {
    /// Create a peer connection with the default codec and interceptor set
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot build the connection
    pub async fn new(
        config: &NegotiatorConfig,
        events: TransportEventSink,
    ) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(backend)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to create peer connection");
            backend(e)
        })?);

        Self::wire_callbacks(&peer_connection, &events);
        tracing::debug!("Peer connection created");

        Ok(Self {
            peer_connection,
            tracks: Mutex::new(Vec::new()),
        })
    }

    /// Write one media sample to the first attached track of `kind`
    ///
    /// Returns `false` without writing when no such track is attached or the
    /// track is disabled (muted audio, camera off).
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails to packetize or send the sample
    pub async fn write_sample(&self, kind: MediaKind, sample: &Sample) -> Result<bool, TransportError> {
        let target = self
            .tracks
            .lock()
            .iter()
            .find(|(track, _)| track.kind() == kind)
            .map(|(track, sample_track)| (track.is_enabled(), Arc::clone(sample_track)));

        match target {
            Some((true, sample_track)) => {
                sample_track.write_sample(sample).await.map_err(backend)?;
                Ok(true)
            }
            Some((false, _)) | None => Ok(false),
        }
    }

    fn wire_callbacks(peer_connection: &RTCPeerConnection, events: &TransportEventSink) {
        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    tracing::debug!(%kind, "Remote track arrived");
                    sink.emit(TransportEvent::RemoteTrack(kind));
                })
            },
        ));

        let sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    let state = match state {
                        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                            TransportState::New
                        }
                        RTCPeerConnectionState::Connecting => TransportState::Connecting,
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                    };
                    sink.emit(TransportEvent::StateChanged(state));
                })
            },
        ));
    }

    fn sample_track(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        let codec = match track.kind() {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        Arc::new(TrackLocalStaticSample::new(
            codec,
            track.id().to_string(),
            STREAM_ID.to_string(),
        ))
    }

    fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
        let sdp_type = match description.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Unspecified => {
                return Err(TransportError::Backend(
                    "unspecified description type".to_string(),
                ))
            }
        };
        Ok(SessionDescription {
            sdp_type,
            sdp: description.sdp,
        })
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
            SdpType::Rollback => {
                return Err(TransportError::Backend(
                    "rollback descriptions are not supported".to_string(),
                ))
            }
        }
        .map_err(backend)
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let sample_track = Self::sample_track(track);
        let local: Arc<dyn TrackLocal + Send + Sync> = sample_track.clone();
        self.peer_connection
            .add_track(local)
            .await
            .map_err(backend)?;
        self.tracks.lock().push((track.clone(), sample_track));
        tracing::trace!(track_id = %track.id(), kind = %track.kind(), "Sample track added");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(backend)?;
        Self::from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(backend)?;
        Self::from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.peer_connection
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.peer_connection
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(backend)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(backend)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.tracks.lock().clear();
        self.peer_connection.close().await.map_err(backend)
    }
}
