//! Local capture media
//!
//! A [`MediaDeviceProvider`] hands out [`LocalMediaStream`]s for a set of
//! [`MediaConstraints`]. Streams own their tracks; stopping a stream stops
//! every track and is idempotent. Track enabled flags are shared between all
//! clones of a track so the peer transport sees mute/unmute immediately.

use crate::types::{MediaConstraints, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(MediaKind),

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),
}

#[derive(Debug)]
struct TrackFlags {
    enabled: AtomicBool,
    live: AtomicBool,
}

/// A local capture track
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    device_id: String,
    flags: Arc<TrackFlags>,
}

impl LocalTrack {
    fn new(kind: MediaKind, device_id: &str) -> Self {
        Self {
            id: format!("{kind}-{}", Uuid::new_v4()),
            kind,
            device_id: device_id.to_string(),
            flags: Arc::new(TrackFlags {
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Device this track captures from
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether captured samples should be forwarded
    pub fn is_enabled(&self) -> bool {
        self.flags.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable forwarding of captured samples
    pub fn set_enabled(&self, enabled: bool) {
        self.flags.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether capture is still running
    pub fn is_live(&self) -> bool {
        self.flags.live.load(Ordering::SeqCst)
    }

    /// Stop capture. Returns `true` if this call stopped it.
    pub fn stop(&self) -> bool {
        self.flags.live.swap(false, Ordering::SeqCst)
    }
}

/// A set of local capture tracks acquired together
#[derive(Debug, Clone)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMediaStream {
    /// Build a stream from tracks
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: format!("stream-{}", Uuid::new_v4()),
            tracks,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// First audio track
    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.track(MediaKind::Audio)
    }

    /// First video track
    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.track(MediaKind::Video)
    }

    fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// True while any track is still capturing
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(LocalTrack::is_live)
    }

    /// Stop every track
    pub fn stop(&self) {
        let stopped = self.tracks.iter().filter(|t| t.stop()).count();
        if stopped > 0 {
            tracing::debug!(stream_id = %self.id, stopped, "Local stream stopped");
        }
    }
}

/// Source of local capture streams
///
/// Implementations wrap the platform's camera/microphone access. Dropping a
/// stream does not release hardware; callers must hand it back through
/// [`MediaDeviceProvider::release`].
#[async_trait]
pub trait MediaDeviceProvider: Send + Sync {
    /// Acquire a stream satisfying `constraints`
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, MediaError>;

    /// Release a stream acquired from this provider
    async fn release(&self, stream: LocalMediaStream) {
        stream.stop();
    }
}

/// Audio device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
}

/// Video device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
}

/// Device provider backed by a fixed device list
///
/// Grants a stream whenever every requested kind has a device and access is
/// allowed. Keeps a handle on each stream it issued so callers can check for
/// leaked capture.
pub struct StaticDeviceProvider {
    audio_devices: Vec<AudioDevice>,
    video_devices: Vec<VideoDevice>,
    allowed: AtomicBool,
    issued: Mutex<Vec<LocalMediaStream>>,
}

impl StaticDeviceProvider {
    /// Provider with the given devices
    #[must_use]
    pub fn new(audio_devices: Vec<AudioDevice>, video_devices: Vec<VideoDevice>) -> Self {
        Self {
            audio_devices,
            video_devices,
            allowed: AtomicBool::new(true),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Provider with one default microphone and camera
    #[must_use]
    pub fn with_default_devices() -> Self {
        Self::new(
            vec![AudioDevice {
                id: "default-audio".to_string(),
                name: "Default Audio Device".to_string(),
            }],
            vec![VideoDevice {
                id: "default-video".to_string(),
                name: "Default Video Device".to_string(),
            }],
        )
    }

    /// Allow or deny access to every device
    pub fn set_allowed(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::SeqCst);
    }

    /// Available audio devices
    #[must_use]
    pub fn audio_devices(&self) -> &[AudioDevice] {
        &self.audio_devices
    }

    /// Available video devices
    #[must_use]
    pub fn video_devices(&self) -> &[VideoDevice] {
        &self.video_devices
    }

    /// Number of issued streams still capturing
    #[must_use]
    pub fn live_streams(&self) -> usize {
        self.issued.lock().iter().filter(|s| s.is_live()).count()
    }

    /// Total number of streams ever issued
    #[must_use]
    pub fn issued_streams(&self) -> usize {
        self.issued.lock().len()
    }
}

impl Default for StaticDeviceProvider {
    fn default() -> Self {
        Self::with_default_devices()
    }
}

#[async_trait]
impl MediaDeviceProvider for StaticDeviceProvider {
    #[tracing::instrument(skip(self), fields(audio = constraints.audio, video = constraints.video))]
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, MediaError> {
        if !self.allowed.load(Ordering::SeqCst) {
            tracing::warn!("Media access denied");
            return Err(MediaError::PermissionDenied(
                "capture access is not allowed".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if constraints.has_audio() {
            let device = self
                .audio_devices
                .first()
                .ok_or(MediaError::DeviceNotFound(MediaKind::Audio))?;
            tracks.push(LocalTrack::new(MediaKind::Audio, &device.id));
        }
        if constraints.has_video() {
            let device = self
                .video_devices
                .first()
                .ok_or(MediaError::DeviceNotFound(MediaKind::Video))?;
            tracks.push(LocalTrack::new(MediaKind::Video, &device.id));
        }
        if tracks.is_empty() {
            return Err(MediaError::StreamError(
                "constraints request no media".to_string(),
            ));
        }

        let stream = LocalMediaStream::new(tracks);
        tracing::debug!(stream_id = %stream.id(), tracks = stream.tracks().len(), "Local stream acquired");
        self.issued.lock().push(stream.clone());
        Ok(stream)
    }
}
