//! Local media acquisition and track handles
//!
//! Media devices are platform-specific; the manager only needs to acquire a
//! set of tracks, flip their enabled flags and stop them on teardown. The
//! `MediaSource` trait is that seam. `SyntheticMediaSource` produces device-
//! free tracks for tests, headless runs and the loopback demo.

use crate::types::{MediaConstraints, MediaKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
///
/// All of these are fatal to the call attempt; media acquisition is never
/// retried.
#[derive(Error, Debug)]
pub enum MediaError {
    /// Camera or microphone is missing or busy
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The user denied capture permission
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
}

/// Handle to one local media track
///
/// Cloning shares the underlying flags, so a paused track is paused for every
/// holder of the handle.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: MediaKind,
    /// Capture width in pixels (0 for audio)
    pub width: u32,
    /// Capture height in pixels (0 for audio)
    pub height: u32,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create an audio track handle
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Audio,
            width: 0,
            height: 0,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a video track handle with its capture resolution
    pub fn video(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Video,
            width,
            height,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the track is currently feeding frames
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the enabled flag and return the new value
    pub fn toggle_enabled(&self) -> bool {
        // fetch_xor returns the previous value
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Stop capture for good; a stopped track cannot be re-enabled
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether the track was stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The set of local tracks acquired for one call attempt
#[derive(Debug, Clone, Default)]
pub struct LocalMediaStream {
    /// Acquired tracks, in acquisition order
    pub tracks: Vec<LocalTrack>,
}

impl LocalMediaStream {
    /// First track of the given kind, if any
    pub fn first_track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Resolution of the first video track, `(0, 0)` when audio only
    pub fn video_resolution(&self) -> (u32, u32) {
        self.first_track(MediaKind::Video)
            .map(|t| (t.width, t.height))
            .unwrap_or((0, 0))
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Source of local media
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire tracks satisfying the constraints
    ///
    /// # Errors
    ///
    /// Returns error when a requested device is unavailable or permission is
    /// denied. Callers treat any error as fatal.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, MediaError>;
}

/// Device-free media source producing silent/blank tracks
///
/// Negotiation only needs track handles, not actual frames, so this source is
/// sufficient for tests, CI and the loopback demo.
#[derive(Debug, Clone)]
pub struct SyntheticMediaSource {
    /// Resolution reported for synthetic video tracks
    pub video_resolution: (u32, u32),
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self {
            video_resolution: (1280, 720),
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, MediaError> {
        let mut tracks = Vec::new();
        if constraints.has_audio() {
            tracks.push(LocalTrack::audio("synthetic-audio"));
        }
        if constraints.has_video() {
            let (width, height) = self.video_resolution;
            tracks.push(LocalTrack::video("synthetic-video", width, height));
        }
        tracing::debug!(count = tracks.len(), "acquired synthetic media tracks");
        Ok(LocalMediaStream { tracks })
    }
}
