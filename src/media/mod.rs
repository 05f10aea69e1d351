//! Media engine adapter: the narrow interface the session layer uses to
//! drive the embedded RTC engine.
//!
//! One [`MediaSession`] wraps the engine's per-call state: created when a
//! call starts, released when it ends, never shared between calls. The
//! engine's asynchronous notifications surface as [`MediaEvent`] values on
//! a channel supplied at creation; the session layer marshals them onto its
//! own ordered queue before acting on them.

pub mod engine;
pub mod tone;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Which side of the negotiation a local description is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Fatal failure reported by the embedded engine.
#[derive(Debug, Clone, Error)]
#[error("media engine failure: {0}")]
pub struct MediaError(pub String);

/// Asynchronous notifications from a media session. Delivered on the
/// channel the session was created with; may arrive at any time, including
/// after the call has been torn down.
#[derive(Debug)]
pub enum MediaEvent {
    /// A local network candidate was discovered and should be routed to
    /// the peer.
    CandidateReady(Value),
    /// Remote media became available.
    TrackAdded { kind: TrackKind },
    /// The engine closed the transport.
    ConnectionClosed,
    /// The engine failed fatally; the call cannot continue.
    ConnectionFailed,
}

/// Render-target seam: receives media units for presentation. The terminal
/// client counts them; a GUI would hand them to a render surface.
pub trait MediaSink: Send + Sync {
    fn on_media(&self, kind: TrackKind, bytes: usize);
}

/// Per-call handle onto the embedded engine.
///
/// Mute, camera toggle, and camera switch are local-only operations; they
/// produce no signaling traffic and no session-phase change.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Create a local session description and apply it to the engine.
    /// The returned value is opaque to the caller and goes on the wire
    /// as an `offer`/`answer` payload.
    async fn local_description(&self, kind: DescriptionKind) -> Result<Value, MediaError>;

    /// Apply the peer's session description.
    async fn set_remote_description(&self, description: Value) -> Result<(), MediaError>;

    /// Feed the engine a network candidate received from the peer.
    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), MediaError>;

    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    async fn switch_camera(&self) -> Result<(), MediaError>;

    /// Attach the local-preview render target.
    fn set_local_sink(&self, sink: Arc<dyn MediaSink>);

    /// Attach the remote-media render target.
    fn set_remote_sink(&self, sink: Arc<dyn MediaSink>);

    /// Release all engine resources. Idempotent.
    async fn close(&self);
}

/// Factory for per-call sessions. Process-global, outlives individual calls.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_session(
        &self,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Box<dyn MediaSession>, MediaError>;
}
