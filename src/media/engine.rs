//! webrtc-rs implementation of the media adapter.
//!
//! This is the only module that talks to the embedded engine directly.
//! Descriptions and candidates cross the seam as opaque JSON; capture and
//! render stay behind the source/sink seams.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::tone::{self, PatternSource, ToneSource};
use super::{
    DescriptionKind, MediaEngine, MediaError, MediaEvent, MediaSession, MediaSink, TrackKind,
};

type SharedSink = Arc<RwLock<Option<Arc<dyn MediaSink>>>>;

fn engine_err(e: impl std::fmt::Display) -> MediaError {
    MediaError(e.to_string())
}

fn notify_sink(sink: &SharedSink, kind: TrackKind, bytes: usize) {
    let sink = sink.read().ok().and_then(|guard| guard.clone());
    if let Some(sink) = sink {
        sink.on_media(kind, bytes);
    }
}

/// Factory handing out one peer connection per call.
pub struct WebRtcEngine {
    stun_servers: Vec<String>,
}

impl WebRtcEngine {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_session(
        &self,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        let session = WebRtcSession::new(self.stun_servers.clone(), events).await?;
        Ok(Box::new(session))
    }
}

/// One call's engine state: a peer connection plus the outgoing sample
/// pumps feeding its local tracks.
pub struct WebRtcSession {
    peer: Arc<RTCPeerConnection>,
    audio_enabled: Arc<AtomicBool>,
    camera_enabled: Arc<AtomicBool>,
    camera_reversed: Arc<AtomicBool>,
    local_sink: SharedSink,
    remote_sink: SharedSink,
    pumps: Vec<JoinHandle<()>>,
    closed: AtomicBool,
}

impl WebRtcSession {
    async fn new(
        stun_servers: Vec<String>,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Self, MediaError> {
        let mut rtc_engine = RtcMediaEngine::default();
        rtc_engine.register_default_codecs().map_err(engine_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut rtc_engine)
            .map_err(engine_err)?;
        let api = APIBuilder::new()
            .with_media_engine(rtc_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers,
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer = Arc::new(api.new_peer_connection(config).await.map_err(engine_err)?);

        let local_sink: SharedSink = Arc::new(RwLock::new(None));
        let remote_sink: SharedSink = Arc::new(RwLock::new(None));

        let candidate_events = events.clone();
        peer.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        tracing::warn!("Could not export ICE candidate: {}", e);
                        return;
                    }
                };
                match serde_json::to_value(&init) {
                    Ok(value) => {
                        let _ = events.send(MediaEvent::CandidateReady(value));
                    }
                    Err(e) => tracing::warn!("Could not serialize ICE candidate: {}", e),
                }
            })
        }));

        let track_events = events.clone();
        let track_sink = Arc::clone(&remote_sink);
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let sink = Arc::clone(&track_sink);
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                tracing::info!("Remote {} track added", kind);
                let _ = events.send(MediaEvent::TrackAdded { kind });

                // Drain RTP to keep the transport moving; payload sizes go
                // to the render sink.
                tokio::spawn(async move {
                    let mut packets: u64 = 0;
                    while let Ok((packet, _)) = track.read_rtp().await {
                        packets += 1;
                        notify_sink(&sink, kind, packet.payload.len());
                    }
                    tracing::debug!("{} track ended after {} packets", kind, packets);
                });
            })
        }));

        let state_events = events;
        peer.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!("Peer connection state: {}", state);
                match state {
                    RTCPeerConnectionState::Failed => {
                        let _ = events.send(MediaEvent::ConnectionFailed);
                    }
                    RTCPeerConnectionState::Closed => {
                        let _ = events.send(MediaEvent::ConnectionClosed);
                    }
                    _ => {}
                }
            })
        }));

        let audio_enabled = Arc::new(AtomicBool::new(true));
        let camera_enabled = Arc::new(AtomicBool::new(true));
        let camera_reversed = Arc::new(AtomicBool::new(false));

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "peercall".to_owned(),
        ));
        peer.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_err)?;

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "peercall".to_owned(),
        ));
        peer.add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_err)?;

        let pumps = vec![
            spawn_audio_pump(
                audio_track,
                Arc::clone(&audio_enabled),
                Arc::clone(&local_sink),
            ),
            spawn_video_pump(
                video_track,
                Arc::clone(&camera_enabled),
                Arc::clone(&camera_reversed),
                Arc::clone(&local_sink),
            ),
        ];

        Ok(Self {
            peer,
            audio_enabled,
            camera_enabled,
            camera_reversed,
            local_sink,
            remote_sink,
            pumps,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn local_description(&self, kind: DescriptionKind) -> Result<Value, MediaError> {
        let description = match kind {
            DescriptionKind::Offer => self.peer.create_offer(None).await,
            DescriptionKind::Answer => self.peer.create_answer(None).await,
        }
        .map_err(engine_err)?;

        self.peer
            .set_local_description(description)
            .await
            .map_err(engine_err)?;

        // The applied description carries any candidates gathered so far;
        // trickle delivers the rest as CandidateReady events.
        let applied = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| MediaError("no local description after apply".into()))?;
        serde_json::to_value(&applied).map_err(engine_err)
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), MediaError> {
        let description: RTCSessionDescription =
            serde_json::from_value(description).map_err(engine_err)?;
        self.peer
            .set_remote_description(description)
            .await
            .map_err(engine_err)
    }

    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), MediaError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate).map_err(engine_err)?;
        self.peer.add_ice_candidate(init).await.map_err(engine_err)
    }

    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.camera_enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    async fn switch_camera(&self) -> Result<(), MediaError> {
        self.camera_reversed.fetch_xor(true, Ordering::Relaxed);
        Ok(())
    }

    fn set_local_sink(&self, sink: Arc<dyn MediaSink>) {
        if let Ok(mut guard) = self.local_sink.write() {
            *guard = Some(sink);
        }
    }

    fn set_remote_sink(&self, sink: Arc<dyn MediaSink>) {
        if let Ok(mut guard) = self.remote_sink.write() {
            *guard = Some(sink);
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for pump in &self.pumps {
            pump.abort();
        }
        if let Err(e) = self.peer.close().await {
            tracing::debug!("Peer connection close: {}", e);
        }
    }
}

fn spawn_audio_pump(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    sink: SharedSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut source = ToneSource::new();
        let mut ticker = time::interval(tone::AUDIO_FRAME);
        loop {
            ticker.tick().await;
            if !enabled.load(Ordering::Relaxed) {
                continue;
            }
            let data = source.next_frame();
            let bytes = data.len();
            let sample = Sample {
                data,
                duration: tone::AUDIO_FRAME,
                ..Default::default()
            };
            if track.write_sample(&sample).await.is_err() {
                break;
            }
            notify_sink(&sink, TrackKind::Audio, bytes);
        }
    })
}

fn spawn_video_pump(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    reversed: Arc<AtomicBool>,
    sink: SharedSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pattern = PatternSource::new();
        let mut ticker = time::interval(tone::VIDEO_FRAME);
        loop {
            ticker.tick().await;
            if !enabled.load(Ordering::Relaxed) {
                continue;
            }
            pattern.set_reversed(reversed.load(Ordering::Relaxed));
            let data = pattern.next_frame();
            let bytes = data.len();
            let sample = Sample {
                data,
                duration: tone::VIDEO_FRAME,
                ..Default::default()
            };
            if track.write_sample(&sample).await.is_err() {
                break;
            }
            notify_sink(&sink, TrackKind::Video, bytes);
        }
    })
}
