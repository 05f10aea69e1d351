//! Call session coordination
//!
//! One coordinator task per client process owns the session state and runs
//! the call lifecycle. Every stimulus (local intents from the presentation
//! layer, parsed relay messages, connectivity changes, media engine
//! notifications) enters through a single ordered queue, so handling is
//! strictly sequential and the state machine needs no locking.

pub mod directory;

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::media::{DescriptionKind, MediaEngine, MediaError, MediaEvent, MediaSession, MediaSink};
use crate::signaling::{ChannelHandle, ChannelUnavailable, MessageType, SignalingMessage};
use self::directory::CallDirectory;

/// Observable session phase, published to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    /// We initiated a call and are waiting for the answer.
    Outgoing { peer: String },
    /// An invitation arrived and awaits the local accept/reject decision.
    IncomingPending { peer: String },
    Connected { peer: String },
    /// Transient: teardown finished, collapses to `Idle` immediately.
    Ended,
}

/// Errors surfaced to the issuer of a session command.
#[derive(Debug, Error)]
pub enum CallError {
    /// A call is already pending or active; the new one is refused.
    #[error("another call is already in progress")]
    Busy,
    /// The command needs a pending or active call and there is none.
    #[error("no call in progress")]
    NoSession,
    #[error(transparent)]
    ChannelUnavailable(#[from] ChannelUnavailable),
    #[error(transparent)]
    Media(#[from] MediaError),
    /// The coordinator task is gone (process shutting down).
    #[error("session coordinator stopped")]
    Stopped,
}

/// Stimuli entering the single ordered queue.
enum SessionCommand {
    Start {
        peer: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleAudio {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleCamera {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    SwitchCamera {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SetLocalRender(Arc<dyn MediaSink>),
    SetRemoteRender(Arc<dyn MediaSink>),
    Inbound(SignalingMessage),
    Engine { generation: u64, event: MediaEvent },
    ChannelUp,
    ChannelDown,
}

/// An arrived offer awaiting the local accept/reject decision. Candidates
/// that trickle in meanwhile are buffered and applied on accept.
struct Invitation {
    peer: String,
    offer: Value,
    candidates: Vec<Value>,
}

/// The one live adapter instance plus its local media toggles.
struct ActiveCall {
    session: Box<dyn MediaSession>,
    generation: u64,
    audio_on: bool,
    camera_on: bool,
}

/// Presentation-layer handle: command entry points plus the observable
/// phase stream.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    phase: watch::Receiver<SessionPhase>,
}

impl CallHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, CallError>>) -> SessionCommand,
    ) -> Result<T, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| CallError::Stopped)?;
        reply_rx.await.map_err(|_| CallError::Stopped)?
    }

    pub async fn start_call(&self, peer: impl Into<String>) -> Result<(), CallError> {
        let peer = peer.into();
        self.request(|reply| SessionCommand::Start { peer, reply })
            .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| SessionCommand::Accept { reply }).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| SessionCommand::Reject { reply }).await
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| SessionCommand::End { reply }).await
    }

    /// Toggle the microphone; returns the new enabled state.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(|reply| SessionCommand::ToggleAudio { reply })
            .await
    }

    /// Toggle the camera; returns the new enabled state.
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.request(|reply| SessionCommand::ToggleCamera { reply })
            .await
    }

    pub async fn switch_camera(&self) -> Result<(), CallError> {
        self.request(|reply| SessionCommand::SwitchCamera { reply })
            .await
    }

    /// Attach the local-preview render target for current and future calls.
    pub fn set_local_render(&self, sink: Arc<dyn MediaSink>) {
        let _ = self.commands.send(SessionCommand::SetLocalRender(sink));
    }

    /// Attach the remote-media render target for current and future calls.
    pub fn set_remote_render(&self, sink: Arc<dyn MediaSink>) {
        let _ = self.commands.send(SessionCommand::SetRemoteRender(sink));
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.borrow().clone()
    }

    /// Watch the phase stream (current value plus every change).
    pub fn phase_changes(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }
}

/// Start the coordinator task and its feeder tasks.
///
/// `inbound` carries parsed relay messages in arrival order; connectivity
/// changes from `channel` and engine notifications are marshaled onto the
/// same queue.
pub fn spawn(
    identity: String,
    channel: ChannelHandle,
    engine: Arc<dyn MediaEngine>,
    inbound: mpsc::UnboundedReceiver<SignalingMessage>,
) -> CallHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (phase_tx, phase_rx) = watch::channel(SessionPhase::Idle);

    let message_tx = cmd_tx.clone();
    tokio::spawn(async move {
        let mut inbound = inbound;
        while let Some(message) = inbound.recv().await {
            if message_tx.send(SessionCommand::Inbound(message)).is_err() {
                break;
            }
        }
    });

    let connectivity_tx = cmd_tx.clone();
    let mut connectivity = channel.connectivity();
    tokio::spawn(async move {
        while connectivity.changed().await.is_ok() {
            let command = if *connectivity.borrow() {
                SessionCommand::ChannelUp
            } else {
                SessionCommand::ChannelDown
            };
            if connectivity_tx.send(command).is_err() {
                break;
            }
        }
    });

    let coordinator = Coordinator {
        directory: CallDirectory::new(identity),
        channel,
        engine,
        commands: cmd_tx.clone(),
        phase: phase_tx,
        call: None,
        invitation: None,
        generation: 0,
        local_sink: None,
        remote_sink: None,
    };
    tokio::spawn(coordinator.run(cmd_rx));

    CallHandle {
        commands: cmd_tx,
        phase: phase_rx,
    }
}

struct Coordinator {
    directory: CallDirectory,
    channel: ChannelHandle,
    engine: Arc<dyn MediaEngine>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    phase: watch::Sender<SessionPhase>,
    call: Option<ActiveCall>,
    invitation: Option<Invitation>,
    generation: u64,
    local_sink: Option<Arc<dyn MediaSink>>,
    remote_sink: Option<Arc<dyn MediaSink>>,
}

impl Coordinator {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        // All handles dropped; release any live engine state.
        self.teardown().await;
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start { peer, reply } => {
                let _ = reply.send(self.handle_start(peer).await);
            }
            SessionCommand::Accept { reply } => {
                let _ = reply.send(self.handle_accept().await);
            }
            SessionCommand::Reject { reply } => {
                let _ = reply.send(self.handle_reject());
            }
            SessionCommand::End { reply } => {
                let _ = reply.send(self.handle_end().await);
            }
            SessionCommand::ToggleAudio { reply } => {
                let _ = reply.send(self.handle_toggle_audio().await);
            }
            SessionCommand::ToggleCamera { reply } => {
                let _ = reply.send(self.handle_toggle_camera().await);
            }
            SessionCommand::SwitchCamera { reply } => {
                let _ = reply.send(self.handle_switch_camera().await);
            }
            SessionCommand::SetLocalRender(sink) => {
                if let Some(call) = &self.call {
                    call.session.set_local_sink(Arc::clone(&sink));
                }
                self.local_sink = Some(sink);
            }
            SessionCommand::SetRemoteRender(sink) => {
                if let Some(call) = &self.call {
                    call.session.set_remote_sink(Arc::clone(&sink));
                }
                self.remote_sink = Some(sink);
            }
            SessionCommand::Inbound(message) => self.handle_inbound(message).await,
            SessionCommand::Engine { generation, event } => {
                self.handle_engine(generation, event).await;
            }
            SessionCommand::ChannelUp => {
                tracing::debug!("Signaling channel up");
            }
            SessionCommand::ChannelDown => self.handle_channel_down().await,
        }
    }

    fn busy(&self) -> bool {
        self.call.is_some() || self.invitation.is_some()
    }

    fn set_phase(&self, phase: SessionPhase) {
        tracing::debug!("Session phase: {:?}", phase);
        self.phase.send_replace(phase);
    }

    /// Create the next adapter instance and wire its notifications onto the
    /// ordered queue, tagged with the call generation so late arrivals after
    /// teardown are recognizable.
    async fn create_adapter(&mut self) -> Result<ActiveCall, MediaError> {
        self.generation += 1;
        let generation = self.generation;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let session = self.engine.create_session(event_tx).await?;

        if let Some(sink) = &self.local_sink {
            session.set_local_sink(Arc::clone(sink));
        }
        if let Some(sink) = &self.remote_sink {
            session.set_remote_sink(Arc::clone(sink));
        }

        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let forwarded = SessionCommand::Engine { generation, event };
                if commands.send(forwarded).is_err() {
                    break;
                }
            }
        });

        Ok(ActiveCall {
            session,
            generation,
            audio_on: true,
            camera_on: true,
        })
    }

    /// Release the call (if any), clear peer identity and invitation, and
    /// collapse to `Idle`. The adapter is closed before the next command is
    /// processed, so at most one instance is ever live.
    async fn teardown(&mut self) {
        self.invitation = None;
        let had_state =
            self.call.is_some() || !matches!(*self.phase.borrow(), SessionPhase::Idle);
        if let Some(call) = self.call.take() {
            call.session.close().await;
        }
        self.directory.clear_peer();
        if had_state {
            self.set_phase(SessionPhase::Ended);
        }
        self.set_phase(SessionPhase::Idle);
    }

    /// Best-effort `end_call` notification. The wire vocabulary has no
    /// dedicated busy/decline tag, so `end_call` serves for all of hang-up,
    /// reject, and busy.
    fn decline(&self, peer: &str) {
        let message = SignalingMessage::end_call(self.directory.local_name(), peer);
        if let Err(e) = self.channel.send(message) {
            tracing::debug!("Could not notify {}: {}", peer, e);
        }
    }

    async fn handle_start(&mut self, peer: String) -> Result<(), CallError> {
        if self.busy() {
            return Err(CallError::Busy);
        }

        let call = self.create_adapter().await?;
        let offer = match call.session.local_description(DescriptionKind::Offer).await {
            Ok(offer) => offer,
            Err(e) => {
                call.session.close().await;
                return Err(e.into());
            }
        };

        let message = SignalingMessage::offer(self.directory.local_name(), peer.as_str(), offer);
        if let Err(e) = self.channel.send(message) {
            // Setup aborts cleanly; we never left Idle.
            call.session.close().await;
            return Err(e.into());
        }

        tracing::info!("Calling {}", peer);
        self.directory.set_peer(peer.as_str());
        self.call = Some(call);
        self.set_phase(SessionPhase::Outgoing { peer });
        Ok(())
    }

    async fn handle_accept(&mut self) -> Result<(), CallError> {
        let invitation = self.invitation.take().ok_or(CallError::NoSession)?;
        let peer = invitation.peer.clone();

        match self.connect_incoming(&invitation).await {
            Ok(call) => {
                tracing::info!("Accepted call from {}", peer);
                self.call = Some(call);
                self.set_phase(SessionPhase::Connected { peer });
                Ok(())
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Accept-path engine work: apply the pending offer, produce and send
    /// the answer, then replay candidates buffered while pending.
    async fn connect_incoming(&mut self, invitation: &Invitation) -> Result<ActiveCall, CallError> {
        let call = self.create_adapter().await?;

        if let Err(e) = call
            .session
            .set_remote_description(invitation.offer.clone())
            .await
        {
            call.session.close().await;
            return Err(e.into());
        }

        let answer = match call.session.local_description(DescriptionKind::Answer).await {
            Ok(answer) => answer,
            Err(e) => {
                call.session.close().await;
                return Err(e.into());
            }
        };

        let message = SignalingMessage::answer(
            self.directory.local_name(),
            invitation.peer.as_str(),
            answer,
        );
        if let Err(e) = self.channel.send(message) {
            call.session.close().await;
            return Err(e.into());
        }

        for candidate in &invitation.candidates {
            if let Err(e) = call.session.add_remote_candidate(candidate.clone()).await {
                tracing::warn!("Buffered candidate rejected by engine: {}", e);
            }
        }

        Ok(call)
    }

    fn handle_reject(&mut self) -> Result<(), CallError> {
        let invitation = self.invitation.take().ok_or(CallError::NoSession)?;
        tracing::info!("Rejected call from {}", invitation.peer);
        self.decline(invitation.peer.as_str());
        self.directory.clear_peer();
        self.set_phase(SessionPhase::Idle);
        Ok(())
    }

    async fn handle_end(&mut self) -> Result<(), CallError> {
        if !self.busy() {
            return Err(CallError::NoSession);
        }
        if let Some(peer) = self.directory.peer().map(str::to_owned) {
            self.decline(&peer);
        }
        self.teardown().await;
        Ok(())
    }

    async fn handle_toggle_audio(&mut self) -> Result<bool, CallError> {
        let call = self.call.as_mut().ok_or(CallError::NoSession)?;
        let enabled = !call.audio_on;
        call.session.set_audio_enabled(enabled).await?;
        call.audio_on = enabled;
        Ok(enabled)
    }

    async fn handle_toggle_camera(&mut self) -> Result<bool, CallError> {
        let call = self.call.as_mut().ok_or(CallError::NoSession)?;
        let enabled = !call.camera_on;
        call.session.set_camera_enabled(enabled).await?;
        call.camera_on = enabled;
        Ok(enabled)
    }

    async fn handle_switch_camera(&mut self) -> Result<(), CallError> {
        let call = self.call.as_ref().ok_or(CallError::NoSession)?;
        call.session.switch_camera().await?;
        Ok(())
    }

    async fn handle_inbound(&mut self, message: SignalingMessage) {
        if !self.directory.is_for_us(&message) {
            tracing::debug!("Ignoring message addressed to {:?}", message.target);
            return;
        }

        match message.kind {
            MessageType::Offer => self.handle_offer(message).await,
            MessageType::Answer => self.handle_answer(message).await,
            MessageType::IceCandidate => self.handle_candidate(message).await,
            MessageType::EndCall => self.handle_end_call(message).await,
            MessageType::StoreUser => {
                tracing::debug!("Ignoring relayed store_user");
            }
        }
    }

    async fn handle_offer(&mut self, message: SignalingMessage) {
        let Some(peer) = message.name else {
            tracing::warn!("Dropping offer without sender name");
            return;
        };
        let Some(offer) = message.payload else {
            tracing::warn!("Dropping offer without payload");
            return;
        };

        if self.busy() {
            tracing::info!("Busy; declining offer from {}", peer);
            self.decline(&peer);
            return;
        }

        tracing::info!("Incoming call from {}", peer);
        self.directory.set_peer(peer.as_str());
        self.invitation = Some(Invitation {
            peer: peer.clone(),
            offer,
            candidates: Vec::new(),
        });
        self.set_phase(SessionPhase::IncomingPending { peer });
    }

    async fn handle_answer(&mut self, message: SignalingMessage) {
        let outgoing = matches!(*self.phase.borrow(), SessionPhase::Outgoing { .. });
        if !outgoing || !self.directory.is_from_peer(&message) {
            tracing::debug!("Ignoring unexpected answer from {:?}", message.name);
            return;
        }
        let Some(answer) = message.payload else {
            tracing::warn!("Dropping answer without payload");
            return;
        };

        let applied = match &self.call {
            Some(call) => call.session.set_remote_description(answer).await,
            None => return,
        };
        if let Err(e) = applied {
            tracing::warn!("Engine rejected remote answer: {}", e);
            self.teardown().await;
            return;
        }

        let Some(peer) = self.directory.peer().map(str::to_owned) else {
            return;
        };
        tracing::info!("Call with {} connected", peer);
        self.set_phase(SessionPhase::Connected { peer });
    }

    async fn handle_candidate(&mut self, message: SignalingMessage) {
        if !self.directory.is_from_peer(&message) {
            // No routable peer for this candidate; a defined, non-fatal loss.
            tracing::debug!("Dropping unroutable candidate from {:?}", message.name);
            return;
        }
        let Some(candidate) = message.payload else {
            tracing::warn!("Dropping candidate without payload");
            return;
        };

        if let Some(call) = &self.call {
            if let Err(e) = call.session.add_remote_candidate(candidate).await {
                tracing::warn!("Engine rejected remote candidate: {}", e);
            }
        } else if let Some(invitation) = &mut self.invitation {
            invitation.candidates.push(candidate);
        }
    }

    async fn handle_end_call(&mut self, message: SignalingMessage) {
        if !self.directory.is_from_peer(&message) {
            tracing::debug!("Ignoring end_call from {:?}", message.name);
            return;
        }
        tracing::info!("Call ended by {}", self.directory.peer().unwrap_or("peer"));
        self.teardown().await;
    }

    async fn handle_engine(&mut self, generation: u64, event: MediaEvent) {
        let current = self.call.as_ref().map(|call| call.generation);
        if current != Some(generation) {
            tracing::debug!("Ignoring stale media event from call #{}", generation);
            return;
        }

        match event {
            MediaEvent::CandidateReady(candidate) => {
                let Some(peer) = self.directory.peer().map(str::to_owned) else {
                    tracing::debug!("Dropping local candidate with no peer");
                    return;
                };
                let message = SignalingMessage::ice_candidate(
                    self.directory.local_name(),
                    peer.as_str(),
                    candidate,
                );
                if let Err(e) = self.channel.send(message) {
                    tracing::warn!("Could not send candidate to {}: {}", peer, e);
                }
            }
            MediaEvent::TrackAdded { kind } => {
                tracing::info!("Remote {} stream available", kind);
            }
            MediaEvent::ConnectionClosed => {
                tracing::info!("Media transport closed");
                self.teardown().await;
            }
            MediaEvent::ConnectionFailed => {
                tracing::warn!("Media transport failed");
                self.teardown().await;
            }
        }
    }

    async fn handle_channel_down(&mut self) {
        if self.busy() {
            tracing::warn!("Signaling channel lost; ending the call");
            self.teardown().await;
        }
    }
}
