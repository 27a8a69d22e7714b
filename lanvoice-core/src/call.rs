//! Call orchestration
//!
//! [`CallManager`] is a handle to a single orchestrator task. Everything that
//! can change the call (user commands, accepted sessions, signaling messages,
//! media events, results of spawned work) is funneled through one `mpsc`
//! channel and handled one event at a time, so the state machine never races
//! with itself.
//!
//! ```text
//!              call(peer)                 Answer
//!     Idle ──────────────► Calling ──────────────────► InCall
//!       │                                                 ▲
//!       │ session accepted                                │ accept_incoming
//!       └───────────────► IncomingRinging ────────────────┘
//!                          (Offer → Answer sent)
//!
//!     Bye / disconnect / media failure / end_call: any state → Idle
//! ```
//!
//! Slow work (TCP connect, offer and answer creation) runs in spawned tasks.
//! Their results come back as events tagged with the call generation; results
//! from an earlier call are discarded. Outgoing signaling is queued to a
//! writer task per session, so a stalled peer never blocks the state machine.
//!
//! ICE candidates are held back on both sides until negotiation can use them:
//! local candidates until our offer or answer is on the wire, remote ones
//! until the remote description has been applied.

use crate::directory::{PeerDirectory, StaticDirectory};
use crate::listener::SignalingListener;
use crate::media::{MediaError, MediaEvent, MediaNegotiator};
use crate::platform::{CallPlatform, LoggingPlatform};
use crate::session::SignalingSession;
use crate::signaling::{SignalingError, SignalingMessage};
use crate::types::{
    CallEvent, CallState, EndReason, IceCandidate, NegotiationRole, Peer, SdpKind,
    SessionDescription, SessionId,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// How long shutdown waits for the final `Bye` to be written
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Command not valid in the current call state
    #[error("Invalid call state")]
    InvalidState,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The call manager has been shut down
    #[error("Call manager shut down")]
    ShutDown,
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::TransportError(err.to_string())
    }
}

/// What to do with an inbound session while a call is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InboundPolicy {
    /// Hang up the current call and take the new one
    #[default]
    ReplaceActive,
    /// Send `Bye` on the new session and keep the current call
    RejectWhileBusy,
}

/// Call manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallManagerConfig {
    /// Name this device is known by on the LAN
    pub service_name: String,
    /// Address the signaling listener binds to
    pub bind_addr: IpAddr,
    /// Signaling port; 0 picks a free one
    pub signaling_port: u16,
    /// Go straight to `InCall` once the answer to an incoming offer is sent
    pub auto_accept: bool,
    /// Handling of inbound sessions while busy
    pub inbound_policy: InboundPolicy,
    /// Outbound connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Buffered `CallEvent`s per subscriber
    pub event_channel_capacity: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            service_name: "lanvoice".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            signaling_port: 0,
            auto_accept: false,
            inbound_policy: InboundPolicy::default(),
            connect_timeout_ms: 5000,
            event_channel_capacity: 64,
        }
    }
}

enum UserCommand {
    Call(Peer),
    AcceptIncoming,
    EndCall,
    SetMuted(bool),
    SetSpeaker(bool),
}

enum Event {
    User {
        command: UserCommand,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    PeersChanged(Vec<Peer>),
    SessionAccepted(SignalingSession),
    OutboundConnected {
        generation: u64,
        result: Result<SignalingSession, SignalingError>,
    },
    Signal {
        session_id: SessionId,
        message: SignalingMessage,
    },
    SessionEnded {
        session_id: SessionId,
    },
    SendFailed {
        session_id: SessionId,
    },
    LocalDescription {
        generation: u64,
        result: Result<SessionDescription, MediaError>,
    },
    Media {
        generation: u64,
        event: MediaEvent,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Builder for [`CallManager`]
pub struct CallManagerBuilder {
    config: CallManagerConfig,
    media: Option<Arc<dyn MediaNegotiator>>,
    directory: Option<Arc<dyn PeerDirectory>>,
    platform: Option<Arc<dyn CallPlatform>>,
}

impl CallManagerBuilder {
    /// Create a builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: CallManagerConfig::default(),
            media: None,
            directory: None,
            platform: None,
        }
    }

    /// Set the configuration
    #[must_use]
    pub fn with_config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the media negotiator
    #[must_use]
    pub fn with_media(mut self, media: Arc<dyn MediaNegotiator>) -> Self {
        self.media = Some(media);
        self
    }

    /// Set the peer directory (default: empty [`StaticDirectory`])
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set the platform hooks (default: [`LoggingPlatform`])
    #[must_use]
    pub fn with_platform(mut self, platform: Arc<dyn CallPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Bind the listener, start the directory and the orchestrator
    ///
    /// # Errors
    ///
    /// Returns error if the signaling port cannot be bound or no media
    /// negotiator is available
    pub async fn start(self) -> Result<CallManager, CallError> {
        let media = match self.media {
            Some(media) => media,
            None => default_media()?,
        };
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(StaticDirectory::default()));
        let platform = self
            .platform
            .unwrap_or_else(|| Arc::new(LoggingPlatform));
        CallManager::start(self.config, media, directory, platform).await
    }
}

impl Default for CallManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "webrtc-engine")]
fn default_media() -> Result<Arc<dyn MediaNegotiator>, CallError> {
    use crate::webrtc_engine::{WebRtcConfig, WebRtcNegotiator};
    Ok(Arc::new(WebRtcNegotiator::new(WebRtcConfig::default())))
}

#[cfg(not(feature = "webrtc-engine"))]
fn default_media() -> Result<Arc<dyn MediaNegotiator>, CallError> {
    Err(CallError::ConfigError(
        "No media negotiator configured".to_string(),
    ))
}

/// Handle to the call orchestrator
///
/// All commands are queued to the orchestrator task and answered once it has
/// processed them. State and peer changes are observable through `watch`
/// receivers; discrete happenings through [`CallEvent`] subscriptions.
pub struct CallManager {
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<CallState>,
    peers: watch::Receiver<Vec<Peer>>,
    event_sender: broadcast::Sender<CallEvent>,
    signaling_port: u16,
    listener: SignalingListener,
    directory: Arc<dyn PeerDirectory>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl CallManager {
    /// Start building a call manager
    #[must_use]
    pub fn builder() -> CallManagerBuilder {
        CallManagerBuilder::new()
    }

    /// Start a call manager with explicit collaborators
    ///
    /// # Errors
    ///
    /// Returns error if the signaling port cannot be bound
    #[tracing::instrument(skip_all, fields(name = %config.service_name))]
    pub async fn start(
        config: CallManagerConfig,
        media: Arc<dyn MediaNegotiator>,
        directory: Arc<dyn PeerDirectory>,
        platform: Arc<dyn CallPlatform>,
    ) -> Result<Self, CallError> {
        let listener = SignalingListener::new(config.bind_addr);
        let signaling_port = listener.start(config.signaling_port).await?;
        let accepted = listener.accepted().ok_or_else(|| {
            CallError::TransportError("Listener sessions already taken".to_string())
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let directory_peers = directory.peers();
        let initial_peers = directory_peers.borrow().clone();
        let (peers_tx, peers_rx) = watch::channel(initial_peers);
        let (event_sender, _) = broadcast::channel(config.event_channel_capacity.max(1));

        let mut tasks = vec![
            tokio::spawn(forward_sessions(accepted, events_tx.clone())),
            tokio::spawn(forward_peers(directory_peers, events_tx.clone())),
        ];

        if let Err(e) = directory.advertise_self(signaling_port).await {
            tracing::warn!(error = %e, "Failed to advertise on the LAN");
        }
        if let Err(e) = directory.start_discovery().await {
            tracing::warn!(error = %e, "Failed to start peer discovery");
        }

        let orchestrator = Orchestrator::new(
            config,
            media,
            platform,
            events_tx.clone(),
            state_tx,
            peers_tx,
            event_sender.clone(),
        );
        tasks.push(tokio::spawn(orchestrator.run(events_rx)));

        tracing::info!(signaling_port, "Call manager started");
        Ok(Self {
            events: events_tx,
            state: state_rx,
            peers: peers_rx,
            event_sender,
            signaling_port,
            listener,
            directory,
            tasks: parking_lot::Mutex::new(tasks),
        })
    }

    /// Observe the call state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Current call state
    #[must_use]
    pub fn current_state(&self) -> CallState {
        self.state.borrow().clone()
    }

    /// Observe the peer set
    #[must_use]
    pub fn peers(&self) -> watch::Receiver<Vec<Peer>> {
        self.peers.clone()
    }

    /// Look up a known peer by name
    #[must_use]
    pub fn find_peer(&self, name: &str) -> Option<Peer> {
        self.peers.borrow().iter().find(|p| p.name == name).cloned()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Port the signaling listener is bound to
    #[must_use]
    pub fn signaling_port(&self) -> u16 {
        self.signaling_port
    }

    /// Call a peer
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless idle
    #[tracing::instrument(skip(self), fields(peer = %peer.name))]
    pub async fn call(&self, peer: Peer) -> Result<(), CallError> {
        self.request(UserCommand::Call(peer)).await
    }

    /// Accept the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless an incoming call is ringing
    #[tracing::instrument(skip(self))]
    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.request(UserCommand::AcceptIncoming).await
    }

    /// Hang up; a no-op when idle
    ///
    /// # Errors
    ///
    /// Only fails after `shutdown`
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(UserCommand::EndCall).await
    }

    /// Mute or unmute the microphone
    ///
    /// Outside a call the preference is kept for the next one.
    ///
    /// # Errors
    ///
    /// Only fails after `shutdown`
    #[tracing::instrument(skip(self))]
    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(UserCommand::SetMuted(muted)).await
    }

    /// Route audio to the loudspeaker or the earpiece
    ///
    /// Outside a call the preference is kept for the next one.
    ///
    /// # Errors
    ///
    /// Only fails after `shutdown`
    #[tracing::instrument(skip(self))]
    pub async fn set_speaker(&self, speaker_on: bool) -> Result<(), CallError> {
        self.request(UserCommand::SetSpeaker(speaker_on)).await
    }

    /// Hang up, stop the orchestrator, the listener and the directory
    ///
    /// Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.events.send(Event::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }

        self.listener.stop();
        if let Err(e) = self.directory.stop().await {
            tracing::warn!(error = %e, "Failed to stop peer directory");
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        tracing::info!("Call manager shut down");
    }

    async fn request(&self, command: UserCommand) -> Result<(), CallError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(Event::User { command, reply })
            .map_err(|_| CallError::ShutDown)?;
        response.await.map_err(|_| CallError::ShutDown)?
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

async fn forward_sessions(
    mut accepted: mpsc::Receiver<SignalingSession>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(session) = accepted.recv().await {
        if events.send(Event::SessionAccepted(session)).is_err() {
            break;
        }
    }
}

async fn forward_peers(mut peers: watch::Receiver<Vec<Peer>>, events: mpsc::UnboundedSender<Event>) {
    while peers.changed().await.is_ok() {
        let snapshot = peers.borrow_and_update().clone();
        if events.send(Event::PeersChanged(snapshot)).is_err() {
            break;
        }
    }
}

/// The adopted signaling session, driven by its two pump tasks
struct ActiveSession {
    id: SessionId,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    reader: Option<JoinHandle<()>>,
    writer: JoinHandle<()>,
}

/// Write queued messages in order, then close the session
///
/// The queue closing (the orchestrator dropping the sender) flushes what is
/// left and closes; a failed write reports `SendFailed` and closes.
async fn write_outbound(
    session: SignalingSession,
    mut outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    events: mpsc::UnboundedSender<Event>,
) {
    let session_id = session.id();
    while let Some(message) = outbound.recv().await {
        if let Err(e) = session.send(&message).await {
            tracing::warn!(%session_id, error = %e, message_type = message.kind(), "Failed to send signaling message");
            let _ = events.send(Event::SendFailed { session_id });
            break;
        }
    }
    session.close().await;
}

/// State owned by the orchestrator task
struct Orchestrator {
    config: CallManagerConfig,
    media: Arc<dyn MediaNegotiator>,
    platform: Arc<dyn CallPlatform>,
    events: mpsc::UnboundedSender<Event>,
    state_tx: watch::Sender<CallState>,
    peers_tx: watch::Sender<Vec<Peer>>,
    event_sender: broadcast::Sender<CallEvent>,

    state: CallState,
    peers: Vec<Peer>,
    session: Option<ActiveSession>,
    /// Writer of the last discarded session, still flushing
    closing: Option<JoinHandle<()>>,
    media_task: Option<JoinHandle<()>>,
    generation: u64,
    role: Option<NegotiationRole>,
    offer_received: bool,
    local_description_sent: bool,
    remote_description_set: bool,
    pending_local: Vec<IceCandidate>,
    pending_remote: Vec<IceCandidate>,
    media_open: bool,
    focus_held: bool,
    foreground: bool,
    muted: bool,
    speaker_on: bool,
}

impl Orchestrator {
    fn new(
        config: CallManagerConfig,
        media: Arc<dyn MediaNegotiator>,
        platform: Arc<dyn CallPlatform>,
        events: mpsc::UnboundedSender<Event>,
        state_tx: watch::Sender<CallState>,
        peers_tx: watch::Sender<Vec<Peer>>,
        event_sender: broadcast::Sender<CallEvent>,
    ) -> Self {
        let peers = peers_tx.borrow().clone();
        Self {
            config,
            media,
            platform,
            events,
            state_tx,
            peers_tx,
            event_sender,
            state: CallState::Idle,
            peers,
            session: None,
            closing: None,
            media_task: None,
            generation: 0,
            role: None,
            offer_received: false,
            local_description_sent: false,
            remote_description_set: false,
            pending_local: Vec::new(),
            pending_remote: Vec::new(),
            media_open: false,
            focus_held: false,
            foreground: false,
            muted: false,
            speaker_on: false,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            if self.handle(event).await.is_break() {
                break;
            }
        }
        tracing::debug!("Call orchestrator stopped");
    }

    async fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::User { command, reply } => {
                let result = self.handle_command(command).await;
                let _ = reply.send(result);
            }
            Event::PeersChanged(peers) => {
                tracing::debug!(count = peers.len(), "Peer set changed");
                self.peers = peers.clone();
                self.peers_tx.send_replace(peers);
            }
            Event::SessionAccepted(session) => self.on_session_accepted(session).await,
            Event::OutboundConnected { generation, result } => {
                self.on_outbound_connected(generation, result).await;
            }
            Event::Signal {
                session_id,
                message,
            } => self.on_signal(session_id, message).await,
            Event::SessionEnded { session_id } => self.on_session_ended(session_id).await,
            Event::SendFailed { session_id } => self.on_send_failed(session_id).await,
            Event::LocalDescription { generation, result } => {
                self.on_local_description(generation, result).await;
            }
            Event::Media { generation, event } => self.on_media_event(generation, event).await,
            Event::Shutdown(ack) => {
                self.hang_up(EndReason::Shutdown).await;
                if let Some(writer) = self.closing.take() {
                    if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, writer).await.is_err() {
                        tracing::debug!("Gave up flushing signaling on shutdown");
                    }
                }
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_command(&mut self, command: UserCommand) -> Result<(), CallError> {
        match command {
            UserCommand::Call(peer) => self.start_call(peer),
            UserCommand::AcceptIncoming => self.accept_incoming().await,
            UserCommand::EndCall => {
                self.hang_up(EndReason::LocalHangup).await;
                Ok(())
            }
            UserCommand::SetMuted(muted) => {
                self.set_muted(muted).await;
                Ok(())
            }
            UserCommand::SetSpeaker(speaker_on) => {
                self.set_speaker(speaker_on).await;
                Ok(())
            }
        }
    }

    fn start_call(&mut self, peer: Peer) -> Result<(), CallError> {
        if !self.state.is_idle() {
            tracing::debug!(state = self.state.name(), "Rejecting call while busy");
            return Err(CallError::InvalidState);
        }

        let generation = self.next_generation();
        let addr = peer.socket_addr();
        tracing::info!(peer = %peer.name, %addr, "Calling peer");
        self.set_state(CallState::Calling { peer });

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = SignalingSession::connect(addr, timeout).await;
            let _ = events.send(Event::OutboundConnected { generation, result });
        });
        Ok(())
    }

    async fn accept_incoming(&mut self) -> Result<(), CallError> {
        let CallState::IncomingRinging { peer } = &self.state else {
            return Err(CallError::InvalidState);
        };
        let peer = peer.clone();
        self.enter_in_call(peer).await;
        Ok(())
    }

    async fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if self.media_open {
            if let Err(e) = self.media.set_muted(muted).await {
                tracing::warn!(error = %e, "Failed to apply mute");
            }
        }
        if let CallState::InCall {
            peer, speaker_on, ..
        } = &self.state
        {
            let next = CallState::InCall {
                peer: peer.clone(),
                muted,
                speaker_on: *speaker_on,
            };
            self.set_state(next);
        }
    }

    async fn set_speaker(&mut self, speaker_on: bool) {
        self.speaker_on = speaker_on;
        if self.media_open {
            if let Err(e) = self.media.set_audio_route(speaker_on).await {
                tracing::warn!(error = %e, "Failed to apply audio route");
            }
        }
        if let CallState::InCall { peer, muted, .. } = &self.state {
            let next = CallState::InCall {
                peer: peer.clone(),
                muted: *muted,
                speaker_on,
            };
            self.set_state(next);
        }
    }

    async fn on_outbound_connected(
        &mut self,
        generation: u64,
        result: Result<SignalingSession, SignalingError>,
    ) {
        let current = generation == self.generation
            && matches!(self.state, CallState::Calling { .. })
            && self.session.is_none();

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                if current {
                    tracing::warn!(error = %e, "Outbound signaling connection failed");
                    self.cleanup(EndReason::Disconnected).await;
                }
                return;
            }
        };
        if !current {
            tracing::debug!(session_id = %session.id(), "Discarding stale outbound session");
            tokio::spawn(async move { session.close().await });
            return;
        }

        self.adopt_session(session);
        if let Err(e) = self.open_media(NegotiationRole::Initiator).await {
            tracing::warn!(error = %e, "Failed to open media connection");
            self.cleanup(EndReason::MediaFailed).await;
            return;
        }
        self.spawn_local_description(SdpKind::Offer);
    }

    async fn on_session_accepted(&mut self, session: SignalingSession) {
        let remote = session.remote_addr();
        let peer = self.identify(remote);

        if !self.state.is_idle() {
            match self.config.inbound_policy {
                InboundPolicy::RejectWhileBusy => {
                    tracing::info!(peer = %peer.name, "Busy, rejecting inbound session");
                    tokio::spawn(async move {
                        if let Err(e) = session.send(&SignalingMessage::Bye).await {
                            tracing::debug!(error = %e, "Failed to send Bye to rejected session");
                        }
                        session.close().await;
                    });
                    return;
                }
                InboundPolicy::ReplaceActive => {
                    tracing::info!(peer = %peer.name, "Inbound session replaces the active call");
                    self.hang_up(EndReason::Superseded).await;
                }
            }
        }

        self.next_generation();
        tracing::info!(peer = %peer.name, remote = ?remote, session_id = %session.id(), "Incoming call");
        self.adopt_session(session);
        if let Err(e) = self.open_media(NegotiationRole::Responder).await {
            tracing::warn!(error = %e, "Failed to open media connection");
            self.cleanup(EndReason::MediaFailed).await;
            return;
        }

        self.set_state(CallState::IncomingRinging { peer: peer.clone() });
        self.emit(CallEvent::IncomingCall { peer });
    }

    async fn on_signal(&mut self, session_id: SessionId, message: SignalingMessage) {
        if !self.is_current_session(session_id) {
            tracing::trace!(%session_id, message_type = message.kind(), "Ignoring message from stale session");
            return;
        }

        match message {
            SignalingMessage::Offer { sdp } => self.on_remote_offer(sdp).await,
            SignalingMessage::Answer { sdp } => self.on_remote_answer(sdp).await,
            SignalingMessage::IceCandidate {
                sdp_mid,
                sdp_mline_index,
                candidate,
            } => {
                self.on_remote_candidate(IceCandidate {
                    sdp_mid,
                    sdp_mline_index,
                    candidate,
                })
                .await;
            }
            SignalingMessage::Bye => {
                tracing::info!("Peer hung up");
                self.cleanup(EndReason::RemoteHangup).await;
            }
        }
    }

    async fn on_remote_offer(&mut self, sdp: String) {
        if self.role != Some(NegotiationRole::Responder) || self.offer_received {
            tracing::debug!(state = self.state.name(), "Ignoring unexpected offer");
            return;
        }
        self.offer_received = true;

        if let Err(e) = self
            .media
            .set_remote_description(SessionDescription::offer(sdp))
            .await
        {
            tracing::warn!(error = %e, "Failed to apply remote offer");
            self.cleanup(EndReason::MediaFailed).await;
            return;
        }
        if !self.remote_description_applied().await {
            return;
        }
        self.spawn_local_description(SdpKind::Answer);
    }

    async fn on_remote_answer(&mut self, sdp: String) {
        let CallState::Calling { peer } = &self.state else {
            tracing::debug!(state = self.state.name(), "Ignoring unexpected answer");
            return;
        };
        let peer = peer.clone();

        if let Err(e) = self
            .media
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            tracing::warn!(error = %e, "Failed to apply remote answer");
            self.cleanup(EndReason::MediaFailed).await;
            return;
        }
        if !self.remote_description_applied().await {
            return;
        }
        self.enter_in_call(peer).await;
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state.is_idle() || !self.media_open {
            return;
        }
        if !self.remote_description_set {
            tracing::trace!("Holding remote ICE candidate until the remote description is set");
            self.pending_remote.push(candidate);
            return;
        }
        if let Err(e) = self.media.add_remote_candidate(candidate).await {
            tracing::warn!(error = %e, "Failed to apply remote ICE candidate");
            self.cleanup(EndReason::MediaFailed).await;
        }
    }

    /// Mark the remote description set and apply the candidates held for it
    ///
    /// Returns false when a held candidate failed and the call was ended.
    async fn remote_description_applied(&mut self) -> bool {
        self.remote_description_set = true;
        let held = std::mem::take(&mut self.pending_remote);
        if !held.is_empty() {
            tracing::debug!(count = held.len(), "Applying held remote ICE candidates");
        }
        for candidate in held {
            if let Err(e) = self.media.add_remote_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to apply remote ICE candidate");
                self.cleanup(EndReason::MediaFailed).await;
                return false;
            }
        }
        true
    }

    async fn on_session_ended(&mut self, session_id: SessionId) {
        if !self.is_current_session(session_id) {
            return;
        }
        tracing::info!(%session_id, "Signaling session ended");
        self.cleanup(EndReason::Disconnected).await;
    }

    async fn on_send_failed(&mut self, session_id: SessionId) {
        if !self.is_current_session(session_id) {
            return;
        }
        self.cleanup(EndReason::Disconnected).await;
    }

    fn is_current_session(&self, session_id: SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session_id)
    }

    async fn on_local_description(
        &mut self,
        generation: u64,
        result: Result<SessionDescription, MediaError>,
    ) {
        if generation != self.generation || self.state.is_idle() {
            tracing::debug!("Discarding stale local description");
            return;
        }

        let description = match result {
            Ok(description) => description,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create local description");
                self.cleanup(EndReason::MediaFailed).await;
                return;
            }
        };

        let kind = description.kind;
        self.send_signal(SignalingMessage::from_description(description));
        self.local_description_sent = true;
        for candidate in std::mem::take(&mut self.pending_local) {
            self.send_signal(candidate.into());
        }

        if kind == SdpKind::Answer && self.config.auto_accept {
            if let CallState::IncomingRinging { peer } = &self.state {
                let peer = peer.clone();
                self.enter_in_call(peer).await;
            }
        }
    }

    async fn on_media_event(&mut self, generation: u64, event: MediaEvent) {
        if generation != self.generation {
            return;
        }

        match event {
            MediaEvent::LocalCandidate(candidate) => {
                if self.local_description_sent {
                    self.send_signal(candidate.into());
                } else {
                    tracing::trace!("Holding local ICE candidate until the description is sent");
                    self.pending_local.push(candidate);
                }
            }
            MediaEvent::ConnectionStateChanged(state) => {
                tracing::debug!(?state, "Media connection state changed");
                if state.is_terminal() && !self.state.is_idle() {
                    tracing::warn!(?state, "Media connection lost");
                    self.cleanup(EndReason::MediaFailed).await;
                }
            }
        }
    }

    fn adopt_session(&mut self, session: SignalingSession) {
        self.discard_session();

        let session_id = session.id();
        let reader = match session.incoming() {
            Some(mut incoming) => {
                let events = self.events.clone();
                Some(tokio::spawn(async move {
                    while let Some(message) = incoming.recv().await {
                        if events.send(Event::Signal { session_id, message }).is_err() {
                            return;
                        }
                    }
                    let _ = events.send(Event::SessionEnded { session_id });
                }))
            }
            None => {
                tracing::warn!(%session_id, "Session messages already taken");
                None
            }
        };

        let (outbound, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_outbound(session, queue, self.events.clone()));
        self.session = Some(ActiveSession {
            id: session_id,
            outbound,
            reader,
            writer,
        });
    }

    /// Stop reading the active session and let its writer flush and close it
    fn discard_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Some(reader) = session.reader {
                reader.abort();
            }
            // Dropping `outbound` ends the writer once its queue is drained
            self.closing = Some(session.writer);
        }
    }

    async fn open_media(&mut self, role: NegotiationRole) -> Result<(), MediaError> {
        match self.platform.acquire_audio_focus().await {
            Ok(()) => self.focus_held = true,
            Err(e) => tracing::warn!(error = %e, "Failed to acquire audio focus"),
        }

        let mut media_events = self.media.open(role).await?;
        self.media_open = true;
        self.role = Some(role);
        self.offer_received = false;
        self.local_description_sent = false;
        self.remote_description_set = false;
        self.pending_local.clear();
        self.pending_remote.clear();

        let generation = self.generation;
        let events = self.events.clone();
        self.media_task = Some(tokio::spawn(async move {
            while let Some(event) = media_events.recv().await {
                if events.send(Event::Media { generation, event }).is_err() {
                    break;
                }
            }
        }));

        if let Err(e) = self.media.set_audio_route(self.speaker_on).await {
            tracing::warn!(error = %e, "Failed to apply audio route");
        }
        if let Err(e) = self.media.set_muted(self.muted).await {
            tracing::warn!(error = %e, "Failed to apply mute");
        }
        Ok(())
    }

    fn spawn_local_description(&self, kind: SdpKind) {
        let media = Arc::clone(&self.media);
        let events = self.events.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = match kind {
                SdpKind::Offer => media.create_offer().await,
                SdpKind::Answer => media.create_answer().await,
            };
            let _ = events.send(Event::LocalDescription { generation, result });
        });
    }

    /// Queue a message on the active session; a failed write ends the call
    fn send_signal(&self, message: SignalingMessage) {
        let Some(session) = &self.session else {
            return;
        };
        if session.outbound.send(message).is_err() {
            tracing::debug!(session_id = %session.id, "Signaling writer already stopped");
        }
    }

    async fn enter_in_call(&mut self, peer: Peer) {
        match self.platform.start_foreground(&peer).await {
            Ok(()) => self.foreground = true,
            Err(e) => tracing::warn!(error = %e, "Failed to start foreground indication"),
        }
        self.set_state(CallState::InCall {
            peer: peer.clone(),
            muted: self.muted,
            speaker_on: self.speaker_on,
        });
        tracing::info!(peer = %peer.name, "Call started");
        self.emit(CallEvent::CallStarted { peer });
    }

    /// Best-effort `Bye`, then cleanup
    async fn hang_up(&mut self, reason: EndReason) {
        self.send_signal(SignalingMessage::Bye);
        self.cleanup(reason).await;
    }

    /// Return to idle, releasing everything the call holds
    ///
    /// Safe to call in any state; collaborator errors are logged.
    async fn cleanup(&mut self, reason: EndReason) {
        let was_active = !self.state.is_idle() || self.session.is_some() || self.media_open;
        self.next_generation();

        if self.focus_held {
            self.focus_held = false;
            if let Err(e) = self.platform.release_audio_focus().await {
                tracing::warn!(error = %e, "Failed to release audio focus");
            }
        }
        if self.media_open {
            self.media_open = false;
            if let Err(e) = self.media.close().await {
                tracing::warn!(error = %e, "Failed to close media connection");
            }
        }
        if let Some(task) = self.media_task.take() {
            task.abort();
        }
        self.discard_session();
        self.role = None;
        self.offer_received = false;
        self.local_description_sent = false;
        self.remote_description_set = false;
        self.pending_local.clear();
        self.pending_remote.clear();

        let peer = self.state.peer().cloned();
        if self.foreground {
            self.foreground = false;
            if let Err(e) = self.platform.stop_foreground().await {
                tracing::warn!(error = %e, "Failed to stop foreground indication");
            }
        }
        self.set_state(CallState::Idle);

        if was_active {
            tracing::info!(?reason, peer = ?peer.as_ref().map(|p| &p.name), "Call ended");
            self.emit(CallEvent::CallEnded { peer, reason });
        }
    }

    /// Match a remote address against the peer set
    fn identify(&self, remote: Option<SocketAddr>) -> Peer {
        remote
            .and_then(|addr| self.peers.iter().find(|p| p.addr == addr.ip()))
            .cloned()
            .unwrap_or_else(|| Peer::unknown(remote))
    }

    fn next_generation(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    fn set_state(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        tracing::debug!(
            old_state = self.state.name(),
            new_state = next.name(),
            peer = ?next.peer().map(|p| &p.name),
            "Call state transition"
        );
        self.state = next.clone();
        self.state_tx.send_replace(next);
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.event_sender.send(event);
    }
}
