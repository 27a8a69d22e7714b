//! Shared helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use lanvoice_core::{
    decode, encode, CallManager, CallManagerConfig, CallPlatform, CallState, IceCandidate,
    MediaError, MediaEvent, MediaEvents, MediaNegotiator, NegotiationRole, Peer, PlatformError,
    SessionDescription, SignalingMessage, StaticDirectory,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

pub const MOCK_OFFER: &str = "v=0 mock-offer";
pub const MOCK_ANSWER: &str = "v=0 mock-answer";
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn local_candidate() -> IceCandidate {
    IceCandidate {
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: 0,
        candidate: "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host".to_string(),
    }
}

/// Route orchestrator logs to the test output; set `RUST_LOG` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Everything the media engine was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    Open(NegotiationRole),
    CreateOffer,
    CreateAnswer,
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    SetMuted(bool),
    SetAudioRoute(bool),
    Close,
}

/// Scripted media engine that records every call
#[derive(Default)]
pub struct MockMedia {
    calls: parking_lot::Mutex<Vec<MediaCall>>,
    events: parking_lot::Mutex<Option<mpsc::UnboundedSender<MediaEvent>>>,
    pub fail_open: AtomicBool,
    pub fail_create_answer: AtomicBool,
    pub fail_candidates: AtomicBool,
    /// Emit a local candidate while the offer or answer is being created,
    /// the way a real engine starts gathering when the local description is set
    pub gather_while_describing: AtomicBool,
    /// Reject remote candidates until a remote description is set
    pub require_remote_description: AtomicBool,
    remote_set: AtomicBool,
    rejected_candidates: AtomicUsize,
}

impl MockMedia {
    pub fn calls(&self) -> Vec<MediaCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &MediaCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    /// Push an event as if the engine produced it; false when nothing is open
    pub fn emit(&self, event: MediaEvent) -> bool {
        self.events
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Remote candidates refused for lack of a remote description
    pub fn rejected_candidates(&self) -> usize {
        self.rejected_candidates.load(Ordering::SeqCst)
    }

    /// Position of the first recorded `call`
    pub fn position(&self, call: &MediaCall) -> Option<usize> {
        self.calls.lock().iter().position(|c| c == call)
    }

    fn record(&self, call: MediaCall) {
        self.calls.lock().push(call);
    }

    async fn gather(&self) {
        if self.gather_while_describing.load(Ordering::SeqCst) {
            self.emit(MediaEvent::LocalCandidate(local_candidate()));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl MediaNegotiator for MockMedia {
    async fn open(&self, role: NegotiationRole) -> Result<MediaEvents, MediaError> {
        self.record(MediaCall::Open(role));
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(MediaError::ConfigError("scripted failure".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        self.remote_set.store(false, Ordering::SeqCst);
        Ok(rx)
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.record(MediaCall::CreateOffer);
        self.gather().await;
        Ok(SessionDescription::offer(MOCK_OFFER))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.record(MediaCall::CreateAnswer);
        if self.fail_create_answer.load(Ordering::SeqCst) {
            return Err(MediaError::NegotiationError("scripted failure".to_string()));
        }
        self.gather().await;
        Ok(SessionDescription::answer(MOCK_ANSWER))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        self.record(MediaCall::SetRemote(description));
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(MediaCall::AddCandidate(candidate));
        if self.require_remote_description.load(Ordering::SeqCst)
            && !self.remote_set.load(Ordering::SeqCst)
        {
            self.rejected_candidates.fetch_add(1, Ordering::SeqCst);
            return Err(MediaError::NegotiationError("No remote description".to_string()));
        }
        if self.fail_candidates.load(Ordering::SeqCst) {
            return Err(MediaError::NegotiationError("scripted failure".to_string()));
        }
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.record(MediaCall::SetMuted(muted));
        Ok(())
    }

    async fn set_audio_route(&self, speaker: bool) -> Result<(), MediaError> {
        self.record(MediaCall::SetAudioRoute(speaker));
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.record(MediaCall::Close);
        self.events.lock().take();
        Ok(())
    }
}

/// Platform that records calls
#[derive(Default)]
pub struct RecordingPlatform {
    calls: parking_lot::Mutex<Vec<String>>,
}

impl RecordingPlatform {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl CallPlatform for RecordingPlatform {
    async fn acquire_audio_focus(&self) -> Result<(), PlatformError> {
        self.calls.lock().push("acquire_audio_focus".to_string());
        Ok(())
    }

    async fn release_audio_focus(&self) -> Result<(), PlatformError> {
        self.calls.lock().push("release_audio_focus".to_string());
        Ok(())
    }

    async fn start_foreground(&self, peer: &Peer) -> Result<(), PlatformError> {
        self.calls.lock().push(format!("start_foreground:{}", peer.name));
        Ok(())
    }

    async fn stop_foreground(&self) -> Result<(), PlatformError> {
        self.calls.lock().push("stop_foreground".to_string());
        Ok(())
    }
}

pub struct Harness {
    pub manager: CallManager,
    pub media: Arc<MockMedia>,
    pub platform: Arc<RecordingPlatform>,
    pub directory: Arc<StaticDirectory>,
}

pub fn test_config() -> CallManagerConfig {
    CallManagerConfig {
        service_name: "A".to_string(),
        bind_addr: localhost(),
        connect_timeout_ms: 2000,
        ..Default::default()
    }
}

pub async fn start(config: CallManagerConfig, peers: Vec<Peer>) -> Harness {
    start_with_media(config, peers, Arc::new(MockMedia::default())).await
}

pub async fn start_with_media(
    config: CallManagerConfig,
    peers: Vec<Peer>,
    media: Arc<MockMedia>,
) -> Harness {
    init_tracing();
    let platform = Arc::new(RecordingPlatform::default());
    let directory = Arc::new(StaticDirectory::new(peers));
    let manager = CallManager::builder()
        .with_config(config)
        .with_media(media.clone())
        .with_platform(platform.clone())
        .with_directory(directory.clone())
        .start()
        .await
        .unwrap();
    Harness {
        manager,
        media,
        platform,
        directory,
    }
}

pub async fn wait_for_state(
    rx: &mut watch::Receiver<CallState>,
    pred: impl FnMut(&CallState) -> bool,
) -> CallState {
    tokio::time::timeout(TIMEOUT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for call state")
        .expect("state channel closed")
        .clone()
}

/// Poll until `cond` holds
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

pub async fn wait_idle(rx: &mut watch::Receiver<CallState>) {
    wait_for_state(rx, CallState::is_idle).await;
}

/// The far end of a signaling connection, driven by hand
pub struct RemotePeer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RemotePeer {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect((localhost(), port)).await.unwrap();
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, message: &SignalingMessage) {
        let line = encode(message).unwrap();
        self.send_raw(&line).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    /// Next decodable message, or `None` once the stream ends
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        loop {
            let line = tokio::time::timeout(TIMEOUT, self.lines.next_line())
                .await
                .expect("timed out waiting for signaling message")
                .ok()??;
            if let Some(message) = decode(&line) {
                return Some(message);
            }
        }
    }

    /// Skip candidates and return the next other message
    pub async fn recv_skipping_candidates(&mut self) -> Option<SignalingMessage> {
        loop {
            match self.recv().await? {
                SignalingMessage::IceCandidate { .. } => continue,
                other => return Some(other),
            }
        }
    }

    pub async fn expect_closed(&mut self) {
        while let Some(message) = self.recv().await {
            assert!(
                matches!(message, SignalingMessage::IceCandidate { .. } | SignalingMessage::Bye),
                "unexpected message before close: {message:?}"
            );
        }
    }
}
