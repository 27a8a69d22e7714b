//! Media negotiation seam
//!
//! The orchestrator drives the real-time media engine only through
//! [`MediaNegotiator`]: it opens a connection for one role, trades session
//! descriptions and candidates, and toggles mute and audio route. The engine
//! reports back asynchronously through [`MediaEvent`]s.

use crate::types::{IceCandidate, NegotiationRole, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// No connection is open
    #[error("Media connection not open")]
    NotOpen,

    /// Engine could not be set up
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Description or candidate could not be produced or applied
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// Sending media failed
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Connection state reported by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, nothing happened yet
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media flowing
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Connectivity could not be established
    Failed,
    /// Connection closed
    Closed,
}

impl ConnectionState {
    /// States after which the call cannot continue
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Asynchronous notification from the media engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// A local ICE candidate to trickle to the peer
    LocalCandidate(IceCandidate),
    /// Connection state changed
    ConnectionStateChanged(ConnectionState),
}

/// Receiver half handed out by [`MediaNegotiator::open`]
pub type MediaEvents = mpsc::UnboundedReceiver<MediaEvent>;

/// Wraps the real-time media engine
///
/// At most one connection is open at a time. `open` replaces any previous
/// connection. Mute and audio route are remembered across connections and
/// applied to each new one.
#[async_trait]
pub trait MediaNegotiator: Send + Sync {
    /// Create a connection for `role`, returning its event stream
    async fn open(&self, role: NegotiationRole) -> Result<MediaEvents, MediaError>;

    /// Create and apply a local offer
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Create and apply a local answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    /// Apply the peer's offer or answer
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    /// Apply a candidate trickled by the peer
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Stop or resume sending microphone audio
    async fn set_muted(&self, muted: bool) -> Result<(), MediaError>;

    /// Route audio to the loudspeaker (`true`) or earpiece (`false`)
    async fn set_audio_route(&self, speaker: bool) -> Result<(), MediaError>;

    /// Tear down the connection; no-op when none is open
    async fn close(&self) -> Result<(), MediaError>;
}
