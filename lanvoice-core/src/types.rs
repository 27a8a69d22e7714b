//! Call and peer types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

/// Display name used for peers that the directory does not know about
pub const UNKNOWN_PEER_NAME: &str = "Unknown";

/// A reachable device on the local network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Unique advertised name
    pub name: String,
    /// Network address
    pub addr: IpAddr,
    /// Signaling port
    pub port: u16,
}

impl Peer {
    /// Create a new peer
    pub fn new(name: impl Into<String>, addr: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            addr,
            port,
        }
    }

    /// Placeholder for a remote end whose name is not known
    pub fn unknown(remote: Option<SocketAddr>) -> Self {
        let (addr, port) = match remote {
            Some(sa) => (sa.ip(), sa.port()),
            None => (IpAddr::from([0, 0, 0, 0]), 0),
        };
        Self::new(UNKNOWN_PEER_NAME, addr, port)
    }

    /// Signaling endpoint of this peer
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.socket_addr())
    }
}

/// Unique identifier for a signaling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdpKind {
    /// Offer from the initiator
    Offer,
    /// Answer from the responder
    Answer,
}

/// Session description produced or consumed by the media engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for WebRTC connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: u16,
    /// ICE candidate string
    pub candidate: String,
}

/// Which side of the offer/answer exchange we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationRole {
    /// Creates the offer
    Initiator,
    /// Waits for the offer and answers it
    Responder,
}

/// Call state
///
/// At most one call exists at a time, so the state carries the remote peer
/// directly. `muted`/`speaker_on` only exist while in a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No active call
    Idle,
    /// Outgoing call, waiting for the answer
    Calling {
        /// Callee
        peer: Peer,
    },
    /// Incoming call, waiting for the local user
    IncomingRinging {
        /// Caller
        peer: Peer,
    },
    /// Call is active
    InCall {
        /// Remote peer
        peer: Peer,
        /// Microphone muted
        muted: bool,
        /// Audio routed to the loudspeaker
        speaker_on: bool,
    },
}

impl CallState {
    /// Check if there is no call
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Remote peer of the current call, if any
    pub fn peer(&self) -> Option<&Peer> {
        match self {
            Self::Idle => None,
            Self::Calling { peer } | Self::IncomingRinging { peer } | Self::InCall { peer, .. } => {
                Some(peer)
            }
        }
    }

    /// Short state name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Calling { .. } => "Calling",
            Self::IncomingRinging { .. } => "IncomingRinging",
            Self::InCall { .. } => "InCall",
        }
    }
}

impl Default for CallState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Why a call returned to idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Peer sent Bye
    RemoteHangup,
    /// Signaling stream ended or failed
    Disconnected,
    /// Media engine reported a terminal connection state or failed to negotiate
    MediaFailed,
    /// Replaced by a newer inbound session
    Superseded,
    /// Call manager shutting down
    Shutdown,
}

/// Call event for notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEvent {
    /// Incoming call received
    IncomingCall {
        /// Caller
        peer: Peer,
    },
    /// Call reached the in-call state
    CallStarted {
        /// Remote peer
        peer: Peer,
    },
    /// Call ended
    CallEnded {
        /// Remote peer, if one was known
        peer: Option<Peer>,
        /// Why it ended
        reason: EndReason,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_unknown_peer() {
        let remote: SocketAddr = "192.168.1.7:51000".parse().unwrap();
        let peer = Peer::unknown(Some(remote));
        assert_eq!(peer.name, UNKNOWN_PEER_NAME);
        assert_eq!(peer.socket_addr(), remote);

        let nowhere = Peer::unknown(None);
        assert_eq!(nowhere.port, 0);
    }

    #[test]
    fn test_call_state_accessors() {
        let peer = Peer::new("kitchen", "10.0.0.2".parse().unwrap(), 4000);
        assert!(CallState::Idle.is_idle());
        assert_eq!(CallState::Idle.peer(), None);

        let state = CallState::InCall {
            peer: peer.clone(),
            muted: true,
            speaker_on: false,
        };
        assert!(!state.is_idle());
        assert_eq!(state.peer(), Some(&peer));
        assert_eq!(state.name(), "InCall");
        assert_eq!(CallState::default(), CallState::Idle);
    }

    #[test]
    fn test_peer_display() {
        let peer = Peer::new("den", "10.0.0.9".parse().unwrap(), 7000);
        assert_eq!(peer.to_string(), "den (10.0.0.9:7000)");
    }
}
