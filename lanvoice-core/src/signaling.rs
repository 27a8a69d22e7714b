//! Signaling wire protocol
//!
//! Session descriptions and ICE candidates travel between the two peers as
//! one JSON object per line over a plain byte stream:
//!
//! ```text
//! {"type":"offer","sdp":"..."}
//! {"type":"answer","sdp":"..."}
//! {"type":"ice","sdpMid":"0","sdpMLineIndex":0,"candidate":"candidate:..."}
//! {"type":"bye"}
//! ```
//!
//! Decoding is total: anything that is not one of the four messages above
//! decodes to `None` and the stream carries on.

use crate::types::{IceCandidate, SdpKind, SessionDescription};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Line terminator appended to every encoded message
pub const LINE_TERMINATOR: u8 = b'\n';

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Session has been closed locally or by the peer
    #[error("Signaling session closed")]
    SessionClosed,

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Outbound connection could not be established
    #[error("Connect error: {0}")]
    ConnectError(String),

    /// Message could not be encoded
    #[error("Encode error: {0}")]
    EncodeError(String),
}

impl From<std::io::Error> for SignalingError {
    fn from(err: std::io::Error) -> Self {
        SignalingError::TransportError(err.to_string())
    }
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// SDP offer from the caller
    #[serde(rename = "offer")]
    Offer {
        /// SDP content
        sdp: String,
    },

    /// SDP answer from the callee
    #[serde(rename = "answer")]
    Answer {
        /// SDP content
        sdp: String,
    },

    /// Trickled ICE candidate
    #[serde(rename = "ice")]
    IceCandidate {
        /// SDP media stream identification tag
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        /// Index of the m-line the candidate belongs to; lines carrying an
        /// index above `u16::MAX` do not decode
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_mline_index: u16,
        /// Candidate string
        candidate: String,
    },

    /// Hang up
    #[serde(rename = "bye")]
    Bye,
}

impl SignalingMessage {
    /// Short message name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "Offer",
            Self::Answer { .. } => "Answer",
            Self::IceCandidate { .. } => "IceCandidate",
            Self::Bye => "Bye",
        }
    }

    /// Wrap a local session description
    #[must_use]
    pub fn from_description(description: SessionDescription) -> Self {
        match description.kind {
            SdpKind::Offer => Self::Offer {
                sdp: description.sdp,
            },
            SdpKind::Answer => Self::Answer {
                sdp: description.sdp,
            },
        }
    }
}

impl From<IceCandidate> for SignalingMessage {
    fn from(candidate: IceCandidate) -> Self {
        Self::IceCandidate {
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            candidate: candidate.candidate,
        }
    }
}

/// Encode a message as a single JSON line, without the terminator
///
/// # Errors
///
/// Returns error if serialization fails
pub fn encode(message: &SignalingMessage) -> Result<String, SignalingError> {
    serde_json::to_string(message).map_err(|e| SignalingError::EncodeError(e.to_string()))
}

/// Decode one line into a message
///
/// Trailing `\r`/`\n` are ignored. Invalid UTF-8, invalid JSON, a missing or
/// unknown `type` and mistyped fields all yield `None`.
#[must_use]
pub fn decode(line: impl AsRef<[u8]>) -> Option<SignalingMessage> {
    let mut bytes = line.as_ref();
    while let [rest @ .., b'\r' | b'\n'] = bytes {
        bytes = rest;
    }
    if bytes.is_empty() {
        return None;
    }

    match serde_json::from_slice::<SignalingMessage>(bytes) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::trace!(error = %e, len = bytes.len(), "Dropping undecodable signaling line");
            None
        }
    }
}
