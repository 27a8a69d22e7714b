//! LanVoice - peer-to-peer voice calls on the local network
//!
//! This library provides the signaling layer and call orchestration for
//! one-to-one voice calls between devices on the same LAN:
//!
//! - **Line-delimited JSON signaling**: offers, answers, ICE candidates and
//!   hang-up over a plain TCP connection between the two peers
//! - **LAN discovery**: peers advertise themselves with UDP multicast beacons
//! - **Single-threaded state machine**: one orchestrator task owns the call and
//!   serializes every user command and network event
//! - **Pluggable media**: the media engine sits behind a trait; a `webrtc`
//!   based engine ships behind the `webrtc-engine` feature
//!
//! # Examples
//!
//! ```rust,no_run
//! use lanvoice_core::{CallManager, CallManagerConfig, DirectoryConfig, LanDirectory};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let directory = Arc::new(LanDirectory::new(DirectoryConfig {
//!     service_name: "kitchen".to_string(),
//!     ..Default::default()
//! }));
//!
//! let manager = CallManager::builder()
//!     .with_config(CallManagerConfig {
//!         service_name: "kitchen".to_string(),
//!         ..Default::default()
//!     })
//!     .with_directory(directory)
//!     .start()
//!     .await?;
//!
//! // Call the first peer that shows up
//! let mut peers = manager.peers();
//! peers.changed().await?;
//! let first = peers.borrow().first().cloned();
//! if let Some(peer) = first {
//!     manager.call(peer).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Call and peer types
pub mod types;

/// Signaling wire protocol
pub mod signaling;

/// Signaling session over a byte stream
pub mod session;

/// Inbound signaling listener
pub mod listener;

/// Peer directory and LAN discovery
pub mod directory;

/// Media negotiation seam
pub mod media;

/// Media negotiator over the webrtc crate (requires webrtc-engine feature)
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_engine;

/// Audio focus and foreground hooks
pub mod platform;

/// Call orchestration
pub mod call;

// Re-export main types at crate root
pub use call::{CallError, CallManager, CallManagerBuilder, CallManagerConfig, InboundPolicy};
pub use directory::{
    DirectoryConfig, DirectoryError, LanDirectory, PeerDirectory, StaticDirectory,
    DEFAULT_MULTICAST_PORT,
};
pub use listener::SignalingListener;
pub use media::{ConnectionState, MediaError, MediaEvent, MediaEvents, MediaNegotiator};
pub use platform::{CallPlatform, LoggingPlatform, PlatformError};
pub use session::{IncomingMessages, SignalingSession};
pub use signaling::{decode, encode, SignalingError, SignalingMessage};
pub use types::*;
#[cfg(feature = "webrtc-engine")]
pub use webrtc_engine::{WebRtcConfig, WebRtcNegotiator};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallManagerConfig, InboundPolicy};
    pub use crate::directory::{DirectoryConfig, LanDirectory, PeerDirectory};
    pub use crate::media::{MediaEvent, MediaNegotiator};
    pub use crate::platform::CallPlatform;
    pub use crate::signaling::SignalingMessage;
    pub use crate::types::{CallEvent, CallState, EndReason, Peer};
    #[cfg(feature = "webrtc-engine")]
    pub use crate::webrtc_engine::{WebRtcConfig, WebRtcNegotiator};
}
