//! Host platform services around a call
//!
//! Audio focus is held while a media connection exists; the foreground
//! indication is shown while a call is in progress.

use crate::types::Peer;
use async_trait::async_trait;
use thiserror::Error;

/// Platform errors
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Audio focus could not be acquired or released
    #[error("Audio focus error: {0}")]
    AudioFocus(String),

    /// Foreground indication could not be changed
    #[error("Foreground error: {0}")]
    Foreground(String),
}

/// Platform hooks invoked by the call orchestrator
///
/// Failures are logged by the caller and never abort a call.
#[async_trait]
pub trait CallPlatform: Send + Sync {
    /// Claim the audio device for a call
    async fn acquire_audio_focus(&self) -> Result<(), PlatformError>;

    /// Give the audio device back
    async fn release_audio_focus(&self) -> Result<(), PlatformError>;

    /// Show that a call with `peer` is in progress
    async fn start_foreground(&self, peer: &Peer) -> Result<(), PlatformError>;

    /// Remove the in-progress indication
    async fn stop_foreground(&self) -> Result<(), PlatformError>;
}

/// Platform that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingPlatform;

#[async_trait]
impl CallPlatform for LoggingPlatform {
    async fn acquire_audio_focus(&self) -> Result<(), PlatformError> {
        tracing::debug!("Audio focus acquired");
        Ok(())
    }

    async fn release_audio_focus(&self) -> Result<(), PlatformError> {
        tracing::debug!("Audio focus released");
        Ok(())
    }

    async fn start_foreground(&self, peer: &Peer) -> Result<(), PlatformError> {
        tracing::info!(peer = %peer.name, "Call in progress");
        Ok(())
    }

    async fn stop_foreground(&self) -> Result<(), PlatformError> {
        tracing::info!("Call indication cleared");
        Ok(())
    }
}
