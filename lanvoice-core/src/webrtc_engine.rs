//! [`MediaNegotiator`] backed by the `webrtc` crate
//!
//! Each call gets a fresh `RTCPeerConnection` with one Opus send track. Local
//! candidates and connection state changes are forwarded as [`MediaEvent`]s.
//! Audio routing has no meaning for a desktop process, so the route is only
//! recorded and logged.

use crate::media::{ConnectionState, MediaError, MediaEvent, MediaEvents, MediaNegotiator};
use crate::types::{IceCandidate, NegotiationRole, SdpKind, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// WebRTC engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// STUN/TURN server URLs; empty means host candidates only
    pub ice_servers: Vec<String>,
}

struct ActiveConnection {
    peer_connection: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticSample>,
    role: NegotiationRole,
}

/// Media negotiator over `webrtc-rs`
pub struct WebRtcNegotiator {
    config: WebRtcConfig,
    active: Mutex<Option<ActiveConnection>>,
    muted: AtomicBool,
    speaker_on: AtomicBool,
}

impl WebRtcNegotiator {
    /// Create a negotiator; no connection exists until `open`
    #[must_use]
    pub fn new(config: WebRtcConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
            muted: AtomicBool::new(false),
            speaker_on: AtomicBool::new(false),
        }
    }

    /// Check if outgoing audio is muted
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Check if audio is routed to the loudspeaker
    #[must_use]
    pub fn is_speaker_on(&self) -> bool {
        self.speaker_on.load(Ordering::SeqCst)
    }

    /// Send one encoded Opus frame on the open connection
    ///
    /// Frames are silently dropped while muted.
    ///
    /// # Errors
    ///
    /// Returns error if no connection is open or the write fails
    pub async fn send_audio(&self, frame: &[u8], duration: Duration) -> Result<(), MediaError> {
        let track = {
            let active = self.active.lock().await;
            let active = active.as_ref().ok_or(MediaError::NotOpen)?;
            Arc::clone(&active.audio_track)
        };
        if self.is_muted() {
            return Ok(());
        }

        let sample = Sample {
            data: bytes::Bytes::copy_from_slice(frame),
            duration,
            ..Default::default()
        };
        track
            .write_sample(&sample)
            .await
            .map_err(|e| MediaError::SendFailed(e.to_string()))
    }

    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::ConfigError(format!("Failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| MediaError::ConfigError(format!("Failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api.new_peer_connection(rtc_config).await.map_err(|e| {
            MediaError::ConfigError(format!("Failed to create peer connection: {e}"))
        })?;
        Ok(Arc::new(peer_connection))
    }

    async fn peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.peer_connection))
            .ok_or(MediaError::NotOpen)
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn register_handlers(peer_connection: &RTCPeerConnection, events: mpsc::UnboundedSender<MediaEvent>) {
    let candidate_events = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(MediaEvent::LocalCandidate(IceCandidate {
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                        candidate: init.candidate,
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize local ICE candidate"),
            }
        })
    }));

    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::debug!(?state, "Peer connection state changed");
        if let Some(state) = map_state(state) {
            let _ = events.send(MediaEvent::ConnectionStateChanged(state));
        }
        Box::pin(async {})
    }));

    peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        Box::pin(async move {
            tracing::info!(ssrc = track.ssrc(), "Remote audio track started");
            tokio::spawn(async move {
                // No playback sink; drain so the interceptors keep running.
                while track.read_rtp().await.is_ok() {}
                tracing::debug!("Remote audio track ended");
            });
        })
    }));
}

#[async_trait]
impl MediaNegotiator for WebRtcNegotiator {
    #[tracing::instrument(skip(self))]
    async fn open(&self, role: NegotiationRole) -> Result<MediaEvents, MediaError> {
        self.close().await?;

        let peer_connection = self.build_peer_connection().await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        register_handlers(&peer_connection, events_tx);

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "lanvoice".to_owned(),
        ));
        let track: Arc<dyn TrackLocal + Send + Sync> = audio_track.clone();
        peer_connection
            .add_track(track)
            .await
            .map_err(|e| MediaError::ConfigError(format!("Failed to add audio track: {e}")))?;

        tracing::debug!(
            muted = self.is_muted(),
            speaker_on = self.is_speaker_on(),
            "Peer connection opened"
        );
        *self.active.lock().await = Some(ActiveConnection {
            peer_connection,
            audio_track,
            role,
        });
        Ok(events_rx)
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let peer_connection = self.peer_connection().await?;
        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(|e| MediaError::NegotiationError(format!("Failed to create offer: {e}")))?;
        peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::NegotiationError(format!("Failed to set local description: {e}")))?;
        tracing::debug!(sdp_len = offer.sdp.len(), "SDP offer created");
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let peer_connection = self.peer_connection().await?;
        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| MediaError::NegotiationError(format!("Failed to create answer: {e}")))?;
        peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::NegotiationError(format!("Failed to set local description: {e}")))?;
        tracing::debug!(sdp_len = answer.sdp.len(), "SDP answer created");
        Ok(SessionDescription::answer(answer.sdp))
    }

    #[tracing::instrument(skip(self, description), fields(kind = ?description.kind, sdp_len = description.sdp.len()))]
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        if description.sdp.trim().is_empty() {
            return Err(MediaError::NegotiationError(
                "Remote SDP cannot be empty".to_string(),
            ));
        }

        let peer_connection = self.peer_connection().await?;
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| MediaError::NegotiationError(format!("Invalid remote SDP: {e}")))?;

        peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| MediaError::NegotiationError(format!("Failed to set remote description: {e}")))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let peer_connection = self.peer_connection().await?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::NegotiationError(format!("Failed to add ICE candidate: {e}")))
    }

    async fn set_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.muted.store(muted, Ordering::SeqCst);
        tracing::debug!(muted, "Microphone mute changed");
        Ok(())
    }

    async fn set_audio_route(&self, speaker: bool) -> Result<(), MediaError> {
        self.speaker_on.store(speaker, Ordering::SeqCst);
        tracing::debug!(speaker, "Audio route changed");
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            tracing::debug!(role = ?active.role, "Closing peer connection");
            active
                .peer_connection
                .close()
                .await
                .map_err(|e| MediaError::ConfigError(format!("Failed to close peer connection: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            Some(ConnectionState::Connected)
        );
    }

    #[tokio::test]
    async fn test_requires_open_connection() {
        let negotiator = WebRtcNegotiator::new(WebRtcConfig::default());
        assert!(matches!(
            negotiator.create_offer().await,
            Err(MediaError::NotOpen)
        ));
        assert!(matches!(
            negotiator
                .send_audio(&[0u8; 4], Duration::from_millis(20))
                .await,
            Err(MediaError::NotOpen)
        ));
        // Closing with nothing open is fine
        negotiator.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_negotiators() {
        let caller = WebRtcNegotiator::new(WebRtcConfig::default());
        let callee = WebRtcNegotiator::new(WebRtcConfig::default());
        let _caller_events = caller.open(NegotiationRole::Initiator).await.unwrap();
        let _callee_events = callee.open(NegotiationRole::Responder).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("opus"));

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        caller.set_remote_description(answer).await.unwrap();

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mute_and_route_are_remembered() {
        let negotiator = WebRtcNegotiator::new(WebRtcConfig::default());
        negotiator.set_muted(true).await.unwrap();
        negotiator.set_audio_route(true).await.unwrap();
        assert!(negotiator.is_muted());
        assert!(negotiator.is_speaker_on());

        let _events = negotiator.open(NegotiationRole::Initiator).await.unwrap();
        assert!(negotiator.is_muted());
        negotiator
            .send_audio(&[0u8; 4], Duration::from_millis(20))
            .await
            .unwrap();
        negotiator.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_empty_remote_sdp() {
        let negotiator = WebRtcNegotiator::new(WebRtcConfig::default());
        let result = negotiator
            .set_remote_description(SessionDescription::answer("  "))
            .await;
        assert!(matches!(result, Err(MediaError::NegotiationError(_))));
    }
}
