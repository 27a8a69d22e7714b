//! ICE candidate ordering tests
//!
//! A real engine starts gathering while the local description is applied and
//! rejects remote candidates until it has a remote description. These tests
//! script both behaviours and check that calls still connect.

mod common;

use common::*;
use lanvoice_core::{CallManagerConfig, CallState, Peer, SessionDescription, SignalingMessage};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;

fn gathering_media() -> Arc<MockMedia> {
    let media = Arc::new(MockMedia::default());
    media.gather_while_describing.store(true, Ordering::SeqCst);
    media.require_remote_description.store(true, Ordering::SeqCst);
    media
}

#[tokio::test]
async fn offer_is_sent_before_local_candidates() {
    let harness = start_with_media(test_config(), Vec::new(), gathering_media()).await;
    let listener = TcpListener::bind((localhost(), 0)).await.unwrap();
    let peer = Peer::new("B", localhost(), listener.local_addr().unwrap().port());

    harness.manager.call(peer).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    let mut remote = RemotePeer::from_stream(stream);

    assert_eq!(
        remote.recv().await,
        Some(SignalingMessage::Offer {
            sdp: MOCK_OFFER.to_string()
        })
    );
    assert_eq!(
        remote.recv().await,
        Some(SignalingMessage::from(local_candidate()))
    );
}

#[tokio::test]
async fn answer_is_sent_before_local_candidates() {
    let harness = start_with_media(test_config(), Vec::new(), gathering_media()).await;
    let mut remote = RemotePeer::connect(harness.manager.signaling_port()).await;
    let mut state = harness.manager.state();
    wait_for_state(&mut state, |s| matches!(s, CallState::IncomingRinging { .. })).await;

    remote
        .send(&SignalingMessage::Offer {
            sdp: "v=0 remote-offer".to_string(),
        })
        .await;

    assert_eq!(
        remote.recv().await,
        Some(SignalingMessage::Answer {
            sdp: MOCK_ANSWER.to_string()
        })
    );
    assert_eq!(
        remote.recv().await,
        Some(SignalingMessage::from(local_candidate()))
    );
}

#[tokio::test]
async fn candidate_before_offer_is_applied_after_it() {
    let harness = start_with_media(test_config(), Vec::new(), gathering_media()).await;
    let mut remote = RemotePeer::connect(harness.manager.signaling_port()).await;
    let mut state = harness.manager.state();
    wait_for_state(&mut state, |s| matches!(s, CallState::IncomingRinging { .. })).await;

    let early = lanvoice_core::IceCandidate {
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: 0,
        candidate: "candidate:9 1 udp 2122260223 127.0.0.1 50009 typ host".to_string(),
    };
    remote.send(&SignalingMessage::from(early.clone())).await;
    remote
        .send(&SignalingMessage::Offer {
            sdp: "v=0 remote-offer".to_string(),
        })
        .await;

    assert_eq!(
        remote.recv().await,
        Some(SignalingMessage::Answer {
            sdp: MOCK_ANSWER.to_string()
        })
    );
    assert!(matches!(
        harness.manager.current_state(),
        CallState::IncomingRinging { .. }
    ));

    harness.manager.accept_incoming().await.unwrap();
    assert!(matches!(
        harness.manager.current_state(),
        CallState::InCall { .. }
    ));

    let set_remote = harness
        .media
        .position(&MediaCall::SetRemote(SessionDescription::offer("v=0 remote-offer")))
        .unwrap();
    let added = harness
        .media
        .position(&MediaCall::AddCandidate(early))
        .unwrap();
    assert!(set_remote < added);
    assert_eq!(harness.media.rejected_candidates(), 0);
}

#[tokio::test]
async fn two_managers_connect_while_gathering() {
    let callee = start_with_media(
        CallManagerConfig {
            service_name: "B".to_string(),
            auto_accept: true,
            ..test_config()
        },
        Vec::new(),
        gathering_media(),
    )
    .await;
    let peer = Peer::new("B", localhost(), callee.manager.signaling_port());
    let caller = start_with_media(test_config(), vec![peer.clone()], gathering_media()).await;
    let mut callee_events = callee.manager.subscribe_events();

    caller.manager.call(peer).await.unwrap();

    let mut caller_state = caller.manager.state();
    let mut callee_state = callee.manager.state();
    wait_for_state(&mut caller_state, |s| matches!(s, CallState::InCall { .. })).await;
    wait_for_state(&mut callee_state, |s| matches!(s, CallState::InCall { .. })).await;

    // Each side receives the other's candidate once negotiation allows it
    let candidate = MediaCall::AddCandidate(local_candidate());
    wait_until(|| caller.media.count(&candidate) == 1).await;
    wait_until(|| callee.media.count(&candidate) == 1).await;

    assert_eq!(caller.media.rejected_candidates(), 0);
    assert_eq!(callee.media.rejected_candidates(), 0);
    assert!(matches!(
        caller.manager.current_state(),
        CallState::InCall { .. }
    ));
    assert!(matches!(
        callee.manager.current_state(),
        CallState::InCall { .. }
    ));
    assert!(matches!(
        callee_events.recv().await.unwrap(),
        lanvoice_core::CallEvent::IncomingCall { .. }
    ));
    assert!(matches!(
        callee_events.recv().await.unwrap(),
        lanvoice_core::CallEvent::CallStarted { .. }
    ));
}
