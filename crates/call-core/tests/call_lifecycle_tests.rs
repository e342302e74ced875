//! Call and peer lifecycle tests
//!
//! Drives a provider through the signalling events of outgoing, incoming,
//! cancelled and failed calls and checks the resulting state, the messages
//! handed to the transport and the published notifications.

mod common;

use pretty_assertions::assert_eq;
use std::time::Duration;

use common::{request, response, Harness, MediaCall, MockTransport, RemoteSdp};
use rvoip_call_core::prelude::*;

fn terminal_transitions(events: &[CoreEvent], peer: &PeerId) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CoreEvent::PeerStateChanged { peer_id, new, .. } if peer_id == peer && new.is_terminal()))
        .count()
}

fn calls_ended(events: &[CoreEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CoreEvent::CallEnded { .. }))
        .count()
}

#[tokio::test]
async fn test_outgoing_call_connects() {
    let mut h = Harness::new();
    let dialog = DialogId::new();

    let (call, peer) = h
        .provider
        .create_outgoing_call("sip:bob@example.com", dialog)
        .await
        .unwrap();
    assert_eq!(call.state(), CallState::InProgress);
    assert_eq!(peer.state(), CallPeerState::Initiating);

    let offer = h.transport.last_request_body(SipMethod::Invite).unwrap();
    assert!(offer.contains("m=audio"));
    assert!(offer.contains("a=rtpmap:101 telephone-event/8000"));

    h.provider
        .handle_event(response(dialog, SipMethod::Invite, 180, None))
        .await;
    assert_eq!(peer.state(), CallPeerState::Ringing);

    let answer = RemoteSdp::audio().build();
    h.provider
        .handle_event(response(dialog, SipMethod::Invite, 200, Some(&answer)))
        .await;

    assert_eq!(peer.state(), CallPeerState::Connected);
    assert_eq!(h.transport.methods(), vec![SipMethod::Invite, SipMethod::Ack]);
    assert_eq!(h.media.count(|c| *c == MediaCall::Start(*peer.id())), 1);

    let states: Vec<CallPeerState> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            CoreEvent::PeerStateChanged { new, .. } => Some(new),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![CallPeerState::Ringing, CallPeerState::Connecting, CallPeerState::Connected]
    );
}

#[tokio::test]
async fn test_incoming_call_is_answered() {
    let mut h = Harness::new();
    let dialog = DialogId::new();
    let offer = RemoteSdp::audio().build();

    let (invite, peer) = h.incoming(dialog, Some(&offer)).await;
    assert_eq!(peer.direction(), CallDirection::Incoming);
    assert_eq!(peer.remote(), "sip:bob@example.com");
    assert_eq!(peer.state(), CallPeerState::Ringing);
    assert_eq!(h.transport.statuses(&invite), vec![180]);

    h.provider.answer(&peer).await.unwrap();
    assert_eq!(peer.state(), CallPeerState::Connecting);
    assert_eq!(h.transport.statuses(&invite), vec![180, 200]);
    let answer = h.transport.response_body(&invite, 200).unwrap();
    assert!(answer.contains("m=audio"));
    assert!(answer.contains("a=sendrecv"));

    // A second answer is a no-op
    h.provider.answer(&peer).await.unwrap();
    assert_eq!(h.transport.statuses(&invite), vec![180, 200]);

    h.provider
        .handle_event(request(TransactionId::new(), dialog, SipMethod::Ack, None))
        .await;
    assert_eq!(peer.state(), CallPeerState::Connected);
    assert!(!peer.is_on_hold());

    let events = h.drain_events();
    assert!(matches!(
        events.first(),
        Some(CoreEvent::CallCreated {
            direction: CallDirection::Incoming,
            ..
        })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::PeerAdded { remote, .. } if remote == "sip:bob@example.com")));
}

#[tokio::test]
async fn test_incoming_late_offer_answered_in_ack() {
    let h = Harness::new();
    let dialog = DialogId::new();

    let (invite, peer) = h.incoming(dialog, None).await;
    h.provider.answer(&peer).await.unwrap();
    let offer = h.transport.response_body(&invite, 200).unwrap();
    assert!(offer.contains("m=audio"));

    // DialogConfirmed before the ACK must not start media without an answer
    h.provider
        .handle_event(SignalingEvent::DialogConfirmed { dialog })
        .await;
    assert_eq!(peer.state(), CallPeerState::Connecting);

    let answer = RemoteSdp::audio().build();
    h.provider
        .handle_event(request(TransactionId::new(), dialog, SipMethod::Ack, Some(Body::sdp(answer))))
        .await;
    assert_eq!(peer.state(), CallPeerState::Connected);
    assert!(peer.negotiated_streams().unwrap().audio);
}

#[tokio::test]
async fn test_late_offer_without_answer_fails() {
    let h = Harness::new();
    let dialog = DialogId::new();

    let (_, peer) = h.incoming(dialog, None).await;
    h.provider.answer(&peer).await.unwrap();
    h.provider
        .handle_event(request(TransactionId::new(), dialog, SipMethod::Ack, None))
        .await;

    assert_eq!(peer.state(), CallPeerState::Failed);
    let byes = h.transport.requests(SipMethod::Bye);
    assert_eq!(byes.len(), 1);
    assert_eq!(byes[0].1.as_ref().map(|r| r.cause), Some(488));
}

#[tokio::test]
async fn test_three_peers_end_the_call_once() {
    let mut h = Harness::new();
    let call = h.provider.create_call(CallDirection::Outgoing);
    assert_eq!(call.state(), CallState::Initializing);

    let caps = MediaCapabilities::audio_only();
    let mut peers = Vec::new();
    for n in 0..3 {
        let peer = h
            .provider
            .add_outgoing_peer(&call, &format!("sip:user{}@example.com", n), DialogId::new(), caps.clone())
            .unwrap();
        peers.push(peer);
    }
    assert_eq!(call.state(), CallState::InProgress);
    assert_eq!(call.peer_count(), 3);

    h.provider.hangup(&peers[0], HangupReason::NormalClearing).await.unwrap();
    h.provider.hangup(&peers[1], HangupReason::NormalClearing).await.unwrap();
    assert_eq!(call.state(), CallState::InProgress);
    assert_eq!(call.peer_count(), 1);
    assert_eq!(calls_ended(&h.drain_events()), 0);

    h.provider.hangup(&peers[2], HangupReason::NormalClearing).await.unwrap();
    assert_eq!(call.state(), CallState::Ended);
    assert_eq!(call.peer_count(), 0);
    assert!(peers.iter().all(|p| p.call().is_none()));
    assert!(h.provider.repository().is_empty());

    let events = h.drain_events();
    assert_eq!(calls_ended(&events), 1);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, CoreEvent::PeerRemoved { .. }))
            .count(),
        1
    );

    // Unanswered outgoing peers are cancelled
    assert_eq!(h.transport.methods(), vec![SipMethod::Cancel; 3]);
}

#[tokio::test]
async fn test_peer_cannot_join_ended_call() {
    let h = Harness::new();
    let call = h.provider.create_call(CallDirection::Outgoing);
    let peer = h
        .provider
        .add_outgoing_peer(&call, "sip:bob@example.com", DialogId::new(), MediaCapabilities::audio_only())
        .unwrap();
    h.provider.hangup(&peer, HangupReason::NormalClearing).await.unwrap();
    assert_eq!(call.state(), CallState::Ended);

    let err = h
        .provider
        .add_outgoing_peer(&call, "sip:carol@example.com", DialogId::new(), MediaCapabilities::audio_only())
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidState { .. }));
}

#[tokio::test]
async fn test_outgoing_peer_arguments_are_checked() {
    let h = Harness::new();
    let other = Harness::new();
    let call = h.provider.create_call(CallDirection::Outgoing);
    let dialog = DialogId::new();

    let err = h
        .provider
        .add_outgoing_peer(&call, "  ", DialogId::new(), MediaCapabilities::audio_only())
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidArgument { .. }));

    let err = other
        .provider
        .add_outgoing_peer(&call, "sip:bob@example.com", DialogId::new(), MediaCapabilities::audio_only())
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidArgument { .. }));

    h.provider
        .add_outgoing_peer(&call, "sip:bob@example.com", dialog, MediaCapabilities::audio_only())
        .unwrap();
    let err = h
        .provider
        .add_outgoing_peer(&call, "sip:carol@example.com", dialog, MediaCapabilities::audio_only())
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidArgument { .. }));
    assert_eq!(call.peer_count(), 1);
}

#[tokio::test]
async fn test_remote_bye_then_local_hangup() {
    let mut h = Harness::new();
    let offer = RemoteSdp::audio().build();
    let peer = h.connected_incoming(&offer).await;
    let dialog = *peer.dialog();
    h.drain_events();
    h.transport.clear();

    let bye = TransactionId::new();
    h.provider
        .handle_event(request(bye, dialog, SipMethod::Bye, None))
        .await;
    assert_eq!(h.transport.statuses(&bye), vec![200]);
    assert_eq!(peer.state(), CallPeerState::Disconnected);

    h.provider.hangup(&peer, HangupReason::NormalClearing).await.unwrap();
    assert_eq!(peer.state(), CallPeerState::Disconnected);
    assert!(h.transport.requests(SipMethod::Bye).is_empty());

    let events = h.drain_events();
    assert_eq!(terminal_transitions(&events, peer.id()), 1);
    assert_eq!(calls_ended(&events), 1);
    assert_eq!(h.media.count(|c| *c == MediaCall::Stop(*peer.id())), 1);
    assert_eq!(h.media.count(|c| *c == MediaCall::Release(*peer.id())), 1);
}

#[tokio::test]
async fn test_local_hangup_then_remote_bye() {
    let mut h = Harness::new();
    let offer = RemoteSdp::audio().build();
    let peer = h.connected_incoming(&offer).await;
    let dialog = *peer.dialog();
    h.drain_events();

    h.provider.hangup(&peer, HangupReason::NormalClearing).await.unwrap();
    assert_eq!(peer.state(), CallPeerState::Disconnected);
    let byes = h.transport.requests(SipMethod::Bye);
    assert_eq!(byes.len(), 1);
    assert_eq!(byes[0].1, None);

    let bye = TransactionId::new();
    h.provider
        .handle_event(request(bye, dialog, SipMethod::Bye, None))
        .await;
    assert_eq!(h.transport.statuses(&bye), vec![481]);

    let events = h.drain_events();
    assert_eq!(terminal_transitions(&events, peer.id()), 1);
}

#[tokio::test]
async fn test_hangup_with_reason_header() {
    let h = Harness::new();
    let answer = RemoteSdp::audio().build();
    let peer = h.connected_outgoing(&answer).await;

    h.provider
        .hangup(
            &peer,
            HangupReason::Custom {
                code: 603,
                text: "Declined".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(peer.state(), CallPeerState::Failed);
    let byes = h.transport.requests(SipMethod::Bye);
    let reason = byes[0].1.clone().unwrap();
    assert_eq!(reason.cause, 603);
    assert_eq!(reason.text.as_deref(), Some("Declined"));
}

#[tokio::test]
async fn test_concurrent_answers_send_one_200() {
    let h = Harness::new();
    h.media.yield_in_reserve(true);
    let dialog = DialogId::new();
    let (invite, peer) = h.incoming(dialog, Some(&RemoteSdp::audio().build())).await;

    let (first, second) = tokio::join!(h.provider.answer(&peer), h.provider.answer(&peer));
    first.unwrap();
    second.unwrap();

    let ok = h.transport.statuses(&invite).into_iter().filter(|s| *s == 200).count();
    assert_eq!(ok, 1);
    assert_eq!(peer.state(), CallPeerState::Connecting);
}

#[tokio::test]
async fn test_hangup_waits_for_answer_in_progress() {
    let h = Harness::new();
    h.media.yield_in_reserve(true);
    let dialog = DialogId::new();
    let (invite, peer) = h.incoming(dialog, Some(&RemoteSdp::audio().build())).await;

    // The hangup lands while the answer is still reserving media
    let (answered, hung_up) = tokio::join!(
        h.provider.answer(&peer),
        h.provider.hangup(&peer, HangupReason::NormalClearing)
    );
    answered.unwrap();
    hung_up.unwrap();

    // One final response on the INVITE, then the dialog is closed with BYE
    assert_eq!(h.transport.statuses(&invite), vec![180, 200]);
    assert_eq!(h.transport.requests(SipMethod::Bye).len(), 1);
    assert_eq!(peer.state(), CallPeerState::Disconnected);
}

#[tokio::test]
async fn test_cancelled_incoming_call() {
    let mut h = Harness::new();
    let dialog = DialogId::new();
    let offer = RemoteSdp::audio().build();
    let (invite, peer) = h.incoming(dialog, Some(&offer)).await;

    let cancel = TransactionId::new();
    h.provider
        .handle_event(request(cancel, dialog, SipMethod::Cancel, None))
        .await;

    assert_eq!(h.transport.statuses(&cancel), vec![200]);
    assert_eq!(h.transport.statuses(&invite), vec![180, 487]);
    assert_eq!(peer.state(), CallPeerState::Disconnected);
    assert!(h.provider.find_peer(&dialog).is_none());
    assert_eq!(calls_ended(&h.drain_events()), 1);
}

#[tokio::test]
async fn test_busy_rejects_incoming_call() {
    let h = Harness::new();
    let dialog = DialogId::new();
    let offer = RemoteSdp::audio().build();
    let (invite, peer) = h.incoming(dialog, Some(&offer)).await;

    h.provider.hangup(&peer, HangupReason::Busy).await.unwrap();

    assert_eq!(h.transport.statuses(&invite), vec![180, 486]);
    assert_eq!(peer.state(), CallPeerState::Failed);
    assert!(h.transport.methods().is_empty());
}

#[tokio::test]
async fn test_requests_for_unknown_dialog() {
    let h = Harness::new();
    let dialog = DialogId::new();

    let bye = TransactionId::new();
    h.provider
        .handle_event(request(bye, dialog, SipMethod::Bye, None))
        .await;
    assert_eq!(h.transport.statuses(&bye), vec![481]);

    h.provider
        .handle_event(request(TransactionId::new(), dialog, SipMethod::Ack, None))
        .await;
    assert_eq!(h.transport.sent().len(), 1);
    assert!(h.provider.repository().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ringing_is_retransmitted_on_unreliable_transport() {
    let h = Harness::with(CallCoreConfig::default(), MockTransport::unreliable());
    let dialog = DialogId::new();
    let offer = RemoteSdp::audio().build();
    let (invite, _peer) = h.incoming(dialog, Some(&offer)).await;

    tokio::time::sleep(Duration::from_secs(10)).await;

    // First 180 plus three retransmissions at 500, 1000 and 2000 ms intervals
    assert_eq!(h.transport.statuses(&invite), vec![180; 4]);
}

#[tokio::test(start_paused = true)]
async fn test_ringing_retransmission_stops_when_answered() {
    let h = Harness::with(CallCoreConfig::default(), MockTransport::unreliable());
    let dialog = DialogId::new();
    let offer = RemoteSdp::audio().build();
    let (invite, peer) = h.incoming(dialog, Some(&offer)).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.transport.statuses(&invite), vec![180, 180]);

    h.provider.answer(&peer).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.transport.statuses(&invite), vec![180, 180, 200]);
}

#[tokio::test(start_paused = true)]
async fn test_no_ringing_retransmission_on_reliable_transport() {
    let h = Harness::new();
    let dialog = DialogId::new();
    let offer = RemoteSdp::audio().build();
    let (invite, _peer) = h.incoming(dialog, Some(&offer)).await;

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(h.transport.statuses(&invite), vec![180]);
}

#[tokio::test]
async fn test_unacceptable_offer_is_rejected_with_488() {
    let mut h = Harness::new();
    let dialog = DialogId::new();
    // Video only, and video is not enabled locally
    let offer = RemoteSdp::audio().without_audio().video().build();
    let (invite, peer) = h.incoming(dialog, Some(&offer)).await;

    let err = h.provider.answer(&peer).await.unwrap_err();
    assert!(matches!(err, CallError::Negotiation { .. }));
    assert_eq!(h.transport.statuses(&invite), vec![180, 488]);
    assert_eq!(peer.state(), CallPeerState::Failed);

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::PeerStateChanged {
            new: CallPeerState::Failed,
            error: Some(CallError::Negotiation { .. }),
            ..
        }
    )));
    assert_eq!(calls_ended(&events), 1);
}

#[tokio::test]
async fn test_unusable_answer_ends_outgoing_call() {
    let h = Harness::new();
    let dialog = DialogId::new();
    let (_, peer) = h
        .provider
        .create_outgoing_call("sip:bob@example.com", dialog)
        .await
        .unwrap();

    let answer = RemoteSdp::audio().without_audio().video().build();
    h.provider
        .handle_event(response(dialog, SipMethod::Invite, 200, Some(&answer)))
        .await;

    assert_eq!(peer.state(), CallPeerState::Failed);
    assert_eq!(
        h.transport.methods(),
        vec![SipMethod::Invite, SipMethod::Ack, SipMethod::Bye]
    );
}

#[tokio::test]
async fn test_address_reservation_failure_fails_outgoing_call() {
    let mut h = Harness::new();
    h.media.fail_reserve(true);

    let err = h
        .provider
        .create_outgoing_call("sip:bob@example.com", DialogId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Io { .. }));
    assert!(h.transport.methods().is_empty());
    assert!(h.provider.repository().is_empty());

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::PeerStateChanged {
            new: CallPeerState::Failed,
            error: Some(CallError::Io { .. }),
            ..
        }
    )));
}

#[tokio::test]
async fn test_rejected_invite_disconnects_peer() {
    let h = Harness::new();
    let dialog = DialogId::new();
    let (call, peer) = h
        .provider
        .create_outgoing_call("sip:bob@example.com", dialog)
        .await
        .unwrap();

    h.provider
        .handle_event(response(dialog, SipMethod::Invite, 486, None))
        .await;
    assert_eq!(peer.state(), CallPeerState::Disconnected);
    assert_eq!(call.state(), CallState::Ended);
}

#[tokio::test]
async fn test_transport_error_fails_peer() {
    let mut h = Harness::new();
    let answer = RemoteSdp::audio().build();
    let peer = h.connected_outgoing(&answer).await;
    h.drain_events();

    h.provider
        .handle_event(SignalingEvent::TransportError {
            dialog: *peer.dialog(),
            message: "connection reset".to_string(),
        })
        .await;

    assert_eq!(peer.state(), CallPeerState::Failed);
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::PeerStateChanged {
            new: CallPeerState::Failed,
            error: Some(CallError::TransportFailure { .. }),
            ..
        }
    )));
}

#[tokio::test]
async fn test_hangup_send_failure_still_ends_peer() {
    let h = Harness::new();
    let answer = RemoteSdp::audio().build();
    let peer = h.connected_outgoing(&answer).await;

    h.transport.fail_requests(true);
    let err = h
        .provider
        .hangup(&peer, HangupReason::NormalClearing)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::TransportFailure { .. }));
    assert_eq!(peer.state(), CallPeerState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_hangs_up_everything() {
    let h = Harness::new();
    let answer = RemoteSdp::audio().build();
    let a = h.connected_outgoing(&answer).await;
    let b = h.connected_outgoing(&answer).await;

    h.provider.shutdown().await;

    assert_eq!(a.state(), CallPeerState::Disconnected);
    assert_eq!(b.state(), CallPeerState::Disconnected);
    assert!(h.provider.repository().is_empty());
}
