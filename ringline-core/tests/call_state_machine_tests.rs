//! Call lifecycle scenarios against in-memory collaborators

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use common::{drain, incoming, signal, Harness, RecordOp, TransportOp};
use pretty_assertions::assert_eq;
use ringline_core::{
    CallError, CallEvent, CallId, CallPhase, CallSignal, CallState, CallStatus, CallType, EndReason,
    IceCandidate, MediaError, ParticipantId, RelayEvent, SessionDescription, SignalingError,
    SignalingEvent, TransportEvent, TransportState,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn remote_answer() -> SessionDescription {
    SessionDescription::answer("v=0 remote-answer")
}

fn ended_reason(events: &[CallEvent]) -> Option<(Option<CallStatus>, EndReason)> {
    events.iter().rev().find_map(|event| match event {
        CallEvent::CallEnded { call, reason } => {
            Some((call.as_ref().map(|c| c.status), reason.clone()))
        }
        _ => None,
    })
}

/// Place a video call from u1 to u2 and connect it
async fn connected_outbound(h: &mut Harness) -> CallId {
    let call = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Video)
        .await
        .unwrap();
    h.relay(RelayEvent::CallAccepted {
        call_id: call.id.clone(),
        answer: Some(remote_answer()),
    })
    .await;
    assert_eq!(h.controller.phase().await, CallPhase::InCall);
    call.id
}

#[tokio::test]
async fn test_outbound_call_connects() {
    let mut h = Harness::new("u1");
    let mut events = h.controller.subscribe_events();

    let call = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Video)
        .await
        .unwrap();
    assert_eq!(call.id.as_str(), "call-1");
    assert_eq!(call.status, CallStatus::Pending);
    assert!(h.controller.is_calling().await);
    assert_eq!(h.channel.sent_kinds(), vec!["offer"]);
    assert_eq!(h.records.log(), vec!["create:u2"]);
    assert_eq!(h.controller.live_transports(), 1);
    assert_eq!(h.devices.live_streams(), 1);

    // Held until the far end has our offer answered
    h.local_candidate("candidate:a").await;
    assert_eq!(h.channel.sent_kinds(), vec!["offer"]);

    h.relay(RelayEvent::CallAccepted {
        call_id: call.id.clone(),
        answer: Some(remote_answer()),
    })
    .await;
    assert_eq!(h.controller.phase().await, CallPhase::InCall);
    assert_eq!(h.channel.sent_kinds(), vec!["offer", "ice-candidate"]);
    assert_eq!(
        h.transports.log.remote_descriptions.lock().clone(),
        vec![remote_answer()]
    );

    h.local_candidate("candidate:b").await;
    assert_eq!(
        h.channel.sent_kinds(),
        vec!["offer", "ice-candidate", "ice-candidate"]
    );

    let state = h.controller.call_state().await;
    assert!(state.is_in_call);
    assert!(state.has_local_stream);
    assert!(state.is_video_enabled);
    assert!(!state.is_muted);

    let current = h.controller.current_call().await.unwrap();
    assert_eq!(current.status, CallStatus::Accepted);
    assert!(current.start_time.is_some());

    let events = drain(&mut events);
    assert!(matches!(events.iter().find(|e| matches!(e, CallEvent::OutgoingCall { .. })),
        Some(CallEvent::OutgoingCall { call }) if call.id.as_str() == "call-1"));
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::Connected { call_id } if call_id.as_str() == "call-1")));
}

#[tokio::test]
async fn test_local_hangup_releases_everything() {
    let mut h = Harness::new("u1");
    let call_id = connected_outbound(&mut h).await;
    let mut events = h.controller.subscribe_events();

    h.controller.end_call().await.unwrap();

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.channel.sent().last().unwrap(), &CallSignal::hangup(call_id));
    assert_eq!(h.records.log(), vec!["create:u2", "end:call-1"]);
    assert_eq!(h.transports.log.closed.load(Ordering::SeqCst), 1);
    assert!(h.controller.current_call().await.is_none());
    assert_eq!(h.controller.call_state().await, CallState::default());
    h.assert_released();

    let events = drain(&mut events);
    assert_eq!(
        ended_reason(&events),
        Some((Some(CallStatus::Ended), EndReason::LocalHangup))
    );
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::PhaseChanged {
            from: CallPhase::Ending,
            to: CallPhase::Idle
        }
    )));
}

#[tokio::test]
async fn test_inbound_call_accept() {
    let mut h = Harness::new("u2");
    let mut events = h.controller.subscribe_events();

    h.relay(incoming("c1", "u1", "u2", CallType::Voice)).await;
    assert!(h.controller.is_ringing().await);
    // Nothing is acquired while ringing
    assert_eq!(h.devices.issued_streams(), 0);
    assert_eq!(h.controller.live_transports(), 0);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, CallEvent::IncomingCall { call } if call.id.as_str() == "c1")));

    h.controller.accept_call().await.unwrap();

    assert_eq!(h.controller.phase().await, CallPhase::InCall);
    assert_eq!(h.records.log(), vec!["accept:c1"]);
    assert_eq!(h.channel.sent_kinds(), vec!["answer"]);
    assert_eq!(
        h.transports.log.remote_descriptions.lock()[0],
        SessionDescription::offer("v=0 remote-offer")
    );
    let state = h.controller.call_state().await;
    assert!(state.is_in_call);
    assert!(!state.is_video_enabled);
    assert_eq!(
        h.controller.current_call().await.unwrap().status,
        CallStatus::Accepted
    );

    h.local_candidate("candidate:a").await;
    assert_eq!(h.channel.sent_kinds(), vec!["answer", "ice-candidate"]);

    h.relay(signal(CallSignal::ice_candidate(
        CallId::from("c1"),
        IceCandidate::new("candidate:remote"),
    )))
    .await;
    assert_eq!(h.transports.log.remote_candidates.lock().len(), 1);
}

#[tokio::test]
async fn test_remote_hangup_during_call() {
    let h = Harness::new("u2");
    h.relay(incoming("c1", "u1", "u2", CallType::Video)).await;
    h.controller.accept_call().await.unwrap();
    let mut events = h.controller.subscribe_events();

    h.relay(signal(CallSignal::hangup(CallId::from("c1")))).await;

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    h.assert_released();
    assert_eq!(h.records.log(), vec!["accept:c1", "end:c1"]);
    assert!(h.channel.sent_kinds().iter().all(|kind| kind != "hangup"));
    assert_eq!(
        ended_reason(&drain(&mut events)),
        Some((Some(CallStatus::Ended), EndReason::RemoteHangup))
    );
}

#[tokio::test]
async fn test_call_ended_event_during_call() {
    let mut h = Harness::new("u1");
    let call_id = connected_outbound(&mut h).await;

    h.relay(RelayEvent::CallEnded { call_id }).await;

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    h.assert_released();
    assert_eq!(h.records.log(), vec!["create:u2", "end:call-1"]);
    assert_eq!(h.channel.sent_kinds(), vec!["offer"]);
}

#[tokio::test]
async fn test_reject_incoming_call() {
    let h = Harness::new("u2");
    let mut events = h.controller.subscribe_events();
    h.relay(incoming("c1", "u1", "u2", CallType::Video)).await;

    h.controller.reject_call().await.unwrap();

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.records.log(), vec!["reject:c1"]);
    assert!(h.channel.sent().is_empty());
    assert_eq!(h.devices.issued_streams(), 0);
    assert_eq!(
        ended_reason(&drain(&mut events)),
        Some((Some(CallStatus::Rejected), EndReason::Declined))
    );
}

#[tokio::test]
async fn test_end_call_while_ringing_declines() {
    let h = Harness::new("u2");
    h.relay(incoming("c1", "u1", "u2", CallType::Voice)).await;

    h.controller.end_call().await.unwrap();

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.records.log(), vec!["reject:c1"]);
    assert!(h.channel.sent().is_empty());
}

#[tokio::test]
async fn test_reject_returns_to_idle_when_record_fails() {
    let h = Harness::new("u2");
    h.records.fail(RecordOp::Reject);
    h.relay(incoming("c1", "u1", "u2", CallType::Voice)).await;

    let err = h.controller.reject_call().await.unwrap_err();

    assert!(matches!(err, CallError::Record(_)));
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
}

#[tokio::test]
async fn test_caller_cancels_while_ringing() {
    let h = Harness::new("u2");
    let mut events = h.controller.subscribe_events();
    h.relay(incoming("c1", "u1", "u2", CallType::Voice)).await;

    h.relay(RelayEvent::CallEnded {
        call_id: CallId::from("c1"),
    })
    .await;

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.records.log(), vec!["reject:c1"]);
    assert!(h.channel.sent().is_empty());
    assert_eq!(
        ended_reason(&drain(&mut events)),
        Some((Some(CallStatus::Missed), EndReason::RemoteHangup))
    );
}

#[tokio::test]
async fn test_far_end_rejects_outbound_call() {
    let h = Harness::new("u1");
    let mut events = h.controller.subscribe_events();
    let call = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Voice)
        .await
        .unwrap();

    h.relay(RelayEvent::CallRejected { call_id: call.id }).await;

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    h.assert_released();
    assert_eq!(h.records.log(), vec!["create:u2"]);
    assert_eq!(
        ended_reason(&drain(&mut events)),
        Some((Some(CallStatus::Rejected), EndReason::Rejected))
    );
}

#[tokio::test]
async fn test_cancel_outbound_call_before_answer() {
    let h = Harness::new("u1");
    let call = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Video)
        .await
        .unwrap();

    h.controller.end_call().await.unwrap();

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.channel.sent().last().unwrap(), &CallSignal::hangup(call.id));
    assert_eq!(h.records.log(), vec!["create:u2", "end:call-1"]);
    h.assert_released();
}

#[tokio::test]
async fn test_accepted_without_answer_waits_for_answer_signal() {
    let h = Harness::new("u1");
    let call = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Voice)
        .await
        .unwrap();

    h.relay(RelayEvent::CallAccepted {
        call_id: call.id.clone(),
        answer: None,
    })
    .await;
    assert_eq!(h.controller.phase().await, CallPhase::Connecting);

    h.relay(signal(CallSignal::answer(call.id, remote_answer())))
        .await;
    assert_eq!(h.controller.phase().await, CallPhase::InCall);
}

// Failure at each stage returns to Idle

#[tokio::test]
async fn test_media_denied_on_initiate() {
    let h = Harness::new("u1");
    h.devices.set_allowed(false);

    let err = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Video)
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::Media(MediaError::PermissionDenied(_))));
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert!(h.records.log().is_empty());
    assert!(h.channel.sent().is_empty());
    h.assert_released();
}

#[tokio::test]
async fn test_transport_creation_failure_releases_capture() {
    let h = Harness::new("u1");
    h.transports.fail(TransportOp::Create);

    let err = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Voice)
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::Negotiation(_)));
    assert_eq!(h.devices.issued_streams(), 1);
    h.assert_released();
    assert!(h.records.log().is_empty());
}

#[tokio::test]
async fn test_record_create_failure_releases_media() {
    let h = Harness::new("u1");
    h.records.fail(RecordOp::Create);

    let err = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Video)
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::Record(_)));
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.transports.log.closed.load(Ordering::SeqCst), 1);
    assert!(h.channel.sent().is_empty());
    h.assert_released();
}

#[tokio::test]
async fn test_offer_failure_ends_record() {
    let h = Harness::new("u1");
    h.transports.fail(TransportOp::Offer);

    let err = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Video)
        .await
        .unwrap_err();

    assert!(matches!(err, CallError::Negotiation(_)));
    assert_eq!(h.records.log(), vec!["create:u2", "end:call-1"]);
    assert!(h.channel.sent().is_empty());
    h.assert_released();
}

#[tokio::test]
async fn test_offer_delivery_failure_ends_record() {
    let h = Harness::new("u1");
    h.channel.set_connected(false);

    let err = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Video)
        .await
        .unwrap_err();

    assert_eq!(err, CallError::Signaling(SignalingError::NotConnected));
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.records.log(), vec!["create:u2", "end:call-1"]);
    h.assert_released();
}

#[tokio::test]
async fn test_bad_remote_answer_fails_call() {
    let h = Harness::new("u1");
    let call = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Video)
        .await
        .unwrap();
    h.transports.fail(TransportOp::Remote);

    h.relay(RelayEvent::CallAccepted {
        call_id: call.id,
        answer: Some(remote_answer()),
    })
    .await;

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.records.log(), vec!["create:u2", "end:call-1"]);
    h.assert_released();
}

#[tokio::test]
async fn test_accept_media_failure_rejects_record() {
    let h = Harness::new("u2");
    h.devices.set_allowed(false);
    h.relay(incoming("c1", "u1", "u2", CallType::Video)).await;

    let err = h.controller.accept_call().await.unwrap_err();

    assert!(matches!(err, CallError::Media(_)));
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.records.log(), vec!["reject:c1"]);
    assert!(h.channel.sent().is_empty());
    h.assert_released();
}

#[tokio::test]
async fn test_accept_answer_failure_rejects_record() {
    let h = Harness::new("u2");
    h.transports.fail(TransportOp::Answer);
    h.relay(incoming("c1", "u1", "u2", CallType::Video)).await;

    let err = h.controller.accept_call().await.unwrap_err();

    assert!(matches!(err, CallError::Negotiation(_)));
    assert_eq!(h.records.log(), vec!["reject:c1"]);
    assert!(h.channel.sent().is_empty());
    h.assert_released();
}

#[tokio::test]
async fn test_accept_record_failure_sends_nothing() {
    let h = Harness::new("u2");
    h.records.fail(RecordOp::Accept);
    h.relay(incoming("c1", "u1", "u2", CallType::Video)).await;

    let err = h.controller.accept_call().await.unwrap_err();

    assert!(matches!(err, CallError::Record(_)));
    assert_eq!(h.records.log(), vec!["accept:c1", "reject:c1"]);
    assert!(h.channel.sent().is_empty());
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    h.assert_released();
}

#[tokio::test]
async fn test_accept_with_unexpected_status() {
    let h = Harness::new("u2");
    h.records.set_accept_status(CallStatus::Missed);
    h.relay(incoming("c1", "u1", "u2", CallType::Voice)).await;

    let err = h.controller.accept_call().await.unwrap_err();

    assert_eq!(err, CallError::UnexpectedStatus(CallStatus::Missed));
    assert!(h.channel.sent().is_empty());
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    h.assert_released();
}

#[tokio::test]
async fn test_connectivity_failure_mid_call() {
    let mut h = Harness::new("u1");
    connected_outbound(&mut h).await;
    let mut events = h.controller.subscribe_events();

    h.transport_state(TransportState::Failed).await;

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.records.log(), vec!["create:u2", "end:call-1"]);
    h.assert_released();
    assert!(matches!(
        ended_reason(&drain(&mut events)),
        Some((Some(CallStatus::Ended), EndReason::Failed(_)))
    ));
}

#[tokio::test]
async fn test_remote_candidate_failure_fails_call() {
    let mut h = Harness::new("u1");
    connected_outbound(&mut h).await;
    h.transports.fail(TransportOp::Candidate);

    h.relay(signal(CallSignal::ice_candidate(
        CallId::from("call-1"),
        IceCandidate::new("candidate:bad"),
    )))
    .await;

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    h.assert_released();
}

// Operations that must not change anything

#[tokio::test]
async fn test_operations_without_call_are_noops() {
    let h = Harness::new("u1");

    h.controller.accept_call().await.unwrap();
    h.controller.reject_call().await.unwrap();
    h.controller.end_call().await.unwrap();

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert!(h.records.log().is_empty());
    assert!(h.channel.sent().is_empty());
    assert_eq!(
        h.controller.toggle_mute().await.unwrap_err(),
        CallError::NoLocalMedia
    );
    assert_eq!(
        h.controller.toggle_video().await.unwrap_err(),
        CallError::NoLocalMedia
    );
}

#[tokio::test]
async fn test_accept_ignored_while_calling() {
    let h = Harness::new("u1");
    h.controller
        .initiate_call(ParticipantId::new("u2"), CallType::Voice)
        .await
        .unwrap();

    h.controller.accept_call().await.unwrap();
    h.controller.reject_call().await.unwrap();

    assert_eq!(h.controller.phase().await, CallPhase::Calling);
    assert_eq!(h.records.log(), vec!["create:u2"]);
}

#[tokio::test]
async fn test_second_initiate_is_busy() {
    let h = Harness::new("u1");
    h.controller
        .initiate_call(ParticipantId::new("u2"), CallType::Voice)
        .await
        .unwrap();

    let err = h
        .controller
        .initiate_call(ParticipantId::new("u3"), CallType::Voice)
        .await
        .unwrap_err();

    assert_eq!(err, CallError::Busy(CallPhase::Calling));
    assert_eq!(h.records.log(), vec!["create:u2"]);
    assert_eq!(h.controller.live_transports(), 1);
    assert_eq!(h.devices.live_streams(), 1);
}

#[tokio::test]
async fn test_incoming_call_ignored_while_busy() {
    let h = Harness::new("u1");
    h.controller
        .initiate_call(ParticipantId::new("u2"), CallType::Voice)
        .await
        .unwrap();

    h.relay(incoming("c9", "u3", "u1", CallType::Voice)).await;

    assert_eq!(h.controller.phase().await, CallPhase::Calling);
    assert_eq!(
        h.controller.current_call().await.unwrap().id.as_str(),
        "call-1"
    );
}

#[tokio::test]
async fn test_incoming_call_for_someone_else_ignored() {
    let h = Harness::new("u2");
    h.relay(incoming("c1", "u1", "u7", CallType::Voice)).await;
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
}

#[tokio::test]
async fn test_relay_events_for_other_calls_ignored() {
    let mut h = Harness::new("u1");
    let call = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Video)
        .await
        .unwrap();
    let other = CallId::from("other");

    h.relay(RelayEvent::CallRejected {
        call_id: other.clone(),
    })
    .await;
    h.relay(RelayEvent::CallAccepted {
        call_id: other.clone(),
        answer: Some(remote_answer()),
    })
    .await;
    h.relay(signal(CallSignal::answer(other.clone(), remote_answer())))
        .await;
    h.relay(signal(CallSignal::hangup(other.clone()))).await;
    assert_eq!(h.controller.phase().await, CallPhase::Calling);
    assert!(h.transports.log.remote_descriptions.lock().is_empty());

    h.relay(RelayEvent::CallAccepted {
        call_id: call.id.clone(),
        answer: Some(remote_answer()),
    })
    .await;
    h.relay(signal(CallSignal::ice_candidate(
        other,
        IceCandidate::new("candidate:x"),
    )))
    .await;
    assert_eq!(h.controller.phase().await, CallPhase::InCall);
    assert!(h.transports.log.remote_candidates.lock().is_empty());

    h.local_candidate("candidate:a").await;
    assert!(h
        .channel
        .sent()
        .iter()
        .all(|signal| signal.call_id == call.id));
}

#[tokio::test]
async fn test_answer_ignored_on_inbound_call() {
    let h = Harness::new("u2");
    h.relay(incoming("c1", "u1", "u2", CallType::Voice)).await;

    h.relay(signal(CallSignal::answer(CallId::from("c1"), remote_answer())))
        .await;

    assert_eq!(h.controller.phase().await, CallPhase::Ringing);
    assert_eq!(h.controller.live_transports(), 0);
}

#[tokio::test]
async fn test_remote_candidate_before_answer_discarded() {
    let h = Harness::new("u1");
    h.controller
        .initiate_call(ParticipantId::new("u2"), CallType::Video)
        .await
        .unwrap();

    h.relay(signal(CallSignal::ice_candidate(
        CallId::from("call-1"),
        IceCandidate::new("candidate:early"),
    )))
    .await;

    assert_eq!(h.controller.phase().await, CallPhase::Calling);
    assert!(h.transports.log.remote_candidates.lock().is_empty());
}

#[tokio::test]
async fn test_toggle_mute_and_video() {
    let mut h = Harness::new("u1");
    connected_outbound(&mut h).await;

    assert!(h.controller.toggle_mute().await.unwrap());
    assert!(h.controller.call_state().await.is_muted);
    assert!(!h.controller.toggle_mute().await.unwrap());
    assert!(!h.controller.call_state().await.is_muted);

    assert!(!h.controller.toggle_video().await.unwrap());
    assert!(!h.controller.call_state().await.is_video_enabled);
    assert!(h.controller.toggle_video().await.unwrap());
}

#[tokio::test]
async fn test_toggle_video_on_voice_call_keeps_it_off() {
    let h = Harness::new("u2");
    h.relay(incoming("c1", "u1", "u2", CallType::Voice)).await;
    h.controller.accept_call().await.unwrap();

    assert!(!h.controller.toggle_video().await.unwrap());
    assert!(!h.controller.call_state().await.is_video_enabled);
}

#[tokio::test]
async fn test_remote_track_sets_remote_stream() {
    let mut h = Harness::new("u1");
    connected_outbound(&mut h).await;

    h.transports
        .emit(TransportEvent::RemoteTrack(ringline_core::MediaKind::Audio));
    h.pump_transport().await;

    assert!(h.controller.call_state().await.has_remote_stream);
}

#[tokio::test]
async fn test_channel_loss_keeps_pending_call() {
    let h = Harness::new("u1");
    h.controller
        .initiate_call(ParticipantId::new("u2"), CallType::Voice)
        .await
        .unwrap();

    h.signaling(SignalingEvent::Disconnected {
        reason: "reset".to_string(),
    })
    .await;

    assert_eq!(h.controller.phase().await, CallPhase::Calling);
}

#[tokio::test]
async fn test_channel_loss_ends_connected_call() {
    let mut h = Harness::new("u1");
    connected_outbound(&mut h).await;
    let mut events = h.controller.subscribe_events();

    h.signaling(SignalingEvent::Disconnected {
        reason: "reset".to_string(),
    })
    .await;

    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.records.log(), vec!["create:u2", "end:call-1"]);
    h.assert_released();
    assert_eq!(
        ended_reason(&drain(&mut events)),
        Some((Some(CallStatus::Ended), EndReason::ChannelLost))
    );
}

#[tokio::test]
async fn test_events_from_previous_transport_ignored() {
    let mut h = Harness::new("u1");
    connected_outbound(&mut h).await;
    h.controller.end_call().await.unwrap();

    h.controller
        .initiate_call(ParticipantId::new("u3"), CallType::Voice)
        .await
        .unwrap();

    h.transports
        .emit_from(0, TransportEvent::StateChanged(TransportState::Failed));
    h.transports
        .emit_from(0, TransportEvent::RemoteTrack(ringline_core::MediaKind::Video));
    h.pump_transport().await;

    assert_eq!(h.controller.phase().await, CallPhase::Calling);
    assert!(!h.controller.call_state().await.has_remote_stream);
    assert_eq!(h.controller.live_transports(), 1);
}

#[tokio::test]
async fn test_end_during_record_creation_cancels_attempt() {
    let h = Harness::new("u1");
    let gate = h.records.hold_create();

    let controller = Arc::clone(&h.controller);
    let attempt = tokio::spawn(async move {
        controller
            .initiate_call(ParticipantId::new("u2"), CallType::Video)
            .await
    });
    while h.records.log().is_empty() {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.controller.phase().await, CallPhase::Calling);
    assert_eq!(h.controller.live_transports(), 1);

    h.controller.end_call().await.unwrap();
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    // No record yet, so nothing to hang up
    assert!(h.channel.sent().is_empty());

    gate.notify_one();
    let result = attempt.await.unwrap();

    assert_eq!(result.unwrap_err(), CallError::Cancelled);
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.records.log(), vec!["create:u2", "end:call-1"]);
    assert!(h.channel.sent().is_empty());
    h.assert_released();
}

#[tokio::test]
async fn test_call_ended_while_accept_acquires_media() {
    let h = Harness::new("u2");
    h.relay(incoming("c1", "u1", "u2", CallType::Video)).await;
    let gate = h.devices.hold_acquire();

    let controller = Arc::clone(&h.controller);
    let accept = tokio::spawn(async move { controller.accept_call().await });
    h.devices.wait_parked().await;
    assert_eq!(h.controller.phase().await, CallPhase::Connecting);

    h.relay(RelayEvent::CallEnded {
        call_id: CallId::from("c1"),
    })
    .await;
    assert_eq!(h.controller.phase().await, CallPhase::Idle);

    gate.notify_one();
    let result = accept.await.unwrap();

    assert_eq!(result.unwrap_err(), CallError::Cancelled);
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.devices.issued_streams(), 1);
    h.assert_released();
    assert_eq!(h.transports.log.created.load(Ordering::SeqCst), 0);
    assert!(h.channel.sent().is_empty());
    assert_eq!(h.records.log(), vec!["reject:c1"]);
}

#[tokio::test]
async fn test_end_while_initiate_acquires_media() {
    let h = Harness::new("u1");
    let gate = h.devices.hold_acquire();

    let controller = Arc::clone(&h.controller);
    let attempt = tokio::spawn(async move {
        controller
            .initiate_call(ParticipantId::new("u2"), CallType::Video)
            .await
    });
    h.devices.wait_parked().await;
    assert_eq!(h.controller.phase().await, CallPhase::Calling);

    h.controller.end_call().await.unwrap();
    assert_eq!(h.controller.phase().await, CallPhase::Idle);

    gate.notify_one();
    let result = attempt.await.unwrap();

    assert_eq!(result.unwrap_err(), CallError::Cancelled);
    assert_eq!(h.devices.issued_streams(), 1);
    h.assert_released();
    assert_eq!(h.transports.log.created.load(Ordering::SeqCst), 0);
    assert!(h.channel.sent().is_empty());
    assert!(h.records.log().is_empty());
}

#[tokio::test]
async fn test_hangup_waits_for_offer_delivery() {
    let h = Harness::new("u1");
    let gate = h.channel.hold_send();

    let controller = Arc::clone(&h.controller);
    let attempt = tokio::spawn(async move {
        controller
            .initiate_call(ParticipantId::new("u2"), CallType::Video)
            .await
    });
    h.channel.wait_send_parked().await;

    let controller = Arc::clone(&h.controller);
    let ending = tokio::spawn(async move { controller.end_call().await });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(h.channel.sent().is_empty());
    assert!(!ending.is_finished());

    gate.notify_one();
    // The attempt itself may end Ok or Cancelled
    let _ = attempt.await.unwrap();
    ending.await.unwrap().unwrap();

    assert_eq!(h.channel.sent_kinds(), vec!["offer", "hangup"]);
    assert_eq!(
        h.channel.sent().last().unwrap(),
        &CallSignal::hangup(CallId::from("call-1"))
    );
    assert_eq!(h.controller.phase().await, CallPhase::Idle);
    assert_eq!(h.records.log(), vec!["create:u2", "end:call-1"]);
    h.assert_released();
}

#[tokio::test]
async fn test_new_call_after_previous_ends() {
    let mut h = Harness::new("u1");
    connected_outbound(&mut h).await;
    h.controller.end_call().await.unwrap();

    let call = h
        .controller
        .initiate_call(ParticipantId::new("u2"), CallType::Voice)
        .await
        .unwrap();

    assert_eq!(call.id.as_str(), "call-2");
    assert_eq!(h.transports.log.created.load(Ordering::SeqCst), 2);
    assert_eq!(h.controller.live_transports(), 1);
    assert_eq!(h.devices.live_streams(), 1);
}

#[tokio::test]
async fn test_history_passthrough() {
    let h = Harness::new("u1");
    h.records.push_history(ringline_core::Call::pending(
        "old",
        ParticipantId::new("u1"),
        ParticipantId::new("u2"),
        CallType::Video,
    ));

    let history = h.controller.history().await.unwrap();
    assert_eq!(history.len(), 1);
    let call = h.controller.call_record(&CallId::from("old")).await.unwrap();
    assert_eq!(call.receiver_id.as_str(), "u2");
}
