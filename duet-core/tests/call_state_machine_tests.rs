//! Call state machine tests
//!
//! One real endpoint ("alice") driven against raw relay connections standing
//! in for remote peers, so every inbound signal is under test control.

mod common;

use common::{settle, Endpoint, Harness};
use duet_core::signaling::SignalPayload;
use duet_core::{
    CallError, CallId, CallOutcome, CallState, EndReason, MediaType, MemoryTransport,
    SignalingMessage, SignalingTransport, UserId,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
const ANSWER_SDP: &str = "v=0\r\no=- 2 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

fn offer(call_id: CallId) -> SignalPayload {
    SignalPayload::Offer {
        call_id,
        media_type: MediaType::Audio,
        sdp: OFFER_SDP.to_string(),
    }
}

async fn deliver(endpoint: &Endpoint, from: &str, payload: SignalPayload) {
    endpoint
        .calls()
        .handle_signal(SignalingMessage::new(
            UserId::new(from),
            endpoint.user.clone(),
            payload,
        ))
        .await;
}

async fn next_payload(peer: &MemoryTransport<UserId>) -> SignalPayload {
    tokio::time::timeout(Duration::from_secs(1), peer.receive_message())
        .await
        .unwrap()
        .unwrap()
        .payload
}

#[tokio::test(start_paused = true)]
async fn offer_while_idle_starts_ringing() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let call_id = CallId::new();

    deliver(&alice, "bob", offer(call_id)).await;

    let session = alice.calls().current_call().await.unwrap();
    assert_eq!(session.state, CallState::Incoming);
    assert_eq!(session.call_id, call_id);
    assert_eq!(session.remote_user, UserId::new("bob"));
    assert!(session.pending_offer.is_some());
}

#[tokio::test(start_paused = true)]
async fn second_offer_gets_busy_and_first_survives() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let carol = harness.relay.connect(UserId::new("carol"));
    let first = CallId::new();
    let second = CallId::new();

    deliver(&alice, "bob", offer(first)).await;
    deliver(&alice, "carol", offer(second)).await;

    assert_eq!(
        next_payload(&carol).await,
        SignalPayload::End {
            call_id: second,
            reason: Some(EndReason::Busy)
        }
    );
    let session = alice.calls().current_call().await.unwrap();
    assert_eq!(session.call_id, first);
    assert_eq!(session.state, CallState::Incoming);
}

#[tokio::test(start_paused = true)]
async fn initiate_while_ringing_is_rejected() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let first = CallId::new();
    deliver(&alice, "bob", offer(first)).await;

    let result = alice.calls().initiate("carol".into(), MediaType::Audio).await;
    assert!(matches!(result, Err(CallError::AlreadyInCall)));
    assert_eq!(alice.calls().current_call().await.unwrap().call_id, first);
    assert_eq!(alice.media.tracks_acquired(), 0);
}

#[tokio::test(start_paused = true)]
async fn calling_yourself_is_refused() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let result = alice.calls().initiate("alice".into(), MediaType::Audio).await;
    assert!(matches!(result, Err(CallError::InvalidPeer(_))));
    assert_eq!(alice.state().await, CallState::Idle);
}

#[tokio::test(start_paused = true)]
async fn triggers_invalid_for_state_change_nothing() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");

    assert!(matches!(alice.calls().accept().await, Err(CallError::InvalidState)));
    assert!(matches!(alice.calls().reject().await, Err(CallError::InvalidState)));
    assert!(alice.calls().end().await.is_ok());
    assert!(matches!(
        alice.calls().switch_media(MediaType::Video).await,
        Err(CallError::InvalidState)
    ));
    assert!(matches!(
        alice.calls().set_video_enabled(false).await,
        Err(CallError::InvalidState)
    ));
    deliver(
        &alice,
        "bob",
        SignalPayload::Answer {
            call_id: CallId::new(),
            sdp: ANSWER_SDP.to_string(),
        },
    )
    .await;
    assert_eq!(alice.state().await, CallState::Idle);

    deliver(&alice, "bob", offer(CallId::new())).await;
    assert!(matches!(alice.calls().end().await, Err(CallError::InvalidState)));
    assert_eq!(alice.state().await, CallState::Incoming);
    assert!(harness.store.all().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_or_foreign_end_is_ignored() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let call_id = CallId::new();
    deliver(&alice, "bob", offer(call_id)).await;

    deliver(&alice, "bob", SignalPayload::end(CallId::new(), EndReason::Hangup)).await;
    assert_eq!(alice.state().await, CallState::Incoming);

    deliver(&alice, "carol", SignalPayload::end(call_id, EndReason::Hangup)).await;
    assert_eq!(alice.state().await, CallState::Incoming);

    deliver(&alice, "bob", SignalPayload::end(call_id, EndReason::Cancelled)).await;
    assert_eq!(alice.state().await, CallState::Idle);
    assert_eq!(harness.records_for("alice").await[0].outcome, CallOutcome::Missed);
}

#[tokio::test(start_paused = true)]
async fn duplicate_offer_is_ignored() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let bob = harness.relay.connect(UserId::new("bob"));
    let call_id = CallId::new();

    deliver(&alice, "bob", offer(call_id)).await;
    deliver(&alice, "bob", offer(call_id)).await;

    assert_eq!(alice.state().await, CallState::Incoming);
    let nothing = tokio::time::timeout(Duration::from_millis(100), bob.receive_message()).await;
    assert!(nothing.is_err());
}

#[tokio::test(start_paused = true)]
async fn offer_precedes_candidates_on_the_wire() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let bob = harness.relay.connect(UserId::new("bob"));

    let call_id = alice.calls().initiate("bob".into(), MediaType::Audio).await.unwrap();

    assert!(matches!(next_payload(&bob).await, SignalPayload::Offer { call_id: id, .. } if id == call_id));
    for _ in 0..2 {
        assert!(matches!(
            next_payload(&bob).await,
            SignalPayload::IceCandidate { call_id: id, .. } if id == call_id
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn early_candidates_buffer_until_answer() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let call_id = alice.calls().initiate("bob".into(), MediaType::Audio).await.unwrap();

    deliver(
        &alice,
        "bob",
        SignalPayload::ice_candidate(
            call_id,
            duet_core::IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.9 50000 typ host"),
        ),
    )
    .await;
    assert_eq!(alice.media.applied_candidate_count(), 0);

    deliver(
        &alice,
        "bob",
        SignalPayload::Answer {
            call_id,
            sdp: ANSWER_SDP.to_string(),
        },
    )
    .await;
    assert_eq!(alice.state().await, CallState::InCall);
    assert_eq!(alice.media.applied_candidate_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn accept_cancels_ring_timer() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let call_id = CallId::new();
    deliver(&alice, "bob", offer(call_id)).await;

    alice.calls().accept().await.unwrap();
    assert_eq!(alice.state().await, CallState::InCall);

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(alice.state().await, CallState::InCall);
    assert!(harness.store.all().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unanswered_offer_expires_as_missed() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let bob = harness.relay.connect(UserId::new("bob"));
    let call_id = CallId::new();
    deliver(&alice, "bob", offer(call_id)).await;

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(alice.state().await, CallState::Idle);
    assert_eq!(
        next_payload(&bob).await,
        SignalPayload::end(call_id, EndReason::Timeout)
    );
    let records = harness.records_for("alice").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, CallOutcome::Missed);
}

#[tokio::test(start_paused = true)]
async fn end_twice_tears_down_once() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let call_id = CallId::new();
    deliver(&alice, "bob", offer(call_id)).await;
    alice.calls().accept().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    alice.calls().end().await.unwrap();
    alice.calls().end().await.unwrap();
    settle().await;

    assert_eq!(alice.state().await, CallState::Idle);
    assert_eq!(alice.media.teardown_count(), 1);
    assert_eq!(alice.media.double_teardown_count(), 0);
    assert_eq!(alice.media.double_release_count(), 0);
    assert_eq!(alice.media.live_track_count(), 0);

    let records = harness.records_for("alice").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, CallOutcome::Completed);
    assert_eq!(records[0].duration_seconds, 5);
}

#[tokio::test(start_paused = true)]
async fn unusable_offer_fails_negotiation() {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let bob = harness.relay.connect(UserId::new("bob"));
    let call_id = CallId::new();
    deliver(
        &alice,
        "bob",
        SignalPayload::Offer {
            call_id,
            media_type: MediaType::Audio,
            sdp: "garbage".to_string(),
        },
    )
    .await;

    let result = alice.calls().accept().await;
    assert!(matches!(result, Err(CallError::NegotiationFailed(_))));
    assert_eq!(alice.state().await, CallState::Idle);
    assert_eq!(alice.media.live_track_count(), 0);
    assert_eq!(
        next_payload(&bob).await,
        SignalPayload::end(call_id, EndReason::Failed)
    );
    assert_eq!(
        harness.records_for("alice").await[0].outcome,
        CallOutcome::NoAnswer
    );
}

#[derive(Debug, Clone)]
enum Op {
    Initiate(usize),
    Accept,
    Reject,
    End,
    Offer(usize),
    Answer,
    RemoteEnd(Option<EndReason>),
    Wait(u64),
}

const PEERS: [&str; 2] = ["bob", "carol"];

fn op_strategy() -> impl Strategy<Value = Op> {
    let reason = prop_oneof![
        Just(EndReason::Hangup),
        Just(EndReason::Cancelled),
        Just(EndReason::Rejected),
        Just(EndReason::Busy),
        Just(EndReason::Timeout),
        Just(EndReason::Failed),
    ];
    prop_oneof![
        (0..PEERS.len()).prop_map(Op::Initiate),
        Just(Op::Accept),
        Just(Op::Reject),
        Just(Op::End),
        (0..PEERS.len()).prop_map(Op::Offer),
        Just(Op::Answer),
        prop::option::of(reason).prop_map(Op::RemoteEnd),
        (1..40u64).prop_map(Op::Wait),
    ]
}

async fn apply(alice: &Endpoint, op: Op) {
    let current = alice.calls().current_call().await;
    match op {
        Op::Initiate(peer) => {
            let _ = alice
                .calls()
                .initiate(PEERS[peer].into(), MediaType::Audio)
                .await;
        }
        Op::Accept => {
            let _ = alice.calls().accept().await;
        }
        Op::Reject => {
            let _ = alice.calls().reject().await;
        }
        Op::End => {
            let _ = alice.calls().end().await;
        }
        Op::Offer(peer) => deliver(alice, PEERS[peer], offer(CallId::new())).await,
        Op::Answer => {
            if let Some(session) = current {
                let payload = SignalPayload::Answer {
                    call_id: session.call_id,
                    sdp: ANSWER_SDP.to_string(),
                };
                deliver(alice, session.remote_user.as_str(), payload).await;
            }
        }
        Op::RemoteEnd(reason) => {
            if let Some(session) = current {
                let payload = SignalPayload::End {
                    call_id: session.call_id,
                    reason,
                };
                deliver(alice, session.remote_user.as_str(), payload).await;
            }
        }
        Op::Wait(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
    }
}

async fn run_sequence(ops: Vec<Op>) {
    let harness = Harness::new();
    let alice = harness.endpoint("alice");
    let mut sessions_seen = HashSet::new();

    for op in ops {
        apply(&alice, op.clone()).await;
        settle().await;

        let state = alice.state().await;
        let session = alice.calls().current_call().await;
        match &session {
            Some(session) => {
                assert_eq!(session.state, state, "after {op:?}");
                assert_ne!(state, CallState::Idle, "after {op:?}");
                sessions_seen.insert(session.call_id);
            }
            None => {
                assert_eq!(state, CallState::Idle, "after {op:?}");
                assert_eq!(alice.media.live_track_count(), 0, "leaked tracks after {op:?}");
                assert_eq!(alice.media.open_session_count(), 0, "leaked session after {op:?}");
            }
        }
        assert_eq!(alice.media.double_release_count(), 0);
        assert_eq!(alice.media.double_teardown_count(), 0);
        assert!(harness.records_for("alice").await.len() <= sessions_seen.len());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_call_sequences_keep_invariants(ops in prop::collection::vec(op_strategy(), 1..20)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(run_sequence(ops));
    }
}
