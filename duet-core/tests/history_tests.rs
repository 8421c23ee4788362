//! Call history persistence tests

use chrono::{Duration as ChronoDuration, Utc};
use duet_core::history::record_id;
use duet_core::media::{SimulatedMediaConfig, SimulatedMediaManager};
use duet_core::{
    compute_stats, CallHistoryRecord, CallId, CallOutcome, CallService, CallState,
    HistoryDirection, HistoryStore, JsonlHistoryStore, MediaType, MemoryRelay, StaticDirectory,
    UserId, UserProfile,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;

fn record(owner: &str, outcome: CallOutcome, minutes_ago: i64) -> CallHistoryRecord {
    let call_id = CallId::new();
    let started_at = Utc::now() - ChronoDuration::minutes(minutes_ago);
    CallHistoryRecord {
        id: record_id(call_id, owner),
        owner_user_id: owner.to_string(),
        call_id,
        participant_id: "bob".to_string(),
        participant_display_name: "bob".to_string(),
        participant_avatar_ref: None,
        media_type: MediaType::Audio,
        direction: HistoryDirection::Outgoing,
        outcome,
        started_at,
        ended_at: Some(started_at + ChronoDuration::seconds(30)),
        duration_seconds: 30,
    }
}

#[tokio::test]
async fn jsonl_store_appends_and_lists_newest_first() {
    let dir = TempDir::new().unwrap();
    let store = JsonlHistoryStore::new(dir.path().join("history.jsonl"));

    let old = record("alice", CallOutcome::Completed, 60);
    let new = record("alice", CallOutcome::NoAnswer, 5);
    let other = record("bob", CallOutcome::Missed, 1);
    for r in [&old, &new, &other] {
        assert!(store.append(r.clone()).await.unwrap());
    }

    let listed = store.list_by_owner("alice").await.unwrap();
    assert_eq!(listed, vec![new, old]);
}

#[tokio::test]
async fn jsonl_store_rejects_duplicate_ids() {
    let dir = TempDir::new().unwrap();
    let store = JsonlHistoryStore::new(dir.path().join("history.jsonl"));
    let r = record("alice", CallOutcome::Completed, 1);

    assert!(assert_ok!(store.append(r.clone()).await));
    assert!(!assert_ok!(store.append(r).await));
    assert_eq!(store.list_by_owner("alice").await.unwrap().len(), 1);
}

#[tokio::test]
async fn jsonl_store_survives_reopen_and_skips_corrupt_lines() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("history.jsonl");
    let first = JsonlHistoryStore::new(&path);
    let r = record("alice", CallOutcome::Completed, 1);
    first.append(r.clone()).await.unwrap();

    let mut text = std::fs::read_to_string(&path).unwrap();
    text.push_str("{not json\n");
    std::fs::write(&path, text).unwrap();

    let reopened = JsonlHistoryStore::new(&path);
    assert_eq!(reopened.list_by_owner("alice").await.unwrap(), vec![r]);
}

#[tokio::test]
async fn jsonl_store_delete_is_owner_scoped() {
    let dir = TempDir::new().unwrap();
    let store = JsonlHistoryStore::new(dir.path().join("history.jsonl"));
    let mine = record("alice", CallOutcome::Completed, 2);
    let theirs = record("bob", CallOutcome::Completed, 2);
    store.append(mine.clone()).await.unwrap();
    store.append(theirs.clone()).await.unwrap();

    assert!(!store.delete("alice", &theirs.id).await.unwrap());
    assert!(store.delete("alice", &mine.id).await.unwrap());
    assert!(store.list_by_owner("alice").await.unwrap().is_empty());
    assert_eq!(store.list_by_owner("bob").await.unwrap(), vec![theirs]);
}

#[tokio::test]
async fn missing_file_lists_nothing() {
    let dir = TempDir::new().unwrap();
    let store = JsonlHistoryStore::new(dir.path().join("absent.jsonl"));
    assert!(store.list_by_owner("alice").await.unwrap().is_empty());
    assert!(!store.delete("alice", "x").await.unwrap());
}

#[tokio::test]
async fn completed_call_writes_enriched_records_to_file() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn HistoryStore> = Arc::new(JsonlHistoryStore::new(dir.path().join("calls.jsonl")));
    let directory: Arc<StaticDirectory> = Arc::new(
        [
            UserProfile::new("alice", "Alice Liddell").with_avatar("avatars/alice.png"),
            UserProfile::new("bob", "Bob Marley"),
        ]
        .into_iter()
        .collect(),
    );
    let relay = MemoryRelay::new();

    let endpoint = |name: &str| {
        let user = UserId::new(name);
        let service = CallService::builder(
            user.clone(),
            Arc::new(relay.connect(user)),
            Arc::new(SimulatedMediaManager::new(SimulatedMediaConfig::default())),
        )
        .with_history_store(store.clone())
        .with_directory(directory.clone())
        .with_presence(Arc::new(relay.clone()))
        .build()
        .unwrap();
        service.start().unwrap();
        service
    };
    let alice = endpoint("alice");
    let bob = endpoint("bob");

    alice
        .calls()
        .initiate(UserId::new("bob"), MediaType::Video)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    bob.calls().accept().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    bob.calls().end().await.unwrap();

    let mut alice_records = Vec::new();
    for _ in 0..50 {
        alice_records = store.list_by_owner("alice").await.unwrap();
        if !alice_records.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(alice.calls().state().await, CallState::Idle);
    let bob_records = store.list_by_owner("bob").await.unwrap();
    assert_eq!(alice_records.len(), 1);
    assert_eq!(bob_records.len(), 1);
    assert_eq!(alice_records[0].participant_display_name, "Bob Marley");
    assert_eq!(bob_records[0].participant_display_name, "Alice Liddell");
    assert_eq!(
        bob_records[0].participant_avatar_ref.as_deref(),
        Some("avatars/alice.png")
    );
    assert_eq!(alice_records[0].call_id, bob_records[0].call_id);

    let stats = compute_stats(&[alice_records[0].clone(), bob_records[0].clone()]);
    assert_eq!(stats.completed_calls, 2);
    assert!(stats.average_duration_seconds >= 1.0);
}
