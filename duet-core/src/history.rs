//! Call history
//!
//! Each endpoint writes one [`CallHistoryRecord`] per terminated call attempt
//! from its own perspective, so a connected call ends up with two records.
//! Writes go through [`HistoryRecorder`], which deduplicates per attempt and
//! never lets a persistence failure reach call teardown.

use crate::directory::{ProfileDirectory, UserProfile};
use crate::types::{CallId, CallOutcome, MediaType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// History errors
#[derive(Error, Debug)]
pub enum HistoryError {
    /// File I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store rejected the write
    #[error("History store error: {0}")]
    Backend(String),
}

/// Direction of a call from the record owner's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryDirection {
    /// Owner received the call
    Incoming,
    /// Owner placed the call
    Outgoing,
    /// Owner received the call and never picked up
    Missed,
}

impl std::fmt::Display for HistoryDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Missed => "missed",
        };
        f.write_str(s)
    }
}

/// Persistent record of one call attempt, owned by one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHistoryRecord {
    /// Record id, derived from call id and owner
    pub id: String,
    /// User this record belongs to
    pub owner_user_id: String,
    /// Call attempt
    pub call_id: CallId,
    /// The other participant
    pub participant_id: String,
    /// Other participant's display name at the time of the call
    pub participant_display_name: String,
    /// Other participant's avatar
    pub participant_avatar_ref: Option<String>,
    /// Media type when the call ended
    pub media_type: MediaType,
    /// Direction
    pub direction: HistoryDirection,
    /// Outcome
    pub outcome: CallOutcome,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// When the attempt ended
    pub ended_at: Option<DateTime<Utc>>,
    /// Connected time; 0 if never connected
    pub duration_seconds: u64,
}

/// Deterministic record id for an (attempt, owner) pair
#[must_use]
pub fn record_id(call_id: CallId, owner: &str) -> String {
    format!("{}:{}", call_id, owner)
}

/// Terminal call attempt as seen by one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAttempt {
    /// Call attempt
    pub call_id: CallId,
    /// Record owner
    pub owner: String,
    /// Other participant
    pub participant: String,
    /// Media type when the call ended
    pub media_type: MediaType,
    /// Direction from the owner's side
    pub direction: HistoryDirection,
    /// Outcome
    pub outcome: CallOutcome,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// When the attempt ended
    pub ended_at: Option<DateTime<Utc>>,
    /// Connected time in seconds
    pub duration_seconds: u64,
}

impl CallAttempt {
    fn into_record(self, profile: UserProfile) -> CallHistoryRecord {
        CallHistoryRecord {
            id: record_id(self.call_id, &self.owner),
            owner_user_id: self.owner,
            call_id: self.call_id,
            participant_id: self.participant,
            participant_display_name: profile.display_name,
            participant_avatar_ref: profile.avatar_ref,
            media_type: self.media_type,
            direction: self.direction,
            outcome: self.outcome,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_seconds: self.duration_seconds,
        }
    }
}

/// Call history persistence
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record; returns `false` if a record with the same id exists
    async fn append(&self, record: CallHistoryRecord) -> Result<bool, HistoryError>;

    /// Records owned by `owner`, newest first
    async fn list_by_owner(&self, owner: &str) -> Result<Vec<CallHistoryRecord>, HistoryError>;

    /// Delete one of `owner`'s records; returns `false` if it did not exist
    async fn delete(&self, owner: &str, id: &str) -> Result<bool, HistoryError>;
}

fn newest_first(records: &mut [CallHistoryRecord]) {
    records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
}

/// In-memory history store
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<CallHistoryRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryHistoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every record, in insertion order
    #[must_use]
    pub fn all(&self) -> Vec<CallHistoryRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, record: CallHistoryRecord) -> Result<bool, HistoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HistoryError::Backend("store offline".to_string()));
        }
        let mut records = self.records.lock();
        if records.iter().any(|r| r.id == record.id) {
            return Ok(false);
        }
        records.push(record);
        Ok(true)
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<CallHistoryRecord>, HistoryError> {
        let mut owned: Vec<_> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.owner_user_id == owner)
            .cloned()
            .collect();
        newest_first(&mut owned);
        Ok(owned)
    }

    async fn delete(&self, owner: &str, id: &str) -> Result<bool, HistoryError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| !(r.owner_user_id == owner && r.id == id));
        Ok(records.len() != before)
    }
}

/// Append-only JSON-lines history file
pub struct JsonlHistoryStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlHistoryStore {
    /// Use the file at `path`, created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<CallHistoryRecord>, HistoryError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CallHistoryRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping corrupt history line"
                ),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, record: CallHistoryRecord) -> Result<bool, HistoryError> {
        let _guard = self.write_lock.lock().await;
        if self.load().await?.iter().any(|r| r.id == record.id) {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(true)
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<CallHistoryRecord>, HistoryError> {
        let mut owned: Vec<_> = self
            .load()
            .await?
            .into_iter()
            .filter(|r| r.owner_user_id == owner)
            .collect();
        newest_first(&mut owned);
        Ok(owned)
    }

    async fn delete(&self, owner: &str, id: &str) -> Result<bool, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let records = self.load().await?;
        let before = records.len();
        let kept: Vec<_> = records
            .into_iter()
            .filter(|r| !(r.owner_user_id == owner && r.id == id))
            .collect();
        if kept.len() == before {
            return Ok(false);
        }

        let mut text = String::new();
        for record in &kept {
            text.push_str(&serde_json::to_string(record)?);
            text.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(true)
    }
}

/// Writes call history on terminal transitions
pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
    directory: Option<Arc<dyn ProfileDirectory>>,
    /// Attempts whose write is under way; the store dedupes finished ones
    in_flight: Mutex<HashSet<(CallId, String)>>,
}

impl HistoryRecorder {
    /// Create a recorder without profile enrichment
    #[must_use]
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            directory: None,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve participant names and avatars through `directory`
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn ProfileDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Write the record for `attempt` once per (attempt, owner)
    ///
    /// Returns `Ok(false)` when this attempt was already recorded.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write
    pub async fn try_record(&self, attempt: CallAttempt) -> Result<bool, HistoryError> {
        let key = (attempt.call_id, attempt.owner.clone());
        if !self.in_flight.lock().insert(key.clone()) {
            return Ok(false);
        }

        let profile = match &self.directory {
            Some(directory) => match directory.get_user_profile(&attempt.participant).await {
                Ok(profile) => profile,
                Err(e) => {
                    tracing::debug!(participant = %attempt.participant, error = %e, "Profile lookup failed, using raw id");
                    UserProfile::anonymous(attempt.participant.clone())
                }
            },
            None => UserProfile::anonymous(attempt.participant.clone()),
        };

        let record = attempt.into_record(profile);
        let result = self.store.append(record).await;
        self.in_flight.lock().remove(&key);
        result
    }

    /// Write the record for `attempt`, logging and swallowing failures
    #[tracing::instrument(skip(self, attempt), fields(call_id = %attempt.call_id, owner = %attempt.owner, outcome = %attempt.outcome))]
    pub async fn record(&self, attempt: CallAttempt) -> bool {
        match self.try_record(attempt).await {
            Ok(true) => {
                tracing::info!("Call history recorded");
                true
            }
            Ok(false) => {
                tracing::debug!("Call history already recorded");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to write call history");
                false
            }
        }
    }
}

/// Aggregate call statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    /// Records counted
    pub total_calls: usize,
    /// Records with outcome `completed`
    pub completed_calls: usize,
    /// Missed records (direction or outcome)
    pub missed_calls: usize,
    /// Mean duration of completed calls
    pub average_duration_seconds: f64,
    /// Summed duration of all calls
    pub total_duration_seconds: u64,
}

/// Aggregate a set of records
#[must_use]
pub fn compute_stats(records: &[CallHistoryRecord]) -> CallStats {
    let completed: Vec<_> = records
        .iter()
        .filter(|r| r.outcome == CallOutcome::Completed)
        .collect();
    let completed_duration: u64 = completed.iter().map(|r| r.duration_seconds).sum();

    CallStats {
        total_calls: records.len(),
        completed_calls: completed.len(),
        missed_calls: records
            .iter()
            .filter(|r| r.direction == HistoryDirection::Missed || r.outcome == CallOutcome::Missed)
            .count(),
        average_duration_seconds: if completed.is_empty() {
            0.0
        } else {
            completed_duration as f64 / completed.len() as f64
        },
        total_duration_seconds: records.iter().map(|r| r.duration_seconds).sum(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    fn attempt(owner: &str, outcome: CallOutcome, duration: u64) -> CallAttempt {
        CallAttempt {
            call_id: CallId::new(),
            owner: owner.to_string(),
            participant: "bob".to_string(),
            media_type: MediaType::Audio,
            direction: HistoryDirection::Outgoing,
            outcome,
            started_at: Utc::now(),
            ended_at: None,
            duration_seconds: duration,
        }
    }

    #[tokio::test]
    async fn test_recorder_is_idempotent_per_attempt() {
        let store = Arc::new(MemoryHistoryStore::new());
        let recorder = HistoryRecorder::new(store.clone());
        let a = attempt("alice", CallOutcome::Completed, 10);

        assert!(recorder.record(a.clone()).await);
        assert!(!recorder.record(a.clone()).await);
        assert_eq!(store.all().len(), 1);

        let mut other_owner = a;
        other_owner.owner = "bob".to_string();
        other_owner.participant = "alice".to_string();
        assert!(recorder.record(other_owner).await);
        assert_eq!(store.all().len(), 2);
        assert!(recorder.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_write_once() {
        let directory = StaticDirectory::new();
        directory.insert(UserProfile::new("bob", "Bob"));
        let store = Arc::new(MemoryHistoryStore::new());
        let recorder = HistoryRecorder::new(store.clone()).with_directory(Arc::new(directory));
        let a = attempt("alice", CallOutcome::Completed, 4);

        let (first, second) = tokio::join!(recorder.record(a.clone()), recorder.record(a.clone()));
        assert!(first ^ second);
        assert_eq!(store.all().len(), 1);
        assert!(recorder.in_flight.lock().is_empty());

        assert!(!recorder.record(a).await);
        assert_eq!(store.all().len(), 1);
    }

    #[tokio::test]
    async fn test_recorder_swallows_write_failures() {
        let store = Arc::new(MemoryHistoryStore::new());
        store.set_fail_writes(true);
        let recorder = HistoryRecorder::new(store.clone());
        let a = attempt("alice", CallOutcome::NoAnswer, 0);

        assert!(!recorder.record(a.clone()).await);
        assert!(matches!(
            recorder.try_record(a.clone()).await,
            Err(HistoryError::Backend(_))
        ));

        store.set_fail_writes(false);
        assert!(recorder.record(a).await);
        assert!(recorder.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_recorder_resolves_profiles() {
        let directory = StaticDirectory::new();
        directory.insert(UserProfile::new("bob", "Bob Marley").with_avatar("bob.png"));
        let store = Arc::new(MemoryHistoryStore::new());
        let recorder = HistoryRecorder::new(store.clone()).with_directory(Arc::new(directory));

        recorder.record(attempt("alice", CallOutcome::Completed, 3)).await;
        let mut unknown = attempt("alice", CallOutcome::Missed, 0);
        unknown.participant = "ghost".to_string();
        recorder.record(unknown).await;

        let records = store.all();
        assert_eq!(records[0].participant_display_name, "Bob Marley");
        assert_eq!(records[0].participant_avatar_ref.as_deref(), Some("bob.png"));
        assert_eq!(records[1].participant_display_name, "ghost");
    }

    #[tokio::test]
    async fn test_memory_store_lists_newest_first() {
        let store = MemoryHistoryStore::new();
        let now = Utc::now();
        for offset in [30, 10, 20] {
            let mut a = attempt("alice", CallOutcome::Completed, 1);
            a.started_at = now - ChronoDuration::seconds(offset);
            store
                .append(a.into_record(UserProfile::anonymous("bob")))
                .await
                .unwrap();
        }

        let listed = store.list_by_owner("alice").await.unwrap();
        let starts: Vec<_> = listed.iter().map(|r| r.started_at).collect();
        assert_eq!(
            starts,
            vec![
                now - ChronoDuration::seconds(10),
                now - ChronoDuration::seconds(20),
                now - ChronoDuration::seconds(30)
            ]
        );
        assert!(store.list_by_owner("bob").await.unwrap().is_empty());
    }

    #[test]
    fn test_compute_stats() {
        let records: Vec<_> = [
            (CallOutcome::Completed, HistoryDirection::Outgoing, 40),
            (CallOutcome::Completed, HistoryDirection::Incoming, 20),
            (CallOutcome::Missed, HistoryDirection::Missed, 0),
            (CallOutcome::NoAnswer, HistoryDirection::Outgoing, 0),
            (CallOutcome::Rejected, HistoryDirection::Incoming, 0),
        ]
        .into_iter()
        .map(|(outcome, direction, duration)| {
            let mut a = attempt("alice", outcome, duration);
            a.direction = direction;
            a.into_record(UserProfile::anonymous("bob"))
        })
        .collect();

        let stats = compute_stats(&records);
        assert_eq!(
            stats,
            CallStats {
                total_calls: 5,
                completed_calls: 2,
                missed_calls: 1,
                average_duration_seconds: 30.0,
                total_duration_seconds: 60,
            }
        );
    }

    #[test]
    fn test_compute_stats_empty() {
        assert_eq!(compute_stats(&[]), CallStats::default());
    }

    #[test]
    fn test_record_wire_names() {
        let record = attempt("alice", CallOutcome::NoAnswer, 0)
            .into_record(UserProfile::anonymous("bob"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"], "no-answer");
        assert_eq!(json["direction"], "outgoing");
        assert_eq!(json["media_type"], "audio");
    }
}
