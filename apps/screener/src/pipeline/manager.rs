//! Retry Queue Manager: the single writer of the queue state.
//!
//! Each transition runs against a copy of the committed state, the copy is
//! persisted, and only then replaces the committed state. A failed write
//! leaves the committed state untouched and returns
//! [`EngineError::Persistence`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::backoff::RetryPolicies;
use crate::pipeline::error::{EngineError, EngineResult};
use crate::pipeline::item::{QueueKind, WorkItem};
use crate::pipeline::queues::{Completion, QueueState};
use crate::pipeline::status::{BatchProgress, ItemDetail, StatusSnapshot};
use crate::pipeline::store::{StateStore, StoreError};

/// One document handed in by a collaborator.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReceipt {
    pub batch_id: Uuid,
    pub accepted: Vec<String>,
    /// Ids already tracked by the engine; not admitted again.
    pub skipped: Vec<String>,
}

pub struct RetryQueueManager {
    state: Mutex<QueueState>,
    store: Arc<dyn StateStore>,
    policies: RetryPolicies,
    persistence_faults: AtomicU64,
}

impl RetryQueueManager {
    /// Loads the last snapshot, demotes interrupted items and persists the
    /// recovered state.
    pub fn open(store: Arc<dyn StateStore>, policies: RetryPolicies) -> EngineResult<Self> {
        let mut state = store.load()?;
        let demoted = state.demote_processing(Utc::now());
        if demoted > 0 {
            warn!("Recovered {demoted} item(s) that were in flight when the process stopped");
        }
        store.save(&state)?;
        info!(
            "Queue state loaded: {} tracked item(s), {} result(s) already consumed",
            state.items().count(),
            state.consumed_total()
        );
        Ok(Self {
            state: Mutex::new(state),
            store,
            policies,
            persistence_faults: AtomicU64::new(0),
        })
    }

    pub fn persistence_faults(&self) -> u64 {
        self.persistence_faults.load(Ordering::Relaxed)
    }

    /// Applies `f` to a copy of the state, persists it, then commits.
    async fn transition<T>(
        &self,
        f: impl FnOnce(&mut QueueState) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut committed = self.state.lock().await;
        let mut next = committed.clone();
        let out = f(&mut next)?;
        if next == *committed {
            return Ok(out);
        }
        if let Err(e) = self.persist(&next).await {
            self.persistence_faults.fetch_add(1, Ordering::Relaxed);
            warn!("State write failed, transition rolled back: {e}");
            return Err(EngineError::Persistence(e));
        }
        *committed = next;
        Ok(out)
    }

    /// Writes a snapshot on the blocking pool; file I/O and `fsync` stay off
    /// the async workers.
    async fn persist(&self, state: &QueueState) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let snapshot = state.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| StoreError::Writer(e.to_string()))?
    }

    /// Admits each document into `quick_retry`, eligible immediately.
    pub async fn submit(&self, documents: Vec<Submission>) -> EngineResult<SubmissionReceipt> {
        let batch_id = Uuid::new_v4();
        let now = Utc::now();
        let receipt = self
            .transition(|state| {
                let mut receipt = SubmissionReceipt {
                    batch_id,
                    accepted: Vec::new(),
                    skipped: Vec::new(),
                };
                for doc in documents {
                    if state.admit(doc.id.clone(), doc.payload, batch_id, now) {
                        receipt.accepted.push(doc.id);
                    } else {
                        receipt.skipped.push(doc.id);
                    }
                }
                Ok(receipt)
            })
            .await?;
        info!(
            "Batch {} admitted {} item(s), skipped {}",
            batch_id,
            receipt.accepted.len(),
            receipt.skipped.len()
        );
        Ok(receipt)
    }

    /// Moves exhausted items to `failed`, then claims what the concurrency
    /// limit and wave size allow.
    pub async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        concurrency_limit: usize,
        batch_size: usize,
        max_retries: u32,
    ) -> EngineResult<Vec<WorkItem>> {
        self.transition(|state| {
            for id in state.sweep_exhausted(max_retries) {
                warn!("Item {id} exhausted its retry budget");
            }
            let free = concurrency_limit.saturating_sub(state.processing.len());
            Ok(state.claim_ready(now, free.min(batch_size)))
        })
        .await
    }

    pub async fn claim_forced(
        &self,
        ids: &[String],
        now: DateTime<Utc>,
    ) -> Vec<EngineResult<WorkItem>> {
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            claimed.push(self.transition(|state| state.claim_forced(id, now)).await);
        }
        claimed
    }

    pub async fn complete(
        &self,
        id: &str,
        completion: Completion,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> EngineResult<QueueKind> {
        let policies = self.policies;
        self.transition(|state| state.complete(id, completion, now, max_retries, &policies))
            .await
    }

    /// Demotes items whose call ended without a recorded outcome back to
    /// `quick_retry`, as a restart would. Returns the ids that were moved.
    pub async fn recover(&self, ids: &[String], now: DateTime<Utc>) -> EngineResult<Vec<String>> {
        let recovered = self
            .transition(|state| {
                Ok(ids
                    .iter()
                    .filter(|id| state.recover(id, now))
                    .cloned()
                    .collect())
            })
            .await?;
        for id in &recovered {
            warn!("Item {id} recovered from processing without an outcome");
        }
        Ok(recovered)
    }

    pub async fn manual_retry(&self, id: &str) -> EngineResult<()> {
        let now = Utc::now();
        self.transition(|state| state.manual_retry(id, now)).await?;
        info!("Item {id} re-admitted by manual retry");
        Ok(())
    }

    /// The stored analysis of an item in `result_ready`.
    pub async fn result(&self, id: &str) -> EngineResult<Value> {
        let state = self.state.lock().await;
        match state.get(id) {
            Some((QueueKind::ResultReady, item)) => {
                Ok(item.result.clone().unwrap_or(Value::Null))
            }
            Some((from, _)) => Err(EngineError::InvalidTransition {
                id: id.to_string(),
                from,
                action: "read the result of",
            }),
            None => Err(EngineError::UnknownItem(id.to_string())),
        }
    }

    pub async fn take_result(&self, id: &str) -> EngineResult<WorkItem> {
        self.transition(|state| state.take_result(id)).await
    }

    pub async fn reset(&self) -> EngineResult<()> {
        self.transition(|state| {
            state.reset();
            Ok(())
        })
        .await?;
        info!("Session reset: all tracked items dropped");
        Ok(())
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::of(&*self.state.lock().await)
    }

    pub async fn item(&self, id: &str) -> Option<ItemDetail> {
        let state = self.state.lock().await;
        state.get(id).map(|(queue, item)| ItemDetail::of(queue, item))
    }

    pub async fn batch_progress(&self, batch_id: Uuid) -> Option<BatchProgress> {
        BatchProgress::of(&*self.state.lock().await, batch_id)
    }

    /// Copy of the committed state.
    #[cfg(test)]
    pub async fn state(&self) -> QueueState {
        self.state.lock().await.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::queues::FailureClass;
    use crate::pipeline::item::AttemptOutcome;
    use crate::pipeline::store::JsonFileStore;
    use std::sync::atomic::AtomicBool;

    /// Store that can be told to fail every write.
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub fail: AtomicBool,
        pub saved: std::sync::Mutex<Option<QueueState>>,
    }

    impl StateStore for FlakyStore {
        fn save(&self, state: &QueueState) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Io {
                    path: "flaky".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            *self.saved.lock().unwrap() = Some(state.clone());
            Ok(())
        }

        fn load(&self) -> Result<QueueState, StoreError> {
            Ok(self.saved.lock().unwrap().clone().unwrap_or_default())
        }
    }

    fn docs(ids: &[&str]) -> Vec<Submission> {
        ids.iter()
            .map(|id| Submission {
                id: id.to_string(),
                payload: format!("resume of {id}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_submit_persists_before_commit() {
        let store = Arc::new(FlakyStore::default());
        let manager = RetryQueueManager::open(store.clone(), RetryPolicies::immediate()).unwrap();
        let receipt = manager.submit(docs(&["a", "b", "a"])).await.unwrap();
        assert_eq!(receipt.accepted, vec!["a", "b"]);
        assert_eq!(receipt.skipped, vec!["a"]);

        let saved = store.saved.lock().unwrap().clone().unwrap();
        assert_eq!(saved, manager.state().await);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_transition() {
        let store = Arc::new(FlakyStore::default());
        let manager = RetryQueueManager::open(store.clone(), RetryPolicies::immediate()).unwrap();
        manager.submit(docs(&["a"])).await.unwrap();
        let before = manager.state().await;

        store.fail.store(true, Ordering::SeqCst);
        let err = manager.claim_ready(Utc::now(), 2, 5, 3).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(manager.state().await, before);
        assert_eq!(manager.persistence_faults(), 1);

        let err = manager.submit(docs(&["b"])).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert!(manager.item("b").await.is_none());

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(manager.claim_ready(Utc::now(), 2, 5, 3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_respects_concurrency_and_wave_size() {
        let store = Arc::new(FlakyStore::default());
        let manager = RetryQueueManager::open(store, RetryPolicies::immediate()).unwrap();
        manager.submit(docs(&["a", "b", "c", "d"])).await.unwrap();
        let now = Utc::now();
        assert_eq!(manager.claim_ready(now, 3, 2, 3).await.unwrap().len(), 2);
        // one slot left under the concurrency limit
        assert_eq!(manager.claim_ready(now, 3, 2, 3).await.unwrap().len(), 1);
        assert!(manager.claim_ready(now, 3, 2, 3).await.unwrap().is_empty());
        assert_eq!(manager.snapshot().await.processing, 3);
    }

    #[tokio::test]
    async fn test_open_demotes_items_left_processing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = Arc::new(JsonFileStore::new(&path));
            let manager = RetryQueueManager::open(store, RetryPolicies::immediate()).unwrap();
            manager.submit(docs(&["a", "b"])).await.unwrap();
            let claimed = manager.claim_ready(Utc::now(), 1, 5, 3).await.unwrap();
            assert_eq!(claimed[0].id, "a");
            // process "dies" here with "a" in flight
        }

        let store = Arc::new(JsonFileStore::new(&path));
        let manager = RetryQueueManager::open(store.clone(), RetryPolicies::immediate()).unwrap();
        let a = manager.item("a").await.unwrap();
        assert_eq!(a.queue, QueueKind::QuickRetry);
        assert_eq!(a.attempts, 1);
        assert_eq!(manager.snapshot().await.processing, 0);
        // the demotion itself was persisted
        assert_eq!(store.load().unwrap().locate("a"), Some(QueueKind::QuickRetry));
    }

    #[tokio::test]
    async fn test_result_readable_until_taken() {
        let store = Arc::new(FlakyStore::default());
        let manager = RetryQueueManager::open(store, RetryPolicies::immediate()).unwrap();
        manager.submit(docs(&["a"])).await.unwrap();
        assert!(matches!(
            manager.result("a").await,
            Err(EngineError::InvalidTransition { from: QueueKind::QuickRetry, .. })
        ));

        manager.claim_ready(Utc::now(), 1, 1, 3).await.unwrap();
        manager
            .complete(
                "a",
                Completion::Accepted {
                    record: serde_json::json!({"nickname": "Ledger Whisperer"}),
                    quality_score: 8.5,
                    issues: vec![],
                },
                Utc::now(),
                3,
            )
            .await
            .unwrap();
        assert_eq!(manager.result("a").await.unwrap()["nickname"], "Ledger Whisperer");

        let taken = manager.take_result("a").await.unwrap();
        assert_eq!(taken.quality_score, Some(8.5));
        assert!(matches!(manager.result("a").await, Err(EngineError::UnknownItem(_))));
        assert_eq!(manager.snapshot().await.processed_ok, 1);
    }

    #[tokio::test]
    async fn test_complete_of_reset_item_is_rejected() {
        let store = Arc::new(FlakyStore::default());
        let manager = RetryQueueManager::open(store, RetryPolicies::immediate()).unwrap();
        manager.submit(docs(&["a"])).await.unwrap();
        manager.claim_ready(Utc::now(), 1, 1, 3).await.unwrap();
        manager.reset().await.unwrap();
        let err = manager
            .complete(
                "a",
                Completion::Failed {
                    class: FailureClass::Transient,
                    message: "late".into(),
                    quality_score: None,
                    issues: vec![],
                },
                Utc::now(),
                3,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownItem(_)));
        assert_eq!(manager.snapshot().await.total, 0);
    }

    fn transient(message: &str) -> Completion {
        Completion::Failed {
            class: FailureClass::Transient,
            message: message.into(),
            quality_score: None,
            issues: vec![],
        }
    }

    #[tokio::test]
    async fn test_final_attempt_interrupted_by_restart_is_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = Arc::new(JsonFileStore::new(&path));
            let manager = RetryQueueManager::open(store, RetryPolicies::immediate()).unwrap();
            manager.submit(docs(&["a"])).await.unwrap();
            for n in 1..=2 {
                let claimed = manager.claim_ready(Utc::now(), 1, 1, 3).await.unwrap();
                assert_eq!(claimed[0].attempts, n);
                manager.complete("a", transient("503"), Utc::now(), 3).await.unwrap();
            }
            let last = manager.claim_ready(Utc::now(), 1, 1, 3).await.unwrap();
            assert_eq!(last[0].attempts, 3);
            // stopped during the last attempt the budget allows
        }

        let store = Arc::new(JsonFileStore::new(&path));
        let manager = RetryQueueManager::open(store, RetryPolicies::immediate()).unwrap();
        assert_eq!(manager.item("a").await.unwrap().queue, QueueKind::QuickRetry);

        let rerun = manager.claim_ready(Utc::now(), 1, 1, 3).await.unwrap();
        assert_eq!(rerun.len(), 1, "the interrupted attempt must not be swept");
        assert_eq!(rerun[0].attempts, 3);
        assert!(rerun[0]
            .history
            .iter()
            .any(|r| r.outcome == AttemptOutcome::Interrupted && r.attempt == 3));

        let queue = manager.complete("a", transient("503"), Utc::now(), 3).await.unwrap();
        assert_eq!(queue, QueueKind::Failed);
    }

    #[tokio::test]
    async fn test_recover_moves_only_items_still_processing() {
        let store = Arc::new(FlakyStore::default());
        let manager = RetryQueueManager::open(store, RetryPolicies::immediate()).unwrap();
        manager.submit(docs(&["a", "b"])).await.unwrap();
        manager.claim_ready(Utc::now(), 2, 2, 3).await.unwrap();
        manager.complete("b", transient("503"), Utc::now(), 3).await.unwrap();

        let ids = vec!["a".to_string(), "b".to_string(), "ghost".to_string()];
        let recovered = manager.recover(&ids, Utc::now()).await.unwrap();
        assert_eq!(recovered, vec!["a"]);

        let a = manager.item("a").await.unwrap();
        assert_eq!(a.queue, QueueKind::QuickRetry);
        assert_eq!(a.attempts, 1);
        assert_eq!(a.history.last().unwrap().outcome, AttemptOutcome::Interrupted);
        // a second pass finds nothing left to move
        assert!(manager.recover(&ids, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_submits_are_all_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("state.json")));
        let manager = Arc::new(
            RetryQueueManager::open(store.clone(), RetryPolicies::immediate()).unwrap(),
        );

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.spawn(async move {
                let id = format!("doc-{n}");
                manager.submit(docs(&[id.as_str()])).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            assert_eq!(joined.unwrap().unwrap().accepted.len(), 1);
        }

        let on_disk = store.load().unwrap();
        assert_eq!(on_disk, manager.state().await);
        assert_eq!(on_disk.items().count(), 8);
    }
}
