//! Queue state and the per-item transition table.
//!
//! `QueueState` is plain data: it is what the store persists and what the
//! status views read. Every method here is synchronous and side-effect free
//! apart from mutating `self`; locking and persistence live in
//! [`RetryQueueManager`](crate::pipeline::manager::RetryQueueManager).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::backoff::RetryPolicies;
use crate::pipeline::error::{EngineError, EngineResult};
use crate::pipeline::item::{AttemptOutcome, QueueKind, WorkItem};

pub const STATE_VERSION: u32 = 1;

/// Failure classes that send an item back to a retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Timeout,
    Formatting,
}

impl FailureClass {
    pub fn queue(self) -> QueueKind {
        match self {
            FailureClass::Transient => QueueKind::QuickRetry,
            FailureClass::Timeout => QueueKind::LongRetry,
            FailureClass::Formatting => QueueKind::FormatRetry,
        }
    }

    fn outcome(self) -> AttemptOutcome {
        match self {
            FailureClass::Transient => AttemptOutcome::Transient,
            FailureClass::Timeout => AttemptOutcome::Timeout,
            FailureClass::Formatting => AttemptOutcome::FormattingFailure,
        }
    }
}

/// Result of one dispatched call, after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Accepted {
        record: Value,
        quality_score: f32,
        issues: Vec<String>,
    },
    Failed {
        class: FailureClass,
        message: String,
        quality_score: Option<f32>,
        issues: Vec<String>,
    },
}

/// Everything the engine tracks. Serialized as-is by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub version: u32,
    pub processing: Vec<WorkItem>,
    pub quick_retry: Vec<WorkItem>,
    pub long_retry: Vec<WorkItem>,
    pub format_retry: Vec<WorkItem>,
    pub failed: Vec<WorkItem>,
    pub result_ready: Vec<WorkItem>,
    /// Results handed to a collaborator and dropped from tracking, per batch.
    pub consumed: BTreeMap<Uuid, u64>,
    pub next_seq: u64,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            processing: Vec::new(),
            quick_retry: Vec::new(),
            long_retry: Vec::new(),
            format_retry: Vec::new(),
            failed: Vec::new(),
            result_ready: Vec::new(),
            consumed: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

const ALL_QUEUES: [QueueKind; 6] = [
    QueueKind::Processing,
    QueueKind::QuickRetry,
    QueueKind::LongRetry,
    QueueKind::FormatRetry,
    QueueKind::Failed,
    QueueKind::ResultReady,
];

impl QueueState {
    pub fn queue(&self, kind: QueueKind) -> &[WorkItem] {
        match kind {
            QueueKind::Processing => &self.processing,
            QueueKind::QuickRetry => &self.quick_retry,
            QueueKind::LongRetry => &self.long_retry,
            QueueKind::FormatRetry => &self.format_retry,
            QueueKind::Failed => &self.failed,
            QueueKind::ResultReady => &self.result_ready,
        }
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut Vec<WorkItem> {
        match kind {
            QueueKind::Processing => &mut self.processing,
            QueueKind::QuickRetry => &mut self.quick_retry,
            QueueKind::LongRetry => &mut self.long_retry,
            QueueKind::FormatRetry => &mut self.format_retry,
            QueueKind::Failed => &mut self.failed,
            QueueKind::ResultReady => &mut self.result_ready,
        }
    }

    /// Every tracked item with the queue it lives in, in queue order.
    pub fn items(&self) -> impl Iterator<Item = (QueueKind, &WorkItem)> {
        ALL_QUEUES
            .into_iter()
            .flat_map(move |kind| self.queue(kind).iter().map(move |item| (kind, item)))
    }

    pub fn get(&self, id: &str) -> Option<(QueueKind, &WorkItem)> {
        self.items().find(|(_, item)| item.id == id)
    }

    pub fn locate(&self, id: &str) -> Option<QueueKind> {
        self.get(id).map(|(kind, _)| kind)
    }

    pub fn consumed_total(&self) -> u64 {
        self.consumed.values().sum()
    }

    fn take(&mut self, id: &str) -> Option<(QueueKind, WorkItem)> {
        for kind in ALL_QUEUES {
            let queue = self.queue_mut(kind);
            if let Some(pos) = queue.iter().position(|item| item.id == id) {
                return Some((kind, queue.remove(pos)));
            }
        }
        None
    }

    fn put(&mut self, kind: QueueKind, mut item: WorkItem) {
        item.seq = self.next_seq;
        self.next_seq += 1;
        self.queue_mut(kind).push(item);
    }

    /// Admits a new item into `quick_retry`, eligible immediately.
    /// Returns `false` when the id is already tracked.
    pub fn admit(
        &mut self,
        id: String,
        payload: String,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) -> bool {
        if self.locate(&id).is_some() {
            return false;
        }
        self.put(QueueKind::QuickRetry, WorkItem::new(id, payload, batch_id, now));
        true
    }

    /// Moves queued items whose budget is spent to `failed`. An attempt that
    /// was interrupted and not yet re-run is still owed to the item.
    pub fn sweep_exhausted(&mut self, max_retries: u32) -> Vec<String> {
        let mut exhausted = Vec::new();
        for kind in QueueKind::RETRY {
            let (spent, keep): (Vec<_>, Vec<_>) = std::mem::take(self.queue_mut(kind))
                .into_iter()
                .partition(|item| item.attempts >= max_retries && !item.resumes_interrupted());
            *self.queue_mut(kind) = keep;
            for mut item in spent {
                if item.last_error.is_none() {
                    item.last_error = Some("retry budget exhausted".to_string());
                }
                exhausted.push(item.id.clone());
                self.put(QueueKind::Failed, item);
            }
        }
        exhausted
    }

    /// Claims up to `limit` eligible items, earliest `next_eligible_at` first
    /// with admission order as tie-break, and moves them to `processing`.
    pub fn claim_ready(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<WorkItem> {
        let mut ready: Vec<(DateTime<Utc>, u64, String)> = QueueKind::RETRY
            .iter()
            .flat_map(|kind| self.queue(*kind))
            .filter(|item| item.next_eligible_at <= now)
            .map(|item| (item.next_eligible_at, item.seq, item.id.clone()))
            .collect();
        ready.sort();

        ready
            .into_iter()
            .take(limit)
            .filter_map(|(_, _, id)| self.start(&id))
            .collect()
    }

    /// Moves one item into `processing` ignoring eligibility. Items in
    /// `failed` get a fresh budget first.
    pub fn claim_forced(&mut self, id: &str, now: DateTime<Utc>) -> EngineResult<WorkItem> {
        match self.locate(id) {
            None => Err(EngineError::UnknownItem(id.to_string())),
            Some(from @ (QueueKind::Processing | QueueKind::ResultReady)) => {
                Err(EngineError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    action: "dispatch",
                })
            }
            Some(QueueKind::Failed) => {
                self.manual_retry(id, now)?;
                self.start(id).ok_or_else(|| EngineError::UnknownItem(id.to_string()))
            }
            Some(_) => self.start(id).ok_or_else(|| EngineError::UnknownItem(id.to_string())),
        }
    }

    fn start(&mut self, id: &str) -> Option<WorkItem> {
        let (_, mut item) = self.take(id)?;
        if !item.resumes_interrupted() {
            item.attempts += 1;
        }
        let claimed = item.clone();
        self.put(QueueKind::Processing, item);
        Some(claimed)
    }

    /// Applies the outcome of a dispatched call. Returns the queue the item
    /// landed in.
    pub fn complete(
        &mut self,
        id: &str,
        completion: Completion,
        now: DateTime<Utc>,
        max_retries: u32,
        policies: &RetryPolicies,
    ) -> EngineResult<QueueKind> {
        match self.locate(id) {
            Some(QueueKind::Processing) => {}
            Some(from) => {
                return Err(EngineError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    action: "complete",
                })
            }
            None => return Err(EngineError::UnknownItem(id.to_string())),
        }
        let (_, mut item) = self
            .take(id)
            .ok_or_else(|| EngineError::UnknownItem(id.to_string()))?;

        let target = match completion {
            Completion::Accepted {
                record,
                quality_score,
                issues,
            } => {
                item.quality_score = Some(quality_score);
                item.quality_issues = issues;
                item.result = Some(record);
                item.record(AttemptOutcome::Success, None, now);
                QueueKind::ResultReady
            }
            Completion::Failed {
                class,
                message,
                quality_score,
                issues,
            } => {
                if quality_score.is_some() {
                    item.quality_score = quality_score;
                }
                item.quality_issues = issues;
                item.last_error = Some(message.clone());
                item.record(class.outcome(), Some(message), now);

                if item.attempts >= max_retries {
                    QueueKind::Failed
                } else {
                    let queue = class.queue();
                    let delay = policies
                        .for_queue(queue)
                        .map(|p| p.delay(item.attempts))
                        .unwrap_or_default();
                    item.next_eligible_at = now
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    queue
                }
            }
        };

        self.put(target, item);
        Ok(target)
    }

    /// Re-admits a failed item with a fresh attempt budget. History is kept.
    pub fn manual_retry(&mut self, id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        match self.locate(id) {
            Some(QueueKind::Failed) => {}
            Some(from) => {
                return Err(EngineError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    action: "retry",
                })
            }
            None => return Err(EngineError::UnknownItem(id.to_string())),
        }
        let (_, mut item) = self
            .take(id)
            .ok_or_else(|| EngineError::UnknownItem(id.to_string()))?;
        item.record(AttemptOutcome::ManualRetry, None, now);
        item.attempts = 0;
        item.next_eligible_at = now;
        self.put(QueueKind::QuickRetry, item);
        Ok(())
    }

    /// Hands a finished result to the collaborator and stops tracking it.
    pub fn take_result(&mut self, id: &str) -> EngineResult<WorkItem> {
        match self.locate(id) {
            Some(QueueKind::ResultReady) => {}
            Some(from) => {
                return Err(EngineError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    action: "consume the result of",
                })
            }
            None => return Err(EngineError::UnknownItem(id.to_string())),
        }
        let (_, item) = self
            .take(id)
            .ok_or_else(|| EngineError::UnknownItem(id.to_string()))?;
        *self.consumed.entry(item.batch_id).or_insert(0) += 1;
        Ok(item)
    }

    /// Demotes items left in `processing` by a previous run: the in-flight
    /// outcome is unknown, so they are re-attempted with attempts unchanged.
    pub fn demote_processing(&mut self, now: DateTime<Utc>) -> usize {
        let interrupted = std::mem::take(&mut self.processing);
        let count = interrupted.len();
        for item in interrupted {
            self.interrupt(item, "process stopped while the call was in flight", now);
        }
        count
    }

    /// Demotes one item whose call ended without a recorded outcome.
    /// Returns `false` when the item is no longer in `processing`.
    pub fn recover(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        if self.locate(id) != Some(QueueKind::Processing) {
            return false;
        }
        match self.take(id) {
            Some((_, item)) => {
                self.interrupt(item, "call ended without a recorded outcome", now);
                true
            }
            None => false,
        }
    }

    fn interrupt(&mut self, mut item: WorkItem, reason: &str, now: DateTime<Utc>) {
        item.record(AttemptOutcome::Interrupted, Some(reason.to_string()), now);
        item.next_eligible_at = now;
        self.put(QueueKind::QuickRetry, item);
    }

    pub fn reset(&mut self) {
        *self = QueueState::default();
    }
}
