//! Status Aggregator: read-only views of the committed queue state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::pipeline::item::{AttemptRecord, QueueKind, WorkItem};
use crate::pipeline::queues::QueueState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub total: usize,
    pub processed_ok: usize,
    pub in_quick_retry: usize,
    pub in_long_retry: usize,
    pub in_format_retry: usize,
    pub failed: usize,
    pub processing: usize,
    pub progress_percent: u8,
}

impl StatusSnapshot {
    /// Consumed results stay in both `total` and `processed_ok`, so progress
    /// does not move backwards when a collaborator collects a result.
    pub fn of(state: &QueueState) -> Self {
        let consumed = state.consumed_total() as usize;
        let processed_ok = state.result_ready.len() + consumed;
        let total = state.processing.len()
            + state.quick_retry.len()
            + state.long_retry.len()
            + state.format_retry.len()
            + state.failed.len()
            + processed_ok;
        Self {
            total,
            processed_ok,
            in_quick_retry: state.quick_retry.len(),
            in_long_retry: state.long_retry.len(),
            in_format_retry: state.format_retry.len(),
            failed: state.failed.len(),
            processing: state.processing.len(),
            progress_percent: percent(processed_ok, total),
        }
    }
}

impl StatusSnapshot {
    /// Items still waiting on a call or a retry.
    pub fn pending(&self) -> usize {
        self.processing + self.in_quick_retry + self.in_long_retry + self.in_format_retry
    }
}

/// What the scheduler is doing, as reported next to the counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Nothing has been submitted since start or the last reset.
    Idle,
    Processing,
    /// Every tracked item reached `result_ready` or `failed`.
    Completed,
    /// Paused by an operator; items stay where they are.
    Paused,
}

impl SchedulerState {
    pub fn of(paused: bool, snapshot: &StatusSnapshot) -> Self {
        if paused {
            SchedulerState::Paused
        } else if snapshot.total == 0 {
            SchedulerState::Idle
        } else if snapshot.pending() > 0 {
            SchedulerState::Processing
        } else {
            SchedulerState::Completed
        }
    }
}

/// Body of `GET /api/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub snapshot: StatusSnapshot,
    pub scheduler: SchedulerState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub total: usize,
    pub processed_ok: usize,
    pub failed: usize,
    pub pending: usize,
    /// Every member is in `result_ready` or `failed` (or was consumed).
    pub complete: bool,
    pub progress_percent: u8,
}

impl BatchProgress {
    pub fn of(state: &QueueState, batch_id: Uuid) -> Option<Self> {
        let consumed = state.consumed.get(&batch_id).copied().unwrap_or(0) as usize;
        let mut processed_ok = consumed;
        let mut failed = 0;
        let mut pending = 0;
        for (queue, _) in state.items().filter(|(_, item)| item.batch_id == batch_id) {
            match queue {
                QueueKind::ResultReady => processed_ok += 1,
                QueueKind::Failed => failed += 1,
                _ => pending += 1,
            }
        }
        let total = processed_ok + failed + pending;
        if total == 0 {
            return None;
        }
        Some(Self {
            batch_id,
            total,
            processed_ok,
            failed,
            pending,
            complete: pending == 0,
            progress_percent: percent(processed_ok, total),
        })
    }
}

/// Per-item view for polling; omits the document text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemDetail {
    pub id: String,
    pub batch_id: Uuid,
    pub queue: QueueKind,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub quality_score: Option<f32>,
    pub quality_issues: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    pub history: Vec<AttemptRecord>,
    pub has_result: bool,
}

impl ItemDetail {
    pub fn of(queue: QueueKind, item: &WorkItem) -> Self {
        Self {
            id: item.id.clone(),
            batch_id: item.batch_id,
            queue,
            attempts: item.attempts,
            last_error: item.last_error.clone(),
            quality_score: item.quality_score,
            quality_issues: item.quality_issues.clone(),
            enqueued_at: item.enqueued_at,
            next_eligible_at: item.next_eligible_at,
            history: item.history.clone(),
            has_result: item.result.is_some(),
        }
    }
}

fn percent(part: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((part as f64 / total as f64) * 100.0).round().clamp(0.0, 100.0) as u8
}
