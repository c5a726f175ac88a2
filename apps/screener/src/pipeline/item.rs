//! Work item model shared by the queue manager, the store and the status views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Which collection a work item currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Processing,
    QuickRetry,
    LongRetry,
    FormatRetry,
    Failed,
    ResultReady,
}

impl QueueKind {
    /// Queues the scheduler pulls from.
    pub const RETRY: [QueueKind; 3] = [
        QueueKind::QuickRetry,
        QueueKind::LongRetry,
        QueueKind::FormatRetry,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, QueueKind::Failed | QueueKind::ResultReady)
    }
}

/// Outcome class recorded in an item's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Transient,
    Timeout,
    FormattingFailure,
    /// The process stopped while the call was in flight.
    Interrupted,
    /// Operator re-admitted the item from `failed`.
    ManualRetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// One resume pending or finished analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub batch_id: Uuid,
    pub payload: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// 0.0 – 10.0, set by the classifier after each parsed attempt.
    pub quality_score: Option<f32>,
    pub quality_issues: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    /// Admission order within the current queue; tie-break for dispatch.
    pub seq: u64,
    pub history: Vec<AttemptRecord>,
    /// Parsed analysis record, present once the item reached `result_ready`.
    pub result: Option<Value>,
}

impl WorkItem {
    pub fn new(id: String, payload: String, batch_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            batch_id,
            payload,
            attempts: 0,
            last_error: None,
            quality_score: None,
            quality_issues: Vec::new(),
            enqueued_at: now,
            next_eligible_at: now,
            seq: 0,
            history: Vec::new(),
            result: None,
        }
    }

    /// Derives the stable item id from a source filename.
    /// `"Jane Doe 123 RESUME.pdf"` becomes `"Jane_Doe_123_RESUME_pdf"`.
    pub fn id_from_filename(filename: &str) -> String {
        filename.trim().replace([' ', '.'], "_")
    }

    /// The last attempt was cut off by a stop or a crashed call and has not
    /// been re-run yet. Re-running it does not spend another attempt; a
    /// second interruption of the same attempt does.
    pub fn resumes_interrupted(&self) -> bool {
        let mut recent = self.history.iter().rev();
        let Some(last) = recent.next() else {
            return false;
        };
        if last.outcome != AttemptOutcome::Interrupted {
            return false;
        }
        !recent
            .next()
            .is_some_and(|p| p.outcome == AttemptOutcome::Interrupted && p.attempt == last.attempt)
    }

    pub fn record(&mut self, outcome: AttemptOutcome, message: Option<String>, at: DateTime<Utc>) {
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            outcome,
            message,
            at,
        });
    }
}
