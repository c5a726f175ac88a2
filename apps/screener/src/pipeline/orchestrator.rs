//! Orchestrator: the scheduling loop.
//!
//! Flow per tick: claim ready items → dispatch each to the generation client
//! under its deadline → classify the reply → record the outcome through the
//! queue manager.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::pipeline::classifier::{expected_length_hint, ResponseClassifier, VerdictKind};
use crate::pipeline::client::GenerationClient;
use crate::pipeline::error::{EngineError, EngineResult};
use crate::pipeline::item::WorkItem;
use crate::pipeline::manager::RetryQueueManager;
use crate::pipeline::queues::{Completion, FailureClass};
use crate::pipeline::settings::{EngineSettings, LowQualityPolicy, SettingsUpdate};
use crate::pipeline::status::{EngineStatus, SchedulerState};
use crate::pipeline::timeout_policy::ModelClass;

/// How many times a completion is re-committed after a persistence fault.
const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
pub struct RejectedDispatch {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForceDispatchReport {
    pub dispatched: Vec<String>,
    pub rejected: Vec<RejectedDispatch>,
}

pub struct Orchestrator {
    manager: Arc<RetryQueueManager>,
    client: Arc<dyn GenerationClient>,
    classifier: ResponseClassifier,
    low_quality_policy: LowQualityPolicy,
    model_class: ModelClass,
    settings: RwLock<EngineSettings>,
    tick_interval: Duration,
    paused: watch::Sender<bool>,
    /// Items whose call ended without a recorded outcome; recovered at the
    /// start of the next tick.
    stranded: Mutex<Vec<String>>,
}

impl Orchestrator {
    pub fn new(
        manager: Arc<RetryQueueManager>,
        client: Arc<dyn GenerationClient>,
        classifier: ResponseClassifier,
        low_quality_policy: LowQualityPolicy,
        model_class: Option<ModelClass>,
        settings: EngineSettings,
        tick_interval: Duration,
    ) -> Self {
        let model_class =
            model_class.unwrap_or_else(|| ModelClass::from_model_id(client.model_id()));
        info!(
            "Orchestrator using model {} ({:?} class)",
            client.model_id(),
            model_class
        );
        Self {
            manager,
            client,
            classifier,
            low_quality_policy,
            model_class,
            settings: RwLock::new(settings),
            tick_interval,
            paused: watch::channel(false).0,
            stranded: Mutex::new(Vec::new()),
        }
    }

    pub fn manager(&self) -> &Arc<RetryQueueManager> {
        &self.manager
    }

    pub fn model_id(&self) -> &str {
        self.client.model_id()
    }

    pub fn model_class(&self) -> ModelClass {
        self.model_class
    }

    pub async fn settings(&self) -> EngineSettings {
        *self.settings.read().await
    }

    pub async fn update_settings(&self, update: SettingsUpdate) -> EngineResult<EngineSettings> {
        let mut settings = self.settings.write().await;
        let next = settings.apply(&update)?;
        *settings = next;
        info!("Engine settings updated: {:?}", next);
        Ok(next)
    }

    /// Stops scheduled dispatch. Calls in flight finish normally and force
    /// dispatch still works. Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        let was_paused = self.paused.send_replace(true);
        if !was_paused {
            info!("Scheduler paused");
        }
        !was_paused
    }

    /// Returns `false` if the scheduler was not paused.
    pub fn resume(&self) -> bool {
        let was_paused = self.paused.send_replace(false);
        if was_paused {
            info!("Scheduler resumed");
        }
        was_paused
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub async fn status(&self) -> EngineStatus {
        let snapshot = self.manager.snapshot().await;
        EngineStatus {
            scheduler: SchedulerState::of(self.is_paused(), &snapshot),
            snapshot,
        }
    }

    /// Runs until `shutdown` flips or its sender is dropped. Calls still in
    /// flight are abandoned; their items are recovered on the next start.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        info!("Scheduler started (tick every {:?})", self.tick_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let tick = if self.is_paused() {
                        self.recover_stranded().await
                    } else {
                        self.dispatch_ready(&mut tasks).await.map(|_| ())
                    };
                    if let Err(e) = tick {
                        error!("Scheduling tick failed: {e}");
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Dispatch task ended abnormally: {e}");
                    }
                }
            }
        }

        if !tasks.is_empty() {
            warn!("Scheduler stopping with {} call(s) in flight", tasks.len());
        }
        tasks.abort_all();
        info!("Scheduler stopped");
    }

    /// One tick that also waits for every call it dispatched.
    #[cfg(test)]
    pub async fn run_tick(self: &Arc<Self>) -> EngineResult<usize> {
        let mut tasks = JoinSet::new();
        let dispatched = self.dispatch_ready(&mut tasks).await?;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Dispatch task ended abnormally: {e}");
            }
        }
        Ok(dispatched)
    }

    async fn dispatch_ready(self: &Arc<Self>, tasks: &mut JoinSet<()>) -> EngineResult<usize> {
        self.recover_stranded().await?;
        let settings = self.settings().await;
        let claimed = self
            .manager
            .claim_ready(
                Utc::now(),
                settings.concurrency_limit,
                settings.batch_size,
                settings.max_retries,
            )
            .await?;
        let wave = claimed.len();
        if wave > 0 {
            debug!("Dispatching {wave} item(s)");
        }
        for item in claimed {
            tasks.spawn(Arc::clone(self).execute(item, wave, settings));
        }
        Ok(wave)
    }

    fn stranded(&self) -> MutexGuard<'_, Vec<String>> {
        self.stranded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Puts items left in `processing` by a crashed call or an unrecorded
    /// outcome back into `quick_retry`. Kept for the next tick if the write
    /// fails.
    async fn recover_stranded(&self) -> EngineResult<()> {
        let ids = std::mem::take(&mut *self.stranded());
        if ids.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.manager.recover(&ids, Utc::now()).await {
            self.stranded().extend(ids);
            return Err(e);
        }
        Ok(())
    }

    /// Dispatches the given items now, ignoring backoff and the concurrency
    /// limit. Failed items get a fresh budget first.
    pub async fn force_dispatch(self: &Arc<Self>, ids: &[String]) -> ForceDispatchReport {
        let (report, mut tasks) = self.spawn_forced(ids).await;
        tasks.detach_all();
        report
    }

    async fn spawn_forced(
        self: &Arc<Self>,
        ids: &[String],
    ) -> (ForceDispatchReport, JoinSet<()>) {
        let settings = self.settings().await;
        let mut report = ForceDispatchReport::default();
        let mut claimed = Vec::new();
        for (id, result) in ids.iter().zip(self.manager.claim_forced(ids, Utc::now()).await) {
            match result {
                Ok(item) => claimed.push(item),
                Err(e) => {
                    warn!("Force dispatch of {id} rejected: {e}");
                    report.rejected.push(RejectedDispatch {
                        id: id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let wave = claimed.len();
        let mut tasks = JoinSet::new();
        for item in claimed {
            report.dispatched.push(item.id.clone());
            tasks.spawn(Arc::clone(self).execute(item, wave, settings));
        }
        if wave > 0 {
            info!("Force-dispatched {wave} item(s)");
        }
        (report, tasks)
    }

    /// Performs one call for a claimed item and records its outcome.
    async fn execute(self: Arc<Self>, item: WorkItem, wave: usize, settings: EngineSettings) {
        let pending = PendingOutcome {
            engine: &self,
            id: Some(item.id.clone()),
        };
        let deadline = settings
            .timeout_policy()
            .deadline_for(self.model_class, wave, item.payload.len());
        debug!(
            "Calling generation service for {} (attempt {}, deadline {:?})",
            item.id, item.attempts, deadline
        );

        let call = self.client.generate(&item.payload, deadline);
        let completion = match tokio::time::timeout(deadline, call).await {
            Err(_) => failure(
                FailureClass::Timeout,
                format!("deadline of {}s exceeded", deadline.as_secs()),
            ),
            Ok(Err(e)) => failure(e.class(), e.to_string()),
            Ok(Ok(raw)) => self.judge(&raw, item.payload.len()),
        };

        if self.commit(&item.id, completion, settings.max_retries).await {
            pending.settle();
        }
    }

    /// Maps a classifier verdict onto the transition table.
    fn judge(&self, raw: &str, payload_len: usize) -> Completion {
        let verdict = self
            .classifier
            .classify(raw, expected_length_hint(payload_len));
        let record = verdict.record.unwrap_or(Value::Null);
        match verdict.kind {
            VerdictKind::Accepted => Completion::Accepted {
                record,
                quality_score: verdict.quality_score,
                issues: verdict.issues,
            },
            VerdictKind::LowQuality => match self.low_quality_policy {
                LowQualityPolicy::Accept => {
                    let mut issues = verdict.issues;
                    issues.push("accepted below the quality threshold".to_string());
                    Completion::Accepted {
                        record,
                        quality_score: verdict.quality_score,
                        issues,
                    }
                }
                LowQualityPolicy::Retry => Completion::Failed {
                    class: FailureClass::Formatting,
                    message: format!(
                        "quality score {} is below the minimum of {}",
                        verdict.quality_score,
                        self.classifier.min_quality_score()
                    ),
                    quality_score: Some(verdict.quality_score),
                    issues: verdict.issues,
                },
            },
            VerdictKind::FormattingFailure => Completion::Failed {
                class: FailureClass::Formatting,
                message: verdict
                    .issues
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "unusable response".to_string()),
                quality_score: Some(verdict.quality_score),
                issues: verdict.issues,
            },
            VerdictKind::Empty => Completion::Failed {
                class: FailureClass::Transient,
                message: "generation service returned an empty response".to_string(),
                quality_score: None,
                issues: verdict.issues,
            },
        }
    }

    /// Returns `true` once the outcome is part of the committed state.
    async fn commit(&self, id: &str, completion: Completion, max_retries: u32) -> bool {
        for attempt in 1..=COMMIT_ATTEMPTS {
            match self
                .manager
                .complete(id, completion.clone(), Utc::now(), max_retries)
                .await
            {
                Ok(queue) if queue.is_terminal() => {
                    info!("Item {id} finished in {queue:?}");
                    return true;
                }
                Ok(queue) => {
                    debug!("Item {id} requeued to {queue:?}");
                    return true;
                }
                Err(EngineError::Persistence(e)) if attempt < COMMIT_ATTEMPTS => {
                    warn!("Recording outcome for {id} failed (attempt {attempt}): {e}");
                    tokio::time::sleep(COMMIT_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!("Outcome for {id} could not be recorded: {e}");
                    return false;
                }
            }
        }
        false
    }
}

/// Marks an item stranded unless its outcome was committed. Dropping it
/// unsettled covers a panicking call too, since the task's future is dropped
/// after the panic is caught.
struct PendingOutcome<'a> {
    engine: &'a Orchestrator,
    id: Option<String>,
}

impl PendingOutcome<'_> {
    fn settle(mut self) {
        self.id = None;
    }
}

impl Drop for PendingOutcome<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.engine.stranded().push(id);
        }
    }
}

fn failure(class: FailureClass, message: String) -> Completion {
    Completion::Failed {
        class,
        message,
        quality_score: None,
        issues: Vec::new(),
    }
}
