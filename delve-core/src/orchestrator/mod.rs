//! Research orchestrator - the task state machine.
//!
//! A request starts synchronously: the remote operation is begun and raced against a
//! short deadline. If it has not finished by then, the same background unit keeps
//! polling and the caller gets a task id to check on later. Every poll tick writes a
//! snapshot to the store and consults the stall detector. On startup, unfinished
//! tasks are rediscovered from the store and re-attached.

mod poll;

pub use poll::{
    NoOpProgressCallback, PartialOutput, PollOutcome, ProgressCallback, ProgressUpdate,
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DelveConfig, MAX_WAIT_LIMIT_SECS};
use crate::error::{DelveError, ResearchError, Result, RunnerError};
use crate::estimate::{CostEstimate, CostEstimator};
use crate::notify::{LogNotifier, Notifier, Urgency, completion_message, failure_message};
use crate::progress::{COMPLETE, ProgressCurve, phase_for};
use crate::remote::{BeginOutcome, RemoteOutput, ResearchApi};
use crate::runner::{TaskRunner, panic_message};
use crate::stall::{StallDetector, StallVerdict};
use crate::store::{ResearchStore, ResultChange, TaskUpdate};
use crate::types::{ResultRecord, TaskRecord, TaskStatus, meta};
use poll::PartialBuffer;

const INTERRUPTED_MESSAGE: &str = "Interrupted before the remote service accepted the request";

/// Per-request options for [`ResearchOrchestrator::start_research`].
#[derive(Clone, Default)]
pub struct StartOptions {
    /// Remote model; the configured default when unset.
    pub model: Option<String>,
    pub enable_notifications: Option<bool>,
    /// Wall-clock ceiling override, in seconds.
    pub max_wait_secs: Option<u64>,
    pub callback: Option<Arc<dyn ProgressCallback>>,
}

/// What `start_research` hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub current_action: Option<String>,
    pub model: String,
    pub remote_handle: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_estimate: f64,
    pub elapsed_secs: f64,
    pub estimated_remaining_minutes: Option<f64>,
    /// Advisory only; a hanging verdict never cancels the task.
    pub stall: Option<StallVerdict>,
    pub error_message: Option<String>,
    /// Whether this process is polling the task right now.
    pub polling: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress_at_cancellation: f64,
    pub partial_saved: bool,
}

/// What `resume` did with one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    Reattached,
    MarkedFailed,
    AlreadyRunning,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeSummary {
    pub resumed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl ResumeSummary {
    pub fn total(&self) -> usize {
        self.resumed.len() + self.failed.len() + self.skipped.len()
    }
}

/// Where a background unit left its task.
#[derive(Debug, Clone)]
struct FinalState {
    status: TaskStatus,
    result: Option<ResultRecord>,
    error: Option<String>,
}

/// A completion whose terminal write failed and has to be retried.
#[derive(Debug, Clone)]
struct PendingFinal {
    update: TaskUpdate,
    result: ResultRecord,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    store: Arc<ResearchStore>,
    remote: Arc<dyn ResearchApi>,
    notifier: Arc<dyn Notifier>,
    callback: Arc<dyn ProgressCallback>,
    runner: TaskRunner,
    detector: StallDetector,
    curve: ProgressCurve,
    estimator: CostEstimator,
    config: DelveConfig,
    polling: Arc<Mutex<HashSet<String>>>,
    partials: Mutex<HashMap<String, PartialBuffer>>,
    pending_finals: Mutex<HashMap<String, PendingFinal>>,
}

/// Builds a [`ResearchOrchestrator`] from injected services.
pub struct OrchestratorBuilder {
    store: Arc<ResearchStore>,
    remote: Arc<dyn ResearchApi>,
    notifier: Option<Arc<dyn Notifier>>,
    callback: Option<Arc<dyn ProgressCallback>>,
    runner: Option<TaskRunner>,
    config: DelveConfig,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: DelveConfig) -> Self {
        self.config = config;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Callback used when a request does not bring its own.
    pub fn callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn runner(mut self, runner: TaskRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn build(self) -> ResearchOrchestrator {
        let config = self.config;
        ResearchOrchestrator {
            inner: Arc::new(Inner {
                store: self.store,
                remote: self.remote,
                notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
                callback: self
                    .callback
                    .unwrap_or_else(|| Arc::new(NoOpProgressCallback)),
                runner: self.runner.unwrap_or_default(),
                detector: StallDetector::new(config.stall.clone()),
                curve: ProgressCurve::new(&config.progress),
                estimator: CostEstimator::new(),
                config,
                polling: Arc::new(Mutex::new(HashSet::new())),
                partials: Mutex::new(HashMap::new()),
                pending_finals: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Drives research tasks from submission to a terminal state.
#[derive(Clone)]
pub struct ResearchOrchestrator {
    inner: Arc<Inner>,
}

impl ResearchOrchestrator {
    pub fn builder(store: Arc<ResearchStore>, remote: Arc<dyn ResearchApi>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            remote,
            notifier: None,
            callback: None,
            runner: None,
            config: DelveConfig::default(),
        }
    }

    pub fn store(&self) -> &Arc<ResearchStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &DelveConfig {
        &self.inner.config
    }

    /// Submit a query and wait up to the sync timeout for it to finish.
    ///
    /// Returns `Completed` or `Failed` when the outcome arrives in time, otherwise
    /// `RunningAsync` with the task id while the same unit keeps polling.
    pub async fn start_research(&self, query: &str, options: StartOptions) -> Result<StartResponse> {
        let inner = &self.inner;
        let research = &inner.config.research;
        let query = validate_query(query, research.max_query_chars)?;
        let max_wait_secs =
            validate_max_wait(options.max_wait_secs.unwrap_or(research.max_wait_secs))?;

        let model = options
            .model
            .clone()
            .unwrap_or_else(|| research.default_model.clone());
        let mut task = TaskRecord::new(query, model.clone(), max_wait_secs);
        task.enable_notifications = options
            .enable_notifications
            .unwrap_or(inner.config.notifications.notify_by_default);
        let task_id = task.id.clone();

        inner.store.create_task(&task).await?;
        inner
            .store
            .transition(
                &task_id,
                TaskStatus::RunningSync,
                TaskUpdate::progress(0.0, "Submitting request"),
                ResultChange::Keep,
            )
            .await?;
        info!(task_id = %task_id, model = %model, "Research task started");

        let handle = match inner.remote.begin(query, &model).await {
            Ok(BeginOutcome::Completed { handle, output }) => {
                info!(task_id = %task_id, "Remote answered immediately");
                let state = inner.complete(&task_id, handle.clone(), output).await;
                return Ok(StartResponse::from_state(task_id, handle, state));
            }
            Ok(BeginOutcome::Accepted { handle }) => handle,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Remote rejected the request");
                let state = inner.fail(&task_id, e.to_string(), None, false).await;
                return Ok(StartResponse::from_state(task_id, None, state));
            }
        };

        inner
            .store
            .update_task(
                &task_id,
                TaskUpdate {
                    remote_handle: Some(handle.clone()),
                    ..Default::default()
                },
            )
            .await?;
        let current = inner.load(&task_id).await?;
        if current.status.is_terminal() {
            // Cancelled while `begin` was in flight.
            return self.response_from_store(&task_id).await;
        }

        let sync_timeout = research.sync_timeout();
        let callback = options
            .callback
            .unwrap_or_else(|| Arc::clone(&inner.callback));
        let (tx, mut rx) = oneshot::channel();
        inner.spawn_unit(&task_id, &handle, callback, Some(tx), Some(sync_timeout))?;

        match tokio::time::timeout(sync_timeout, &mut rx).await {
            Ok(Ok(state)) => Ok(StartResponse::from_state(task_id, Some(handle), state)),
            Ok(Err(_)) => self.response_from_store(&task_id).await,
            Err(_) => {
                let moved = inner
                    .store
                    .transition(
                        &task_id,
                        TaskStatus::RunningAsync,
                        TaskUpdate::default(),
                        ResultChange::Keep,
                    )
                    .await?;
                if moved.is_none() {
                    debug!(task_id = %task_id, "Task finished as the sync wait expired");
                    return self.response_from_store(&task_id).await;
                }
                info!(
                    task_id = %task_id,
                    timeout_ms = sync_timeout.as_millis() as u64,
                    "Sync wait expired, continuing in the background"
                );
                Ok(StartResponse {
                    task_id,
                    status: TaskStatus::RunningAsync,
                    result: None,
                    remote_handle: Some(handle),
                    error: None,
                })
            }
        }
    }

    /// Poll a remote operation in the caller's task until it ends.
    ///
    /// Fails with `ConcurrencyViolation` if the task is already being polled.
    pub async fn poll(
        &self,
        task_id: &str,
        remote_handle: &str,
        cancel: &CancellationToken,
        callback: Option<Arc<dyn ProgressCallback>>,
    ) -> Result<PollOutcome> {
        let callback = callback.unwrap_or_else(|| Arc::clone(&self.inner.callback));
        self.inner
            .poll_loop(task_id, remote_handle, cancel, callback, None)
            .await
    }

    /// Re-attach polling for one unfinished task.
    pub async fn resume(&self, task_id: &str) -> Result<ResumeAction> {
        let task = self.inner.load(task_id).await?;
        self.inner.resume_task(task).await
    }

    /// Re-attach every task left running by a previous process.
    pub async fn resume_incomplete(&self) -> Result<ResumeSummary> {
        let tasks = self.inner.store.list_incomplete().await?;
        let mut summary = ResumeSummary::default();
        for task in tasks {
            let id = task.id.clone();
            match self.inner.resume_task(task).await {
                Ok(ResumeAction::Reattached) => summary.resumed.push(id),
                Ok(ResumeAction::MarkedFailed) => summary.failed.push(id),
                Ok(ResumeAction::AlreadyRunning) => summary.skipped.push(id),
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Failed to resume task");
                    summary.skipped.push(id);
                }
            }
        }
        if summary.total() > 0 {
            info!(
                resumed = summary.resumed.len(),
                failed = summary.failed.len(),
                skipped = summary.skipped.len(),
                "Resumed incomplete tasks"
            );
        }
        Ok(summary)
    }

    /// Cancel a running task, optionally keeping what it produced so far.
    pub async fn cancel(&self, task_id: &str, save_partial: bool) -> Result<CancelResponse> {
        let inner = &self.inner;
        let task = inner.load(task_id).await?;
        if !task.status.is_running() {
            return Err(invalid_state(task_id, task.status, "cancel"));
        }
        let progress = task.progress;

        let mut partial_saved = false;
        let change = if save_partial {
            let existing = inner.store.get_result(task_id).await?;
            let record = existing.or_else(|| {
                inner
                    .partial_snapshot(task_id)
                    .map(|p| p.into_result(task_id))
            });
            match record {
                Some(mut record) => {
                    record.set_meta(meta::PARTIAL, true);
                    record.set_meta(meta::CANCELLED_AT_PROGRESS, progress);
                    partial_saved = true;
                    ResultChange::Save(record)
                }
                None => ResultChange::Keep,
            }
        } else {
            ResultChange::Discard
        };

        let update = TaskUpdate {
            current_action: Some(format!("Cancelled at {progress:.0}%")),
            ..Default::default()
        };
        let moved = inner
            .store
            .transition(task_id, TaskStatus::Cancelled, update, change)
            .await?;
        if moved.is_none() {
            let now = inner.load(task_id).await?;
            return Err(invalid_state(task_id, now.status, "cancel"));
        }

        inner.runner.cancel(task_id);
        lock(&inner.partials).remove(task_id);
        info!(task_id, progress, partial_saved, "Task cancelled");

        Ok(CancelResponse {
            task_id: task_id.to_string(),
            status: TaskStatus::Cancelled,
            progress_at_cancellation: progress,
            partial_saved,
        })
    }

    pub async fn get_status(&self, task_id: &str) -> Result<StatusReport> {
        let inner = &self.inner;
        inner.reconcile(task_id).await;
        let task = inner.load(task_id).await?;
        let pending = inner.pending_result(task_id).is_some();
        let (status, progress) = if pending {
            (TaskStatus::Completed, COMPLETE)
        } else {
            (task.status, task.progress)
        };

        let now = Utc::now();
        let (estimated_remaining_minutes, stall) = if status.is_running() {
            let history = inner.store.get_snapshots(task_id).await?;
            (
                inner.detector.estimate_remaining_minutes(&history),
                Some(inner.detector.analyze(&history, Some(task.created_at), now)),
            )
        } else {
            (None, None)
        };

        Ok(StatusReport {
            task_id: task.id.clone(),
            status,
            progress,
            current_action: task.current_action.clone(),
            model: task.model.clone(),
            remote_handle: task.remote_handle.clone(),
            tokens_in: task.tokens_in,
            tokens_out: task.tokens_out,
            cost_estimate: task.cost_estimate,
            elapsed_secs: task.elapsed_secs(task.completed_at.unwrap_or(now)),
            estimated_remaining_minutes,
            stall,
            error_message: task.error_message.clone(),
            polling: inner.runner.is_running(task_id),
            created_at: task.created_at,
            completed_at: task.completed_at,
        })
    }

    /// The stored result of a completed task.
    pub async fn get_result(&self, task_id: &str) -> Result<ResultRecord> {
        let inner = &self.inner;
        inner.reconcile(task_id).await;
        if let Some(result) = inner.pending_result(task_id) {
            return Ok(result);
        }
        let task = inner.load(task_id).await?;
        if task.status != TaskStatus::Completed {
            return Err(ResearchError::NotCompleted {
                task_id: task_id.to_string(),
                status: task.status.to_string(),
            }
            .into());
        }
        inner.store.get_result(task_id).await?.ok_or_else(|| {
            ResearchError::ResultMissing {
                task_id: task_id.to_string(),
            }
            .into()
        })
    }

    /// Whatever output a task has, finished or not.
    ///
    /// Prefers the stored result and falls back to the in-memory partial buffer.
    pub async fn get_partial_result(&self, task_id: &str) -> Result<Option<ResultRecord>> {
        let inner = &self.inner;
        inner.load(task_id).await?;
        if let Some(result) = inner.store.get_result(task_id).await? {
            return Ok(Some(result));
        }
        Ok(inner
            .partial_snapshot(task_id)
            .map(|p| p.into_result(task_id)))
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>> {
        Ok(self.inner.store.list_tasks(status, limit).await?)
    }

    /// Delete a task with its result and snapshots, stopping it first if running.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let inner = &self.inner;
        if inner.runner.cancel(task_id) {
            debug!(task_id, "Stopped running task before delete");
        }
        lock(&inner.partials).remove(task_id);
        lock(&inner.pending_finals).remove(task_id);
        let removed = inner.store.delete_task(task_id).await?;
        if removed {
            info!(task_id, "Task deleted");
        }
        Ok(removed)
    }

    pub fn estimate(&self, query: &str) -> CostEstimate {
        self.inner.estimator.estimate(query)
    }

    /// Ids of the tasks this process is polling.
    pub fn running_tasks(&self) -> Vec<String> {
        self.inner.runner.running_ids()
    }

    /// Stop every background unit without marking tasks cancelled.
    ///
    /// The tasks stay in their running states and are picked up again by
    /// [`resume_incomplete`](Self::resume_incomplete) on the next start.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let stopped = self.inner.runner.cancel_all(timeout).await;
        info!(stopped, "Orchestrator shut down");
        stopped
    }

    async fn response_from_store(&self, task_id: &str) -> Result<StartResponse> {
        let inner = &self.inner;
        inner.reconcile(task_id).await;
        let task = inner.load(task_id).await?;
        if let Some(result) = inner.pending_result(task_id) {
            return Ok(StartResponse {
                task_id: task.id,
                status: TaskStatus::Completed,
                result: Some(result),
                remote_handle: task.remote_handle,
                error: None,
            });
        }
        let result = if task.status == TaskStatus::Completed {
            inner.store.get_result(task_id).await?
        } else {
            None
        };
        Ok(StartResponse {
            task_id: task.id,
            status: task.status,
            result,
            remote_handle: task.remote_handle,
            error: task.error_message,
        })
    }
}

impl StartResponse {
    fn from_state(task_id: String, remote_handle: Option<String>, state: FinalState) -> Self {
        Self {
            task_id,
            status: state.status,
            result: state.result,
            remote_handle,
            error: state.error,
        }
    }
}

impl Inner {
    async fn load(&self, task_id: &str) -> Result<TaskRecord> {
        self.store.get_task(task_id).await?.ok_or_else(|| {
            ResearchError::NotFound {
                task_id: task_id.to_string(),
            }
            .into()
        })
    }

    fn pending_result(&self, task_id: &str) -> Option<ResultRecord> {
        lock(&self.pending_finals)
            .get(task_id)
            .map(|p| p.result.clone())
    }

    /// Hand a poll loop plus its terminal write to the runner.
    fn spawn_unit(
        self: &Arc<Self>,
        task_id: &str,
        remote_handle: &str,
        callback: Arc<dyn ProgressCallback>,
        outcome_tx: Option<oneshot::Sender<FinalState>>,
        sync_window: Option<Duration>,
    ) -> std::result::Result<(), RunnerError> {
        let inner = Arc::clone(self);
        let id = task_id.to_string();
        let handle = remote_handle.to_string();

        self.runner.start(
            task_id,
            move |token| async move {
                let run = AssertUnwindSafe(async {
                    let outcome = inner
                        .poll_loop(&id, &handle, &token, callback, sync_window)
                        .await?;
                    Ok::<_, DelveError>(inner.finalize(&id, &outcome).await)
                })
                .catch_unwind()
                .await;
                // The task is failed before the sync waiter can see the channel close.
                let err = match run {
                    Ok(Ok(state)) => return Ok(state),
                    Ok(Err(e)) => e,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(task_id = %id, %message, "Poll unit panicked");
                        DelveError::from(RunnerError::Panicked {
                            task_id: id.clone(),
                            message,
                        })
                    }
                };
                inner.abandon(&id, &err).await;
                Err(err)
            },
            move |state: FinalState| {
                if let Some(tx) = outcome_tx {
                    let _ = tx.send(state);
                }
            },
            |_err| {},
        )
    }

    async fn resume_task(self: &Arc<Self>, task: TaskRecord) -> Result<ResumeAction> {
        if !task.status.is_running() {
            return Err(invalid_state(&task.id, task.status, "resume"));
        }
        if self.runner.is_running(&task.id) {
            return Ok(ResumeAction::AlreadyRunning);
        }

        let Some(handle) = task.remote_handle.clone() else {
            let update = TaskUpdate {
                error_message: Some(INTERRUPTED_MESSAGE.to_string()),
                ..Default::default()
            };
            self.store
                .transition(&task.id, TaskStatus::Failed, update, ResultChange::Keep)
                .await?;
            warn!(task_id = %task.id, "Task had no remote handle, marked failed");
            return Ok(ResumeAction::MarkedFailed);
        };

        if task.status == TaskStatus::RunningSync {
            self.store
                .transition(
                    &task.id,
                    TaskStatus::RunningAsync,
                    TaskUpdate::default(),
                    ResultChange::Keep,
                )
                .await?;
        }

        match self.spawn_unit(&task.id, &handle, Arc::clone(&self.callback), None, None) {
            Ok(()) => {
                info!(task_id = %task.id, remote_handle = %handle, "Re-attached polling");
                Ok(ResumeAction::Reattached)
            }
            Err(RunnerError::AlreadyRunning { .. }) => Ok(ResumeAction::AlreadyRunning),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the end of a poll loop.
    async fn finalize(&self, task_id: &str, outcome: &PollOutcome) -> FinalState {
        let state = match outcome {
            PollOutcome::Completed(output) => self.complete(task_id, None, output.clone()).await,
            PollOutcome::Failed { message, partial } => {
                self.fail(task_id, message.clone(), partial.clone(), false)
                    .await
            }
            PollOutcome::TimedOut {
                elapsed_secs,
                max_wait_secs,
                partial,
            } => {
                debug!(task_id, elapsed_secs, "Failing timed out task");
                let message = ResearchError::Timeout {
                    task_id: task_id.to_string(),
                    max_wait_secs: *max_wait_secs,
                }
                .to_string();
                self.fail(task_id, message, partial.clone(), true).await
            }
            PollOutcome::Cancelled { .. } => {
                let status = match self.store.get_task(task_id).await {
                    Ok(Some(task)) => task.status,
                    _ => TaskStatus::Cancelled,
                };
                FinalState {
                    status,
                    result: None,
                    error: None,
                }
            }
        };
        if state.status.is_terminal() {
            lock(&self.partials).remove(task_id);
        }
        state
    }

    async fn complete(
        &self,
        task_id: &str,
        remote_handle: Option<String>,
        output: RemoteOutput,
    ) -> FinalState {
        let usage = output.usage;
        let mut result = ResultRecord::new(task_id, output.report);
        result.sources = output.sources;
        result.metadata = output.metadata;
        result.set_meta(meta::TOKENS_INPUT, usage.input_tokens);
        result.set_meta(meta::TOKENS_OUTPUT, usage.output_tokens);

        let update = TaskUpdate {
            remote_handle,
            progress: Some(COMPLETE),
            current_action: Some(phase_for(COMPLETE).to_string()),
            usage: Some(usage),
            cost_estimate: Some(
                self.config
                    .pricing
                    .cost(usage.input_tokens, usage.output_tokens),
            ),
            ..Default::default()
        };

        match self
            .store
            .transition(
                task_id,
                TaskStatus::Completed,
                update.clone(),
                ResultChange::Save(result.clone()),
            )
            .await
        {
            Ok(Some(previous)) => {
                info!(
                    task_id,
                    tokens_in = usage.input_tokens,
                    tokens_out = usage.output_tokens,
                    "Research completed"
                );
                self.notify_finished(task_id, previous, TaskStatus::Completed, None)
                    .await;
                FinalState {
                    status: TaskStatus::Completed,
                    result: Some(result),
                    error: None,
                }
            }
            Ok(None) => {
                let status = self.current_status(task_id).await;
                info!(task_id, %status, "Remote finished after the task left its running state");
                FinalState {
                    status,
                    result: None,
                    error: None,
                }
            }
            Err(e) => {
                error!(task_id, error = %e, "Failed to persist completed task, keeping it in memory");
                lock(&self.pending_finals).insert(
                    task_id.to_string(),
                    PendingFinal {
                        update,
                        result: result.clone(),
                    },
                );
                FinalState {
                    status: TaskStatus::Completed,
                    result: Some(result),
                    error: None,
                }
            }
        }
    }

    async fn fail(
        &self,
        task_id: &str,
        message: String,
        partial: Option<PartialOutput>,
        timed_out: bool,
    ) -> FinalState {
        let change = match partial {
            Some(partial) => {
                let mut record = partial.into_result(task_id);
                record.set_meta(meta::FAILURE_REASON, message.clone());
                if timed_out {
                    record.set_meta(meta::TIMED_OUT, true);
                }
                ResultChange::Save(record)
            }
            None => ResultChange::Keep,
        };
        let update = TaskUpdate {
            current_action: Some((if timed_out { "Timed out" } else { "Failed" }).to_string()),
            error_message: Some(message.clone()),
            ..Default::default()
        };

        match self
            .store
            .transition(task_id, TaskStatus::Failed, update, change)
            .await
        {
            Ok(Some(previous)) => {
                warn!(task_id, error = %message, timed_out, "Research failed");
                self.notify_finished(task_id, previous, TaskStatus::Failed, Some(&message))
                    .await;
                FinalState {
                    status: TaskStatus::Failed,
                    result: None,
                    error: Some(message),
                }
            }
            Ok(None) => FinalState {
                status: self.current_status(task_id).await,
                result: None,
                error: None,
            },
            Err(e) => {
                error!(task_id, error = %e, "Failed to persist task failure");
                FinalState {
                    status: TaskStatus::Failed,
                    result: None,
                    error: Some(message),
                }
            }
        }
    }

    /// Mark a task failed after its unit died without an outcome.
    async fn abandon(&self, task_id: &str, err: &DelveError) {
        if matches!(
            err,
            DelveError::Research(
                ResearchError::ConcurrencyViolation { .. } | ResearchError::NotFound { .. }
            )
        ) {
            return;
        }
        let update = TaskUpdate {
            error_message: Some(err.to_string()),
            ..Default::default()
        };
        if let Err(e) = self
            .store
            .transition(task_id, TaskStatus::Failed, update, ResultChange::Keep)
            .await
        {
            warn!(task_id, error = %e, "Could not mark abandoned task failed");
        }
        lock(&self.partials).remove(task_id);
    }

    /// Retry a terminal write that failed earlier.
    async fn reconcile(&self, task_id: &str) {
        let Some(pending) = lock(&self.pending_finals).get(task_id).cloned() else {
            return;
        };
        match self
            .store
            .transition(
                task_id,
                TaskStatus::Completed,
                pending.update,
                ResultChange::Save(pending.result),
            )
            .await
        {
            Ok(_) => {
                lock(&self.pending_finals).remove(task_id);
                info!(task_id, "Persisted deferred completion");
            }
            Err(e) => debug!(task_id, error = %e, "Deferred completion still not persisted"),
        }
    }

    async fn current_status(&self, task_id: &str) -> TaskStatus {
        match self.store.get_task(task_id).await {
            Ok(Some(task)) => task.status,
            _ => TaskStatus::Cancelled,
        }
    }

    /// Tell the user about a task that finished in the background.
    async fn notify_finished(
        &self,
        task_id: &str,
        previous: TaskStatus,
        status: TaskStatus,
        error: Option<&str>,
    ) {
        if previous != TaskStatus::RunningAsync || !self.config.notifications.enabled {
            return;
        }
        let Ok(Some(task)) = self.store.get_task(task_id).await else {
            return;
        };
        if !task.enable_notifications {
            return;
        }

        let ((title, body), urgency) = match status {
            TaskStatus::Completed => {
                let finished = task.completed_at.unwrap_or_else(Utc::now);
                let minutes = (finished - task.created_at).num_seconds().max(0) as f64 / 60.0;
                (completion_message(task_id, minutes), Urgency::Normal)
            }
            _ => (
                failure_message(task_id, error.unwrap_or("unknown error")),
                Urgency::Critical,
            ),
        };

        let delivered = AssertUnwindSafe(self.notifier.notify(&title, &body, urgency))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!(task_id, "Notifier panicked");
                false
            });
        debug!(task_id, delivered, "Notification dispatched");
    }
}

fn invalid_state(task_id: &str, status: TaskStatus, action: &str) -> DelveError {
    ResearchError::InvalidState {
        task_id: task_id.to_string(),
        status: status.to_string(),
        action: action.to_string(),
    }
    .into()
}

/// Trim a query and check it against the length limit.
fn validate_query(query: &str, max_chars: usize) -> std::result::Result<&str, ResearchError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(ResearchError::Validation {
            message: "Query must not be empty".to_string(),
        });
    }
    let chars = query.chars().count();
    if chars > max_chars {
        return Err(ResearchError::Validation {
            message: format!("Query is {chars} characters; the limit is {max_chars}"),
        });
    }
    Ok(query)
}

/// Check a per-task wall-clock ceiling.
fn validate_max_wait(secs: u64) -> std::result::Result<u64, ResearchError> {
    if secs == 0 || secs > MAX_WAIT_LIMIT_SECS {
        return Err(ResearchError::Validation {
            message: format!(
                "max_wait_secs must be between 1 and {MAX_WAIT_LIMIT_SECS}, got {secs}"
            ),
        });
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_query_trims() {
        assert_eq!(validate_query("  what is rust?  ", 100).unwrap(), "what is rust?");
    }

    #[test]
    fn test_validate_query_rejects_blank_and_long() {
        assert!(matches!(
            validate_query(" \n\t ", 100),
            Err(ResearchError::Validation { .. })
        ));
        let err = validate_query(&"é".repeat(11), 10).unwrap_err();
        assert!(err.to_string().contains("11 characters"));
        assert!(validate_query(&"é".repeat(10), 10).is_ok());
    }

    #[test]
    fn test_validate_max_wait_bounds() {
        assert!(validate_max_wait(0).is_err());
        assert!(validate_max_wait(u64::MAX).is_err());
        assert!(validate_max_wait(MAX_WAIT_LIMIT_SECS + 1).is_err());
        assert_eq!(validate_max_wait(3600).unwrap(), 3600);
    }

    #[test]
    fn test_invalid_state_message() {
        let err = invalid_state("abc", TaskStatus::Completed, "cancel");
        assert_eq!(
            err.to_string(),
            "Research error: Cannot cancel task abc in state 'completed'"
        );
    }

    #[test]
    fn test_resume_summary_total() {
        let summary = ResumeSummary {
            resumed: vec!["a".into()],
            failed: vec!["b".into(), "c".into()],
            skipped: vec![],
        };
        assert_eq!(summary.total(), 3);
    }
}
