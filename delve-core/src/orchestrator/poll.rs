//! The per-task poll loop and its supporting types.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Inner;
use crate::error::{DelveError, ResearchError};
use crate::progress::phase_for;
use crate::remote::{RemoteOutput, RemoteState};
use crate::stall::StallVerdict;
use crate::store::TaskUpdate;
use crate::types::{ProgressSnapshot, ResultRecord, meta};

/// Output captured from an operation that did not finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialOutput {
    pub text: String,
    pub chunks: usize,
}

impl PartialOutput {
    /// Build a result row flagged as partial.
    pub fn into_result(self, task_id: &str) -> ResultRecord {
        let mut result = ResultRecord::new(task_id, self.text);
        result.set_meta(meta::PARTIAL, true);
        result.set_meta(meta::CHUNKS_CAPTURED, self.chunks);
        result
    }
}

/// Partial text accumulated across polls.
#[derive(Debug, Clone, Default)]
pub(super) struct PartialBuffer {
    chunks: Vec<String>,
}

impl PartialBuffer {
    pub(super) fn push(&mut self, chunk: String) {
        self.chunks.push(chunk);
    }

    pub(super) fn snapshot(&self) -> Option<PartialOutput> {
        if self.chunks.is_empty() {
            return None;
        }
        Some(PartialOutput {
            text: self.chunks.concat(),
            chunks: self.chunks.len(),
        })
    }
}

/// How a poll loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(RemoteOutput),
    Failed {
        message: String,
        partial: Option<PartialOutput>,
    },
    TimedOut {
        elapsed_secs: u64,
        max_wait_secs: u64,
        partial: Option<PartialOutput>,
    },
    Cancelled {
        progress: f64,
        partial: Option<PartialOutput>,
    },
}

/// What a caller sees on every poll tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub progress: f64,
    pub action: String,
    pub remote_status: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub elapsed_secs: f64,
    /// Advisory stall verdict for this tick.
    pub stall: StallVerdict,
}

/// Receives progress updates while a task is polled.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate) -> anyhow::Result<()>;
}

/// Callback that ignores every update.
pub struct NoOpProgressCallback;

impl ProgressCallback for NoOpProgressCallback {
    fn on_progress(&self, _update: &ProgressUpdate) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<F> ProgressCallback for F
where
    F: Fn(&ProgressUpdate) -> anyhow::Result<()> + Send + Sync,
{
    fn on_progress(&self, update: &ProgressUpdate) -> anyhow::Result<()> {
        self(update)
    }
}

/// Claim on a task id for the duration of one poll loop.
pub(super) struct PollGuard {
    polling: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl PollGuard {
    pub(super) fn claim(
        polling: &Arc<Mutex<HashSet<String>>>,
        task_id: &str,
    ) -> Result<Self, ResearchError> {
        let mut set = polling.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(task_id.to_string()) {
            return Err(ResearchError::ConcurrencyViolation {
                task_id: task_id.to_string(),
            });
        }
        Ok(Self {
            polling: Arc::clone(polling),
            task_id: task_id.to_string(),
        })
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.polling
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.task_id);
    }
}

fn emit(callback: &dyn ProgressCallback, update: &ProgressUpdate) {
    match std::panic::catch_unwind(AssertUnwindSafe(|| callback.on_progress(update))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task_id = %update.task_id, error = %e, "Progress callback failed"),
        Err(_) => warn!(task_id = %update.task_id, "Progress callback panicked"),
    }
}

impl Inner {
    /// Poll `remote_handle` until it finishes, the ceiling passes, or `cancel` fires.
    ///
    /// While `sync_window` has not elapsed the faster sync interval is used.
    pub(super) async fn poll_loop(
        &self,
        task_id: &str,
        remote_handle: &str,
        cancel: &CancellationToken,
        callback: Arc<dyn ProgressCallback>,
        sync_window: Option<Duration>,
    ) -> Result<PollOutcome, DelveError> {
        let _guard = PollGuard::claim(&self.polling, task_id)?;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound {
                task_id: task_id.to_string(),
            })?;

        let research = &self.config.research;
        let limit = self.config.store.snapshot_limit.max(2);
        let mut history = self.store.get_snapshots(task_id).await?;
        let mut progress = task.progress;
        let mut usage = task.usage();
        // A ceiling too large to represent means there is none.
        let deadline = i64::try_from(task.max_wait_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|budget| task.created_at.checked_add_signed(budget));
        let started = Instant::now();
        let mut was_hanging = false;

        info!(
            task_id,
            remote_handle,
            seeded_snapshots = history.len(),
            "Polling remote operation"
        );

        loop {
            if cancel.is_cancelled() {
                debug!(task_id, "Poll loop cancelled");
                return Ok(PollOutcome::Cancelled {
                    progress,
                    partial: self.partial_snapshot(task_id),
                });
            }

            let now = Utc::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                let elapsed_secs = task.elapsed_secs(now) as u64;
                warn!(task_id, elapsed_secs, "Task exceeded its wall-clock ceiling");
                return Ok(PollOutcome::TimedOut {
                    elapsed_secs,
                    max_wait_secs: task.max_wait_secs,
                    partial: self.partial_snapshot(task_id),
                });
            }

            let polled = self.remote.get_status(remote_handle).await;
            if cancel.is_cancelled() {
                debug!(task_id, "Poll loop cancelled during a status call");
                return Ok(PollOutcome::Cancelled {
                    progress,
                    partial: self.partial_snapshot(task_id),
                });
            }

            match polled {
                Ok(status) => {
                    if let Some(chunk) = status.partial_chunk.clone() {
                        self.partials
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .entry(task_id.to_string())
                            .or_default()
                            .push(chunk);
                    }
                    if let Some(u) = status.usage {
                        usage = u;
                    }

                    match status.state {
                        RemoteState::Completed => {
                            return Ok(match status.output {
                                Some(output) => PollOutcome::Completed(output),
                                None => PollOutcome::Failed {
                                    message: "remote reported completion without output".into(),
                                    partial: self.partial_snapshot(task_id),
                                },
                            });
                        }
                        RemoteState::Failed => {
                            let message = status
                                .error
                                .unwrap_or_else(|| format!("remote status '{}'", status.status));
                            warn!(task_id, %message, "Remote operation failed");
                            return Ok(PollOutcome::Failed {
                                message,
                                partial: self.partial_snapshot(task_id),
                            });
                        }
                        RemoteState::InProgress => {}
                    }

                    let elapsed = (now - task.created_at).to_std().unwrap_or_default();
                    progress = self.curve.advance(progress, elapsed);
                    let action = status
                        .detail
                        .clone()
                        .unwrap_or_else(|| phase_for(progress).to_string());

                    let snapshot = ProgressSnapshot::new(
                        task_id,
                        now,
                        progress,
                        Some(action.clone()),
                        Some(status.status.clone()),
                    );
                    let update = TaskUpdate {
                        progress: Some(progress),
                        current_action: Some(action.clone()),
                        usage: Some(usage),
                        cost_estimate: Some(
                            self.config
                                .pricing
                                .cost(usage.input_tokens, usage.output_tokens),
                        ),
                        ..Default::default()
                    };
                    match self.store.record_progress(&snapshot, update).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(task_id, "Task left its running state, stopping poll loop");
                            return Ok(PollOutcome::Cancelled {
                                progress,
                                partial: self.partial_snapshot(task_id),
                            });
                        }
                        Err(e) => warn!(task_id, error = %e, "Failed to record task progress"),
                    }

                    history.push(snapshot);
                    if history.len() > limit {
                        let excess = history.len() - limit;
                        history.drain(..excess);
                    }

                    let verdict = self.detector.analyze(&history, Some(task.created_at), now);
                    if verdict.is_hanging && !was_hanging {
                        warn!(
                            task_id,
                            kind = %verdict.kind,
                            confidence = verdict.confidence,
                            reason = %verdict.reason,
                            "Task appears to be hanging"
                        );
                    }
                    was_hanging = verdict.is_hanging;

                    emit(
                        callback.as_ref(),
                        &ProgressUpdate {
                            task_id: task_id.to_string(),
                            progress,
                            action,
                            remote_status: status.status,
                            tokens_in: usage.input_tokens,
                            tokens_out: usage.output_tokens,
                            elapsed_secs: task.elapsed_secs(now),
                            stall: verdict,
                        },
                    );
                }
                Err(e) => {
                    warn!(
                        task_id,
                        error = %e,
                        transient = e.is_transient(),
                        "Status poll failed, will retry"
                    );
                }
            }

            let interval = match sync_window {
                Some(window) if started.elapsed() < window => research.sync_poll_interval(),
                _ => research.poll_interval(),
            };
            let remaining = deadline
                .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or_default())
                .unwrap_or(interval);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(interval.min(remaining)) => {}
            }
        }
    }

    pub(super) fn partial_snapshot(&self, task_id: &str) -> Option<PartialOutput> {
        self.partials
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(task_id)
            .and_then(PartialBuffer::snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_buffer_concatenates_chunks() {
        let mut buffer = PartialBuffer::default();
        assert!(buffer.snapshot().is_none());
        buffer.push("Intro. ".into());
        buffer.push("Body.".into());
        let partial = buffer.snapshot().unwrap();
        assert_eq!(partial.text, "Intro. Body.");
        assert_eq!(partial.chunks, 2);

        let result = partial.into_result("t1");
        assert!(result.is_partial());
        assert_eq!(result.metadata[meta::CHUNKS_CAPTURED], 2);
    }

    #[test]
    fn test_poll_guard_is_exclusive_and_released() {
        let polling = Arc::new(Mutex::new(HashSet::new()));
        let first = PollGuard::claim(&polling, "t1").unwrap();
        assert!(matches!(
            PollGuard::claim(&polling, "t1"),
            Err(ResearchError::ConcurrencyViolation { .. })
        ));
        assert!(PollGuard::claim(&polling, "t2").is_ok());
        drop(first);
        assert!(PollGuard::claim(&polling, "t1").is_ok());
    }

    #[test]
    fn test_closure_callback_errors_are_swallowed() {
        let cb = |_: &ProgressUpdate| -> anyhow::Result<()> { anyhow::bail!("ui went away") };
        let update = ProgressUpdate {
            task_id: "t1".into(),
            progress: 10.0,
            action: "Searching".into(),
            remote_status: "in_progress".into(),
            tokens_in: 0,
            tokens_out: 0,
            elapsed_secs: 1.0,
            stall: crate::stall::StallDetector::default().analyze(&[], None, Utc::now()),
        };
        emit(&cb, &update);
        let panicking = |_: &ProgressUpdate| -> anyhow::Result<()> { panic!("boom") };
        emit(&panicking, &update);
    }
}
