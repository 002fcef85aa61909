//! Background task runner - at most one in-flight unit per task id.
//!
//! Each unit is a `tokio::spawn`ed future handed a [`CancellationToken`]. The map entry
//! for a task is removed whenever its unit ends, whether it returned, panicked, or
//! was aborted, so a finished task can always be started again.

use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DelveError, RunnerError};

struct RunningUnit {
    token: CancellationToken,
    abort: Option<tokio::task::AbortHandle>,
    handle: Option<tokio::task::JoinHandle<()>>,
    generation: u64,
}

type UnitMap = Arc<Mutex<HashMap<String, RunningUnit>>>;

/// Removes a unit's map entry when dropped, unless a newer unit has taken the slot.
struct EntryGuard {
    units: UnitMap,
    task_id: String,
    generation: u64,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        let mut units = lock(&self.units);
        if units
            .get(&self.task_id)
            .is_some_and(|u| u.generation == self.generation)
        {
            units.remove(&self.task_id);
            debug!(task_id = %self.task_id, "Runner entry removed");
        }
    }
}

fn lock(units: &UnitMap) -> MutexGuard<'_, HashMap<String, RunningUnit>> {
    units.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the background units of all running tasks.
#[derive(Clone, Default)]
pub struct TaskRunner {
    units: UnitMap,
    generation: Arc<AtomicU64>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `unit` for `task_id`.
    ///
    /// Refuses if the task already has an unfinished unit. `on_complete` receives the
    /// unit's value and `on_error` its error (or a panic, reported as
    /// [`RunnerError::Panicked`]). Panics inside either callback are logged and dropped.
    pub fn start<F, Fut, T, C, E>(
        &self,
        task_id: &str,
        unit: F,
        on_complete: C,
        on_error: E,
    ) -> Result<(), RunnerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, DelveError>> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(T) + Send + 'static,
        E: FnOnce(DelveError) + Send + 'static,
    {
        let mut units = lock(&self.units);
        if units.contains_key(task_id) {
            return Err(RunnerError::AlreadyRunning {
                task_id: task_id.to_string(),
            });
        }

        let token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let guard = EntryGuard {
            units: Arc::clone(&self.units),
            task_id: task_id.to_string(),
            generation,
        };
        let fut = unit(token.clone());
        let id = task_id.to_string();

        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;
            drop(guard);
            let callback = match outcome {
                Ok(Ok(value)) => {
                    std::panic::catch_unwind(AssertUnwindSafe(move || on_complete(value)))
                }
                Ok(Err(err)) => {
                    warn!(task_id = %id, error = %err, "Background unit failed");
                    std::panic::catch_unwind(AssertUnwindSafe(move || on_error(err)))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(task_id = %id, %message, "Background unit panicked");
                    let err = DelveError::from(RunnerError::Panicked {
                        task_id: id.clone(),
                        message,
                    });
                    std::panic::catch_unwind(AssertUnwindSafe(move || on_error(err)))
                }
            };
            if callback.is_err() {
                error!(task_id = %id, "Completion callback panicked");
            }
        });

        units.insert(
            task_id.to_string(),
            RunningUnit {
                token,
                abort: Some(handle.abort_handle()),
                handle: Some(handle),
                generation,
            },
        );
        debug!(task_id, generation, "Runner unit started");
        Ok(())
    }

    /// Signal one task's unit to stop. Returns `false` if it has no unit.
    pub fn cancel(&self, task_id: &str) -> bool {
        match lock(&self.units).get(task_id) {
            Some(unit) => {
                unit.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        lock(&self.units).contains_key(task_id)
    }

    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.units).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.units).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until the task's unit has finished, polling at `interval`.
    pub async fn wait_for(&self, task_id: &str, interval: Duration) {
        while self.is_running(task_id) {
            tokio::time::sleep(interval).await;
        }
    }

    /// Signal every unit, wait up to `timeout` for them to finish, then abort the rest.
    ///
    /// Returns how many units were signalled.
    pub async fn cancel_all(&self, timeout: Duration) -> usize {
        let (handles, aborts): (Vec<_>, Vec<_>) = {
            let mut units = lock(&self.units);
            units
                .values_mut()
                .map(|unit| {
                    unit.token.cancel();
                    (unit.handle.take(), unit.abort.take())
                })
                .unzip()
        };
        let count = handles.len();
        if count == 0 {
            return 0;
        }
        info!(count, "Cancelling background units");

        let handles: Vec<_> = handles.into_iter().flatten().collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Units did not stop in time, aborting"
            );
            for abort in aborts.into_iter().flatten() {
                abort.abort();
            }
        }
        count
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
