//! SQLite-backed durable store for research tasks, results, and progress snapshots.
//!
//! All access goes through a single connection guarded by a mutex and executed on the
//! blocking pool. Transient `SQLITE_BUSY` / `SQLITE_LOCKED` failures are retried with
//! exponential backoff as configured in [`StoreConfig`]; every other error is returned
//! to the caller unchanged.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{ToSqlOutput, Type, Value};
use rusqlite::{Connection, OptionalExtension, ToSql, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::types::{ProgressSnapshot, ResultRecord, Source, TaskRecord, TaskStatus, TokenUsage};

/// Columns that may be written through [`ResearchStore::update_fields`].
pub const ALLOWED_UPDATE_COLUMNS: &[&str] = &[
    "remote_handle",
    "progress",
    "current_action",
    "enable_notifications",
    "max_wait_secs",
    "tokens_in",
    "tokens_out",
    "cost_estimate",
    "error_message",
];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS research_tasks (
    id TEXT PRIMARY KEY,
    remote_handle TEXT,
    query TEXT NOT NULL,
    model TEXT NOT NULL,
    status TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    current_action TEXT,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cost_estimate REAL NOT NULL DEFAULT 0,
    enable_notifications INTEGER NOT NULL DEFAULT 1,
    max_wait_secs INTEGER NOT NULL,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_research_tasks_status ON research_tasks(status);
CREATE INDEX IF NOT EXISTS idx_research_tasks_created ON research_tasks(created_at);

CREATE TABLE IF NOT EXISTS research_results (
    task_id TEXT PRIMARY KEY REFERENCES research_tasks(id) ON DELETE CASCADE,
    report TEXT NOT NULL,
    sources TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS progress_snapshots (
    task_id TEXT NOT NULL REFERENCES research_tasks(id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    progress REAL NOT NULL,
    action TEXT,
    remote_status TEXT,
    PRIMARY KEY (task_id, timestamp)
);
";

const TASK_COLUMNS: &str = "id, remote_handle, query, model, status, progress, current_action, \
     tokens_in, tokens_out, cost_estimate, enable_notifications, max_wait_secs, error_message, \
     created_at, updated_at, completed_at";

/// A value bound to a column in an update-by-field call.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            FieldValue::Null => Ok(ToSqlOutput::Owned(Value::Null)),
            FieldValue::Text(s) => s.to_sql(),
            FieldValue::Integer(i) => i.to_sql(),
            FieldValue::Real(f) => f.to_sql(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<Option<String>> for FieldValue {
    fn from(v: Option<String>) -> Self {
        v.map_or(FieldValue::Null, FieldValue::Text)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Real(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Integer(i64::from(v))
    }
}

impl From<TaskStatus> for FieldValue {
    fn from(v: TaskStatus) -> Self {
        FieldValue::Text(v.as_str().to_string())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Text(fmt_ts(v))
    }
}

/// Typed partial update for a task's mutable fields.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub remote_handle: Option<String>,
    pub progress: Option<f64>,
    pub current_action: Option<String>,
    pub usage: Option<TokenUsage>,
    pub cost_estimate: Option<f64>,
    pub enable_notifications: Option<bool>,
    pub error_message: Option<String>,
}

impl TaskUpdate {
    pub fn progress(progress: f64, action: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            current_action: Some(action.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        let mut fields = Vec::new();
        if let Some(ref handle) = self.remote_handle {
            fields.push(("remote_handle", FieldValue::from(handle.as_str())));
        }
        if let Some(progress) = self.progress {
            fields.push(("progress", FieldValue::from(progress)));
        }
        if let Some(ref action) = self.current_action {
            fields.push(("current_action", FieldValue::from(action.as_str())));
        }
        if let Some(usage) = self.usage {
            fields.push(("tokens_in", FieldValue::from(usage.input_tokens)));
            fields.push(("tokens_out", FieldValue::from(usage.output_tokens)));
        }
        if let Some(cost) = self.cost_estimate {
            fields.push(("cost_estimate", FieldValue::from(cost)));
        }
        if let Some(notify) = self.enable_notifications {
            fields.push(("enable_notifications", FieldValue::from(notify)));
        }
        if let Some(ref message) = self.error_message {
            fields.push(("error_message", FieldValue::from(message.as_str())));
        }
        fields
    }
}

/// What a status transition does to the task's result row.
#[derive(Debug, Clone, Default)]
pub enum ResultChange {
    #[default]
    Keep,
    Save(ResultRecord),
    Discard,
}

/// SQLite store shared by the orchestrator, the runner units, and the CLI.
#[derive(Clone)]
pub struct ResearchStore {
    conn: Arc<Mutex<Connection>>,
    config: StoreConfig,
}

impl ResearchStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
            }
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_connection(conn, config)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(config: StoreConfig) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(conn: Connection, config: StoreConfig) -> Result<Self, StoreError> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Run `f` against the connection on the blocking pool, retrying busy errors.
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let conn = Arc::clone(&self.conn);
            let job = Arc::clone(&f);
            let outcome = tokio::task::spawn_blocking(move || {
                let mut guard = conn.lock().map_err(|_| StoreError::Worker {
                    message: "connection mutex poisoned".into(),
                })?;
                job(&mut guard)
            })
            .await
            .map_err(|e| StoreError::Worker {
                message: e.to_string(),
            })?;

            match outcome {
                Err(err) if err.is_busy() => {
                    if attempt >= self.config.retry_max_attempts {
                        warn!(op, attempts = attempt, "Database still busy, giving up");
                        return Err(StoreError::Busy { attempts: attempt });
                    }
                    let delay = self.config.backoff_delay(attempt);
                    debug!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Database busy, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    // --- Tasks ---

    pub async fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let task = task.clone();
        self.run("create_task", move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO research_tasks ({TASK_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    task.id,
                    task.remote_handle,
                    task.query,
                    task.model,
                    task.status.as_str(),
                    task.progress,
                    task.current_action,
                    to_i64(task.tokens_in),
                    to_i64(task.tokens_out),
                    task.cost_estimate,
                    task.enable_notifications,
                    to_i64(task.max_wait_secs),
                    task.error_message,
                    fmt_ts(task.created_at),
                    fmt_ts(task.updated_at),
                    task.completed_at.map(fmt_ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let task_id = task_id.to_string();
        self.run("get_task", move |conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM research_tasks WHERE id = ?1"),
                    params![task_id],
                    row_to_task,
                )
                .optional()?;
            Ok(task)
        })
        .await
    }

    /// Most recently created tasks first, optionally filtered by status.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run("list_tasks", move |conn| {
            let tasks = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM research_tasks WHERE status = ?1 \
                         ORDER BY created_at DESC LIMIT ?2"
                    ))?;
                    stmt.query_map(params![status.as_str(), limit], row_to_task)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM research_tasks \
                         ORDER BY created_at DESC LIMIT ?1"
                    ))?;
                    stmt.query_map(params![limit], row_to_task)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(tasks)
        })
        .await
    }

    /// Tasks left in a running state, oldest first. Each carries its remote handle, if any.
    pub async fn list_incomplete(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.run("list_incomplete", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM research_tasks WHERE status IN (?1, ?2) \
                 ORDER BY created_at ASC"
            ))?;
            let tasks = stmt
                .query_map(
                    params![
                        TaskStatus::RunningSync.as_str(),
                        TaskStatus::RunningAsync.as_str()
                    ],
                    row_to_task,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
        .await
    }

    /// Update arbitrary columns by name. Only [`ALLOWED_UPDATE_COLUMNS`] are accepted;
    /// if any name is outside that set nothing is written.
    ///
    /// Returns `false` when no task has the given id.
    pub async fn update_fields(
        &self,
        task_id: &str,
        fields: Vec<(String, FieldValue)>,
    ) -> Result<bool, StoreError> {
        let invalid: Vec<String> = fields
            .iter()
            .filter(|(name, _)| !ALLOWED_UPDATE_COLUMNS.contains(&name.as_str()))
            .map(|(name, _)| name.clone())
            .collect();
        if !invalid.is_empty() {
            return Err(StoreError::InvalidField { fields: invalid });
        }
        if fields.is_empty() {
            return Ok(self.get_task(task_id).await?.is_some());
        }
        let task_id = task_id.to_string();
        self.run("update_fields", move |conn| {
            let borrowed: Vec<(&str, FieldValue)> = fields
                .iter()
                .map(|(name, value)| (name.as_str(), value.clone()))
                .collect();
            Ok(apply_update(conn, &task_id, &borrowed, &[])? > 0)
        })
        .await
    }

    /// Apply a typed update. Returns `false` when no task has the given id.
    pub async fn update_task(&self, task_id: &str, update: TaskUpdate) -> Result<bool, StoreError> {
        let task_id = task_id.to_string();
        self.run("update_task", move |conn| {
            Ok(apply_update(conn, &task_id, &update.fields(), &[])? > 0)
        })
        .await
    }

    /// Move a task to `to` if its current status allows it, in one transaction.
    ///
    /// Terminal transitions also stamp `completed_at` and clear the task's snapshots.
    /// Returns the previous status, or `None` if the task is missing or the transition
    /// is not allowed from its current state (nothing is written in that case).
    pub async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        update: TaskUpdate,
        result: ResultChange,
    ) -> Result<Option<TaskStatus>, StoreError> {
        let task_id = task_id.to_string();
        self.run("transition", move |conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM research_tasks WHERE id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Ok(None);
            };
            let from = TaskStatus::parse(&current).ok_or_else(|| StoreError::Corrupt {
                message: format!("unknown status '{current}' for task {task_id}"),
            })?;
            if !from.can_transition_to(to) {
                return Ok(None);
            }

            let now = Utc::now();
            let mut fields = update.fields();
            fields.push(("status", FieldValue::from(to)));
            if to.is_terminal() {
                fields.push(("completed_at", FieldValue::from(now)));
            }
            if apply_update(&tx, &task_id, &fields, &[from])? == 0 {
                return Ok(None);
            }

            match &result {
                ResultChange::Keep => {}
                ResultChange::Save(record) => insert_result(&tx, &task_id, record)?,
                ResultChange::Discard => {
                    tx.execute(
                        "DELETE FROM research_results WHERE task_id = ?1",
                        params![task_id],
                    )?;
                }
            }
            if to.is_terminal() {
                tx.execute(
                    "DELETE FROM progress_snapshots WHERE task_id = ?1",
                    params![task_id],
                )?;
            }
            tx.commit()?;
            Ok(Some(from))
        })
        .await
    }

    /// Delete a task. Its result and snapshots go with it.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let task_id = task_id.to_string();
        self.run("delete_task", move |conn| {
            let removed = conn.execute("DELETE FROM research_tasks WHERE id = ?1", params![task_id])?;
            Ok(removed > 0)
        })
        .await
    }

    // --- Results ---

    /// Insert or replace the result for a task.
    pub async fn save_result(&self, result: &ResultRecord) -> Result<(), StoreError> {
        let result = result.clone();
        self.run("save_result", move |conn| {
            insert_result(conn, &result.task_id, &result)?;
            Ok(())
        })
        .await
    }

    pub async fn get_result(&self, task_id: &str) -> Result<Option<ResultRecord>, StoreError> {
        let task_id = task_id.to_string();
        self.run("get_result", move |conn| {
            let result = conn
                .query_row(
                    "SELECT task_id, report, sources, metadata, created_at \
                     FROM research_results WHERE task_id = ?1",
                    params![task_id],
                    row_to_result,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    pub async fn delete_result(&self, task_id: &str) -> Result<bool, StoreError> {
        let task_id = task_id.to_string();
        self.run("delete_result", move |conn| {
            let removed = conn.execute(
                "DELETE FROM research_results WHERE task_id = ?1",
                params![task_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    // --- Progress snapshots ---

    /// Append a snapshot and prune the task's history to the configured limit.
    pub async fn append_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<(), StoreError> {
        let snapshot = snapshot.clone();
        let limit = i64::try_from(self.config.snapshot_limit).unwrap_or(i64::MAX);
        self.run("append_snapshot", move |conn| {
            let tx = conn.transaction()?;
            insert_snapshot(&tx, &snapshot, limit)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Record one poll tick: apply `update` and append `snapshot`, but only while the
    /// task is still running. Returns `false` (and writes nothing) once the task is
    /// terminal or gone.
    pub async fn record_progress(
        &self,
        snapshot: &ProgressSnapshot,
        update: TaskUpdate,
    ) -> Result<bool, StoreError> {
        let snapshot = snapshot.clone();
        let limit = i64::try_from(self.config.snapshot_limit).unwrap_or(i64::MAX);
        self.run("record_progress", move |conn| {
            let tx = conn.transaction()?;
            let running = [TaskStatus::RunningSync, TaskStatus::RunningAsync];
            if apply_update(&tx, &snapshot.task_id, &update.fields(), &running)? == 0 {
                return Ok(false);
            }
            insert_snapshot(&tx, &snapshot, limit)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Snapshot history for a task, oldest first.
    pub async fn get_snapshots(&self, task_id: &str) -> Result<Vec<ProgressSnapshot>, StoreError> {
        let task_id = task_id.to_string();
        self.run("get_snapshots", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, timestamp, progress, action, remote_status \
                 FROM progress_snapshots WHERE task_id = ?1 ORDER BY timestamp ASC",
            )?;
            let snapshots = stmt
                .query_map(params![task_id], row_to_snapshot)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(snapshots)
        })
        .await
    }

    pub async fn clear_snapshots(&self, task_id: &str) -> Result<usize, StoreError> {
        let task_id = task_id.to_string();
        self.run("clear_snapshots", move |conn| {
            Ok(conn.execute(
                "DELETE FROM progress_snapshots WHERE task_id = ?1",
                params![task_id],
            )?)
        })
        .await
    }

    pub async fn count_snapshots(&self, task_id: &str) -> Result<usize, StoreError> {
        let task_id = task_id.to_string();
        self.run("count_snapshots", move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM progress_snapshots WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }
}

/// Apply `fields` plus `updated_at` to one task. A non-empty `expected` restricts the
/// write to tasks currently in one of those states.
fn apply_update(
    conn: &Connection,
    task_id: &str,
    fields: &[(&str, FieldValue)],
    expected: &[TaskStatus],
) -> Result<usize, StoreError> {
    let mut assignments: Vec<String> = fields
        .iter()
        .enumerate()
        .map(|(i, (name, _))| format!("{name} = ?{}", i + 1))
        .collect();
    let mut values: Vec<FieldValue> = fields.iter().map(|(_, v)| v.clone()).collect();

    values.push(FieldValue::from(Utc::now()));
    assignments.push(format!("updated_at = ?{}", values.len()));

    values.push(FieldValue::from(task_id));
    let mut sql = format!(
        "UPDATE research_tasks SET {} WHERE id = ?{}",
        assignments.join(", "),
        values.len()
    );
    if !expected.is_empty() {
        let placeholders: Vec<String> = expected
            .iter()
            .map(|status| {
                values.push(FieldValue::from(*status));
                format!("?{}", values.len())
            })
            .collect();
        sql.push_str(&format!(" AND status IN ({})", placeholders.join(", ")));
    }

    let params: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
    Ok(conn.execute(&sql, params.as_slice())?)
}

fn insert_snapshot(
    conn: &Connection,
    snapshot: &ProgressSnapshot,
    limit: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO progress_snapshots \
         (task_id, timestamp, progress, action, remote_status) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            snapshot.task_id,
            fmt_ts(snapshot.timestamp),
            snapshot.progress,
            snapshot.action,
            snapshot.remote_status,
        ],
    )?;
    conn.execute(
        "DELETE FROM progress_snapshots WHERE task_id = ?1 AND timestamp NOT IN \
         (SELECT timestamp FROM progress_snapshots WHERE task_id = ?1 \
          ORDER BY timestamp DESC LIMIT ?2)",
        params![snapshot.task_id, limit],
    )?;
    Ok(())
}

fn insert_result(conn: &Connection, task_id: &str, result: &ResultRecord) -> Result<(), StoreError> {
    let sources = serde_json::to_string(&result.sources).map_err(|e| StoreError::Corrupt {
        message: format!("sources not serializable: {e}"),
    })?;
    let metadata = serde_json::to_string(&result.metadata).map_err(|e| StoreError::Corrupt {
        message: format!("metadata not serializable: {e}"),
    })?;
    conn.execute(
        "INSERT OR REPLACE INTO research_results (task_id, report, sources, metadata, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![task_id, result.report, sources, metadata, fmt_ts(result.created_at)],
    )?;
    Ok(())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status: String = row.get(4)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        remote_handle: row.get(1)?,
        query: row.get(2)?,
        model: row.get(3)?,
        status: TaskStatus::parse(&status).ok_or_else(|| {
            conversion_error(4, format!("unknown task status '{status}'"))
        })?,
        progress: row.get(5)?,
        current_action: row.get(6)?,
        tokens_in: from_i64(row.get(7)?),
        tokens_out: from_i64(row.get(8)?),
        cost_estimate: row.get(9)?,
        enable_notifications: row.get(10)?,
        max_wait_secs: from_i64(row.get(11)?),
        error_message: row.get(12)?,
        created_at: parse_ts(13, &row.get::<_, String>(13)?)?,
        updated_at: parse_ts(14, &row.get::<_, String>(14)?)?,
        completed_at: row
            .get::<_, Option<String>>(15)?
            .map(|s| parse_ts(15, &s))
            .transpose()?,
    })
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResultRecord> {
    let sources: String = row.get(2)?;
    let metadata: String = row.get(3)?;
    Ok(ResultRecord {
        task_id: row.get(0)?,
        report: row.get(1)?,
        sources: serde_json::from_str::<Vec<Source>>(&sources)
            .map_err(|e| conversion_error(2, e.to_string()))?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(3, e.to_string()))?,
        created_at: parse_ts(4, &row.get::<_, String>(4)?)?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgressSnapshot> {
    Ok(ProgressSnapshot {
        task_id: row.get(0)?,
        timestamp: parse_ts(1, &row.get::<_, String>(1)?)?,
        progress: row.get(2)?,
        action: row.get(3)?,
        remote_status: row.get(4)?,
    })
}

/// Fixed-width RFC 3339 so lexical order matches time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_i64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::meta;
    use chrono::Duration as ChronoDuration;

    fn store() -> ResearchStore {
        ResearchStore::open_in_memory(StoreConfig::default()).unwrap()
    }

    async fn running_task(store: &ResearchStore) -> TaskRecord {
        let task = TaskRecord::new("history of the transistor", "model-x", 3600);
        store.create_task(&task).await.unwrap();
        store
            .transition(
                &task.id,
                TaskStatus::RunningSync,
                TaskUpdate::default(),
                ResultChange::Keep,
            )
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let store = store();
        let task = TaskRecord::new("what is rust", "model-x", 60);
        store.create_task(&task).await.unwrap();

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.query, "what is rust");
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.max_wait_secs, 60);
        assert!(loaded.enable_notifications);
        assert!(loaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_task() {
        let store = store();
        assert!(store.get_task("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_fields_rejects_unknown_columns() {
        let store = store();
        let task = TaskRecord::new("q", "m", 60);
        store.create_task(&task).await.unwrap();

        let err = store
            .update_fields(
                &task.id,
                vec![
                    ("progress".into(), FieldValue::from(50.0)),
                    ("query".into(), FieldValue::from("changed")),
                ],
            )
            .await
            .unwrap_err();
        match err {
            StoreError::InvalidField { fields } => assert_eq!(fields, vec!["query".to_string()]),
            other => panic!("unexpected error: {other}"),
        }

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.query, "q");
        assert_eq!(loaded.progress, 0.0);
    }

    #[tokio::test]
    async fn test_update_fields_cannot_change_status() {
        let store = store();
        let task = running_task(&store).await;
        store
            .transition(
                &task.id,
                TaskStatus::Failed,
                TaskUpdate::default(),
                ResultChange::Keep,
            )
            .await
            .unwrap();

        for column in ["status", "completed_at"] {
            let err = store
                .update_fields(&task.id, vec![(column.into(), FieldValue::from("completed"))])
                .await
                .unwrap_err();
            assert!(
                matches!(&err, StoreError::InvalidField { fields } if fields == &vec![column.to_string()])
            );
        }

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_record_progress_writes_while_running() {
        let store = store();
        let task = running_task(&store).await;
        let snapshot = ProgressSnapshot::new(
            &task.id,
            Utc::now(),
            12.0,
            Some("Searching".into()),
            Some("searching".into()),
        );

        let written = store
            .record_progress(&snapshot, TaskUpdate::progress(12.0, "Searching"))
            .await
            .unwrap();
        assert!(written);
        assert_eq!(store.count_snapshots(&task.id).await.unwrap(), 1);
        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 12.0);
        assert_eq!(loaded.current_action.as_deref(), Some("Searching"));
    }

    #[tokio::test]
    async fn test_record_progress_skips_terminal_task() {
        let store = store();
        let task = running_task(&store).await;
        store
            .transition(
                &task.id,
                TaskStatus::Cancelled,
                TaskUpdate::progress(5.0, "Cancelled at 5%"),
                ResultChange::Discard,
            )
            .await
            .unwrap();

        let snapshot = ProgressSnapshot::new(
            &task.id,
            Utc::now(),
            9.0,
            Some("Planning research".into()),
            Some("queued".into()),
        );
        let written = store
            .record_progress(&snapshot, TaskUpdate::progress(9.0, "Planning research"))
            .await
            .unwrap();
        assert!(!written);
        assert_eq!(store.count_snapshots(&task.id).await.unwrap(), 0);
        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
        assert_eq!(loaded.progress, 5.0);
        assert_eq!(loaded.current_action.as_deref(), Some("Cancelled at 5%"));
    }

    #[tokio::test]
    async fn test_update_fields_applies_whitelisted_columns() {
        let store = store();
        let task = TaskRecord::new("q", "m", 60);
        store.create_task(&task).await.unwrap();

        let updated = store
            .update_fields(
                &task.id,
                vec![
                    ("progress".into(), FieldValue::from(42.5)),
                    ("current_action".into(), FieldValue::from("Reading")),
                    ("tokens_in".into(), FieldValue::from(1200u64)),
                ],
            )
            .await
            .unwrap();
        assert!(updated);

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 42.5);
        assert_eq!(loaded.current_action.as_deref(), Some("Reading"));
        assert_eq!(loaded.tokens_in, 1200);
        assert!(loaded.updated_at >= task.updated_at);
    }

    #[tokio::test]
    async fn test_update_missing_task_reports_false() {
        let store = store();
        let updated = store
            .update_task("missing", TaskUpdate::progress(10.0, "x"))
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_terminal_transition_sets_completed_at() {
        let store = store();
        let task = running_task(&store).await;

        let mut result = ResultRecord::new(&task.id, "final report");
        result.sources.push(Source {
            title: "Bell Labs".into(),
            url: "https://example.com/bell".into(),
            snippet: None,
            relevance_score: Some(0.9),
        });
        let prev = store
            .transition(
                &task.id,
                TaskStatus::Completed,
                TaskUpdate::progress(100.0, "Completed"),
                ResultChange::Save(result),
            )
            .await
            .unwrap();
        assert_eq!(prev, Some(TaskStatus::RunningSync));

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.progress, 100.0);

        let stored = store.get_result(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.report, "final report");
        assert_eq!(stored.sources.len(), 1);
        assert_eq!(stored.sources[0].relevance_score, Some(0.9));
    }

    #[tokio::test]
    async fn test_terminal_state_cannot_be_left() {
        let store = store();
        let task = running_task(&store).await;
        store
            .transition(
                &task.id,
                TaskStatus::Failed,
                TaskUpdate {
                    error_message: Some("boom".into()),
                    ..Default::default()
                },
                ResultChange::Keep,
            )
            .await
            .unwrap();

        for next in [
            TaskStatus::RunningAsync,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ] {
            let prev = store
                .transition(&task.id, next, TaskUpdate::default(), ResultChange::Keep)
                .await
                .unwrap();
            assert!(prev.is_none());
        }
        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_transition_clears_snapshots_on_terminal() {
        let store = store();
        let task = running_task(&store).await;
        let now = Utc::now();
        for i in 0..3 {
            store
                .append_snapshot(&ProgressSnapshot::new(
                    &task.id,
                    now + ChronoDuration::seconds(i),
                    i as f64 * 10.0,
                    None,
                    Some("in_progress".into()),
                ))
                .await
                .unwrap();
        }
        assert_eq!(store.count_snapshots(&task.id).await.unwrap(), 3);

        store
            .transition(
                &task.id,
                TaskStatus::Cancelled,
                TaskUpdate::default(),
                ResultChange::Keep,
            )
            .await
            .unwrap();
        assert_eq!(store.count_snapshots(&task.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_discard_result_on_transition() {
        let store = store();
        let task = running_task(&store).await;
        store
            .save_result(&ResultRecord::new(&task.id, "draft"))
            .await
            .unwrap();
        store
            .transition(
                &task.id,
                TaskStatus::Cancelled,
                TaskUpdate::default(),
                ResultChange::Discard,
            )
            .await
            .unwrap();
        assert!(store.get_result(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshots_are_pruned_to_limit() {
        let config = StoreConfig {
            snapshot_limit: 5,
            ..Default::default()
        };
        let store = ResearchStore::open_in_memory(config).unwrap();
        let task = running_task(&store).await;
        let start = Utc::now();
        for i in 0..8 {
            store
                .append_snapshot(&ProgressSnapshot::new(
                    &task.id,
                    start + ChronoDuration::seconds(i),
                    i as f64,
                    Some(format!("step {i}")),
                    Some("in_progress".into()),
                ))
                .await
                .unwrap();
        }
        let history = store.get_snapshots(&task.id).await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].progress, 3.0);
        assert_eq!(history[4].progress, 7.0);
        assert!(history.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = store();
        let task = running_task(&store).await;
        let mut result = ResultRecord::new(&task.id, "partial text");
        result.set_meta(meta::PARTIAL, true);
        store.save_result(&result).await.unwrap();
        store
            .append_snapshot(&ProgressSnapshot::new(
                &task.id,
                Utc::now(),
                5.0,
                None,
                None,
            ))
            .await
            .unwrap();

        assert!(store.delete_task(&task.id).await.unwrap());
        assert!(store.get_task(&task.id).await.unwrap().is_none());
        assert!(store.get_result(&task.id).await.unwrap().is_none());
        assert_eq!(store.count_snapshots(&task.id).await.unwrap(), 0);
        assert!(!store.delete_task(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_incomplete_returns_running_tasks_with_handles() {
        let store = store();
        let pending = TaskRecord::new("pending", "m", 60);
        store.create_task(&pending).await.unwrap();

        let sync = running_task(&store).await;

        let background = running_task(&store).await;
        store
            .transition(
                &background.id,
                TaskStatus::RunningAsync,
                TaskUpdate {
                    remote_handle: Some("op-123".into()),
                    ..Default::default()
                },
                ResultChange::Keep,
            )
            .await
            .unwrap();

        let done = running_task(&store).await;
        store
            .transition(
                &done.id,
                TaskStatus::Completed,
                TaskUpdate::default(),
                ResultChange::Keep,
            )
            .await
            .unwrap();

        let incomplete = store.list_incomplete().await.unwrap();
        let ids: Vec<&str> = incomplete.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&sync.id.as_str()));
        assert!(ids.contains(&background.id.as_str()));
        let bg = incomplete.iter().find(|t| t.id == background.id).unwrap();
        assert_eq!(bg.remote_handle.as_deref(), Some("op-123"));
        let sy = incomplete.iter().find(|t| t.id == sync.id).unwrap();
        assert!(sy.remote_handle.is_none());
    }

    #[tokio::test]
    async fn test_list_tasks_filters_by_status() {
        let store = store();
        for i in 0..3 {
            store
                .create_task(&TaskRecord::new(format!("q{i}"), "m", 60))
                .await
                .unwrap();
        }
        running_task(&store).await;

        assert_eq!(store.list_tasks(None, 10).await.unwrap().len(), 4);
        assert_eq!(store.list_tasks(None, 2).await.unwrap().len(), 2);
        assert_eq!(
            store
                .list_tasks(Some(TaskStatus::Pending), 10)
                .await
                .unwrap()
                .len(),
            3
        );
    }
}
