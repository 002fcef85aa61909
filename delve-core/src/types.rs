//! Core types for research tasks, results, and progress snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a research task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    RunningSync,
    RunningAsync,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::RunningSync => "running_sync",
            TaskStatus::RunningAsync => "running_async",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the stored representation. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running_sync" => Some(TaskStatus::RunningSync),
            "running_async" => Some(TaskStatus::RunningAsync),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether the task is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_running(self) -> bool {
        matches!(self, TaskStatus::RunningSync | TaskStatus::RunningAsync)
    }

    /// States from which a task may move into `self`.
    pub fn predecessors(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[],
            TaskStatus::RunningSync => &[TaskStatus::Pending],
            TaskStatus::RunningAsync => &[TaskStatus::RunningSync],
            TaskStatus::Completed => &[TaskStatus::RunningSync, TaskStatus::RunningAsync],
            TaskStatus::Failed => &[
                TaskStatus::Pending,
                TaskStatus::RunningSync,
                TaskStatus::RunningAsync,
            ],
            TaskStatus::Cancelled => &[TaskStatus::RunningSync, TaskStatus::RunningAsync],
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        next.predecessors().contains(&self)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token usage reported by the remote service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A single research request and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// Opaque handle returned by the remote service once it accepted the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_handle: Option<String>,
    pub query: String,
    pub model: String,
    pub status: TaskStatus,
    /// Synthetic progress, 0-100. Advisory only.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Estimated cost in USD.
    pub cost_estimate: f64,
    pub enable_notifications: bool,
    pub max_wait_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a new pending task with a fresh id.
    pub fn new(query: impl Into<String>, model: impl Into<String>, max_wait_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            remote_handle: None,
            query: query.into(),
            model: model.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            current_action: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_estimate: 0.0,
            enable_notifications: true,
            max_wait_secs,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Whether the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// First eight characters of the id, for display.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.tokens_in,
            output_tokens: self.tokens_out,
        }
    }
}

/// First eight characters of an id (or the whole id if shorter).
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// A source cited by a research report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
}

/// Metadata keys written alongside results.
pub mod meta {
    pub const PARTIAL: &str = "partial";
    pub const TIMED_OUT: &str = "timed_out";
    pub const CHUNKS_CAPTURED: &str = "chunks_captured";
    pub const CANCELLED_AT_PROGRESS: &str = "cancelled_at_progress";
    pub const FAILURE_REASON: &str = "failure_reason";
    pub const TOKENS_INPUT: &str = "tokens_input";
    pub const TOKENS_OUTPUT: &str = "tokens_output";
}

/// The report produced by a task. At most one per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: String,
    pub report: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn new(task_id: impl Into<String>, report: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            report: report.into(),
            sources: Vec::new(),
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    /// Whether this result was saved from an unfinished run.
    pub fn is_partial(&self) -> bool {
        self.metadata
            .get(meta::PARTIAL)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

/// One poll tick's view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// The status word reported by the remote service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_status: Option<String>,
}

impl ProgressSnapshot {
    pub fn new(
        task_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        progress: f64,
        action: Option<String>,
        remote_status: Option<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            timestamp,
            progress,
            action,
            remote_status,
        }
    }
}
