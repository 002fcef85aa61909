//! Error types for the Delve core library.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering the task store, the remote research API, the background runner,
//! and the research lifecycle itself.

use std::path::PathBuf;

/// Top-level error type for the Delve core library.
#[derive(Debug, thiserror::Error)]
pub enum DelveError {
    #[error("Research error: {0}")]
    Research(#[from] ResearchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DelveError {
    /// Whether the error is a caller mistake rather than an operational failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DelveError::Research(ResearchError::Validation { .. })
                | DelveError::Store(StoreError::InvalidField { .. })
        )
    }
}

/// Errors from the research lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Task not found: {task_id}")]
    NotFound { task_id: String },

    #[error("Cannot {action} task {task_id} in state '{status}'")]
    InvalidState {
        task_id: String,
        status: String,
        action: String,
    },

    #[error("Task {task_id} has not completed (status: {status})")]
    NotCompleted { task_id: String, status: String },

    #[error("Task {task_id} is already being polled")]
    ConcurrencyViolation { task_id: String },

    #[error("Task {task_id} exceeded its wall-clock budget of {max_wait_secs}s")]
    Timeout { task_id: String, max_wait_secs: u64 },

    #[error("No result stored for task {task_id}")]
    ResultMissing { task_id: String },
}

/// Errors from the durable task store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database is busy, gave up after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("Invalid column names for update: {}", fields.join(", "))]
    InvalidField { fields: Vec<String> },

    #[error("Stored row is malformed: {message}")]
    Corrupt { message: String },

    #[error("Failed to open database at {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store worker failed: {message}")]
    Worker { message: String },
}

impl StoreError {
    /// Whether this error is transient lock contention worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Errors from the remote research API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote connection failed: {message}")]
    Connection { message: String },

    #[error("Remote service unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("Rate limited by remote service")]
    RateLimited,

    #[error("Remote rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Remote response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Remote research failed: {message}")]
    Failed { message: String },
}

impl RemoteError {
    /// Whether a retry after a short delay may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Connection { .. }
                | RemoteError::Unavailable { .. }
                | RemoteError::RateLimited
        )
    }
}

/// Errors from the background task runner.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Task {task_id} already has a running unit")]
    AlreadyRunning { task_id: String },

    #[error("Unit for task {task_id} panicked: {message}")]
    Panicked { task_id: String, message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },
}

/// Errors from markdown export.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Template render failed: {message}")]
    Render { message: String },

    #[error("Failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },
}

/// Convenience type alias for results using DelveError.
pub type Result<T> = std::result::Result<T, DelveError>;
