//! # Delve Core
//!
//! Core library for Delve, a long-running research task engine.
//! Provides the durable task store, the stall detector, the background task
//! runner, and the research orchestrator that ties them together.

pub mod config;
pub mod error;
pub mod estimate;
pub mod export;
pub mod notify;
pub mod orchestrator;
pub mod progress;
pub mod remote;
pub mod runner;
pub mod stall;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{DelveConfig, load_config};
pub use error::{DelveError, Result};
pub use estimate::{Complexity, CostEstimate, CostEstimator};
pub use export::{ExportedReport, MarkdownExporter};
pub use notify::{DesktopNotifier, LogNotifier, Notifier, RecordingNotifier, Urgency};
pub use orchestrator::{
    CancelResponse, NoOpProgressCallback, OrchestratorBuilder, PollOutcome, ProgressCallback,
    ProgressUpdate, ResearchOrchestrator, ResumeAction, ResumeSummary, StartOptions,
    StartResponse, StatusReport,
};
pub use progress::ProgressCurve;
pub use remote::{
    BeginOutcome, HttpResearchApi, RemoteOutput, RemoteState, RemoteStatus, ResearchApi,
    ScriptedResearchApi,
};
pub use runner::TaskRunner;
pub use stall::{StallDetector, StallKind, StallVerdict};
pub use store::{ResearchStore, ResultChange, TaskUpdate};
pub use types::{ProgressSnapshot, ResultRecord, Source, TaskRecord, TaskStatus, TokenUsage};
