//! Desktop notifications for tasks that finish in the background.
//!
//! Delivery is best-effort: every notifier reports success as a `bool` and never
//! returns an error to the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::types::short_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    Critical,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::Critical => "critical",
        }
    }
}

/// Something that can show the user a short message.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification. Returns whether it was shown.
    async fn notify(&self, title: &str, body: &str, urgency: Urgency) -> bool;
}

/// Title and body for a successful task.
pub fn completion_message(task_id: &str, duration_minutes: f64) -> (String, String) {
    (
        "Research Complete".to_string(),
        format!(
            "Task {} finished in {:.1} minutes",
            short_id(task_id),
            duration_minutes
        ),
    )
}

/// Title and body for a failed task.
pub fn failure_message(task_id: &str, error: &str) -> (String, String) {
    let error: String = error.chars().take(100).collect();
    (
        "Research Failed".to_string(),
        format!("Task {}: {}", short_id(task_id), error),
    )
}

/// Uses `notify-send` on Linux and `osascript` on macOS, falling back to a log line.
#[derive(Debug, Clone, Default)]
pub struct DesktopNotifier;

impl DesktopNotifier {
    pub fn new() -> Self {
        Self
    }

    async fn run(program: &str, args: &[&str]) -> bool {
        match tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
        {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                debug!(
                    program,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Notification command failed"
                );
                false
            }
            Err(e) => {
                debug!(program, error = %e, "Notification command unavailable");
                false
            }
        }
    }
}

/// Escape a string for use inside an AppleScript double-quoted literal.
pub(crate) fn applescript_quote(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\0', "")
}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, title: &str, body: &str, urgency: Urgency) -> bool {
        let delivered = if cfg!(target_os = "linux") {
            Self::run("notify-send", &["-u", urgency.as_str(), title, body]).await
        } else if cfg!(target_os = "macos") {
            let script = format!(
                "display notification \"{}\" with title \"{}\"",
                applescript_quote(body),
                applescript_quote(title)
            );
            Self::run("osascript", &["-e", &script]).await
        } else {
            false
        };
        if !delivered {
            info!(urgency = urgency.as_str(), "NOTIFICATION: {title} - {body}");
        }
        true
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, body: &str, urgency: Urgency) -> bool {
        info!(urgency = urgency.as_str(), "NOTIFICATION: {title} - {body}");
        true
    }
}

/// A notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub title: String,
    pub body: String,
    pub urgency: Urgency,
}

/// Keeps every notification in memory. Useful in tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, title: &str, body: &str, urgency: Urgency) -> bool {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SentNotification {
                title: title.to_string(),
                body: body.to_string(),
                urgency,
            });
        true
    }
}
