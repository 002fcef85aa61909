//! Stall detection for long-running research tasks.
//!
//! The detector is a pure function of a task's snapshot history. Synthetic progress
//! only ever creeps upward, so the primary signal is how long the status word reported
//! by the remote service has stayed the same. Verdicts are advisory: nothing in the
//! engine cancels a task because of one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StallConfig;
use crate::types::ProgressSnapshot;

/// Which rule produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallKind {
    InsufficientData,
    ExcessiveDuration,
    StatusStalled,
    SlowProgress,
    FinalizationHung,
    Healthy,
}

impl std::fmt::Display for StallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StallKind::InsufficientData => write!(f, "insufficient_data"),
            StallKind::ExcessiveDuration => write!(f, "excessive_duration"),
            StallKind::StatusStalled => write!(f, "status_stalled"),
            StallKind::SlowProgress => write!(f, "slow_progress"),
            StallKind::FinalizationHung => write!(f, "finalization_hung"),
            StallKind::Healthy => write!(f, "healthy"),
        }
    }
}

/// Result of analysing a snapshot history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallVerdict {
    pub is_hanging: bool,
    /// Confidence in the verdict, 0.0 to 1.0.
    pub confidence: f64,
    pub kind: StallKind,
    pub reason: String,
    pub recommendation: String,
    pub elapsed_minutes: f64,
    pub status_stall_minutes: f64,
    pub progress_stall_minutes: f64,
    pub last_progress: f64,
}

/// Applies the stall rules with configurable thresholds.
#[derive(Debug, Clone, Default)]
pub struct StallDetector {
    config: StallConfig,
}

impl StallDetector {
    pub fn new(config: StallConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StallConfig {
        &self.config
    }

    /// Classify a task from its time-ordered history.
    ///
    /// Elapsed time is measured from `created_at` when given, otherwise from the
    /// first snapshot. Rules are evaluated in order and the first match wins.
    pub fn analyze(
        &self,
        history: &[ProgressSnapshot],
        created_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StallVerdict {
        let elapsed = match (created_at, history.first()) {
            (Some(created), _) => minutes_between(created, now),
            (None, Some(first)) => minutes_between(first.timestamp, now),
            (None, None) => 0.0,
        };
        let last_progress = history.last().map(|s| s.progress).unwrap_or(0.0);

        if history.len() < 2 {
            return StallVerdict {
                is_hanging: false,
                confidence: 0.0,
                kind: StallKind::InsufficientData,
                reason: "Insufficient progress data".to_string(),
                recommendation: "Continue monitoring".to_string(),
                elapsed_minutes: elapsed,
                status_stall_minutes: 0.0,
                progress_stall_minutes: 0.0,
                last_progress,
            };
        }

        let status_stall = status_stall_minutes(history);
        let progress_stall = progress_stall_minutes(history);
        let verdict = |is_hanging: bool,
                       confidence: f64,
                       kind: StallKind,
                       reason: String,
                       recommendation: &str| StallVerdict {
            is_hanging,
            confidence,
            kind,
            reason,
            recommendation: recommendation.to_string(),
            elapsed_minutes: elapsed,
            status_stall_minutes: status_stall,
            progress_stall_minutes: progress_stall,
            last_progress,
        };
        let cfg = &self.config;

        if elapsed > cfg.excessive_minutes {
            return verdict(
                true,
                0.95,
                StallKind::ExcessiveDuration,
                format!(
                    "Excessive duration: {elapsed:.0} min (expected around {:.0} min)",
                    cfg.expected_minutes
                ),
                "Cancel task - almost certainly hung",
            );
        }

        if status_stall > cfg.stall_threshold_minutes {
            let confidence = (0.5 + status_stall / cfg.excessive_minutes * 0.4).min(0.9);
            return verdict(
                true,
                confidence,
                StallKind::StatusStalled,
                format!("Remote status unchanged for {status_stall:.0} min"),
                "Consider cancelling - no status change from the remote service",
            );
        }

        if elapsed > cfg.concern_minutes && last_progress < 50.0 {
            return verdict(
                false,
                0.4,
                StallKind::SlowProgress,
                format!("Slow progress: {last_progress:.0}% after {elapsed:.0} min"),
                "Monitor closely - slower than expected",
            );
        }

        if last_progress >= cfg.finalization_progress
            && status_stall > cfg.finalization_stall_minutes
        {
            return verdict(
                true,
                0.8,
                StallKind::FinalizationHung,
                format!(
                    "Stuck at {last_progress:.0}% for {status_stall:.0} min (finalization hung)"
                ),
                "Cancel task - finalization appears hung",
            );
        }

        verdict(
            false,
            0.1,
            StallKind::Healthy,
            "Task progressing normally".to_string(),
            "Continue - within expected parameters",
        )
    }

    /// Minutes until completion extrapolated from the observed progress rate.
    pub fn estimate_remaining_minutes(&self, history: &[ProgressSnapshot]) -> Option<f64> {
        let rate = progress_rate(history)?;
        if rate <= 0.0 {
            return None;
        }
        let last = history.last()?;
        Some(((100.0 - last.progress).max(0.0)) / rate)
    }
}

/// Minutes the remote status word has been unchanged, as of the latest snapshot.
///
/// Snapshots without a status word do not break a run. If the latest snapshot has no
/// status word at all, the progress stall is used instead.
pub fn status_stall_minutes(history: &[ProgressSnapshot]) -> f64 {
    let Some(last) = history.last() else {
        return 0.0;
    };
    if history.len() < 2 {
        return 0.0;
    }
    let current = match last.remote_status.as_deref() {
        Some(s) if !s.is_empty() => s,
        _ => return progress_stall_minutes(history),
    };

    let mut since = last.timestamp;
    for snapshot in history[..history.len() - 1].iter().rev() {
        match snapshot.remote_status.as_deref() {
            Some(s) if !s.is_empty() && s != current => break,
            _ => since = snapshot.timestamp,
        }
    }
    minutes_between(since, last.timestamp)
}

/// Minutes the synthetic progress value has been unchanged, as of the latest snapshot.
pub fn progress_stall_minutes(history: &[ProgressSnapshot]) -> f64 {
    let Some(last) = history.last() else {
        return 0.0;
    };
    if history.len() < 2 {
        return 0.0;
    }
    let mut since = last.timestamp;
    for snapshot in history[..history.len() - 1].iter().rev() {
        if snapshot.progress != last.progress {
            break;
        }
        since = snapshot.timestamp;
    }
    minutes_between(since, last.timestamp)
}

/// Progress in percent per minute between the first and last snapshot.
pub fn progress_rate(history: &[ProgressSnapshot]) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let first = history.first()?;
    let last = history.last()?;
    let minutes = minutes_between(first.timestamp, last.timestamp);
    if minutes <= 0.0 {
        return None;
    }
    Some((last.progress - first.progress) / minutes)
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snap(start: DateTime<Utc>, minute: i64, progress: f64, status: &str) -> ProgressSnapshot {
        ProgressSnapshot::new(
            "task",
            start + Duration::minutes(minute),
            progress,
            None,
            if status.is_empty() {
                None
            } else {
                Some(status.to_string())
            },
        )
    }

    fn detector() -> StallDetector {
        StallDetector::new(StallConfig::default())
    }

    #[test]
    fn test_insufficient_data_is_never_hanging() {
        let start = Utc::now();
        let history = vec![snap(start, 0, 5.0, "in_progress")];
        let v = detector().analyze(&history, Some(start - Duration::hours(3)), start);
        assert!(!v.is_hanging);
        assert_eq!(v.kind, StallKind::InsufficientData);
        assert_eq!(v.confidence, 0.0);

        let v = detector().analyze(&[], None, start);
        assert_eq!(v.kind, StallKind::InsufficientData);
        assert_eq!(v.elapsed_minutes, 0.0);
    }

    #[test]
    fn test_excessive_duration() {
        let start = Utc::now();
        let history = vec![
            snap(start, 0, 10.0, "a"),
            snap(start, 1, 20.0, "b"),
        ];
        let now = start + Duration::minutes(61);
        let v = detector().analyze(&history, Some(start), now);
        assert!(v.is_hanging);
        assert_eq!(v.kind, StallKind::ExcessiveDuration);
        assert_eq!(v.confidence, 0.95);
    }

    #[test]
    fn test_same_status_for_twenty_minutes_is_hanging() {
        let start = Utc::now();
        let history = vec![
            snap(start, 0, 10.0, "in_progress"),
            snap(start, 10, 40.0, "in_progress"),
            snap(start, 20, 60.0, "in_progress"),
        ];
        let now = start + Duration::minutes(20);
        let v = detector().analyze(&history, Some(start), now);
        assert!(v.is_hanging);
        assert_eq!(v.kind, StallKind::StatusStalled);
        assert!((v.status_stall_minutes - 20.0).abs() < 1e-9);
        let expected = (0.5_f64 + 20.0 / 60.0 * 0.4).min(0.9);
        assert!((v.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_status_change_resets_stall() {
        let start = Utc::now();
        let history = vec![
            snap(start, 0, 10.0, "queued"),
            snap(start, 1, 12.0, "in_progress"),
        ];
        let now = start + Duration::minutes(1);
        let v = detector().analyze(&history, Some(start), now);
        assert!(!v.is_hanging);
        assert_eq!(v.kind, StallKind::Healthy);
        assert_eq!(v.confidence, 0.1);
        assert_eq!(v.status_stall_minutes, 0.0);
    }

    #[test]
    fn test_status_stall_confidence_is_capped() {
        let config = StallConfig {
            excessive_minutes: 600.0,
            ..StallConfig::default()
        };
        let start = Utc::now();
        let history = vec![
            snap(start, 0, 10.0, "in_progress"),
            snap(start, 500, 12.0, "in_progress"),
        ];
        let v = StallDetector::new(config).analyze(
            &history,
            Some(start),
            start + Duration::minutes(500),
        );
        assert_eq!(v.kind, StallKind::StatusStalled);
        assert_eq!(v.confidence, 0.9);
    }

    #[test]
    fn test_slow_progress_is_not_hanging() {
        let start = Utc::now();
        let history = vec![
            snap(start, 25, 30.0, "searching"),
            snap(start, 35, 40.0, "reading"),
        ];
        let v = detector().analyze(&history, Some(start), start + Duration::minutes(35));
        assert!(!v.is_hanging);
        assert_eq!(v.kind, StallKind::SlowProgress);
        assert_eq!(v.confidence, 0.4);
    }

    #[test]
    fn test_finalization_hung() {
        let start = Utc::now();
        let history = vec![
            snap(start, 5, 80.0, "reading"),
            snap(start, 8, 91.0, "writing"),
            snap(start, 20, 93.0, "writing"),
        ];
        let v = detector().analyze(&history, Some(start), start + Duration::minutes(20));
        assert!(v.is_hanging);
        assert_eq!(v.kind, StallKind::FinalizationHung);
        assert_eq!(v.confidence, 0.8);
    }

    #[test]
    fn test_missing_status_falls_back_to_progress_stall() {
        let start = Utc::now();
        let history = vec![
            snap(start, 0, 20.0, ""),
            snap(start, 4, 30.0, ""),
            snap(start, 8, 30.0, ""),
        ];
        assert!((status_stall_minutes(&history) - 4.0).abs() < 1e-9);
        assert!((progress_stall_minutes(&history) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_blank_status_does_not_break_run() {
        let start = Utc::now();
        let history = vec![
            snap(start, 0, 10.0, "queued"),
            snap(start, 2, 20.0, "in_progress"),
            snap(start, 5, 25.0, ""),
            snap(start, 9, 30.0, "in_progress"),
        ];
        assert!((status_stall_minutes(&history) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_remaining() {
        let start = Utc::now();
        let history = vec![
            snap(start, 0, 0.0, "a"),
            snap(start, 10, 50.0, "b"),
        ];
        let remaining = detector().estimate_remaining_minutes(&history).unwrap();
        assert!((remaining - 10.0).abs() < 1e-9);

        let flat = vec![snap(start, 0, 50.0, "a"), snap(start, 5, 50.0, "a")];
        assert!(detector().estimate_remaining_minutes(&flat).is_none());
        assert!(progress_rate(&flat[..1]).is_none());
    }
}
