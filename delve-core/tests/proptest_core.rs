//! Property-based tests for core components using proptest.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use std::time::Duration;

use delve_core::config::{ProgressCurveConfig, StallConfig};
use delve_core::estimate::CostEstimator;
use delve_core::progress::ProgressCurve;
use delve_core::stall::{StallDetector, StallKind, status_stall_minutes};
use delve_core::types::{ProgressSnapshot, TaskStatus};

const ALL_STATUSES: [TaskStatus; 6] = [
    TaskStatus::Pending,
    TaskStatus::RunningSync,
    TaskStatus::RunningAsync,
    TaskStatus::Completed,
    TaskStatus::Failed,
    TaskStatus::Cancelled,
];

/// Build a time-ordered history from `(minute gap, progress, status index)` steps.
fn history(steps: &[(i64, f64, usize)]) -> Vec<ProgressSnapshot> {
    let words = ["queued", "searching", "reading", "writing", ""];
    let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let mut minute = 0;
    steps
        .iter()
        .map(|&(gap, progress, status)| {
            minute += gap;
            let word = words[status % words.len()];
            ProgressSnapshot::new(
                "task",
                start + ChronoDuration::minutes(minute),
                progress,
                None,
                (!word.is_empty()).then(|| word.to_string()),
            )
        })
        .collect()
}

// --- Progress curve properties ---

proptest! {
    #[test]
    fn curve_is_monotonic_in_time(a in 0u64..200_000, b in 0u64..200_000) {
        let curve = ProgressCurve::default();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(curve.at(Duration::from_secs(lo)) <= curve.at(Duration::from_secs(hi)));
    }

    #[test]
    fn curve_stays_below_ceiling(
        secs in 0u64..10_000_000,
        ceiling in 0.0f64..99.9,
        tau in 1.0f64..100_000.0,
    ) {
        let curve = ProgressCurve::new(&ProgressCurveConfig { ceiling, time_constant_secs: tau });
        let p = curve.at(Duration::from_secs(secs));
        prop_assert!(p >= 0.0);
        prop_assert!(p <= curve.ceiling());
        prop_assert!(p < 100.0);
    }

    #[test]
    fn advance_never_decreases(previous in -50.0f64..150.0, secs in 0u64..100_000) {
        let curve = ProgressCurve::default();
        let next = curve.advance(previous, Duration::from_secs(secs));
        prop_assert!(next >= previous.clamp(0.0, 100.0));
        prop_assert!(next <= 100.0);
    }
}

// --- Stall detector properties ---

proptest! {
    #[test]
    fn verdict_confidence_is_a_probability(
        steps in prop::collection::vec((0i64..30, 0.0f64..100.0, 0usize..5), 0..20),
        extra in 0i64..200,
    ) {
        let history = history(&steps);
        let now = history
            .last()
            .map(|s| s.timestamp)
            .unwrap_or_else(Utc::now)
            + ChronoDuration::minutes(extra);
        let verdict = StallDetector::default().analyze(&history, None, now);
        prop_assert!((0.0..=1.0).contains(&verdict.confidence));
        prop_assert!(verdict.status_stall_minutes >= 0.0);
        prop_assert!(verdict.progress_stall_minutes >= 0.0);
        prop_assert!(!verdict.reason.is_empty());
    }

    #[test]
    fn short_history_is_never_hanging(
        steps in prop::collection::vec((0i64..30, 0.0f64..100.0, 0usize..5), 0..2),
        age in 0i64..10_000,
    ) {
        let history = history(&steps);
        let now = Utc::now();
        let verdict = StallDetector::default()
            .analyze(&history, Some(now - ChronoDuration::minutes(age)), now);
        prop_assert!(!verdict.is_hanging);
        prop_assert_eq!(verdict.kind, StallKind::InsufficientData);
    }

    #[test]
    fn excessive_duration_always_hangs(
        steps in prop::collection::vec((0i64..30, 0.0f64..100.0, 0usize..5), 2..10),
        over in 1i64..1_000,
    ) {
        let history = history(&steps);
        let config = StallConfig::default();
        let created = history[0].timestamp;
        let now = created + ChronoDuration::minutes(config.excessive_minutes as i64 + over);
        let verdict = StallDetector::new(config).analyze(&history, Some(created), now);
        prop_assert!(verdict.is_hanging);
        prop_assert_eq!(verdict.kind, StallKind::ExcessiveDuration);
    }

    #[test]
    fn status_stall_never_exceeds_history_span(
        steps in prop::collection::vec((0i64..30, 0.0f64..100.0, 0usize..5), 2..20),
    ) {
        let history = history(&steps);
        let span = (history[history.len() - 1].timestamp - history[0].timestamp)
            .num_seconds() as f64 / 60.0;
        prop_assert!(status_stall_minutes(&history) <= span + 1e-9);
    }
}

// --- State machine and estimator properties ---

proptest! {
    #[test]
    fn terminal_states_are_absorbing(from in 0usize..6, to in 0usize..6) {
        let from = ALL_STATUSES[from];
        let to = ALL_STATUSES[to];
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
        if from.can_transition_to(to) {
            prop_assert!(to.predecessors().contains(&from));
        }
    }

    #[test]
    fn estimate_ranges_are_ordered(query in "\\PC{0,400}") {
        let est = CostEstimator::new().estimate(&query);
        prop_assert!(est.minutes.min <= est.minutes.likely);
        prop_assert!(est.minutes.likely <= est.minutes.max);
        prop_assert!(est.usd.min <= est.usd.likely);
        prop_assert!(est.usd.likely <= est.usd.max);
    }
}
