//! Synthetic progress for tasks whose remote service reports no percentage.
//!
//! Progress follows `ceiling * (1 - e^(-t / tau))`: quick movement early, slowing as
//! the task runs long. It never decreases between ticks and only reaches 100 when the
//! remote service reports completion.

use std::time::Duration;

use crate::config::ProgressCurveConfig;

/// Progress reported once the remote service confirms completion.
pub const COMPLETE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressCurve {
    ceiling: f64,
    time_constant_secs: f64,
}

impl Default for ProgressCurve {
    fn default() -> Self {
        Self::new(&ProgressCurveConfig::default())
    }
}

impl ProgressCurve {
    pub fn new(config: &ProgressCurveConfig) -> Self {
        Self {
            ceiling: config.ceiling.clamp(0.0, COMPLETE - f64::EPSILON),
            time_constant_secs: config.time_constant_secs.max(f64::EPSILON),
        }
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    /// Raw curve value after `elapsed`.
    pub fn at(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64() / self.time_constant_secs;
        self.ceiling * (1.0 - (-t).exp())
    }

    /// Next tick's progress given the previous value. Never lower than `previous`.
    pub fn advance(&self, previous: f64, elapsed: Duration) -> f64 {
        let previous = if previous.is_finite() {
            previous.clamp(0.0, COMPLETE)
        } else {
            0.0
        };
        self.at(elapsed).max(previous)
    }
}

/// Human-readable phase for a progress value.
pub fn phase_for(progress: f64) -> &'static str {
    match progress {
        p if p >= COMPLETE => "Research complete",
        p if p < 10.0 => "Planning research",
        p if p < 30.0 => "Searching sources",
        p if p < 60.0 => "Reading and analyzing sources",
        p if p < 85.0 => "Synthesizing findings",
        _ => "Writing report",
    }
}
