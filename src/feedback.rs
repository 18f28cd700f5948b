//! Per-tool outcome tracking used for adaptive risk escalation.
//!
//! Every dispatch outcome feeds an exponential moving average of the error
//! rate. Tools that start failing get their effective risk raised one level;
//! tools with a long clean streak can relax one level, but never below the
//! floor their name implies.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::policy::document::RiskLevel;

const DEFAULT_ALPHA: f64 = 0.1;
/// Adaptive adjustment only kicks in once a tool has this many samples.
const MIN_SAMPLES: u64 = 5;
const ESCALATE_ABOVE: f64 = 0.4;
const RELAX_BELOW: f64 = 0.1;

/// Snapshot of one tool's stats.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStats {
    pub error_rate: f64,
    pub samples: u64,
}

pub struct FeedbackTracker {
    alpha: f64,
    /// Whether outcomes may adjust risk. When off, outcomes are still
    /// recorded but `adjusted_risk` returns the base unchanged.
    adaptive: bool,
    stats: Mutex<HashMap<String, ToolStats>>,
}

impl FeedbackTracker {
    pub fn new(adaptive: bool) -> Self {
        FeedbackTracker {
            alpha: DEFAULT_ALPHA,
            adaptive,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Record one dispatch outcome for `tool`.
    pub fn record(&self, tool: &str, ok: bool) {
        let mut stats = self.stats.lock().expect("feedback lock poisoned");
        let entry = stats.entry(tool.to_ascii_lowercase()).or_default();
        let sample = if ok { 0.0 } else { 1.0 };
        entry.error_rate = (1.0 - self.alpha) * entry.error_rate + self.alpha * sample;
        entry.samples += 1;
    }

    /// Stats snapshot for `tool`, if any outcomes were recorded.
    pub fn stats(&self, tool: &str) -> Option<ToolStats> {
        self.stats
            .lock()
            .expect("feedback lock poisoned")
            .get(&tool.to_ascii_lowercase())
            .copied()
    }

    /// Adjust `base` risk for `tool` from recent outcomes.
    pub fn adjusted_risk(&self, tool: &str, base: RiskLevel) -> RiskLevel {
        if !self.adaptive {
            return base;
        }
        let Some(stats) = self.stats(tool) else {
            return base;
        };
        if stats.samples < MIN_SAMPLES {
            return base;
        }

        if stats.error_rate > ESCALATE_ABOVE {
            return base.escalate();
        }
        if stats.error_rate < RELAX_BELOW
            && base == RiskLevel::Medium
            && !RiskLevel::name_implies_danger(tool)
        {
            return RiskLevel::Low;
        }
        base
    }

    /// Drop all recorded stats.
    pub fn reset(&self) {
        self.stats.lock().expect("feedback lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with_errors(tool: &str, errors: usize, oks: usize) -> FeedbackTracker {
        let t = FeedbackTracker::new(true);
        for _ in 0..errors {
            t.record(tool, false);
        }
        for _ in 0..oks {
            t.record(tool, true);
        }
        t
    }

    #[test]
    fn ema_moves_toward_outcomes() {
        let t = FeedbackTracker::new(true);
        t.record("fmt", false);
        let after_one = t.stats("fmt").unwrap();
        assert!((after_one.error_rate - 0.1).abs() < 1e-9);
        t.record("fmt", true);
        assert!(t.stats("fmt").unwrap().error_rate < after_one.error_rate);
    }

    #[test]
    fn no_adjustment_below_sample_floor() {
        let t = tracker_with_errors("fmt", 4, 0);
        assert_eq!(t.adjusted_risk("fmt", RiskLevel::Low), RiskLevel::Low);
    }

    #[test]
    fn high_error_rate_escalates_one_level() {
        let t = tracker_with_errors("fmt", 10, 0);
        assert_eq!(t.adjusted_risk("fmt", RiskLevel::Low), RiskLevel::Medium);
        assert_eq!(t.adjusted_risk("fmt", RiskLevel::Medium), RiskLevel::High);
        assert_eq!(t.adjusted_risk("fmt", RiskLevel::High), RiskLevel::High);
    }

    #[test]
    fn clean_streak_relaxes_medium_only_for_harmless_names() {
        let t = tracker_with_errors("fmt", 0, 20);
        assert_eq!(t.adjusted_risk("fmt", RiskLevel::Medium), RiskLevel::Low);
        assert_eq!(t.adjusted_risk("fmt", RiskLevel::High), RiskLevel::High);

        let t = tracker_with_errors("shell_exec", 0, 20);
        assert_eq!(
            t.adjusted_risk("shell_exec", RiskLevel::Medium),
            RiskLevel::Medium
        );
    }

    #[test]
    fn tool_names_are_case_insensitive() {
        let t = tracker_with_errors("Fmt", 10, 0);
        assert_eq!(t.adjusted_risk("FMT", RiskLevel::Low), RiskLevel::Medium);
    }

    #[test]
    fn disabled_tracker_records_but_never_adjusts() {
        let t = FeedbackTracker::new(false);
        for _ in 0..10 {
            t.record("fmt", false);
        }
        assert_eq!(t.stats("fmt").unwrap().samples, 10);
        assert_eq!(t.adjusted_risk("fmt", RiskLevel::Low), RiskLevel::Low);
    }

    #[test]
    fn reset_clears_state() {
        let t = tracker_with_errors("fmt", 10, 0);
        t.reset();
        assert!(t.stats("fmt").is_none());
    }
}
