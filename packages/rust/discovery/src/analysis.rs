//! Offline aggregate analysis across many sealed discovery sessions.

use std::collections::BTreeMap;

use serde::Serialize;

use genpipe_shared::{DiscoverySession, HintType};

/// Per-method totals across sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MethodStats {
    pub attempts: usize,
    pub failures: usize,
    pub total_duration_ms: u64,
}

impl MethodStats {
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.failures as f64 / self.attempts as f64
        }
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.attempts as f64
        }
    }
}

/// Cross-session summary used to diagnose systemic discovery gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionAnalysis {
    pub session_count: usize,
    pub total_attempts: usize,
    pub failed_attempts: usize,
    pub overall_success_rate: f64,
    pub navigation_mismatches: usize,
    pub methods: BTreeMap<String, MethodStats>,
    pub hint_totals: BTreeMap<HintType, usize>,
    /// Most frequent missing hint other than `none`; ties go to the
    /// first in `HintType` order.
    pub dominant_gap: Option<HintType>,
}

impl SessionAnalysis {
    pub fn from_sessions(sessions: &[DiscoverySession]) -> Self {
        let mut analysis = Self {
            session_count: sessions.len(),
            ..Default::default()
        };

        for session in sessions {
            let agg = session.aggregates();
            analysis.total_attempts += agg.total_attempts;
            analysis.failed_attempts += agg.failed_attempts;
            analysis.navigation_mismatches += agg.navigation_mismatches.len();

            for (hint, count) in &agg.hint_deficiencies {
                *analysis.hint_totals.entry(*hint).or_insert(0) += count;
            }

            for attempt in session.attempts() {
                let stats = analysis.methods.entry(attempt.method.clone()).or_default();
                stats.attempts += 1;
                stats.total_duration_ms += attempt.duration_ms;
                if !attempt.success {
                    stats.failures += 1;
                }
            }
        }

        if analysis.total_attempts > 0 {
            let ok = analysis.total_attempts - analysis.failed_attempts;
            analysis.overall_success_rate = ok as f64 / analysis.total_attempts as f64;
        }

        analysis.dominant_gap = analysis
            .hint_totals
            .iter()
            .filter(|(hint, count)| **hint != HintType::None && **count > 0)
            .fold(None, |best: Option<(HintType, usize)>, (hint, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((*hint, *count)),
            })
            .map(|(hint, _)| hint);

        analysis
    }
}
