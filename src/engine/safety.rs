//! Safety circuit.
//!
//! [`assess`] maps one set of freshly computed metrics to a state. The
//! [`SafetyMonitor`] wraps it with a latch: once `Halted`, it stays halted
//! until [`SafetyMonitor::reset`] is called, however the metrics recover.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::types::{RiskMetrics, RiskProfile, SafetyState};

pub const HALT_RISK_SCORE: f64 = 0.9;
pub const HALT_MARGIN_UTILIZATION: f64 = 0.95;
/// Fraction of a halt threshold at which a metric raises a warning.
pub const WARNING_RATIO: f64 = 0.8;

/// State derived from one metrics snapshot, with the breaches behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyAssessment {
    pub state: SafetyState,
    pub reasons: Vec<String>,
}

/// Pure classification of a metrics snapshot.
pub fn assess(metrics: &RiskMetrics, profile: &RiskProfile) -> SafetyAssessment {
    let checks = [
        ("drawdown", metrics.max_drawdown, profile.emergency_stop_loss),
        ("risk score", metrics.risk_score, HALT_RISK_SCORE),
        ("margin utilization", metrics.margin_utilization, HALT_MARGIN_UTILIZATION),
    ];

    let breaches: Vec<String> = checks
        .iter()
        .filter(|(_, value, limit)| value > limit)
        .map(|(name, value, limit)| format!("{name} {value:.3} exceeds {limit:.3}"))
        .collect();
    if !breaches.is_empty() {
        return SafetyAssessment {
            state: SafetyState::Halted,
            reasons: breaches,
        };
    }

    let warnings: Vec<String> = checks
        .iter()
        .filter(|(_, value, limit)| *value > limit * WARNING_RATIO)
        .map(|(name, value, limit)| format!("{name} {value:.3} approaching {limit:.3}"))
        .collect();
    if !warnings.is_empty() {
        return SafetyAssessment {
            state: SafetyState::Warning,
            reasons: warnings,
        };
    }

    SafetyAssessment {
        state: SafetyState::Normal,
        reasons: Vec::new(),
    }
}

/// Result of one monitor evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyUpdate {
    pub previous: SafetyState,
    pub current: SafetyState,
    pub reasons: Vec<String>,
}

impl SafetyUpdate {
    /// True only on the evaluation that moved the monitor into `Halted`.
    pub fn just_halted(&self) -> bool {
        self.current == SafetyState::Halted && self.previous != SafetyState::Halted
    }
}

#[derive(Debug, Default)]
pub struct SafetyMonitor {
    state: SafetyState,
    reasons: Vec<String>,
    halted_at: Option<DateTime<Utc>>,
    /// Set on entering `Halted`, cleared once the portfolio is flat.
    flatten_pending: bool,
}

impl SafetyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SafetyState {
        self.state
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn halted_at(&self) -> Option<DateTime<Utc>> {
        self.halted_at
    }

    pub fn is_halted(&self) -> bool {
        self.state == SafetyState::Halted
    }

    /// True while a halt is waiting for a successful close-all.
    pub fn flatten_pending(&self) -> bool {
        self.flatten_pending
    }

    pub fn mark_flattened(&mut self) {
        self.flatten_pending = false;
    }

    /// Re-assess against fresh metrics. A halted monitor ignores them.
    pub fn evaluate(&mut self, metrics: &RiskMetrics, profile: &RiskProfile) -> SafetyUpdate {
        let previous = self.state;
        if previous == SafetyState::Halted {
            return SafetyUpdate {
                previous,
                current: previous,
                reasons: self.reasons.clone(),
            };
        }

        let assessment = assess(metrics, profile);
        self.state = assessment.state;
        self.reasons = assessment.reasons;

        match self.state {
            SafetyState::Halted => {
                self.halted_at = Some(Utc::now());
                self.flatten_pending = true;
                error!(
                    profile = %profile.name,
                    reasons = %self.reasons.join("; "),
                    "SAFETY HALT: trading suspended until operator reset"
                );
            }
            SafetyState::Warning => {
                warn!(reasons = %self.reasons.join("; "), "Safety warning");
            }
            SafetyState::Normal if previous == SafetyState::Warning => {
                info!("Safety state back to normal");
            }
            SafetyState::Normal => {}
        }

        SafetyUpdate {
            previous,
            current: self.state,
            reasons: self.reasons.clone(),
        }
    }

    /// Operator reset. The next evaluation starts from `Normal`.
    pub fn reset(&mut self) -> SafetyState {
        let previous = self.state;
        self.state = SafetyState::Normal;
        self.reasons.clear();
        self.halted_at = None;
        if std::mem::take(&mut self.flatten_pending) {
            warn!("Reset while positions were still waiting to be closed");
        }
        info!(previous = %previous, "Safety monitor reset by operator");
        previous
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
