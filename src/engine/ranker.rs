//! Opportunity ranking.
//!
//! Scores validated candidates, drops the weak ones, and orders the rest
//! by `(priority desc, execution_score desc)`. The sort is stable, so
//! candidates that tie keep their arrival order.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::types::{
    Action, Advice, EngineError, EngineResult, FusedSignal, Opportunity, PositionSizing, Priority,
};

/// Neutral advisory score used when no advice is available.
const NEUTRAL_ADVISORY: f64 = 0.5;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RankerConfig {
    /// Global fused-confidence floor.
    pub min_confidence: f64,
    pub min_risk_reward: f64,
    pub technical_weight: f64,
    pub liquidity_weight: f64,
    pub advisory_weight: f64,
    pub priority_technical_weight: f64,
    pub priority_advisory_weight: f64,
    pub priority_volatility_weight: f64,
    pub critical_threshold: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
    /// Published list length cap.
    pub max_opportunities: usize,
    pub expiry_minutes: i64,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            min_risk_reward: 1.0,
            technical_weight: 0.4,
            liquidity_weight: 0.3,
            advisory_weight: 0.3,
            priority_technical_weight: 0.4,
            priority_advisory_weight: 0.3,
            priority_volatility_weight: 0.3,
            critical_threshold: 0.9,
            high_threshold: 0.75,
            medium_threshold: 0.6,
            max_opportunities: 50,
            expiry_minutes: 30,
        }
    }
}

impl RankerConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let weights = [
            self.technical_weight,
            self.liquidity_weight,
            self.advisory_weight,
            self.priority_technical_weight,
            self.priority_advisory_weight,
            self.priority_volatility_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EngineError::Configuration("ranker: weights must be non-negative".to_string()));
        }
        if !(self.critical_threshold >= self.high_threshold && self.high_threshold >= self.medium_threshold) {
            return Err(EngineError::Configuration(
                "ranker: priority thresholds must satisfy critical >= high >= medium".to_string(),
            ));
        }
        if self.expiry_minutes <= 0 {
            return Err(EngineError::Configuration("ranker: expiry_minutes must be positive".to_string()));
        }
        Ok(())
    }
}

/// A validated candidate entering the ranker.
#[derive(Debug, Clone)]
pub struct RankInput {
    pub signal: FusedSignal,
    pub sizing: PositionSizing,
    pub advice: Option<Advice>,
}

pub struct OpportunityRanker {
    config: RankerConfig,
}

impl OpportunityRanker {
    pub fn new(config: RankerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RankerConfig {
        &self.config
    }

    /// Filter, score and order candidates.
    pub fn rank(&self, candidates: Vec<RankInput>, now: DateTime<Utc>) -> Vec<Opportunity> {
        let mut ranked: Vec<Opportunity> = candidates
            .into_iter()
            .filter(|c| {
                c.signal.confidence >= self.config.min_confidence
                    && c.signal.risk_reward() >= self.config.min_risk_reward
            })
            .map(|c| self.score(c, now))
            .collect();

        ranked.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| {
                b.execution_score
                    .partial_cmp(&a.execution_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });
        ranked.truncate(self.config.max_opportunities);
        ranked
    }

    fn score(&self, input: RankInput, now: DateTime<Utc>) -> Opportunity {
        let RankInput { signal, sizing, advice } = input;
        let cfg = &self.config;
        let technical = signal.confidence.clamp(0.0, 1.0);
        let liquidity = signal.market.volume_score.clamp(0.0, 1.0);

        // Weights need not sum to one, so both blends are capped.
        let execution_score = (technical * cfg.technical_weight
            + liquidity * cfg.liquidity_weight
            + advisory_agreement(signal.action, advice.as_ref()) * cfg.advisory_weight)
            .clamp(0.0, 1.0);

        let advisory_conf = advice.map(|a| a.confidence.clamp(0.0, 1.0)).unwrap_or(NEUTRAL_ADVISORY);
        let priority_score = (technical * cfg.priority_technical_weight
            + advisory_conf * cfg.priority_advisory_weight
            + signal.market.volatility_score.clamp(0.0, 1.0) * cfg.priority_volatility_weight)
            .clamp(0.0, 1.0);

        let rr = signal.risk_reward();
        let expected_return = (technical * rr - (1.0 - technical)) * sizing.adjusted_size;
        let recommendations = execution_notes(&signal, &sizing);

        Opportunity {
            id: Uuid::new_v4(),
            priority: self.priority(priority_score),
            execution_score,
            expected_return,
            max_risk: sizing.max_loss,
            advice,
            recommendations,
            created_at: now,
            expires_at: now + Duration::minutes(cfg.expiry_minutes),
            signal,
            sizing,
        }
    }

    fn priority(&self, score: f64) -> Priority {
        if score >= self.config.critical_threshold {
            Priority::Critical
        } else if score >= self.config.high_threshold {
            Priority::High
        } else if score >= self.config.medium_threshold {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

/// How strongly the advisor backs the signal, in [0, 1].
pub fn advisory_agreement(action: Action, advice: Option<&Advice>) -> f64 {
    let Some(advice) = advice else {
        return NEUTRAL_ADVISORY;
    };
    let conf = advice.confidence.clamp(0.0, 1.0);
    if advice.recommendation == action {
        (conf * 1.2).min(1.0)
    } else if Some(advice.recommendation) == action.opposite() {
        conf * 0.5
    } else {
        conf * 0.8
    }
}

fn execution_notes(signal: &FusedSignal, sizing: &PositionSizing) -> Vec<String> {
    let mut notes = Vec::new();
    if sizing.leverage > 5.0 {
        notes.push("High leverage: monitor closely".to_string());
    }
    if sizing.adjusted_size > 10_000.0 {
        notes.push("Large position: consider scaling in".to_string());
    }
    if signal.market.volatility_score > 0.7 {
        notes.push("High volatility: keep stops tight".to_string());
    }
    notes
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
