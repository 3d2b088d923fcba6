//! EMA momentum strategy.
//!
//! Compares a fast and a slow EMA of closes. A spread above the threshold
//! is a buy, below the negative threshold a sell; confidence grows with
//! the spread until it saturates.

use serde_json::json;

use super::{ema, Strategy};
use crate::types::{Action, Candle, EngineError, EngineResult, StrategyResult};

pub const STRATEGY_ID: &str = "momentum";

#[derive(Debug, Clone)]
pub struct EmaMomentum {
    pub fast: usize,
    pub slow: usize,
    /// Relative spread below which the trend is ignored.
    pub threshold: f64,
    /// Relative spread at which confidence saturates.
    pub saturation: f64,
}

impl Default for EmaMomentum {
    fn default() -> Self {
        Self {
            fast: 12,
            slow: 26,
            threshold: 0.002,
            saturation: 0.02,
        }
    }
}

impl Strategy for EmaMomentum {
    fn id(&self) -> &str {
        STRATEGY_ID
    }

    fn min_candles(&self) -> usize {
        self.slow + 1
    }

    fn evaluate(&self, candles: &[Candle]) -> EngineResult<StrategyResult> {
        if candles.len() < self.min_candles() {
            return Err(EngineError::analyzer(
                STRATEGY_ID,
                format!("need {} candles, got {}", self.min_candles(), candles.len()),
            ));
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let fast = ema(&closes, self.fast);
        let slow = ema(&closes, self.slow);

        let (Some(&f), Some(&s)) = (fast.last(), slow.last()) else {
            return Err(EngineError::analyzer(STRATEGY_ID, "empty EMA series"));
        };
        if !f.is_finite() || !s.is_finite() || s.abs() <= f64::EPSILON {
            return Err(EngineError::analyzer(STRATEGY_ID, "degenerate close series"));
        }

        let spread = (f - s) / s;
        let strength = (spread.abs() / self.saturation).min(1.0);
        let conf = (0.4 + strength * 0.5).min(0.95);

        let action = if spread > self.threshold {
            Action::Buy
        } else if spread < -self.threshold {
            Action::Sell
        } else {
            Action::Hold
        };
        let confidence = if action == Action::Hold { 0.2 } else { conf };

        Ok(StrategyResult {
            metadata: json!({ "ema_fast": f, "ema_slow": s, "spread": spread }),
            ..StrategyResult::new(STRATEGY_ID, action, confidence)
        })
    }
}
