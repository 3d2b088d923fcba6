//! Support/resistance range strategy.
//!
//! Locates the recent trading range (lowest low, highest high over a
//! lookback) and buys near support or sells near resistance. Supplies its
//! own stop and target just beyond the opposite side of the trade.

use serde_json::json;

use super::Strategy;
use crate::types::{Action, Candle, EngineError, EngineResult, StrategyResult};

pub const STRATEGY_ID: &str = "support_resistance";

/// Offset applied to range edges when placing levels (0.5%).
const LEVEL_OFFSET: f64 = 0.005;

#[derive(Debug, Clone)]
pub struct SupportResistance {
    /// Candles used to locate the range.
    pub lookback: usize,
    /// Fraction of the range treated as "near" an edge.
    pub edge_zone: f64,
}

impl Default for SupportResistance {
    fn default() -> Self {
        Self {
            lookback: 20,
            edge_zone: 0.2,
        }
    }
}

impl Strategy for SupportResistance {
    fn id(&self) -> &str {
        STRATEGY_ID
    }

    fn min_candles(&self) -> usize {
        self.lookback + 1
    }

    fn evaluate(&self, candles: &[Candle]) -> EngineResult<StrategyResult> {
        if candles.len() < self.min_candles() {
            return Err(EngineError::analyzer(
                STRATEGY_ID,
                format!("need {} candles, got {}", self.min_candles(), candles.len()),
            ));
        }

        let (last, history) = match candles.split_last() {
            Some(split) => split,
            None => return Err(EngineError::analyzer(STRATEGY_ID, "empty window")),
        };
        let window = &history[history.len() - self.lookback..];

        let support = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        let resistance = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
        let price = last.close;

        if !price.is_finite() || !support.is_finite() || !resistance.is_finite() {
            return Err(EngineError::analyzer(STRATEGY_ID, "non-finite prices in window"));
        }

        let range = resistance - support;
        if range <= f64::EPSILON * price.abs().max(1.0) {
            return Ok(StrategyResult::new(STRATEGY_ID, Action::Hold, 0.0));
        }

        let position = ((price - support) / range).clamp(0.0, 1.0);
        let meta = json!({
            "support": support,
            "resistance": resistance,
            "range_position": position,
        });

        let result = if position <= self.edge_zone {
            // Closer to support = stronger bounce case.
            let conf = 0.5 + (self.edge_zone - position) / self.edge_zone * 0.4;
            StrategyResult::new(STRATEGY_ID, Action::Buy, conf.min(0.9)).with_levels(
                support * (1.0 - LEVEL_OFFSET),
                resistance * (1.0 - LEVEL_OFFSET),
            )
        } else if position >= 1.0 - self.edge_zone {
            let conf = 0.5 + (position - (1.0 - self.edge_zone)) / self.edge_zone * 0.4;
            StrategyResult::new(STRATEGY_ID, Action::Sell, conf.min(0.9)).with_levels(
                resistance * (1.0 + LEVEL_OFFSET),
                support * (1.0 + LEVEL_OFFSET),
            )
        } else {
            StrategyResult::new(STRATEGY_ID, Action::Hold, 0.3)
        };

        Ok(StrategyResult { metadata: meta, ..result })
    }
}
