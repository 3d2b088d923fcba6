//! Strategy adapters.
//!
//! Every technical-analysis strategy is consumed through the [`Strategy`]
//! trait: a stateless evaluation of one candle window into an
//! `{action, confidence, levels, metadata}` result. The scanner is generic
//! over any implementer, so new strategies register without touching it.
//!
//! Two reference strategies ship with the crate for the binary:
//! - [`support_resistance::SupportResistance`]: range position with levels
//! - [`momentum::EmaMomentum`]: fast/slow EMA spread

pub mod momentum;
pub mod support_resistance;

use std::sync::Arc;

use crate::types::{Candle, EngineResult, StrategyResult};

/// A stateless signal generator over one OHLCV window.
///
/// Implementations must not hold shared mutable state: the scanner calls
/// `evaluate` from many tasks at once.
pub trait Strategy: Send + Sync {
    /// Stable identifier, used as the weight key during fusion.
    fn id(&self) -> &str;

    /// Smallest window this strategy can evaluate.
    fn min_candles(&self) -> usize {
        1
    }

    /// Evaluate the window (oldest candle first).
    fn evaluate(&self, candles: &[Candle]) -> EngineResult<StrategyResult>;
}

/// The reference strategies, ready to hand to the scanner.
pub fn builtin() -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(support_resistance::SupportResistance::default()),
        Arc::new(momentum::EmaMomentum::default()),
    ]
}

/// Exponential moving average over closes. Empty input yields an empty series.
pub(crate) fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    if values.is_empty() || period == 0 {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut prev = values[0];
    out.push(prev);
    for v in &values[1..] {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}
