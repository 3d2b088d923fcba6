//! Signal fusion.
//!
//! Combines the per-strategy results for one (pair, timeframe) into a
//! single weighted decision. Each result adds `confidence × weight` to the
//! buy, sell or hold bucket; the heaviest bucket wins and its weight is
//! the fused confidence. A tie for the top bucket resolves to hold.
//!
//! Contributions are accumulated in strategy-id order so the same set of
//! results always fuses to the same signal, whatever order they arrive in.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{
    Action, Contribution, FusedSignal, MarketContext, RiskProfile, StrategyResult, Timeframe,
    TradablePair,
};

/// Fixed-percentage stop/target used when no strategy supplied levels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelDefaults {
    pub stop_pct: f64,
    pub target_pct: f64,
}

impl LevelDefaults {
    pub fn from_profile(profile: &RiskProfile) -> Self {
        Self {
            stop_pct: profile.stop_loss_pct,
            target_pct: profile.take_profit_pct,
        }
    }

    /// Profile defaults with optional per-field overrides.
    pub fn resolve(profile: &RiskProfile, stop_pct: Option<f64>, target_pct: Option<f64>) -> Self {
        let base = Self::from_profile(profile);
        Self {
            stop_pct: stop_pct.unwrap_or(base.stop_pct),
            target_pct: target_pct.unwrap_or(base.target_pct),
        }
    }
}

pub struct SignalFuser {
    weights: BTreeMap<String, f64>,
}

impl SignalFuser {
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self { weights }
    }

    /// Weight for a strategy id. Unweighted strategies contribute nothing.
    pub fn weight(&self, strategy_id: &str) -> f64 {
        self.weights.get(strategy_id).copied().unwrap_or(0.0)
    }

    /// Fuse all results for one (pair, timeframe).
    pub fn fuse(
        &self,
        pair: &TradablePair,
        timeframe: Timeframe,
        market: &MarketContext,
        results: &[StrategyResult],
        defaults: LevelDefaults,
    ) -> FusedSignal {
        // Dedupe by id first so arrival order cannot matter. A repeated id
        // keeps its most confident result; see `outranks` for ties.
        let mut by_id: BTreeMap<&str, &StrategyResult> = BTreeMap::new();
        for r in results {
            by_id
                .entry(r.strategy_id.as_str())
                .and_modify(|kept| {
                    if outranks(r, kept) {
                        *kept = r;
                    }
                })
                .or_insert(r);
        }

        let mut contributions = BTreeMap::new();
        let (mut buy, mut sell, mut hold) = (0.0_f64, 0.0_f64, 0.0_f64);
        for (id, r) in &by_id {
            let weight = self.weight(id);
            let weighted = r.confidence * weight;
            match r.action {
                Action::Buy => buy += weighted,
                Action::Sell => sell += weighted,
                Action::Hold => hold += weighted,
            }
            contributions.insert(
                id.to_string(),
                Contribution {
                    action: r.action,
                    confidence: r.confidence,
                    weight,
                    weighted,
                },
            );
        }

        let top = buy.max(sell).max(hold);
        let leaders = [buy, sell, hold].iter().filter(|w| **w == top).count();
        let action = if leaders > 1 || top <= 0.0 {
            Action::Hold
        } else if buy == top {
            Action::Buy
        } else if sell == top {
            Action::Sell
        } else {
            Action::Hold
        };

        let entry = if market.price > 0.0 { market.price } else { pair.price };
        let (stop_loss, take_profit) = levels(action, entry, &by_id, &contributions, defaults);

        debug!(
            pair = %pair.key(),
            timeframe = %timeframe,
            buy = format!("{buy:.4}"),
            sell = format!("{sell:.4}"),
            hold = format!("{hold:.4}"),
            action = %action,
            "Signals fused"
        );

        FusedSignal {
            pair: pair.clone(),
            timeframe,
            action,
            confidence: top.clamp(0.0, 1.0),
            contributions,
            entry_price: entry,
            stop_loss,
            take_profit,
            market: *market,
        }
    }
}

/// Total order over duplicate results: higher confidence, then the more
/// cautious action (hold, sell, buy), then lower levels.
fn outranks(a: &StrategyResult, b: &StrategyResult) -> bool {
    fn caution(action: Action) -> u8 {
        match action {
            Action::Hold => 2,
            Action::Sell => 1,
            Action::Buy => 0,
        }
    }
    fn level(v: Option<f64>) -> f64 {
        v.unwrap_or(f64::INFINITY)
    }

    a.confidence
        .total_cmp(&b.confidence)
        .then_with(|| caution(a.action).cmp(&caution(b.action)))
        .then_with(|| level(b.levels.stop_loss).total_cmp(&level(a.levels.stop_loss)))
        .then_with(|| level(b.levels.take_profit).total_cmp(&level(a.levels.take_profit)))
        == Ordering::Greater
}

/// Pick stop/target for the fused action.
///
/// Levels come from the heaviest agreeing contributor that supplied them
/// and that sit on the correct side of the entry. Each missing level falls
/// back to the fixed percentage, asymmetric by side.
fn levels(
    action: Action,
    entry: f64,
    results: &BTreeMap<&str, &StrategyResult>,
    contributions: &BTreeMap<String, Contribution>,
    defaults: LevelDefaults,
) -> (f64, f64) {
    let (fallback_stop, fallback_target) = match action {
        Action::Buy => (entry * (1.0 - defaults.stop_pct), entry * (1.0 + defaults.target_pct)),
        Action::Sell => (entry * (1.0 + defaults.stop_pct), entry * (1.0 - defaults.target_pct)),
        Action::Hold => return (entry, entry),
    };

    let stop_ok = |s: f64| match action {
        Action::Buy => s < entry,
        _ => s > entry,
    };
    let target_ok = |t: f64| match action {
        Action::Buy => t > entry,
        _ => t < entry,
    };

    // Heaviest first; BTreeMap order breaks ties by id.
    let mut agreeing: Vec<(&str, f64)> = contributions
        .iter()
        .filter(|(_, c)| c.action == action && c.weighted > 0.0)
        .map(|(id, c)| (id.as_str(), c.weighted))
        .collect();
    agreeing.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let pick = |get: fn(&StrategyResult) -> Option<f64>, ok: &dyn Fn(f64) -> bool| {
        agreeing
            .iter()
            .filter_map(|(id, _)| results.get(id).and_then(|r| get(r)))
            .find(|v| ok(*v))
    };

    let stop = pick(|r| r.levels.stop_loss, &stop_ok).unwrap_or(fallback_stop);
    let target = pick(|r| r.levels.take_profit, &target_ok).unwrap_or(fallback_target);
    (stop, target)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
