//! Portfolio risk metrics.
//!
//! Rebuilds [`RiskMetrics`] from scratch each cycle out of the closed-trade
//! ledger, the open positions and the free balance. The result is wrapped
//! in a [`PortfolioSnapshot`] that every later stage of the cycle reads, so
//! sizing, validation and the safety check all see the same numbers.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::exchange::PortfolioSource;
use crate::types::{ClosedTrade, EngineResult, Position, RiskMetrics, RiskProfile};

/// Distinct symbols at which diversification is considered full.
const DIVERSIFICATION_TARGET: f64 = 10.0;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One consistent read of the portfolio, taken once per cycle.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub balance: f64,
    pub positions: Vec<Position>,
    /// Trades opened today (UTC), open or closed.
    pub trades_today: u32,
    pub metrics: RiskMetrics,
    pub taken_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    /// Read balance, positions and history concurrently and derive metrics.
    pub async fn capture(portfolio: &dyn PortfolioSource, profile: &RiskProfile) -> EngineResult<Self> {
        let (balance, positions, history) = tokio::try_join!(
            portfolio.fetch_balance(),
            portfolio.fetch_open_positions(),
            portfolio.fetch_trade_history(),
        )?;
        Ok(Self::from_parts(balance, positions, &history, profile, Utc::now()))
    }

    pub fn from_parts(
        balance: f64,
        positions: Vec<Position>,
        history: &[ClosedTrade],
        profile: &RiskProfile,
        now: DateTime<Utc>,
    ) -> Self {
        let metrics = compute_metrics(history, &positions, balance, profile);
        let trades_today = trades_on(now.date_naive(), &positions, history);
        debug!(
            balance = format!("{balance:.2}"),
            positions = positions.len(),
            trades_today,
            drawdown = format!("{:.2}%", metrics.max_drawdown * 100.0),
            risk_score = format!("{:.2}", metrics.risk_score),
            "Portfolio snapshot taken"
        );
        Self {
            balance,
            positions,
            trades_today,
            metrics,
            taken_at: now,
        }
    }

    /// Sum of open position notionals.
    pub fn exposure(&self) -> f64 {
        self.metrics.total_exposure
    }
}

/// Count trades opened on `day`, across open positions and the ledger.
pub fn trades_on(day: NaiveDate, positions: &[Position], history: &[ClosedTrade]) -> u32 {
    let open = positions.iter().filter(|p| p.opened_at.date_naive() == day).count();
    let closed = history.iter().filter(|t| t.opened_at.date_naive() == day).count();
    (open + closed) as u32
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Derive risk metrics. `history` need not be sorted.
pub fn compute_metrics(
    history: &[ClosedTrade],
    positions: &[Position],
    balance: f64,
    profile: &RiskProfile,
) -> RiskMetrics {
    let exposure: f64 = positions.iter().map(Position::notional).sum();
    let total_leverage = if balance > 0.0 { exposure / balance } else { 0.0 };
    let margin_utilization = if balance > 0.0 {
        exposure / (balance * profile.max_leverage)
    } else if exposure > 0.0 {
        1.0
    } else {
        0.0
    };

    let mut trades: Vec<&ClosedTrade> = history.iter().collect();
    trades.sort_by_key(|t| t.closed_at);
    let pnls: Vec<f64> = trades.iter().map(|t| t.pnl.to_f64().unwrap_or(0.0)).collect();

    let wins = pnls.iter().filter(|p| **p > 0.0).count();
    let win_rate = if pnls.is_empty() { 0.0 } else { wins as f64 / pnls.len() as f64 };

    let gross_win: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
    let gross_loss: f64 = pnls.iter().filter(|p| **p < 0.0).map(|p| -p).sum();
    let profit_factor = (gross_loss > 0.0).then(|| gross_win / gross_loss);

    let sharpe_ratio = if pnls.len() >= 2 {
        let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
        let var = pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (pnls.len() - 1) as f64;
        if var > 0.0 { mean / var.sqrt() } else { 0.0 }
    } else {
        0.0
    };

    let (max_drawdown, current_drawdown) = drawdowns(&pnls, positions, balance);

    let mut symbols: Vec<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();
    symbols.sort_unstable();
    symbols.dedup();
    let diversification_score = (symbols.len() as f64 / DIVERSIFICATION_TARGET).min(1.0);

    let leverage_utilization = (total_leverage / profile.max_leverage).min(1.0);
    let mut risk_score = leverage_utilization * 0.3 + max_drawdown * 0.4;
    if !pnls.is_empty() {
        risk_score += (1.0 - win_rate) * 0.3;
    }

    RiskMetrics {
        total_exposure: exposure,
        total_leverage,
        max_drawdown,
        current_drawdown,
        win_rate,
        profit_factor,
        sharpe_ratio,
        risk_score: risk_score.clamp(0.0, 1.0),
        margin_utilization,
        diversification_score,
        open_positions: positions.len(),
        closed_trades: pnls.len(),
    }
}

/// Max and current peak-to-trough drawdown of the equity curve.
///
/// The curve starts at the equity before the first closed trade, steps
/// through each realised PnL, and ends with open positions marked to market.
fn drawdowns(pnls: &[f64], positions: &[Position], balance: f64) -> (f64, f64) {
    let locked_margin: f64 = positions
        .iter()
        .map(|p| p.quantity.abs() * p.entry_price / p.leverage.max(1.0))
        .sum();
    let unrealised: f64 = positions.iter().map(Position::unrealised_pnl).sum();
    let realised: f64 = pnls.iter().sum();

    let mut equity = balance + locked_margin - realised;
    let mut peak = equity;
    let mut max_dd: f64 = 0.0;

    let mut observe = |equity: f64, peak: &mut f64| -> f64 {
        if equity > *peak {
            *peak = equity;
        }
        let dd = if *peak > 0.0 { ((*peak - equity) / *peak).max(0.0) } else { 0.0 };
        max_dd = max_dd.max(dd);
        dd
    };

    let mut current = observe(equity, &mut peak);
    for pnl in pnls {
        equity += pnl;
        current = observe(equity, &mut peak);
    }
    if !positions.is_empty() {
        equity += unrealised;
        current = observe(equity, &mut peak);
    }

    (max_dd.min(1.0), current.min(1.0))
}

/// Human-readable risk recommendations for the status view.
pub fn recommendations(metrics: &RiskMetrics, profile: &RiskProfile) -> Vec<String> {
    let mut out = Vec::new();
    if metrics.risk_score > 0.7 {
        out.push("High risk score: consider reducing position sizes".to_string());
    }
    if metrics.max_drawdown > profile.max_drawdown * 0.8 {
        out.push(format!(
            "Drawdown {:.1}% approaching limit {:.1}%",
            metrics.max_drawdown * 100.0,
            profile.max_drawdown * 100.0
        ));
    }
    if metrics.closed_trades > 0 && metrics.win_rate < 0.4 {
        out.push("Low win rate: review strategy weights".to_string());
    }
    if metrics.open_positions > 0 && metrics.diversification_score < 0.3 {
        out.push("Low diversification: spread exposure across more pairs".to_string());
    }
    if metrics.margin_utilization > 0.8 {
        out.push("High margin utilisation: risk of liquidation".to_string());
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
