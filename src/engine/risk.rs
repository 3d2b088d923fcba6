//! Risk engine: position sizing and pre-trade validation.
//!
//! Both operations are pure functions of their inputs. Sizing picks a base
//! size with the profile's sizing method, scales it by leverage from the
//! profile's leverage mode, then caps it. Validation runs a fixed sequence
//! of gates and stops at the first one that fails.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use super::metrics::PortfolioSnapshot;
use crate::types::{
    Action, FusedSignal, LeverageMode, MarketContext, PositionSizing, RiskProfile, SizingMethod,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper clamp on the Kelly fraction.
const KELLY_CAP: f64 = 0.25;

/// Ceiling applied by the fixed leverage mode.
const FIXED_LEVERAGE_CAP: f64 = 2.0;

/// Realised volatility at which dynamic leverage is fully damped.
const VOLATILITY_DAMPING_SCALE: f64 = 0.1;

/// Dynamic leverage never damps below this factor.
const VOLATILITY_DAMPING_FLOOR: f64 = 0.5;

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Why a candidate failed validation. Not an error: a normal negative result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RejectionReason {
    LowConfidence { confidence: f64, required: f64 },
    DailyTradeLimit { today: u32, limit: u32 },
    DiversificationLimit { open: usize, limit: u32 },
    ExposureLimit { projected: f64, limit: f64 },
    LeverageLimit { leverage: f64, limit: f64 },
    DrawdownLimit { drawdown: f64, limit: f64 },
    BelowMinimumSize { size: f64, minimum: f64 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowConfidence { confidence, required } => {
                write!(f, "Confidence {confidence:.3} below minimum {required:.3}")
            }
            Self::DailyTradeLimit { today, limit } => {
                write!(f, "Daily trade limit reached ({today}/{limit})")
            }
            Self::DiversificationLimit { open, limit } => {
                write!(f, "Open position limit reached ({open}/{limit})")
            }
            Self::ExposureLimit { projected, limit } => {
                write!(f, "Projected exposure {projected:.2} exceeds {limit:.2}")
            }
            Self::LeverageLimit { leverage, limit } => {
                write!(f, "Leverage {leverage:.2}x exceeds {limit:.2}x")
            }
            Self::DrawdownLimit { drawdown, limit } => {
                write!(f, "Drawdown {:.1}% exceeds {:.1}%", drawdown * 100.0, limit * 100.0)
            }
            Self::BelowMinimumSize { size, minimum } => {
                write!(f, "Size {size:.2} below venue minimum {minimum:.2}")
            }
        }
    }
}

/// A fused signal with its sizing, awaiting validation.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub signal: FusedSignal,
    pub sizing: PositionSizing,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RiskEngine;

impl RiskEngine {
    pub fn new() -> Self {
        Self
    }

    /// Size a position for `signal` under `profile`.
    ///
    /// `volatility` is the realised volatility of the window (drives
    /// dynamic leverage damping); `market` carries the trend and the
    /// normalised volume/volatility scores.
    pub fn size(
        &self,
        signal: &FusedSignal,
        balance: f64,
        volatility: f64,
        market: &MarketContext,
        profile: &RiskProfile,
    ) -> PositionSizing {
        let ceiling = profile.max_leverage.min(signal.pair.max_leverage.max(1.0));
        let leverage = self.leverage(signal.confidence, volatility, market, profile, ceiling);

        if !(balance > 0.0) || signal.action == Action::Hold {
            return PositionSizing {
                leverage,
                ..PositionSizing::default()
            };
        }

        let base_size = finite_or_zero(self.base_size(signal, balance, market, profile)).max(0.0);
        let cap = profile.max_position_size.min(balance * profile.max_leverage);
        let adjusted_size = finite_or_zero((base_size * leverage).min(cap)).max(0.0);
        let risk_amount = adjusted_size * profile.risk_per_trade;

        PositionSizing {
            base_size,
            leverage,
            adjusted_size,
            risk_amount,
            margin_required: adjusted_size / leverage,
            max_loss: risk_amount,
        }
    }

    fn base_size(
        &self,
        signal: &FusedSignal,
        balance: f64,
        market: &MarketContext,
        profile: &RiskProfile,
    ) -> f64 {
        match profile.sizing_method {
            SizingMethod::Kelly => balance * kelly_fraction(signal.confidence, signal.risk_reward()),
            SizingMethod::VolatilityInverse => {
                profile.base_position_size / (1.0 + market.volatility_score.max(0.0))
            }
            SizingMethod::Momentum => {
                let momentum = (signal.confidence + market.volume_score + market.volatility_score) / 3.0;
                profile.base_position_size * (0.5 + momentum.clamp(0.0, 1.0) * 0.5)
            }
        }
    }

    /// Leverage for the profile's mode, clamped to `[1, ceiling]`.
    fn leverage(
        &self,
        confidence: f64,
        volatility: f64,
        market: &MarketContext,
        profile: &RiskProfile,
        ceiling: f64,
    ) -> f64 {
        let max = profile.max_leverage;
        let raw = match profile.leverage_mode {
            LeverageMode::Fixed => max.min(FIXED_LEVERAGE_CAP),
            LeverageMode::Dynamic => {
                let damping = (1.0 - volatility / VOLATILITY_DAMPING_SCALE).max(VOLATILITY_DAMPING_FLOOR);
                max * confidence * damping * market.trend_strength
            }
            LeverageMode::Adaptive => {
                max * (0.5 + market.trend_strength * 0.3 + market.volume_score * 0.2)
            }
        };
        finite_or_zero(raw).clamp(1.0, ceiling.max(1.0))
    }

    /// Run the validation gates in order. The first failure wins.
    pub fn validate(
        &self,
        candidate: &Candidate,
        portfolio: &PortfolioSnapshot,
        profile: &RiskProfile,
    ) -> Result<(), RejectionReason> {
        let signal = &candidate.signal;
        let sizing = &candidate.sizing;

        let outcome = Self::gates(signal, sizing, portfolio, profile);
        if let Err(reason) = &outcome {
            debug!(
                pair = %signal.pair.key(),
                timeframe = %signal.timeframe,
                reason = %reason,
                "Candidate rejected"
            );
        }
        outcome
    }

    fn gates(
        signal: &FusedSignal,
        sizing: &PositionSizing,
        portfolio: &PortfolioSnapshot,
        profile: &RiskProfile,
    ) -> Result<(), RejectionReason> {
        if !(signal.confidence >= profile.min_confidence) {
            return Err(RejectionReason::LowConfidence {
                confidence: signal.confidence,
                required: profile.min_confidence,
            });
        }
        if portfolio.trades_today >= profile.max_daily_trades {
            return Err(RejectionReason::DailyTradeLimit {
                today: portfolio.trades_today,
                limit: profile.max_daily_trades,
            });
        }
        if portfolio.positions.len() >= profile.diversification_limit as usize {
            return Err(RejectionReason::DiversificationLimit {
                open: portfolio.positions.len(),
                limit: profile.diversification_limit,
            });
        }
        let projected = portfolio.exposure() + sizing.adjusted_size;
        let exposure_limit = profile.max_position_size * profile.diversification_limit as f64;
        if projected > exposure_limit {
            return Err(RejectionReason::ExposureLimit {
                projected,
                limit: exposure_limit,
            });
        }
        if sizing.leverage > profile.max_leverage {
            return Err(RejectionReason::LeverageLimit {
                leverage: sizing.leverage,
                limit: profile.max_leverage,
            });
        }
        if portfolio.metrics.max_drawdown > profile.max_drawdown {
            return Err(RejectionReason::DrawdownLimit {
                drawdown: portfolio.metrics.max_drawdown,
                limit: profile.max_drawdown,
            });
        }
        let minimum = signal.pair.min_order_size.max(f64::MIN_POSITIVE);
        if sizing.adjusted_size < minimum {
            return Err(RejectionReason::BelowMinimumSize {
                size: sizing.adjusted_size,
                minimum,
            });
        }
        Ok(())
    }
}

/// Each candidate passes the gates on its own against the same snapshot.
/// Walking `sizes` in rank order, flag those that would push the portfolio
/// past its position count or exposure budget if every earlier one were
/// taken too.
pub fn exceeds_cumulative_budget(
    sizes: &[f64],
    portfolio: &PortfolioSnapshot,
    profile: &RiskProfile,
) -> Vec<bool> {
    let limit = profile.diversification_limit as usize;
    let exposure_limit = profile.max_position_size * profile.diversification_limit as f64;
    let mut open = portfolio.positions.len();
    let mut exposure = portfolio.exposure();
    sizes
        .iter()
        .map(|size| {
            open += 1;
            exposure += size;
            open > limit || exposure > exposure_limit
        })
        .collect()
}

/// Kelly fraction `(p·b − (1−p)) / b`, clamped to `[0, KELLY_CAP]`.
pub fn kelly_fraction(p: f64, b: f64) -> f64 {
    if !(b > 0.0) || !p.is_finite() {
        return 0.0;
    }
    let f = (p * b - (1.0 - p)) / b;
    finite_or_zero(f).clamp(0.0, KELLY_CAP)
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
