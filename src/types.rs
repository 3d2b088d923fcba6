//! Shared types for the TRADESCOUT engine.
//!
//! These types form the data model used across all modules. Everything a
//! cycle produces (strategy results, fused signals, sizings, opportunities)
//! is an immutable value rebuilt from scratch each cycle; only the risk
//! profile and the portfolio ledger live longer than one cycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Result alias used at every typed error boundary in the engine.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// 24h volume (quote currency) at which the volume score saturates.
pub const VOLUME_SCORE_NORMALISER: f64 = 10_000_000.0;

/// Absolute 24h change at which the volatility score saturates.
pub const VOLATILITY_SCORE_NORMALISER: f64 = 0.10;

/// A tradable instrument on one venue, as seen at the start of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradablePair {
    /// Venue-native symbol, e.g. "BTCUSDT".
    pub symbol: String,
    /// Venue identifier, e.g. "binance".
    pub venue: String,
    pub base: String,
    pub quote: String,
    /// Last traded price.
    pub price: f64,
    /// 24h volume in quote currency.
    pub volume_24h: f64,
    /// 24h relative price change (0.05 = +5%).
    pub change_24h: f64,
    /// Highest leverage the venue allows on this pair.
    pub max_leverage: f64,
    /// Smallest order notional the venue accepts.
    pub min_order_size: f64,
}

impl TradablePair {
    /// Unique key across venues: `venue:symbol`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.venue, self.symbol)
    }

    /// Liquidity score in [0, 1].
    pub fn volume_score(&self) -> f64 {
        normalise(self.volume_24h, VOLUME_SCORE_NORMALISER)
    }

    /// Volatility score in [0, 1] from the absolute 24h change.
    pub fn volatility_score(&self) -> f64 {
        normalise(self.change_24h.abs(), VOLATILITY_SCORE_NORMALISER)
    }

    #[cfg(test)]
    pub fn sample(symbol: &str) -> Self {
        TradablePair {
            symbol: symbol.to_string(),
            venue: "mock".to_string(),
            base: symbol.trim_end_matches("USDT").to_string(),
            quote: "USDT".to_string(),
            price: 100.0,
            volume_24h: 5_000_000.0,
            change_24h: 0.03,
            max_leverage: 20.0,
            min_order_size: 10.0,
        }
    }
}

impl fmt::Display for TradablePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} @ {:.4} (vol: {:.0} | 24h: {:+.2}%)",
            self.venue,
            self.symbol,
            self.price,
            self.volume_24h,
            self.change_24h * 100.0,
        )
    }
}

fn normalise(value: f64, saturation: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    (value / saturation).min(1.0)
}

/// Candle interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(EngineError::Configuration(format!("unknown timeframe '{other}'"))),
        }
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Per-(pair, timeframe) market context derived from the candle window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketContext {
    /// Last close in the window.
    pub price: f64,
    /// Standard deviation of close-to-close returns.
    pub volatility: f64,
    /// Directional efficiency of the window, 0 (chop) to 1 (straight line).
    pub trend_strength: f64,
    /// Liquidity score of the pair (see [`TradablePair::volume_score`]).
    pub volume_score: f64,
    /// 24h volatility score of the pair (see [`TradablePair::volatility_score`]).
    pub volatility_score: f64,
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Trade direction recommended by a strategy or the fuser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// The opposing direction. Hold has none.
    pub fn opposite(&self) -> Option<Self> {
        match self {
            Action::Buy => Some(Action::Sell),
            Action::Sell => Some(Action::Buy),
            Action::Hold => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" | "long" => Ok(Action::Buy),
            "sell" | "short" => Ok(Action::Sell),
            "hold" | "neutral" => Ok(Action::Hold),
            other => Err(EngineError::Analyzer {
                strategy: "parse".to_string(),
                message: format!("unknown action '{other}'"),
            }),
        }
    }
}

/// Price levels a strategy may supply alongside its recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalLevels {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Output of one strategy for one (pair, timeframe) window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyResult {
    pub strategy_id: String,
    pub action: Action,
    /// Confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub levels: SignalLevels,
    /// Free-form strategy output kept for audit.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl StrategyResult {
    pub fn new(strategy_id: &str, action: Action, confidence: f64) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            action,
            confidence,
            levels: SignalLevels::default(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_levels(mut self, stop_loss: f64, take_profit: f64) -> Self {
        self.levels = SignalLevels {
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
        };
        self
    }
}

/// What one strategy contributed to a fused decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub action: Action,
    pub confidence: f64,
    pub weight: f64,
    /// `confidence × weight`.
    pub weighted: f64,
}

/// One weighted decision for a (pair, timeframe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSignal {
    pub pair: TradablePair,
    pub timeframe: Timeframe,
    pub action: Action,
    /// Accumulated weight of the winning bucket.
    pub confidence: f64,
    /// Per-strategy contributions keyed by strategy id.
    pub contributions: BTreeMap<String, Contribution>,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub market: MarketContext,
}

impl FusedSignal {
    /// Reward per unit of risk implied by the entry, stop and target.
    pub fn risk_reward(&self) -> f64 {
        let risk = (self.entry_price - self.stop_loss).abs();
        let reward = (self.take_profit - self.entry_price).abs();
        if risk <= f64::EPSILON || !reward.is_finite() {
            return 0.0;
        }
        reward / risk
    }
}

// ---------------------------------------------------------------------------
// Risk profiles
// ---------------------------------------------------------------------------

/// How the base position size is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    Kelly,
    VolatilityInverse,
    Momentum,
}

/// How leverage is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeverageMode {
    Fixed,
    Dynamic,
    Adaptive,
}

/// Operator-selectable risk configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub name: String,
    pub max_leverage: f64,
    /// Base notional for the volatility-inverse and momentum methods.
    pub base_position_size: f64,
    pub max_position_size: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_drawdown: f64,
    pub max_daily_trades: u32,
    pub risk_per_trade: f64,
    pub volatility_threshold: f64,
    pub min_confidence: f64,
    pub emergency_stop_loss: f64,
    pub sizing_method: SizingMethod,
    pub leverage_mode: LeverageMode,
    /// Maximum number of concurrently open positions.
    pub diversification_limit: u32,
}

impl RiskProfile {
    pub fn conservative() -> Self {
        Self {
            name: "conservative".to_string(),
            max_leverage: 2.0,
            base_position_size: 1000.0,
            max_position_size: 5000.0,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.04,
            max_drawdown: 0.05,
            max_daily_trades: 5,
            risk_per_trade: 0.01,
            volatility_threshold: 0.03,
            min_confidence: 0.8,
            emergency_stop_loss: 0.03,
            sizing_method: SizingMethod::Kelly,
            leverage_mode: LeverageMode::Fixed,
            diversification_limit: 3,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            name: "aggressive".to_string(),
            max_leverage: 5.0,
            base_position_size: 2000.0,
            max_position_size: 10_000.0,
            stop_loss_pct: 0.03,
            take_profit_pct: 0.06,
            max_drawdown: 0.10,
            max_daily_trades: 15,
            risk_per_trade: 0.025,
            volatility_threshold: 0.05,
            min_confidence: 0.7,
            emergency_stop_loss: 0.05,
            sizing_method: SizingMethod::VolatilityInverse,
            leverage_mode: LeverageMode::Dynamic,
            diversification_limit: 5,
        }
    }

    pub fn turbo() -> Self {
        Self {
            name: "turbo".to_string(),
            max_leverage: 10.0,
            base_position_size: 5000.0,
            max_position_size: 20_000.0,
            stop_loss_pct: 0.05,
            take_profit_pct: 0.10,
            max_drawdown: 0.20,
            max_daily_trades: 30,
            risk_per_trade: 0.05,
            volatility_threshold: 0.08,
            min_confidence: 0.6,
            emergency_stop_loss: 0.08,
            sizing_method: SizingMethod::Momentum,
            leverage_mode: LeverageMode::Adaptive,
            diversification_limit: 8,
        }
    }

    /// The three built-in profiles, in escalating order of risk.
    pub fn builtin() -> Vec<Self> {
        vec![Self::conservative(), Self::aggressive(), Self::turbo()]
    }

    /// Reject profiles whose numbers cannot be enforced.
    pub fn validate(&self) -> EngineResult<()> {
        let fail = |msg: String| Err(EngineError::Configuration(format!("profile '{}': {msg}", self.name)));

        if self.name.trim().is_empty() {
            return Err(EngineError::Configuration("profile name is empty".to_string()));
        }
        if !self.max_leverage.is_finite() || self.max_leverage < 1.0 {
            return fail(format!("max_leverage must be >= 1, got {}", self.max_leverage));
        }
        if !(self.base_position_size > 0.0) || !(self.max_position_size > 0.0) {
            return fail("position sizes must be positive".to_string());
        }
        if self.base_position_size > self.max_position_size {
            return fail("base_position_size exceeds max_position_size".to_string());
        }
        let fractions = [
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("max_drawdown", self.max_drawdown),
            ("risk_per_trade", self.risk_per_trade),
            ("volatility_threshold", self.volatility_threshold),
            ("emergency_stop_loss", self.emergency_stop_loss),
        ];
        for (field, value) in fractions {
            if !(value > 0.0 && value < 1.0) {
                return fail(format!("{field} must be in (0, 1), got {value}"));
            }
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return fail(format!("min_confidence must be in [0, 1], got {}", self.min_confidence));
        }
        if self.max_daily_trades == 0 {
            return fail("max_daily_trades must be at least 1".to_string());
        }
        if self.diversification_limit == 0 {
            return fail("diversification_limit must be at least 1".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (lev ≤ {:.0}x | max size {:.0} | dd ≤ {:.0}% | {} trades/day)",
            self.name,
            self.max_leverage,
            self.max_position_size,
            self.max_drawdown * 100.0,
            self.max_daily_trades,
        )
    }
}

// ---------------------------------------------------------------------------
// Sizing and opportunities
// ---------------------------------------------------------------------------

/// Position sizing for one candidate. Sizes are notionals in quote currency.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionSizing {
    pub base_size: f64,
    pub leverage: f64,
    pub adjusted_size: f64,
    pub risk_amount: f64,
    pub margin_required: f64,
    pub max_loss: f64,
}

/// Publication priority, ordered low to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Advisory opinion on a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    pub recommendation: Action,
    pub confidence: f64,
}

/// A validated, sized and ranked trade candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub signal: FusedSignal,
    pub sizing: PositionSizing,
    pub priority: Priority,
    pub execution_score: f64,
    pub expected_return: f64,
    pub max_risk: f64,
    pub advice: Option<Advice>,
    pub recommendations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Display for Opportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}] conf {:.2} | score {:.2} | {:.0} @ {:.1}x",
            self.signal.action,
            self.signal.pair.key(),
            self.signal.timeframe,
            self.priority,
            self.signal.confidence,
            self.execution_score,
            self.sizing.adjusted_size,
            self.sizing.leverage,
        )
    }
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

/// An open position as reported by the portfolio layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub venue: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Current notional value.
    pub fn notional(&self) -> f64 {
        (self.quantity * self.mark_price).abs()
    }

    /// Unrealised profit at the current mark.
    pub fn unrealised_pnl(&self) -> f64 {
        let diff = self.mark_price - self.entry_price;
        match self.side {
            PositionSide::Long => diff * self.quantity,
            PositionSide::Short => -diff * self.quantity,
        }
    }
}

/// A closed trade in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub venue: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Persisted paper-portfolio state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub balance: Decimal,
    pub positions: Vec<Position>,
    pub history: Vec<ClosedTrade>,
    pub updated_at: DateTime<Utc>,
}

impl PortfolioState {
    pub fn new(balance: Decimal) -> Self {
        Self {
            balance,
            positions: Vec::new(),
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Realised profit across the whole ledger.
    pub fn realised_pnl(&self) -> Decimal {
        self.history.iter().map(|t| t.pnl).sum()
    }
}

// ---------------------------------------------------------------------------
// Risk metrics and safety
// ---------------------------------------------------------------------------

/// Portfolio-level risk aggregate, recomputed every cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Sum of open position notionals.
    pub total_exposure: f64,
    /// Exposure over balance.
    pub total_leverage: f64,
    /// Worst peak-to-trough equity decline over the ledger.
    pub max_drawdown: f64,
    /// Decline of current equity from its peak.
    pub current_drawdown: f64,
    pub win_rate: f64,
    /// Gross profit over gross loss. `None` without losing trades.
    pub profit_factor: Option<f64>,
    /// Mean over standard deviation of per-trade PnL.
    pub sharpe_ratio: f64,
    pub risk_score: f64,
    pub margin_utilization: f64,
    pub diversification_score: f64,
    pub open_positions: usize,
    pub closed_trades: usize,
}

/// Safety state machine. Ordered by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyState {
    #[default]
    Normal,
    Warning,
    Halted,
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyState::Normal => write!(f, "NORMAL"),
            SafetyState::Warning => write!(f, "WARNING"),
            SafetyState::Halted => write!(f, "HALTED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Transient data error ({venue}): {message}")]
    TransientData { venue: String, message: String },

    #[error("Analyzer error ({strategy}): {message}")]
    Analyzer { strategy: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Safety halt: {0}")]
    SafetyHalt(String),

    #[error("Portfolio error: {0}")]
    Portfolio(String),

    #[error("Advisory error: {0}")]
    Advisory(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn transient(venue: &str, message: impl Into<String>) -> Self {
        EngineError::TransientData {
            venue: venue.to_string(),
            message: message.into(),
        }
    }

    pub fn analyzer(strategy: &str, message: impl Into<String>) -> Self {
        EngineError::Analyzer {
            strategy: strategy.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
