//! Mock venue and portfolio for integration testing.
//!
//! Provides deterministic `MarketDataSource` and `PortfolioSource`
//! implementations whose pairs, failures, latency and ledger are fully
//! controllable from test code, plus a few fixed strategies and an engine
//! builder wired the way the binary wires it.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tradescout::advisor::Advisor;
use tradescout::engine::detection::{DetectionEngine, EngineConfig, EngineParts};
use tradescout::engine::fusion::SignalFuser;
use tradescout::engine::ranker::{OpportunityRanker, RankerConfig};
use tradescout::engine::scanner::{Scanner, ScannerConfig};
use tradescout::exchange::{MarketDataSource, PortfolioSource};
use tradescout::strategy::Strategy;
use tradescout::types::*;

pub const VENUE: &str = "mockex";

pub fn make_pair(symbol: &str, price: f64) -> TradablePair {
    TradablePair {
        symbol: symbol.to_string(),
        venue: VENUE.to_string(),
        base: symbol.trim_end_matches("USDT").to_string(),
        quote: "USDT".to_string(),
        price,
        volume_24h: 8_000_000.0,
        change_24h: 0.04,
        max_leverage: 20.0,
        min_order_size: 10.0,
    }
}

/// `n` hourly candles rising steadily to `price`.
pub fn rising_candles(price: f64, n: usize) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let from = price * 0.95;
    let step = (price - from) / (n.max(2) - 1) as f64;
    (0..n)
        .map(|i| {
            let close = from + step * i as f64;
            Candle {
                open_time: start + ChronoDuration::hours(i as i64),
                open: close - step / 2.0,
                high: close * 1.002,
                low: close * 0.998,
                close,
                volume: 1_000.0,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// A mock venue. All state is in-memory.
pub struct MockExchange {
    pairs: Mutex<Vec<TradablePair>>,
    failing: Mutex<Vec<String>>,
    slow: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
    /// If set, pair discovery returns this error.
    force_error: Mutex<Option<String>>,
    pub pair_calls: AtomicUsize,
    pub candle_calls: AtomicUsize,
}

impl MockExchange {
    pub fn new(pairs: Vec<TradablePair>) -> Self {
        Self {
            pairs: Mutex::new(pairs),
            failing: Mutex::new(Vec::new()),
            slow: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
            force_error: Mutex::new(None),
            pair_calls: AtomicUsize::new(0),
            candle_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_pairs(&self, pairs: Vec<TradablePair>) {
        *self.pairs.lock().unwrap() = pairs;
    }

    /// Candle fetches for `symbol` fail.
    pub fn fail_symbol(&self, symbol: &str) {
        self.failing.lock().unwrap().push(symbol.to_string());
    }

    /// Candle fetches for `symbol` take far longer than any item timeout.
    pub fn stall_symbol(&self, symbol: &str) {
        self.slow.lock().unwrap().push(symbol.to_string());
    }

    /// Latency added to every candle fetch.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn pair_calls(&self) -> usize {
        self.pair_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataSource for MockExchange {
    fn venue(&self) -> &str {
        VENUE
    }

    async fn fetch_pairs(&self) -> EngineResult<Vec<TradablePair>> {
        self.pair_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(EngineError::transient(VENUE, msg));
        }
        Ok(self.pairs.lock().unwrap().clone())
    }

    async fn fetch_candles(
        &self,
        pair: &TradablePair,
        _timeframe: Timeframe,
        limit: usize,
    ) -> EngineResult<Vec<Candle>> {
        self.candle_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        let stalled = self.slow.lock().unwrap().contains(&pair.symbol);
        let failing = self.failing.lock().unwrap().contains(&pair.symbol);

        if stalled {
            tokio::time::sleep(Duration::from_secs(5)).await;
        } else if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if failing {
            return Err(EngineError::transient(VENUE, format!("klines unavailable for {}", pair.symbol)));
        }
        Ok(rising_candles(pair.price, limit))
    }
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

pub struct MockPortfolio {
    balance: Mutex<f64>,
    positions: Mutex<Vec<Position>>,
    history: Mutex<Vec<ClosedTrade>>,
    force_error: Mutex<Option<String>>,
    pub close_all_calls: AtomicUsize,
    failing_closes: AtomicUsize,
}

impl MockPortfolio {
    pub fn new(balance: f64) -> Self {
        Self {
            balance: Mutex::new(balance),
            positions: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            force_error: Mutex::new(None),
            close_all_calls: AtomicUsize::new(0),
            failing_closes: AtomicUsize::new(0),
        }
    }

    pub fn add_position(&self, position: Position) {
        self.positions.lock().unwrap().push(position);
    }

    /// Book a realised loss of `loss` quote units from an old trade.
    pub fn book_loss(&self, symbol: &str, loss: f64) {
        let opened = Utc::now() - ChronoDuration::days(3);
        *self.balance.lock().unwrap() -= loss;
        self.history.lock().unwrap().push(ClosedTrade {
            symbol: symbol.to_string(),
            venue: VENUE.to_string(),
            side: PositionSide::Long,
            quantity: 1.0,
            entry_price: 100.0 + loss,
            exit_price: 100.0,
            pnl: -Decimal::try_from(loss).unwrap(),
            opened_at: opened,
            closed_at: opened + ChronoDuration::hours(4),
        });
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    /// Make the next `n` close-all calls fail without closing anything.
    pub fn fail_next_closes(&self, n: usize) {
        self.failing_closes.store(n, Ordering::SeqCst);
    }

    pub fn open_positions(&self) -> usize {
        self.positions.lock().unwrap().len()
    }

    pub fn close_all_calls(&self) -> usize {
        self.close_all_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> EngineResult<()> {
        match self.force_error.lock().unwrap().clone() {
            Some(msg) => Err(EngineError::Portfolio(msg)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PortfolioSource for MockPortfolio {
    async fn fetch_open_positions(&self) -> EngineResult<Vec<Position>> {
        self.check()?;
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn fetch_balance(&self) -> EngineResult<f64> {
        self.check()?;
        Ok(*self.balance.lock().unwrap())
    }

    async fn fetch_trade_history(&self) -> EngineResult<Vec<ClosedTrade>> {
        self.check()?;
        Ok(self.history.lock().unwrap().clone())
    }

    async fn close_all_positions(&self) -> EngineResult<usize> {
        self.close_all_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_closes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(EngineError::Portfolio("venue rejected close".to_string()));
        }
        let mut positions = self.positions.lock().unwrap();
        let closed = positions.len();
        positions.clear();
        Ok(closed)
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Always returns the same verdict.
pub struct FixedStrategy {
    pub id: &'static str,
    pub action: Action,
    pub confidence: f64,
}

impl Strategy for FixedStrategy {
    fn id(&self) -> &str {
        self.id
    }

    fn evaluate(&self, _candles: &[Candle]) -> EngineResult<StrategyResult> {
        Ok(StrategyResult::new(self.id, self.action, self.confidence))
    }
}

/// Buys, but errors on any window closing above `max_price`.
pub struct PickyStrategy {
    pub max_price: f64,
}

impl Strategy for PickyStrategy {
    fn id(&self) -> &str {
        "picky"
    }

    fn evaluate(&self, candles: &[Candle]) -> EngineResult<StrategyResult> {
        let last = candles.last().map(|c| c.close).unwrap_or(0.0);
        if last > self.max_price {
            return Err(EngineError::analyzer("picky", format!("price {last} out of range")));
        }
        Ok(StrategyResult::new("picky", Action::Buy, 0.9))
    }
}

pub struct PanickingStrategy;

impl Strategy for PanickingStrategy {
    fn id(&self) -> &str {
        "panics"
    }

    fn evaluate(&self, _candles: &[Candle]) -> EngineResult<StrategyResult> {
        panic!("indicator blew up");
    }
}

pub fn buy(id: &'static str, confidence: f64) -> Arc<dyn Strategy> {
    Arc::new(FixedStrategy {
        id,
        action: Action::Buy,
        confidence,
    })
}

pub fn hold(id: &'static str, confidence: f64) -> Arc<dyn Strategy> {
    Arc::new(FixedStrategy {
        id,
        action: Action::Hold,
        confidence,
    })
}

// ---------------------------------------------------------------------------
// Engine wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub exchange: Arc<MockExchange>,
    pub portfolio: Arc<MockPortfolio>,
    pub engine: Arc<DetectionEngine>,
}

pub fn build_engine(
    pairs: Vec<TradablePair>,
    strategies: Vec<Arc<dyn Strategy>>,
    weights: &[(&str, f64)],
    advisor: Option<Arc<dyn Advisor>>,
    profile: &str,
) -> Harness {
    let exchange = Arc::new(MockExchange::new(pairs));
    let portfolio = Arc::new(MockPortfolio::new(10_000.0));

    let scanner = Scanner::new(
        ScannerConfig {
            timeframes: vec![Timeframe::H1],
            chunk_size: 4,
            chunk_pause_ms: 0,
            item_timeout_ms: 500,
            ..ScannerConfig::default()
        },
        vec![exchange.clone() as Arc<dyn MarketDataSource>],
    );
    let weights: BTreeMap<String, f64> = weights.iter().map(|(k, v)| (k.to_string(), *v)).collect();

    let parts = EngineParts {
        scanner,
        fuser: SignalFuser::new(weights),
        ranker: OpportunityRanker::new(RankerConfig::default()),
        strategies,
        portfolio: portfolio.clone(),
        advisor,
    };
    let config = EngineConfig {
        timeframes: vec![Timeframe::H1],
        advisory_timeout: Duration::from_millis(100),
        ..EngineConfig::default()
    };
    let profiles = RiskProfile::builtin()
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect();

    let engine = DetectionEngine::new(config, parts, profiles, profile).unwrap();
    Harness {
        exchange,
        portfolio,
        engine: Arc::new(engine),
    }
}
