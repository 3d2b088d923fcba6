//! Exchange connectivity.
//!
//! Defines the two async data-access traits the engine consumes and
//! provides implementations for:
//! - Binance-compatible public REST market data (read-only)
//! - An in-memory paper portfolio persisted to JSON
//!
//! All methods must be safe to call concurrently, and must report failure
//! as an `Err` distinct from an empty (no data) `Ok`.

pub mod binance;
pub mod paper;

use async_trait::async_trait;

use crate::types::{Candle, ClosedTrade, EngineResult, Position, Timeframe, TradablePair};

/// Read-only market data for one venue.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Venue identifier. Must match `TradablePair::venue` of returned pairs.
    fn venue(&self) -> &str;

    /// Snapshot of all tradable pairs with their 24h statistics.
    async fn fetch_pairs(&self) -> EngineResult<Vec<TradablePair>>;

    /// The most recent `limit` candles, oldest first.
    async fn fetch_candles(
        &self,
        pair: &TradablePair,
        timeframe: Timeframe,
        limit: usize,
    ) -> EngineResult<Vec<Candle>>;
}

/// The portfolio the engine reads each cycle and flattens on a safety halt.
#[async_trait]
pub trait PortfolioSource: Send + Sync {
    async fn fetch_open_positions(&self) -> EngineResult<Vec<Position>>;

    /// Free balance in quote currency.
    async fn fetch_balance(&self) -> EngineResult<f64>;

    /// Closed trades, oldest first.
    async fn fetch_trade_history(&self) -> EngineResult<Vec<ClosedTrade>>;

    /// Close every open position. Returns how many were closed.
    async fn close_all_positions(&self) -> EngineResult<usize>;
}
