//! Paper portfolio.
//!
//! In-memory portfolio used by the binary and by tests. Keeps a Decimal
//! ledger of closed trades so realised PnL never accumulates float error.
//! State can be snapshotted for persistence (see `storage`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::PortfolioSource;
use crate::types::{
    ClosedTrade, EngineError, EngineResult, Position, PortfolioState, PositionSide,
};

pub struct PaperPortfolio {
    state: RwLock<PortfolioState>,
}

impl PaperPortfolio {
    pub fn new(balance: Decimal) -> Self {
        Self::from_state(PortfolioState::new(balance))
    }

    /// Resume from a previously saved state.
    pub fn from_state(state: PortfolioState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Copy of the current state, for persistence or display.
    pub async fn snapshot(&self) -> PortfolioState {
        self.state.read().await.clone()
    }

    /// Open a position. Margin (`notional / leverage`) is reserved from the balance.
    pub async fn open_position(&self, position: Position) -> EngineResult<()> {
        if !(position.quantity > 0.0) || !(position.entry_price > 0.0) || !(position.leverage >= 1.0) {
            return Err(EngineError::Portfolio(format!(
                "invalid position for {}: qty {} @ {} x{}",
                position.symbol, position.quantity, position.entry_price, position.leverage
            )));
        }

        let margin = to_decimal(position.quantity * position.entry_price / position.leverage)?;
        let mut state = self.state.write().await;
        if margin > state.balance {
            return Err(EngineError::Portfolio(format!(
                "insufficient balance for {}: need {:.2}, have {:.2}",
                position.symbol, margin, state.balance
            )));
        }

        state.balance -= margin;
        state.positions.push(position);
        state.updated_at = Utc::now();
        Ok(())
    }

    /// Update the mark price of every position on `symbol`.
    pub async fn mark(&self, symbol: &str, price: f64) {
        let mut state = self.state.write().await;
        for pos in state.positions.iter_mut().filter(|p| p.symbol == symbol) {
            pos.mark_price = price;
        }
    }

    /// Close every position on `symbol` at `exit_price`.
    pub async fn close_symbol(&self, symbol: &str, exit_price: f64) -> EngineResult<Vec<ClosedTrade>> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let (closing, keep): (Vec<Position>, Vec<Position>) =
            state.positions.drain(..).partition(|p| p.symbol == symbol);
        state.positions = keep;

        let mut closed = Vec::with_capacity(closing.len());
        for pos in closing {
            let trade = settle(&pos, exit_price, now)?;
            state.balance += to_decimal(pos.quantity * pos.entry_price / pos.leverage)? + trade.pnl;
            state.history.push(trade.clone());
            closed.push(trade);
        }
        state.updated_at = now;
        Ok(closed)
    }
}

fn to_decimal(value: f64) -> EngineResult<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| EngineError::Portfolio(format!("value {value} is not representable")))
}

fn settle(pos: &Position, exit_price: f64, now: DateTime<Utc>) -> EngineResult<ClosedTrade> {
    let diff = exit_price - pos.entry_price;
    let pnl = match pos.side {
        PositionSide::Long => diff * pos.quantity,
        PositionSide::Short => -diff * pos.quantity,
    };

    Ok(ClosedTrade {
        symbol: pos.symbol.clone(),
        venue: pos.venue.clone(),
        side: pos.side,
        quantity: pos.quantity,
        entry_price: pos.entry_price,
        exit_price,
        pnl: to_decimal(pnl)?.round_dp(8),
        opened_at: pos.opened_at,
        closed_at: now,
    })
}

#[async_trait]
impl PortfolioSource for PaperPortfolio {
    async fn fetch_open_positions(&self) -> EngineResult<Vec<Position>> {
        Ok(self.state.read().await.positions.clone())
    }

    async fn fetch_balance(&self) -> EngineResult<f64> {
        let balance = self.state.read().await.balance;
        balance
            .to_f64()
            .ok_or_else(|| EngineError::Portfolio(format!("balance {balance} out of range")))
    }

    async fn fetch_trade_history(&self) -> EngineResult<Vec<ClosedTrade>> {
        Ok(self.state.read().await.history.clone())
    }

    async fn close_all_positions(&self) -> EngineResult<usize> {
        let symbols: Vec<(String, f64)> = {
            let state = self.state.read().await;
            state
                .positions
                .iter()
                .map(|p| (p.symbol.clone(), p.mark_price))
                .collect()
        };

        let mut closed = 0;
        let mut done: Vec<&str> = Vec::new();
        for (symbol, mark) in &symbols {
            if done.contains(&symbol.as_str()) {
                continue;
            }
            closed += self.close_symbol(symbol, *mark).await?.len();
            done.push(symbol);
        }

        if closed > 0 {
            let balance = self.state.read().await.balance;
            warn!(closed, balance = %balance, "Paper portfolio flattened");
        } else {
            info!("Paper portfolio already flat");
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_position(symbol: &str, side: PositionSide, qty: f64, entry: f64, lev: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            venue: "paper".to_string(),
            side,
            quantity: qty,
            entry_price: entry,
            mark_price: entry,
            leverage: lev,
            opened_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_open_reserves_margin() {
        let p = PaperPortfolio::new(dec!(1000));
        p.open_position(make_position("BTCUSDT", PositionSide::Long, 2.0, 100.0, 2.0))
            .await
            .unwrap();
        assert_eq!(p.snapshot().await.balance, dec!(900));
        assert_eq!(p.fetch_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_rejects_insufficient_balance() {
        let p = PaperPortfolio::new(dec!(50));
        let err = p
            .open_position(make_position("BTCUSDT", PositionSide::Long, 1.0, 100.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Portfolio(_)));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_position() {
        let p = PaperPortfolio::new(dec!(1000));
        assert!(p
            .open_position(make_position("BTCUSDT", PositionSide::Long, 0.0, 100.0, 1.0))
            .await
            .is_err());
        assert!(p
            .open_position(make_position("BTCUSDT", PositionSide::Long, 1.0, 100.0, 0.5))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_close_symbol_long_profit() {
        let p = PaperPortfolio::new(dec!(1000));
        p.open_position(make_position("ETHUSDT", PositionSide::Long, 1.0, 100.0, 1.0))
            .await
            .unwrap();
        let closed = p.close_symbol("ETHUSDT", 110.0).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].pnl, dec!(10));

        let state = p.snapshot().await;
        assert_eq!(state.balance, dec!(1010));
        assert!(state.positions.is_empty());
        assert_eq!(state.history.len(), 1);
    }

    #[tokio::test]
    async fn test_close_symbol_short_loss() {
        let p = PaperPortfolio::new(dec!(1000));
        p.open_position(make_position("SOLUSDT", PositionSide::Short, 2.0, 50.0, 1.0))
            .await
            .unwrap();
        let closed = p.close_symbol("SOLUSDT", 55.0).await.unwrap();
        assert_eq!(closed[0].pnl, dec!(-10));
        assert_eq!(p.snapshot().await.balance, dec!(990));
    }

    #[tokio::test]
    async fn test_close_all_uses_marks() {
        let p = PaperPortfolio::new(dec!(1000));
        p.open_position(make_position("BTCUSDT", PositionSide::Long, 1.0, 100.0, 1.0))
            .await
            .unwrap();
        p.open_position(make_position("BTCUSDT", PositionSide::Long, 1.0, 100.0, 1.0))
            .await
            .unwrap();
        p.open_position(make_position("ETHUSDT", PositionSide::Short, 1.0, 100.0, 1.0))
            .await
            .unwrap();
        p.mark("BTCUSDT", 90.0).await;
        p.mark("ETHUSDT", 95.0).await;

        let closed = p.close_all_positions().await.unwrap();
        assert_eq!(closed, 3);
        assert!(p.fetch_open_positions().await.unwrap().is_empty());
        // -10 -10 +5
        assert_eq!(p.snapshot().await.realised_pnl(), dec!(-15));
        assert_eq!(p.snapshot().await.balance, dec!(985));
    }

    #[test]
    fn test_fetch_balance_blocking() {
        let p = PaperPortfolio::new(dec!(1234.5));
        let balance = tokio_test::block_on(p.fetch_balance()).unwrap();
        assert!((balance - 1234.5).abs() < 1e-9);
    }

    #[test]
    fn test_close_all_when_flat() {
        let p = PaperPortfolio::new(dec!(10));
        tokio_test::assert_ok!(tokio_test::block_on(p.close_all_positions()));
    }
}
