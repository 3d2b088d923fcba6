//! Binance public market data.
//!
//! Read-only client for the public spot REST endpoints. No API key needed.
//!
//! API docs: https://developers.binance.com/docs/binance-spot-api-docs/rest-api
//! Endpoints used:
//! - `GET /api/v3/ticker/24hr` (all symbols, weight 80)
//! - `GET /api/v3/klines` (weight 2)

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use super::MarketDataSource;
use crate::types::{Candle, EngineError, EngineResult, Timeframe, TradablePair};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const VENUE: &str = "binance";

/// Hard cap on the klines `limit` parameter.
const MAX_KLINES: usize = 1000;

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

/// Entry of `/api/v3/ticker/24hr`. Numbers arrive as strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    last_price: String,
    price_change_percent: String,
    quote_volume: String,
    #[serde(default)]
    count: u64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Binance public data client, filtered to a single quote asset.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    quote_asset: String,
    max_leverage: f64,
    min_order_size: f64,
}

impl BinanceClient {
    /// Create a new client.
    ///
    /// `max_leverage` is attributed to every pair since the spot endpoints
    /// do not report leverage brackets.
    pub fn new(base_url: Option<&str>, quote_asset: &str, max_leverage: f64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent("TRADESCOUT/0.1.0 (signal-engine)")
            .build()
            .context("Failed to build HTTP client for Binance")?;

        Ok(Self {
            http,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            quote_asset: quote_asset.to_uppercase(),
            max_leverage,
            min_order_size: 10.0,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url = %url, "Fetching Binance endpoint");

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("Binance API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {status}: {body}");
        }

        resp.json()
            .await
            .context("Failed to parse Binance response")
    }

    async fn tickers(&self) -> Result<Vec<TradablePair>> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let raw: Vec<Ticker24h> = self.get_json(&url).await?;
        let total = raw.len();

        let pairs: Vec<TradablePair> = raw
            .into_iter()
            .filter_map(|t| self.convert_ticker(t))
            .collect();

        info!(
            total,
            kept = pairs.len(),
            quote = %self.quote_asset,
            "Binance tickers fetched"
        );
        Ok(pairs)
    }

    /// Convert a raw ticker. Drops other quote assets, dead symbols, and
    /// entries with unparseable numbers.
    fn convert_ticker(&self, t: Ticker24h) -> Option<TradablePair> {
        let base = t.symbol.strip_suffix(self.quote_asset.as_str())?;
        if base.is_empty() || t.count == 0 {
            return None;
        }
        let price: f64 = t.last_price.parse().ok()?;
        let change_pct: f64 = t.price_change_percent.parse().ok()?;
        let volume: f64 = t.quote_volume.parse().ok()?;
        if price <= 0.0 {
            return None;
        }

        Some(TradablePair {
            base: base.to_string(),
            quote: self.quote_asset.clone(),
            symbol: t.symbol,
            venue: VENUE.to_string(),
            price,
            volume_24h: volume,
            change_24h: change_pct / 100.0,
            max_leverage: self.max_leverage,
            min_order_size: self.min_order_size,
        })
    }

    async fn klines(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            urlencoding::encode(symbol),
            timeframe.as_str(),
            limit.clamp(1, MAX_KLINES),
        );
        let rows: Vec<Vec<serde_json::Value>> = self.get_json(&url).await?;

        rows.iter()
            .map(|row| parse_kline(row))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Malformed kline for {symbol} {timeframe}"))
    }
}

/// Parse one kline row: `[open_time, "open", "high", "low", "close", "volume", ...]`.
fn parse_kline(row: &[serde_json::Value]) -> Result<Candle> {
    if row.len() < 6 {
        anyhow::bail!("kline row has {} fields, expected at least 6", row.len());
    }
    let open_ms = row[0].as_i64().context("open time is not an integer")?;
    let num = |i: usize| -> Result<f64> {
        row[i]
            .as_str()
            .context("price field is not a string")?
            .parse::<f64>()
            .context("price field is not a number")
    };

    Ok(Candle {
        open_time: Utc
            .timestamp_millis_opt(open_ms)
            .single()
            .context("open time out of range")?,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    fn venue(&self) -> &str {
        VENUE
    }

    async fn fetch_pairs(&self) -> EngineResult<Vec<TradablePair>> {
        self.tickers()
            .await
            .map_err(|e| EngineError::transient(VENUE, format!("{e:#}")))
    }

    async fn fetch_candles(
        &self,
        pair: &TradablePair,
        timeframe: Timeframe,
        limit: usize,
    ) -> EngineResult<Vec<Candle>> {
        self.klines(&pair.symbol, timeframe, limit)
            .await
            .map_err(|e| EngineError::transient(VENUE, format!("{e:#}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
