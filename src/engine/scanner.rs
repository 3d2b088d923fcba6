//! Multi-venue pair scanner.
//!
//! Fans strategy evaluation out across the product of tradable pairs,
//! timeframes and strategies. Each (pair, timeframe, strategy) triple is
//! one work item. Items run in chunks under a fixed worker bound, with a
//! short pause between chunks so the data source is not flooded.
//!
//! A failing item (fetch error, timeout, malformed adapter output, adapter
//! panic) is recorded in the scan failures and dropped. It never aborts
//! its siblings or the scan.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::exchange::MarketDataSource;
use crate::strategy::Strategy;
use crate::types::{
    Candle, EngineError, EngineResult, MarketContext, StrategyResult, Timeframe, TradablePair,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub timeframes: Vec<Timeframe>,
    /// Minimum 24h quote volume for a pair to be scanned.
    pub min_volume_24h: f64,
    /// Minimum absolute 24h change for a pair to be scanned.
    pub min_change_24h: f64,
    /// Work items allowed in flight at once.
    pub max_concurrency: usize,
    /// Work items dispatched per chunk.
    pub chunk_size: usize,
    pub chunk_pause_ms: u64,
    /// Candles requested per (pair, timeframe).
    pub candle_limit: usize,
    /// Windows shorter than this are skipped.
    pub min_candles: usize,
    /// Per-item budget covering fetch and evaluation.
    pub item_timeout_ms: u64,
    /// Highest-volume pairs kept per venue during discovery.
    pub max_pairs_per_venue: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::H1, Timeframe::H4],
            min_volume_24h: 1_000_000.0,
            min_change_24h: 0.01,
            max_concurrency: 8,
            chunk_size: 50,
            chunk_pause_ms: 100,
            candle_limit: 100,
            min_candles: 50,
            item_timeout_ms: 10_000,
            max_pairs_per_venue: 100,
        }
    }
}

impl ScannerConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let err = |msg: &str| Err(EngineError::Configuration(format!("scanner: {msg}")));
        if self.timeframes.is_empty() {
            return err("at least one timeframe is required");
        }
        if self.max_concurrency == 0 {
            return err("max_concurrency must be at least 1");
        }
        if self.chunk_size == 0 {
            return err("chunk_size must be at least 1");
        }
        if self.candle_limit == 0 || self.min_candles > self.candle_limit {
            return err("min_candles must not exceed a non-zero candle_limit");
        }
        if self.item_timeout_ms == 0 {
            return err("item_timeout_ms must be at least 1");
        }
        if !(self.min_volume_24h >= 0.0) || !(self.min_change_24h >= 0.0) {
            return err("pre-filter thresholds must be non-negative");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// One strategy result, tagged with the pair and window it came from.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub pair: Arc<TradablePair>,
    pub timeframe: Timeframe,
    pub market: MarketContext,
    pub result: StrategyResult,
}

/// A dropped work item.
#[derive(Debug, Clone)]
pub struct ScanFailure {
    pub pair_key: String,
    pub timeframe: Timeframe,
    pub strategy_id: String,
    pub error: EngineError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanStats {
    pub pairs_offered: usize,
    pub pairs_scanned: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items whose window was too short to evaluate.
    pub skipped: usize,
    pub timed_out: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    /// Results in work-item order (pair, then timeframe, then strategy).
    pub results: Vec<ScanResult>,
    pub failures: Vec<ScanFailure>,
    pub stats: ScanStats,
}

// ---------------------------------------------------------------------------
// Candle cache
// ---------------------------------------------------------------------------

struct Window {
    candles: Vec<Candle>,
    market: MarketContext,
}

type WindowCell = Arc<OnceCell<EngineResult<Arc<Window>>>>;

/// Per-scan cache so strategies sharing a (pair, timeframe) share one fetch.
#[derive(Default)]
struct CandleCache {
    cells: Mutex<HashMap<(String, Timeframe), WindowCell>>,
}

impl CandleCache {
    fn cell(&self, key: &str, timeframe: Timeframe) -> WindowCell {
        let mut cells = match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cells
            .entry((key.to_string(), timeframe))
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

struct WorkItem {
    index: usize,
    pair: Arc<TradablePair>,
    timeframe: Timeframe,
    strategy: Arc<dyn Strategy>,
    source: Arc<dyn MarketDataSource>,
}

enum ItemOutcome {
    Done(ScanResult),
    Skipped,
}

pub struct Scanner {
    config: ScannerConfig,
    sources: BTreeMap<String, Arc<dyn MarketDataSource>>,
}

impl Scanner {
    /// Create a scanner over the given venues. Later sources with a
    /// duplicate venue name replace earlier ones.
    pub fn new(config: ScannerConfig, sources: Vec<Arc<dyn MarketDataSource>>) -> Self {
        let sources = sources
            .into_iter()
            .map(|s| (s.venue().to_string(), s))
            .collect();
        Self { config, sources }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn venues(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }

    /// Fetch the pair universe from every venue concurrently.
    ///
    /// A failing venue is logged and skipped. Each venue contributes at
    /// most `max_pairs_per_venue` pairs, highest volume first.
    pub async fn discover_pairs(&self) -> Vec<TradablePair> {
        let fetches = self.sources.iter().map(|(venue, source)| async move {
            (venue.as_str(), source.fetch_pairs().await)
        });

        let mut all = Vec::new();
        for (venue, fetched) in futures::future::join_all(fetches).await {
            match fetched {
                Ok(mut pairs) => {
                    pairs.sort_by(|a, b| {
                        b.volume_24h
                            .partial_cmp(&a.volume_24h)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    pairs.truncate(self.config.max_pairs_per_venue);
                    debug!(venue, count = pairs.len(), "Pairs discovered");
                    all.extend(pairs);
                }
                Err(e) => warn!(venue, error = %e, "Pair discovery failed, continuing without venue"),
            }
        }
        all
    }

    /// Keep pairs that clear the volume and 24h-change thresholds.
    pub fn prefilter(&self, pairs: &[TradablePair]) -> Vec<TradablePair> {
        pairs
            .iter()
            .filter(|p| {
                p.volume_24h >= self.config.min_volume_24h
                    && p.change_24h.abs() >= self.config.min_change_24h
                    && p.price > 0.0
            })
            .cloned()
            .collect()
    }

    /// Evaluate every strategy on every pre-filtered pair and timeframe.
    pub async fn scan(
        &self,
        pairs: &[TradablePair],
        timeframes: &[Timeframe],
        strategies: &[Arc<dyn Strategy>],
    ) -> ScanOutput {
        let started = Instant::now();
        let filtered = self.prefilter(pairs);
        let items = self.build_items(&filtered, timeframes, strategies);

        let mut stats = ScanStats {
            pairs_offered: pairs.len(),
            pairs_scanned: filtered.len(),
            attempted: items.len(),
            ..ScanStats::default()
        };

        info!(
            pairs = pairs.len(),
            filtered = filtered.len(),
            timeframes = timeframes.len(),
            strategies = strategies.len(),
            items = items.len(),
            "Scan starting"
        );

        let cache = Arc::new(CandleCache::default());
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let timeout = Duration::from_millis(self.config.item_timeout_ms);
        let pause = Duration::from_millis(self.config.chunk_pause_ms);

        let mut indexed: Vec<(usize, ScanResult)> = Vec::new();
        let mut failures = Vec::new();
        let chunk_count = items.len().div_ceil(self.config.chunk_size);

        let mut items = items.into_iter().peekable();
        let mut chunk_no = 0;
        while items.peek().is_some() {
            chunk_no += 1;
            let mut set = JoinSet::new();
            for item in items.by_ref().take(self.config.chunk_size) {
                let cache = Arc::clone(&cache);
                let permits = Arc::clone(&permits);
                let limit = self.config.candle_limit;
                let min_candles = self.config.min_candles;
                set.spawn(async move {
                    let tag = (item.index, item.pair.key(), item.timeframe, item.strategy.id().to_string());
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return (tag, Err(EngineError::transient(item.source.venue(), "worker pool closed")), false);
                    };
                    let venue = item.source.venue().to_string();
                    match tokio::time::timeout(timeout, run_item(item, &cache, limit, min_candles)).await {
                        Ok(outcome) => (tag, outcome, false),
                        Err(_) => (
                            tag,
                            Err(EngineError::transient(&venue, format!("timed out after {timeout:?}"))),
                            true,
                        ),
                    }
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(((index, pair_key, timeframe, strategy_id), outcome, timed_out)) => match outcome {
                        Ok(ItemOutcome::Done(result)) => {
                            stats.succeeded += 1;
                            indexed.push((index, result));
                        }
                        Ok(ItemOutcome::Skipped) => stats.skipped += 1,
                        Err(error) => {
                            stats.failed += 1;
                            if timed_out {
                                stats.timed_out += 1;
                            }
                            debug!(
                                pair = %pair_key,
                                timeframe = %timeframe,
                                strategy = %strategy_id,
                                error = %error,
                                "Scan item dropped"
                            );
                            failures.push(ScanFailure { pair_key, timeframe, strategy_id, error });
                        }
                    },
                    Err(e) => {
                        stats.failed += 1;
                        warn!(error = %e, "Scan task aborted");
                    }
                }
            }

            if chunk_no < chunk_count && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        indexed.sort_by_key(|(index, _)| *index);
        stats.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            attempted = stats.attempted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            duration_ms = stats.duration_ms,
            "Scan complete"
        );

        ScanOutput {
            results: indexed.into_iter().map(|(_, r)| r).collect(),
            failures,
            stats,
        }
    }

    fn build_items(
        &self,
        pairs: &[TradablePair],
        timeframes: &[Timeframe],
        strategies: &[Arc<dyn Strategy>],
    ) -> Vec<WorkItem> {
        let mut items = Vec::with_capacity(pairs.len() * timeframes.len() * strategies.len());
        for pair in pairs {
            let Some(source) = self.sources.get(&pair.venue) else {
                warn!(pair = %pair.key(), "No data source for venue, pair skipped");
                continue;
            };
            let pair = Arc::new(pair.clone());
            for &timeframe in timeframes {
                for strategy in strategies {
                    items.push(WorkItem {
                        index: items.len(),
                        pair: Arc::clone(&pair),
                        timeframe,
                        strategy: Arc::clone(strategy),
                        source: Arc::clone(source),
                    });
                }
            }
        }
        items
    }
}

async fn run_item(
    item: WorkItem,
    cache: &CandleCache,
    limit: usize,
    min_candles: usize,
) -> EngineResult<ItemOutcome> {
    let cell = cache.cell(&item.pair.key(), item.timeframe);
    let window = cell
        .get_or_init(|| async {
            let candles = item.source.fetch_candles(&item.pair, item.timeframe, limit).await?;
            let market = market_context(&item.pair, &candles);
            Ok(Arc::new(Window { candles, market }))
        })
        .await
        .clone()?;

    let needed = min_candles.max(item.strategy.min_candles());
    if window.candles.len() < needed {
        debug!(
            pair = %item.pair.key(),
            timeframe = %item.timeframe,
            have = window.candles.len(),
            needed,
            "Window too short, skipping"
        );
        return Ok(ItemOutcome::Skipped);
    }

    let strategy_id = item.strategy.id().to_string();
    let evaluated = catch_unwind(AssertUnwindSafe(|| item.strategy.evaluate(&window.candles)))
        .map_err(|_| EngineError::analyzer(&strategy_id, "strategy panicked"))??;

    let result = check_result(evaluated, &strategy_id)?;
    Ok(ItemOutcome::Done(ScanResult {
        pair: item.pair,
        timeframe: item.timeframe,
        market: window.market,
        result,
    }))
}

/// Reject malformed adapter output and pin the strategy id.
fn check_result(mut result: StrategyResult, strategy_id: &str) -> EngineResult<StrategyResult> {
    if !result.confidence.is_finite() || !(0.0..=1.0).contains(&result.confidence) {
        return Err(EngineError::analyzer(
            strategy_id,
            format!("confidence {} outside [0, 1]", result.confidence),
        ));
    }
    for level in [result.levels.stop_loss, result.levels.take_profit].into_iter().flatten() {
        if !level.is_finite() || level <= 0.0 {
            return Err(EngineError::analyzer(strategy_id, format!("invalid level {level}")));
        }
    }
    result.strategy_id = strategy_id.to_string();
    Ok(result)
}

/// Derive the market context of a window.
pub fn market_context(pair: &TradablePair, candles: &[Candle]) -> MarketContext {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).filter(|c| c.is_finite() && *c > 0.0).collect();
    let price = closes.last().copied().unwrap_or(pair.price);

    let returns: Vec<f64> = closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect();
    let volatility = if returns.len() >= 2 {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
        var.sqrt()
    } else {
        0.0
    };

    // Efficiency ratio: net move over total path length.
    let path: f64 = closes.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    let trend_strength = match (closes.first(), closes.last()) {
        (Some(first), Some(last)) if path > 0.0 => ((last - first).abs() / path).clamp(0.0, 1.0),
        _ => 0.0,
    };

    MarketContext {
        price,
        volatility,
        trend_strength,
        volume_score: pair.volume_score(),
        volatility_score: pair.volatility_score(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
