//! Detection loop.
//!
//! One cycle runs, in order:
//!
//! 1. Refuse to run while the safety monitor is halted, retrying the
//!    close-all first if the last attempt failed.
//! 2. Snapshot the active risk profile and the portfolio.
//! 3. Re-assess safety from fresh metrics. Entering `Halted` flattens the
//!    portfolio and clears the published list.
//! 4. Discover pairs and scan them.
//! 5. Fuse each (pair, timeframe) group, then size and validate it.
//! 6. Ask the advisor about survivors, bounded and time-limited.
//! 7. Rank and atomically replace the published list.
//!
//! Every stage after step 2 reads the same profile and portfolio snapshot.
//! [`DetectionEngine::run`] repeats cycles until told to stop, backing off
//! exponentially after failures. A stop request is only observed between
//! cycles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::fusion::{LevelDefaults, SignalFuser};
use super::metrics::{self, PortfolioSnapshot};
use super::ranker::{OpportunityRanker, RankInput};
use super::risk::{self, Candidate, RiskEngine};
use super::safety::SafetyMonitor;
use super::scanner::{ScanResult, ScanStats, Scanner};
use crate::advisor::{Advisor, AdvisoryContext};
use crate::exchange::PortfolioSource;
use crate::strategy::Strategy;
use crate::types::{
    Action, Advice, EngineError, EngineResult, MarketContext, Opportunity, RiskMetrics,
    RiskProfile, SafetyState, StrategyResult, Timeframe, TradablePair,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cycle_interval: Duration,
    /// First delay after a failed cycle. Doubles per consecutive failure.
    pub error_backoff: Duration,
    pub max_backoff: Duration,
    pub timeframes: Vec<Timeframe>,
    pub advisory_timeout: Duration,
    pub advisory_concurrency: usize,
    pub fallback_stop_pct: Option<f64>,
    pub fallback_target_pct: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            timeframes: vec![Timeframe::H1, Timeframe::H4],
            advisory_timeout: Duration::from_secs(10),
            advisory_concurrency: 4,
            fallback_stop_pct: None,
            fallback_target_pct: None,
        }
    }
}

/// Attached to opportunities that only fit the budget on their own.
pub const CUMULATIVE_BUDGET_NOTE: &str =
    "Over position budget if taken together with higher-ranked opportunities";

/// Delay before the next cycle after `failures` consecutive failures.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(max)
}

// ---------------------------------------------------------------------------
// Reports and status
// ---------------------------------------------------------------------------

/// What one completed cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub profile: String,
    pub safety_state: SafetyState,
    pub scan: ScanStats,
    /// (pair, timeframe) groups fused.
    pub fused: usize,
    /// Groups whose fused action was not hold.
    pub actionable: usize,
    pub validated: usize,
    pub rejected: usize,
    pub advised: usize,
    pub published: usize,
    pub duration_ms: u64,
}

/// Running totals across cycles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub total_cycles: u64,
    pub failed_cycles: u64,
    /// Cycles refused because the engine was halted.
    pub halted_cycles: u64,
    pub consecutive_failures: u32,
    pub last_scan: ScanStats,
    pub candidates_fused: usize,
    pub candidates_validated: usize,
    pub candidates_rejected: usize,
    pub opportunities_published: usize,
    pub cycle_duration_ms: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CycleStats {
    fn record(&mut self, report: &mut CycleReport) {
        self.total_cycles += 1;
        self.consecutive_failures = 0;
        self.last_scan = report.scan.clone();
        self.candidates_fused = report.fused;
        self.candidates_validated = report.validated;
        self.candidates_rejected = report.rejected;
        self.opportunities_published = report.published;
        self.cycle_duration_ms = report.duration_ms;
        self.last_cycle_at = Some(Utc::now());
        self.last_error = None;
        report.cycle = self.total_cycles;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub safety_state: SafetyState,
    pub safety_reasons: Vec<String>,
    pub halted_at: Option<DateTime<Utc>>,
    /// Halted but the close-all has not succeeded yet.
    pub flatten_pending: bool,
    pub risk_metrics: RiskMetrics,
    pub cycle_stats: CycleStats,
    pub active_profile: String,
    pub recommendations: Vec<String>,
    pub running: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The collaborators a [`DetectionEngine`] drives.
pub struct EngineParts {
    pub scanner: Scanner,
    pub fuser: SignalFuser,
    pub ranker: OpportunityRanker,
    pub strategies: Vec<Arc<dyn Strategy>>,
    pub portfolio: Arc<dyn PortfolioSource>,
    pub advisor: Option<Arc<dyn Advisor>>,
}

struct Group {
    pair: Arc<TradablePair>,
    market: MarketContext,
    results: Vec<StrategyResult>,
}

pub struct DetectionEngine {
    config: EngineConfig,
    scanner: Scanner,
    fuser: SignalFuser,
    risk: RiskEngine,
    ranker: OpportunityRanker,
    strategies: Vec<Arc<dyn Strategy>>,
    portfolio: Arc<dyn PortfolioSource>,
    advisor: Option<Arc<dyn Advisor>>,
    profiles: BTreeMap<String, RiskProfile>,
    active_profile: RwLock<Arc<RiskProfile>>,
    safety: Mutex<SafetyMonitor>,
    published: RwLock<Arc<Vec<Opportunity>>>,
    last_metrics: RwLock<RiskMetrics>,
    stats: RwLock<CycleStats>,
    running: AtomicBool,
}

impl DetectionEngine {
    /// Build an engine. `active_profile` must name one of `profiles`.
    pub fn new(
        config: EngineConfig,
        parts: EngineParts,
        profiles: BTreeMap<String, RiskProfile>,
        active_profile: &str,
    ) -> EngineResult<Self> {
        let active = profiles.get(active_profile).cloned().ok_or_else(|| {
            EngineError::Configuration(format!("unknown risk profile '{active_profile}'"))
        })?;
        if config.advisory_concurrency == 0 {
            return Err(EngineError::Configuration(
                "advisory_concurrency must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            config,
            scanner: parts.scanner,
            fuser: parts.fuser,
            risk: RiskEngine::new(),
            ranker: parts.ranker,
            strategies: parts.strategies,
            portfolio: parts.portfolio,
            advisor: parts.advisor,
            profiles,
            active_profile: RwLock::new(Arc::new(active)),
            safety: Mutex::new(SafetyMonitor::new()),
            published: RwLock::new(Arc::new(Vec::new())),
            last_metrics: RwLock::new(RiskMetrics::default()),
            stats: RwLock::new(CycleStats::default()),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- Operator interface ------------------------------------------------

    /// Up to `limit` published opportunities that have not expired, best first.
    pub async fn get_ranked_opportunities(&self, limit: usize) -> Vec<Opportunity> {
        let published = self.published.read().await.clone();
        let now = Utc::now();
        published
            .iter()
            .filter(|o| !o.is_expired(now))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_status(&self) -> EngineStatus {
        let (safety_state, safety_reasons, halted_at, flatten_pending) = {
            let safety = self.safety.lock().await;
            (
                safety.state(),
                safety.reasons().to_vec(),
                safety.halted_at(),
                safety.flatten_pending(),
            )
        };
        let profile = self.active_profile().await;
        let risk_metrics = self.last_metrics.read().await.clone();
        let recommendations = metrics::recommendations(&risk_metrics, &profile);

        EngineStatus {
            safety_state,
            safety_reasons,
            halted_at,
            flatten_pending,
            risk_metrics,
            cycle_stats: self.stats.read().await.clone(),
            active_profile: profile.name.clone(),
            recommendations,
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Swap the active profile. Takes effect from the next cycle.
    pub async fn set_risk_profile(&self, name: &str) -> EngineResult<()> {
        let profile = self
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Configuration(format!("unknown risk profile '{name}'")))?;
        *self.active_profile.write().await = Arc::new(profile);
        info!(profile = name, "Risk profile switched, effective next cycle");
        Ok(())
    }

    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    pub async fn active_profile(&self) -> Arc<RiskProfile> {
        self.active_profile.read().await.clone()
    }

    /// Operator reset of a halted engine. Returns the state it left.
    pub async fn reset_safety(&self) -> SafetyState {
        self.safety.lock().await.reset()
    }

    pub async fn safety_state(&self) -> SafetyState {
        self.safety.lock().await.state()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -- Loop --------------------------------------------------------------

    /// Run cycles until `stop` turns true or its sender is dropped.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            interval_secs = self.config.cycle_interval.as_secs(),
            strategies = self.strategies.len(),
            venues = ?self.scanner.venues(),
            "Detection loop started"
        );

        loop {
            if *stop.borrow() {
                break;
            }

            let wait = match self.run_cycle().await {
                Ok(_) => self.config.cycle_interval,
                Err(EngineError::SafetyHalt(reason)) => {
                    debug!(reason = %reason, "Cycle skipped while halted");
                    self.config.cycle_interval
                }
                Err(e) => {
                    let failures = self.stats.read().await.consecutive_failures;
                    let delay = backoff_delay(self.config.error_backoff, self.config.max_backoff, failures);
                    error!(
                        error = %e,
                        consecutive_failures = failures,
                        backoff_secs = delay.as_secs(),
                        "Cycle failed, backing off"
                    );
                    delay
                }
            };

            if wait_or_stop(&mut stop, wait).await {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Detection loop stopped");
    }

    /// Run one cycle and fold its outcome into the running stats.
    pub async fn run_cycle(&self) -> EngineResult<CycleReport> {
        let mut result = self.cycle().await;

        let mut stats = self.stats.write().await;
        match &mut result {
            Ok(report) => {
                stats.record(report);
                info!(
                    cycle = report.cycle,
                    profile = %report.profile,
                    safety = %report.safety_state,
                    scanned = report.scan.succeeded,
                    failed = report.scan.failed,
                    fused = report.fused,
                    validated = report.validated,
                    rejected = report.rejected,
                    published = report.published,
                    duration_ms = report.duration_ms,
                    "Cycle complete"
                );
            }
            Err(EngineError::SafetyHalt(_)) => stats.halted_cycles += 1,
            Err(e) => {
                stats.failed_cycles += 1;
                stats.consecutive_failures += 1;
                stats.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn cycle(&self) -> EngineResult<CycleReport> {
        let started = Instant::now();

        let (halted, pending) = {
            let safety = self.safety.lock().await;
            (safety.is_halted(), safety.flatten_pending())
        };
        if halted {
            if pending {
                self.flatten().await;
            }
            return Err(EngineError::SafetyHalt(
                "engine halted, operator reset required".to_string(),
            ));
        }

        let profile = self.active_profile().await;
        let snapshot = PortfolioSnapshot::capture(self.portfolio.as_ref(), &profile).await?;
        *self.last_metrics.write().await = snapshot.metrics.clone();

        let update = self.safety.lock().await.evaluate(&snapshot.metrics, &profile);
        if update.current == SafetyState::Halted {
            let reasons = update.reasons.join("; ");
            if update.just_halted() {
                self.halt().await;
            }
            return Err(EngineError::SafetyHalt(reasons));
        }

        let pairs = self.scanner.discover_pairs().await;
        let scan = self
            .scanner
            .scan(&pairs, &self.config.timeframes, &self.strategies)
            .await;
        if !scan.failures.is_empty() {
            warn!(
                failed = scan.failures.len(),
                timed_out = scan.stats.timed_out,
                "Scan items dropped this cycle"
            );
        }

        let groups = group_results(scan.results);
        let defaults = LevelDefaults::resolve(
            &profile,
            self.config.fallback_stop_pct,
            self.config.fallback_target_pct,
        );

        let mut report = CycleReport {
            profile: profile.name.clone(),
            safety_state: update.current,
            scan: scan.stats,
            fused: groups.len(),
            ..CycleReport::default()
        };

        let mut candidates = Vec::new();
        for ((_, timeframe), group) in &groups {
            let signal = self
                .fuser
                .fuse(&group.pair, *timeframe, &group.market, &group.results, defaults);
            if signal.action == Action::Hold {
                continue;
            }
            report.actionable += 1;

            let sizing = self.risk.size(
                &signal,
                snapshot.balance,
                group.market.volatility,
                &group.market,
                &profile,
            );
            let candidate = Candidate { signal, sizing };
            match self.risk.validate(&candidate, &snapshot, &profile) {
                Ok(()) => candidates.push(candidate),
                Err(_) => report.rejected += 1,
            }
        }
        report.validated = candidates.len();

        let advice = self.advise(&candidates).await;
        report.advised = advice.iter().filter(|a| a.is_some()).count();

        let inputs: Vec<RankInput> = candidates
            .into_iter()
            .zip(advice)
            .map(|(c, advice)| RankInput {
                signal: c.signal,
                sizing: c.sizing,
                advice,
            })
            .collect();
        let mut ranked = self.ranker.rank(inputs, Utc::now());
        let sizes: Vec<f64> = ranked.iter().map(|o| o.sizing.adjusted_size).collect();
        for (opp, over) in ranked
            .iter_mut()
            .zip(risk::exceeds_cumulative_budget(&sizes, &snapshot, &profile))
        {
            if over {
                opp.recommendations.push(CUMULATIVE_BUDGET_NOTE.to_string());
            }
        }
        report.published = ranked.len();

        *self.published.write().await = Arc::new(ranked);

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Consult the advisor for each candidate, in order. Failures and
    /// timeouts yield `None`.
    async fn advise(&self, candidates: &[Candidate]) -> Vec<Option<Advice>> {
        let Some(advisor) = &self.advisor else {
            return vec![None; candidates.len()];
        };
        let timeout = self.config.advisory_timeout;

        let contexts: Vec<AdvisoryContext> = candidates
            .iter()
            .map(|c| AdvisoryContext::new(&c.signal, &c.sizing))
            .collect();

        stream::iter(contexts.into_iter().map(|ctx| {
            let advisor = Arc::clone(advisor);
            async move {
                match tokio::time::timeout(timeout, advisor.advise(&ctx)).await {
                    Ok(Ok(advice)) => Some(advice),
                    Ok(Err(e)) => {
                        warn!(pair = %ctx.pair, error = %e, "Advisory failed, using neutral weight");
                        None
                    }
                    Err(_) => {
                        warn!(pair = %ctx.pair, timeout_ms = timeout.as_millis() as u64, "Advisory timed out");
                        None
                    }
                }
            }
        }))
        .buffered(self.config.advisory_concurrency)
        .collect()
        .await
    }

    /// Side effects of entering `Halted`.
    async fn halt(&self) {
        *self.published.write().await = Arc::new(Vec::new());
        self.flatten().await;
    }

    /// Close everything. The pending flag is only cleared on success, so a
    /// failed attempt is retried at the start of the next cycle.
    async fn flatten(&self) {
        match self.portfolio.close_all_positions().await {
            Ok(closed) => {
                self.safety.lock().await.mark_flattened();
                error!(closed, "Safety halt: all positions closed");
            }
            Err(e) => error!(error = %e, "Safety halt: failed to close positions, will retry"),
        }
    }
}

/// Group results by (pair key, timeframe). Map order keeps fusion deterministic.
fn group_results(results: Vec<ScanResult>) -> BTreeMap<(String, Timeframe), Group> {
    let mut groups: BTreeMap<(String, Timeframe), Group> = BTreeMap::new();
    for r in results {
        groups
            .entry((r.pair.key(), r.timeframe))
            .or_insert_with(|| Group {
                pair: Arc::clone(&r.pair),
                market: r.market,
                results: Vec::new(),
            })
            .results
            .push(r.result);
    }
    groups
}

/// Sleep for `wait`, returning early with `true` if a stop is requested.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return true;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
