//! TRADESCOUT: multi-exchange signal detection and risk engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the paper portfolio from disk (or creates a fresh one), and
//! runs the detection loop with graceful shutdown.

use anyhow::{Context, Result};
use rust_decimal::prelude::*;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use tradescout::advisor::openrouter::OpenRouterAdvisor;
use tradescout::advisor::Advisor;
use tradescout::config;
use tradescout::dashboard::{self, routes::DashboardState};
use tradescout::engine::detection::{DetectionEngine, EngineParts};
use tradescout::engine::fusion::SignalFuser;
use tradescout::engine::ranker::OpportunityRanker;
use tradescout::engine::scanner::Scanner;
use tradescout::exchange::binance::BinanceClient;
use tradescout::exchange::paper::PaperPortfolio;
use tradescout::exchange::MarketDataSource;
use tradescout::storage::PortfolioStore;
use tradescout::strategy;

const BANNER: &str = r#"
 _____ ____      _    ____  _____ ____   ____ ___  _   _ _____
|_   _|  _ \    / \  |  _ \| ____/ ___| / ___/ _ \| | | |_   _|
  | | | |_) |  / _ \ | | | |  _| \___ \| |  | | | | | | | | |
  | | |  _ <  / ___ \| |_| | |___ ___) | |__| |_| | |_| | | |
  |_| |_| \_\/_/   \_\____/|_____|____/ \____\___/ \___/  |_|

  Multi-exchange signal detection & risk engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;
    init_logging();

    println!("{BANNER}");

    let strategies = strategy::builtin();
    let strategy_ids: Vec<&str> = strategies.iter().map(|s| s.id()).collect();
    cfg.validate(&strategy_ids).context("Invalid configuration")?;

    info!(
        name = %cfg.engine.name,
        cycle_interval_secs = cfg.engine.cycle_interval_secs,
        profile = %cfg.risk.active_profile,
        strategies = ?strategy_ids,
        "TRADESCOUT starting up"
    );

    // -- Portfolio -------------------------------------------------------

    let store = PortfolioStore::new(cfg.exchange.state_file.as_deref());
    if cfg.exchange.fresh_start && store.clear()? {
        info!(path = %store.path().display(), "fresh_start set, ignoring saved portfolio");
    }
    let portfolio = match store.load()? {
        Some(state) => {
            info!(
                balance = %state.balance,
                positions = state.positions.len(),
                trades = state.history.len(),
                "Resumed paper portfolio"
            );
            PaperPortfolio::from_state(state)
        }
        None => {
            let balance = Decimal::from_f64(cfg.exchange.paper_balance)
                .context("paper_balance is not representable")?;
            info!(balance = %balance, "Fresh paper portfolio");
            PaperPortfolio::new(balance)
        }
    };
    let portfolio = Arc::new(portfolio);

    // -- Components ------------------------------------------------------

    let exchange: Arc<dyn MarketDataSource> = Arc::new(BinanceClient::new(
        cfg.exchange.base_url.as_deref(),
        &cfg.exchange.quote_asset,
        cfg.exchange.max_leverage,
    )?);

    let advisor: Option<Arc<dyn Advisor>> = if cfg.advisor.enabled {
        let api_key = cfg.advisor.api_key();
        if api_key.is_none() {
            warn!(env = ?cfg.advisor.api_key_env, "Advisor enabled without an API key");
        }
        info!(model = %cfg.advisor.model, base_url = %cfg.advisor.base_url, "Advisor enabled");
        Some(Arc::new(OpenRouterAdvisor::new(
            Some(&cfg.advisor.base_url),
            api_key,
            Some(cfg.advisor.model.clone()),
            Some(cfg.advisor.max_tokens),
        )?))
    } else {
        info!("Advisor disabled, ranking on technical and liquidity scores only");
        None
    };

    let parts = EngineParts {
        scanner: Scanner::new(cfg.scanner.clone(), vec![exchange]),
        fuser: SignalFuser::new(cfg.fusion.weights.clone()),
        ranker: OpportunityRanker::new(cfg.ranker.clone()),
        strategies,
        portfolio: portfolio.clone(),
        advisor,
    };
    let engine = Arc::new(DetectionEngine::new(
        cfg.engine_config(),
        parts,
        cfg.risk.profiles(),
        &cfg.risk.active_profile,
    )?);

    if cfg.dashboard.enabled {
        dashboard::spawn_dashboard(Arc::new(DashboardState::new(engine.clone())), cfg.dashboard.port)?;
    }

    // -- Main loop -------------------------------------------------------

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping after the current cycle.");
            let _ = stop_tx.send(true);
        }
    });

    info!("Entering detection loop. Press Ctrl+C to stop.");
    engine.run(stop_rx).await;

    // Save final state
    let final_state = portfolio.snapshot().await;
    store.save(&final_state)?;

    let status = engine.get_status().await;
    info!(
        balance = %final_state.balance,
        cycles = status.cycle_stats.total_cycles,
        failed = status.cycle_stats.failed_cycles,
        safety = %status.safety_state,
        "TRADESCOUT shut down cleanly."
    );

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tradescout=info"));

    let json_logging = std::env::var("TRADESCOUT_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
