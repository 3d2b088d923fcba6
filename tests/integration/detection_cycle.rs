//! Full detection cycles against the mock venue and portfolio.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tradescout::engine::detection::CUMULATIVE_BUDGET_NOTE;
use tradescout::types::{Action, EngineError, SafetyState};

use crate::mock_exchange::{build_engine, buy, hold, make_pair, PanickingStrategy, PickyStrategy};

fn symbols(opps: &[tradescout::types::Opportunity]) -> BTreeSet<String> {
    opps.iter().map(|o| o.signal.pair.symbol.clone()).collect()
}

// -- Fault isolation ----------------------------------------------------

#[tokio::test]
async fn test_one_failing_item_does_not_abort_cycle() {
    let h = build_engine(
        vec![
            make_pair("BTCUSDT", 100.0),
            make_pair("ETHUSDT", 1_000.0),
            make_pair("SOLUSDT", 20.0),
        ],
        vec![buy("trend", 0.9), Arc::new(PickyStrategy { max_price: 500.0 })],
        &[("trend", 0.5), ("picky", 0.5)],
        None,
        "aggressive",
    );

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.scan.attempted, 6);
    assert_eq!(report.scan.succeeded, 5);
    assert_eq!(report.scan.failed, 1);
    assert_eq!(report.fused, 3);

    // ETH lost half its weight and falls below the profile's floor.
    assert_eq!(report.validated, 2);
    assert_eq!(report.rejected, 1);
    let opps = h.engine.get_ranked_opportunities(10).await;
    assert_eq!(
        symbols(&opps),
        ["BTCUSDT", "SOLUSDT"].iter().map(|s| s.to_string()).collect()
    );
}

#[tokio::test]
async fn test_failed_candle_fetch_drops_only_that_pair() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0), make_pair("SOLUSDT", 20.0)],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "aggressive",
    );
    h.exchange.fail_symbol("SOLUSDT");

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.scan.failed, 1);
    assert_eq!(report.scan.succeeded, 1);
    assert_eq!(report.published, 1);
}

#[tokio::test]
async fn test_panicking_strategy_is_contained() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.9), Arc::new(PanickingStrategy)],
        &[("trend", 1.0), ("panics", 1.0)],
        None,
        "aggressive",
    );

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.scan.failed, 1);
    assert_eq!(report.published, 1);
    let opps = h.engine.get_ranked_opportunities(10).await;
    assert!(!opps[0].signal.contributions.contains_key("panics"));
}

#[tokio::test]
async fn test_stalled_fetch_times_out_per_item() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0), make_pair("XRPUSDT", 0.5)],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "aggressive",
    );
    h.exchange.stall_symbol("XRPUSDT");

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.scan.timed_out, 1);
    assert_eq!(report.scan.succeeded, 1);
    assert_eq!(report.published, 1);
}

#[tokio::test]
async fn test_venue_outage_yields_empty_cycle() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "aggressive",
    );
    h.exchange.set_error("503 Service Unavailable");

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.scan.attempted, 0);
    assert_eq!(report.published, 0);

    h.exchange.clear_error();
    assert_eq!(h.engine.run_cycle().await.unwrap().published, 1);
}

#[tokio::test]
async fn test_portfolio_failure_counts_as_failed_cycle() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "aggressive",
    );
    h.portfolio.set_error("balance endpoint down");

    let err = h.engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, EngineError::Portfolio(_)));
    assert_eq!(h.exchange.pair_calls(), 0);
    let stats = h.engine.get_status().await.cycle_stats;
    assert_eq!(stats.failed_cycles, 1);
    assert_eq!(stats.consecutive_failures, 1);

    h.portfolio.clear_error();
    h.engine.run_cycle().await.unwrap();
    let stats = h.engine.get_status().await.cycle_stats;
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(stats.total_cycles, 1);
}

// -- Safety ---------------------------------------------------------------

#[tokio::test]
async fn test_halt_closes_positions_once_and_stops_scanning() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "conservative",
    );

    h.engine.run_cycle().await.unwrap();
    assert_eq!(h.engine.get_ranked_opportunities(10).await.len(), 1);
    assert_eq!(h.exchange.pair_calls(), 1);

    // 600 lost from a 10,000 peak: 6% drawdown against a 3% emergency stop.
    h.portfolio.book_loss("ETHUSDT", 600.0);
    h.portfolio.add_position(tradescout::types::Position {
        symbol: "BTCUSDT".to_string(),
        venue: "mockex".to_string(),
        side: tradescout::types::PositionSide::Long,
        quantity: 1.0,
        entry_price: 100.0,
        mark_price: 100.0,
        leverage: 1.0,
        opened_at: chrono::Utc::now(),
    });

    let err = h.engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, EngineError::SafetyHalt(_)));
    assert_eq!(h.engine.safety_state().await, SafetyState::Halted);
    assert_eq!(h.portfolio.close_all_calls(), 1);
    assert_eq!(h.portfolio.open_positions(), 0);
    assert!(h.engine.get_ranked_opportunities(10).await.is_empty());

    // Still halted: no scan, no second flatten.
    for _ in 0..3 {
        assert!(matches!(h.engine.run_cycle().await, Err(EngineError::SafetyHalt(_))));
    }
    assert_eq!(h.exchange.pair_calls(), 1);
    assert_eq!(h.portfolio.close_all_calls(), 1);

    let status = h.engine.get_status().await;
    assert_eq!(status.safety_state, SafetyState::Halted);
    assert!(status.halted_at.is_some());
    assert!(status.safety_reasons[0].contains("drawdown"));
}

#[tokio::test]
async fn test_failed_close_is_retried_while_halted() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "conservative",
    );
    h.portfolio.book_loss("ETHUSDT", 600.0);
    h.portfolio.add_position(tradescout::types::Position {
        symbol: "BTCUSDT".to_string(),
        venue: "mockex".to_string(),
        side: tradescout::types::PositionSide::Long,
        quantity: 1.0,
        entry_price: 100.0,
        mark_price: 100.0,
        leverage: 1.0,
        opened_at: chrono::Utc::now(),
    });
    h.portfolio.fail_next_closes(1);

    let err = h.engine.run_cycle().await.unwrap_err();
    assert!(matches!(err, EngineError::SafetyHalt(_)));
    assert_eq!(h.portfolio.close_all_calls(), 1);
    assert_eq!(h.portfolio.open_positions(), 1);
    assert!(h.engine.get_status().await.flatten_pending);

    // The next halted cycle tries again and succeeds.
    assert!(matches!(h.engine.run_cycle().await, Err(EngineError::SafetyHalt(_))));
    assert_eq!(h.portfolio.close_all_calls(), 2);
    assert_eq!(h.portfolio.open_positions(), 0);

    let status = h.engine.get_status().await;
    assert_eq!(status.safety_state, SafetyState::Halted);
    assert!(!status.flatten_pending);

    // Flat now, so no further attempts and still no scanning.
    for _ in 0..2 {
        assert!(matches!(h.engine.run_cycle().await, Err(EngineError::SafetyHalt(_))));
    }
    assert_eq!(h.portfolio.close_all_calls(), 2);
    assert_eq!(h.exchange.pair_calls(), 0);
}

#[tokio::test]
async fn test_reset_requires_operator_and_healthy_metrics() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "conservative",
    );
    h.portfolio.book_loss("ETHUSDT", 600.0);
    assert!(h.engine.run_cycle().await.is_err());

    // Reset alone re-halts on the same metrics.
    assert_eq!(h.engine.reset_safety().await, SafetyState::Halted);
    assert!(matches!(h.engine.run_cycle().await, Err(EngineError::SafetyHalt(_))));
    assert_eq!(h.portfolio.close_all_calls(), 2);

    // A looser profile tolerates the drawdown once reset.
    h.engine.reset_safety().await;
    h.engine.set_risk_profile("turbo").await.unwrap();
    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.profile, "turbo");
    assert_eq!(h.exchange.pair_calls(), 1);
}

// -- Profile swap ---------------------------------------------------------

#[tokio::test]
async fn test_profile_swap_takes_effect_next_cycle() {
    // 0.75 clears aggressive (0.7) but not conservative (0.8).
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.75)],
        &[("trend", 1.0)],
        None,
        "aggressive",
    );

    let first = h.engine.run_cycle().await.unwrap();
    assert_eq!(first.profile, "aggressive");
    assert_eq!(first.validated, 1);

    h.engine.set_risk_profile("conservative").await.unwrap();
    // Not retroactive: the published list is untouched until the next cycle.
    assert_eq!(h.engine.get_ranked_opportunities(10).await.len(), 1);

    let second = h.engine.run_cycle().await.unwrap();
    assert_eq!(second.profile, "conservative");
    assert_eq!(second.validated, 0);
    assert_eq!(second.rejected, 1);
    assert!(h.engine.get_ranked_opportunities(10).await.is_empty());
}

#[tokio::test]
async fn test_profile_swap_mid_cycle_uses_snapshot() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.75)],
        &[("trend", 1.0)],
        None,
        "aggressive",
    );
    h.exchange.set_latency(Duration::from_millis(150));

    let engine = h.engine.clone();
    let cycle = tokio::spawn(async move { engine.run_cycle().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.set_risk_profile("conservative").await.unwrap();

    let report = cycle.await.unwrap().unwrap();
    assert_eq!(report.profile, "aggressive");
    assert_eq!(report.validated, 1);
    assert_eq!(h.engine.active_profile().await.name, "conservative");
}

#[tokio::test]
async fn test_unknown_profile_keeps_current() {
    let h = build_engine(vec![], vec![], &[], None, "turbo");
    assert!(matches!(
        h.engine.set_risk_profile("moonshot").await,
        Err(EngineError::Configuration(_))
    ));
    assert_eq!(h.engine.active_profile().await.name, "turbo");
}

// -- Publishing -----------------------------------------------------------

#[tokio::test]
async fn test_publish_replaces_previous_list() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0), make_pair("SOLUSDT", 20.0)],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "aggressive",
    );

    h.engine.run_cycle().await.unwrap();
    let first = h.engine.get_ranked_opportunities(10).await;
    assert_eq!(first.len(), 2);

    h.exchange.set_pairs(vec![make_pair("ADAUSDT", 0.4)]);
    h.engine.run_cycle().await.unwrap();
    let second = h.engine.get_ranked_opportunities(10).await;

    assert_eq!(second.len(), 1);
    assert_eq!(second[0].signal.pair.symbol, "ADAUSDT");
    assert!(first.iter().all(|o| o.id != second[0].id));
}

#[tokio::test]
async fn test_published_opportunities_are_sane() {
    let h = build_engine(
        vec![
            make_pair("BTCUSDT", 100.0),
            make_pair("SOLUSDT", 20.0),
            make_pair("ADAUSDT", 0.4),
        ],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "turbo",
    );

    h.engine.run_cycle().await.unwrap();
    let profile = h.engine.active_profile().await;
    let opps = h.engine.get_ranked_opportunities(10).await;
    assert_eq!(opps.len(), 3);

    for o in &opps {
        assert_eq!(o.signal.action, Action::Buy);
        assert!(o.signal.stop_loss < o.signal.entry_price);
        assert!(o.signal.take_profit > o.signal.entry_price);
        assert!(o.sizing.leverage >= 1.0 && o.sizing.leverage <= profile.max_leverage);
        assert!(o.sizing.adjusted_size <= profile.max_position_size);
        assert!(o.advice.is_none());
        assert!(o.expires_at > o.created_at);
    }
    for pair in opps.windows(2) {
        assert!(pair[0].priority >= pair[1].priority);
        if pair[0].priority == pair[1].priority {
            assert!(pair[0].execution_score >= pair[1].execution_score);
        }
    }
    assert_eq!(h.engine.get_ranked_opportunities(2).await.len(), 2);
}

#[tokio::test]
async fn test_opportunities_past_slot_budget_carry_note() {
    // Conservative allows three open positions.
    let h = build_engine(
        vec![
            make_pair("BTCUSDT", 100.0),
            make_pair("ETHUSDT", 90.0),
            make_pair("SOLUSDT", 80.0),
            make_pair("ADAUSDT", 110.0),
        ],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "conservative",
    );

    h.engine.run_cycle().await.unwrap();
    let opps = h.engine.get_ranked_opportunities(10).await;
    assert_eq!(opps.len(), 4);

    let noted = |o: &tradescout::types::Opportunity| {
        o.recommendations.iter().any(|r| r == CUMULATIVE_BUDGET_NOTE)
    };
    assert!(!noted(&opps[0]));
    assert!(noted(&opps[3]));
}

#[tokio::test]
async fn test_hold_groups_are_not_candidates() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.6), hold("flat", 0.8)],
        &[("trend", 0.5), ("flat", 0.5)],
        None,
        "turbo",
    );

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.fused, 1);
    assert_eq!(report.actionable, 0);
    assert_eq!(report.published, 0);
}

// -- Loop -----------------------------------------------------------------

#[tokio::test]
async fn test_run_loop_observes_stop_between_cycles() {
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        None,
        "aggressive",
    );
    let (tx, rx) = tokio::sync::watch::channel(false);

    let engine = h.engine.clone();
    let runner = tokio::spawn(async move { engine.run(rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.engine.get_status().await.cycle_stats.total_cycles == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(h.engine.is_running());

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();

    assert!(!h.engine.is_running());
    assert_eq!(h.engine.get_status().await.cycle_stats.total_cycles, 1);
    assert_eq!(h.engine.get_ranked_opportunities(10).await.len(), 1);
}
