//! Advisor behaviour inside a full cycle: advice only moves ranking, and a
//! failing or slow advisor never costs a candidate.

use async_trait::async_trait;
use mockall::mock;
use std::sync::Arc;
use std::time::Duration;

use tradescout::advisor::{Advisor, AdvisoryContext};
use tradescout::types::{Action, Advice, EngineError, EngineResult};

use crate::mock_exchange::{build_engine, buy, make_pair};

mock! {
    pub Adv {}

    #[async_trait]
    impl Advisor for Adv {
        async fn advise(&self, context: &AdvisoryContext) -> EngineResult<Advice>;
    }
}

/// Answers correctly, but only after the engine has given up waiting.
struct SlowAdvisor;

#[async_trait]
impl Advisor for SlowAdvisor {
    async fn advise(&self, _context: &AdvisoryContext) -> EngineResult<Advice> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(Advice {
            recommendation: Action::Buy,
            confidence: 0.9,
        })
    }
}

fn single_pair(advisor: Option<Arc<dyn Advisor>>) -> crate::mock_exchange::Harness {
    build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        vec![buy("trend", 0.9)],
        &[("trend", 1.0)],
        advisor,
        "aggressive",
    )
}

#[tokio::test]
async fn test_agreeing_advice_raises_execution_score() {
    let baseline = single_pair(None);
    baseline.engine.run_cycle().await.unwrap();
    let neutral = baseline.engine.get_ranked_opportunities(1).await[0].execution_score;

    let mut adv = MockAdv::new();
    adv.expect_advise()
        .withf(|ctx| ctx.pair == "mockex:BTCUSDT" && ctx.action == Action::Buy)
        .times(1)
        .returning(|_| {
            Ok(Advice {
                recommendation: Action::Buy,
                confidence: 0.9,
            })
        });
    let h = single_pair(Some(Arc::new(adv)));

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.advised, 1);
    let opp = &h.engine.get_ranked_opportunities(1).await[0];
    assert!(opp.advice.is_some());
    // Full agreement (1.0) instead of neutral (0.5), weighted 0.3.
    assert!((opp.execution_score - neutral - 0.15).abs() < 1e-9);
}

#[tokio::test]
async fn test_advisor_error_falls_back_to_neutral() {
    let mut adv = MockAdv::new();
    adv.expect_advise()
        .times(1)
        .returning(|_| Err(EngineError::Advisory("HTTP 429".to_string())));
    let h = single_pair(Some(Arc::new(adv)));

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.advised, 0);
    assert_eq!(report.published, 1);
    let opps = h.engine.get_ranked_opportunities(1).await;
    assert!(opps[0].advice.is_none());
}

#[tokio::test]
async fn test_slow_advisor_times_out() {
    let h = single_pair(Some(Arc::new(SlowAdvisor)));

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.advised, 0);
    assert_eq!(report.published, 1);
    assert!(h.engine.get_ranked_opportunities(1).await[0].advice.is_none());
}

#[tokio::test]
async fn test_advisor_not_called_without_candidates() {
    let mut adv = MockAdv::new();
    adv.expect_advise().times(0);
    let h = build_engine(
        vec![make_pair("BTCUSDT", 100.0)],
        // Below the aggressive profile's confidence floor.
        vec![buy("trend", 0.5)],
        &[("trend", 1.0)],
        Some(Arc::new(adv)),
        "aggressive",
    );

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.advised, 0);
}
