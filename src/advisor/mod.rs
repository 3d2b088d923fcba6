//! Optional language-model advisory.
//!
//! An [`Advisor`] gives a second opinion on a validated candidate. Its
//! answer only moves the ranking: a missing, late or failed answer is
//! treated as neutral and never blocks a cycle.

pub mod openrouter;

use async_trait::async_trait;
use serde::Serialize;

use crate::types::{Action, Advice, EngineError, EngineResult, FusedSignal, PositionSizing, Timeframe};

/// What the advisor is told about one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvisoryContext {
    pub pair: String,
    pub timeframe: Timeframe,
    pub action: Action,
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub change_24h: f64,
    pub volatility: f64,
    pub trend_strength: f64,
    pub leverage: f64,
    pub position_size: f64,
    /// `(strategy id, action, weighted contribution)`, in id order.
    pub contributions: Vec<(String, Action, f64)>,
}

impl AdvisoryContext {
    pub fn new(signal: &FusedSignal, sizing: &PositionSizing) -> Self {
        Self {
            pair: signal.pair.key(),
            timeframe: signal.timeframe,
            action: signal.action,
            confidence: signal.confidence,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            change_24h: signal.pair.change_24h,
            volatility: signal.market.volatility,
            trend_strength: signal.market.trend_strength,
            leverage: sizing.leverage,
            position_size: sizing.adjusted_size,
            contributions: signal
                .contributions
                .iter()
                .map(|(id, c)| (id.clone(), c.action, c.weighted))
                .collect(),
        }
    }
}

#[async_trait]
pub trait Advisor: Send + Sync {
    async fn advise(&self, context: &AdvisoryContext) -> EngineResult<Advice>;
}

// ---------------------------------------------------------------------------
// Prompting
// ---------------------------------------------------------------------------

pub fn system_prompt() -> &'static str {
    "You review trade setups produced by a technical-analysis engine. \
     Judge whether the proposed direction is sound given the levels, \
     volatility and the agreement between strategies.\n\n\
     RULES:\n\
     1. Be brief. One or two sentences of reasoning at most.\n\
     2. Your final answer MUST be on the last two lines in exactly this format:\n\
        RECOMMENDATION: BUY|SELL|HOLD\n\
        CONFIDENCE: 0.XX\n\
     3. Confidence is between 0.0 and 1.0."
}

pub fn build_prompt(ctx: &AdvisoryContext) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str(&format!("PAIR: {} ({})\n", ctx.pair, ctx.timeframe));
    prompt.push_str(&format!(
        "PROPOSED: {} at {:.6} (confidence {:.2})\n",
        ctx.action, ctx.entry_price, ctx.confidence
    ));
    prompt.push_str(&format!("STOP: {:.6}  TARGET: {:.6}\n", ctx.stop_loss, ctx.take_profit));
    prompt.push_str(&format!(
        "24H CHANGE: {:+.2}%  VOLATILITY: {:.4}  TREND: {:.2}\n",
        ctx.change_24h * 100.0,
        ctx.volatility,
        ctx.trend_strength
    ));
    prompt.push_str(&format!("LEVERAGE: {:.1}x  SIZE: {:.2}\n", ctx.leverage, ctx.position_size));
    if !ctx.contributions.is_empty() {
        prompt.push_str("STRATEGIES:\n");
        for (id, action, weighted) in &ctx.contributions {
            prompt.push_str(&format!("- {id}: {action} ({weighted:.3})\n"));
        }
    }
    prompt
}

/// Parse the `RECOMMENDATION:` / `CONFIDENCE:` lines, scanning from the end.
pub fn parse_advice(text: &str) -> EngineResult<Advice> {
    let mut recommendation: Option<Action> = None;
    let mut confidence: Option<f64> = None;

    for line in text.lines().rev() {
        let upper = line.to_uppercase();
        if recommendation.is_none() {
            if let Some(pos) = upper.find("RECOMMENDATION:") {
                let word = upper[pos + "RECOMMENDATION:".len()..]
                    .split(|c: char| !c.is_ascii_alphabetic())
                    .find(|w| !w.is_empty())
                    .unwrap_or("");
                recommendation = word.parse().ok();
            }
        }
        if confidence.is_none() {
            if let Some(pos) = upper.find("CONFIDENCE:") {
                confidence = leading_float(&upper[pos + "CONFIDENCE:".len()..]);
            }
        }
        if recommendation.is_some() && confidence.is_some() {
            break;
        }
    }

    let recommendation = recommendation
        .ok_or_else(|| EngineError::Advisory("no recommendation in advisor response".to_string()))?;
    let confidence = confidence
        .ok_or_else(|| EngineError::Advisory("no confidence in advisor response".to_string()))?;

    Ok(Advice {
        recommendation,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

/// First number in `text`. A trailing `%` divides by 100.
fn leading_float(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit() || c == '.')?;
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let value: f64 = rest[..end].trim_end_matches('.').parse().ok()?;
    if rest[end..].starts_with('%') {
        Some(value / 100.0)
    } else {
        Some(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
