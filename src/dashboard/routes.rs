//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::detection::{DetectionEngine, EngineStatus};
use crate::types::{Opportunity, SafetyState};

/// Published list length when `limit` is not given.
const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub engine: Arc<DetectionEngine>,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(engine: Arc<DetectionEngine>) -> Self {
        Self {
            engine,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub engine: EngineStatus,
    pub uptime_secs: i64,
}

#[derive(Debug, Deserialize)]
pub struct OpportunitiesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfilesResponse {
    pub active: String,
    pub available: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetProfileRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyResetResponse {
    pub previous: SafetyState,
    pub current: SafetyState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        engine: state.engine.get_status().await,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// GET /api/opportunities?limit=N
pub async fn get_opportunities(
    State(state): State<AppState>,
    Query(query): Query<OpportunitiesQuery>,
) -> Json<Vec<Opportunity>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Json(state.engine.get_ranked_opportunities(limit).await)
}

/// GET /api/profiles
pub async fn get_profiles(State(state): State<AppState>) -> Json<ProfilesResponse> {
    Json(ProfilesResponse {
        active: state.engine.active_profile().await.name.clone(),
        available: state.engine.profile_names(),
    })
}

/// POST /api/risk-profile
pub async fn set_risk_profile(
    State(state): State<AppState>,
    Json(req): Json<SetProfileRequest>,
) -> Result<Json<ProfilesResponse>, (StatusCode, Json<ErrorResponse>)> {
    state.engine.set_risk_profile(&req.name).await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: e.to_string() }),
        )
    })?;
    Ok(get_profiles(State(state)).await)
}

/// POST /api/safety/reset
pub async fn reset_safety(State(state): State<AppState>) -> Json<SafetyResetResponse> {
    let previous = state.engine.reset_safety().await;
    Json(SafetyResetResponse {
        previous,
        current: state.engine.safety_state().await,
    })
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_serializes() {
        let json = serde_json::to_string(&ErrorResponse {
            error: "Configuration error: unknown risk profile 'yolo'".into(),
        })
        .unwrap();
        assert!(json.contains("unknown risk profile"));
    }

    #[test]
    fn test_safety_reset_response_serializes() {
        let json = serde_json::to_value(SafetyResetResponse {
            previous: SafetyState::Halted,
            current: SafetyState::Normal,
        })
        .unwrap();
        assert_eq!(json["previous"], "halted");
        assert_eq!(json["current"], "normal");
    }
}
