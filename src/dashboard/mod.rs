//! Dashboard: Axum web server for monitoring and operator control.
//!
//! Exposes the engine's status, the published opportunities and the risk
//! profile switch as a JSON API. CORS enabled for local development.

pub mod routes;

use anyhow::Result;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use routes::AppState;

/// Start the dashboard web server.
///
/// Spawns a background task and returns immediately.
pub fn spawn_dashboard(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        info!(port, "Dashboard server starting on http://localhost:{port}");

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(port, error = %e, "Failed to bind dashboard port");
                return;
            }
        };

        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Dashboard server error");
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/status", get(routes::get_status))
        .route("/api/opportunities", get(routes::get_opportunities))
        .route("/api/profiles", get(routes::get_profiles))
        .route("/api/risk-profile", post(routes::set_risk_profile))
        .route("/api/safety/reset", post(routes::reset_safety))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
