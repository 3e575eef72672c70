//! Read-only HTTP API
//!
//! - `GET /health`
//! - `GET /api/leaderboard?limit=n` - cached top-N feed
//! - `GET /api/principals/:identity` - live detail for one principal
//! - `GET /api/cache/status` - rebuild bookkeeping

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::leaderboard::CacheStatus;
use crate::principal::now_millis;
use crate::query::{LeaderboardRow, PrincipalDetail};

pub fn create_router(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/principals/:identity", get(principal_detail))
        .route("/api/cache/status", get(cache_status))
        .with_state(engine)
}

/// Error body returned for any failed request
#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => {
                error!(error = %self.0, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub async fn health() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardParams {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct LeaderboardResponse {
    pub entries: Vec<LeaderboardRow>,
    pub version: u64,
}

/// GET /api/leaderboard
pub async fn leaderboard(
    State(engine): State<Engine>,
    Query(params): Query<LeaderboardParams>,
) -> Result<Json<LeaderboardResponse>, ApiError> {
    let limit = params.limit.unwrap_or(engine.config.top_n).min(engine.config.top_n);
    let entries = engine.query.top_n(limit)?;
    let version = engine.store.leaderboard_version()?;
    Ok(Json(LeaderboardResponse { entries, version }))
}

/// GET /api/principals/:identity
pub async fn principal_detail(
    State(engine): State<Engine>,
    Path(identity): Path<String>,
) -> Result<Json<PrincipalDetail>, ApiError> {
    Ok(Json(engine.query.rank_and_balance(&identity, now_millis())?))
}

#[derive(Serialize)]
pub struct CacheStatusResponse {
    #[serde(flatten)]
    pub status: CacheStatus,
    pub top_n: usize,
    pub rebuild_interval_secs: u64,
}

/// GET /api/cache/status
pub async fn cache_status(State(engine): State<Engine>) -> Json<CacheStatusResponse> {
    Json(CacheStatusResponse {
        status: engine.cache.status(),
        top_n: engine.config.top_n,
        rebuild_interval_secs: engine.config.rebuild_interval_secs,
    })
}
