//! Administrative trigger endpoints (§4.9) — thin wrappers over the
//! Loyalty Worker's own tick routine, not a separate code path.

use std::sync::Arc;

use axum::extract::{OriginalUri, State};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::extract::AppQuery;
use crate::error::{respond, AppResult};
use crate::services::LoyaltyRunOutcome;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RunLoyaltyQuery {
    /// Lookback window in hours; absent uses the scheduled tick's default
    /// (60 minutes). `?hours=24` is the "manual trigger" case of §4.8.
    pub hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RunLoyaltyResponse {
    pub skipped: bool,
    pub orders_processed: u64,
    pub points_awarded: u64,
}

pub async fn run_loyalty(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    AppQuery(query): AppQuery<RunLoyaltyQuery>,
) -> Response {
    respond(&uri, run_loyalty_inner(state, query).await)
}

async fn run_loyalty_inner(
    state: Arc<AppState>,
    query: RunLoyaltyQuery,
) -> AppResult<Json<RunLoyaltyResponse>> {
    let lookback_minutes = match query.hours {
        Some(hours) => hours * 60,
        None => state.loyalty_worker.default_lookback_minutes(),
    };

    let outcome = state.loyalty_worker.run_tick(lookback_minutes).await?;

    let response = match outcome {
        LoyaltyRunOutcome::Skipped => RunLoyaltyResponse {
            skipped: true,
            orders_processed: 0,
            points_awarded: 0,
        },
        LoyaltyRunOutcome::Completed(summary) => RunLoyaltyResponse {
            skipped: false,
            orders_processed: summary.orders_processed,
            points_awarded: summary.points_awarded,
        },
    };

    Ok(Json(response))
}
