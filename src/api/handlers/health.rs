//! Liveness and metrics endpoints. Neither touches the store, so neither
//! goes through `AppError`/Problem Details.

use std::sync::Arc;

use axum::extract::State;

use crate::AppState;

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
