//! Router assembly (§6): maps the HTTP surface onto `api::handlers`.

use std::sync::Arc;

use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api::{handlers, middleware};
use crate::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .route("/api/orders", post(handlers::order::create_order))
        .route("/api/orders/:id", get(handlers::order::get_order))
        .route(
            "/api/orders/customer/:email",
            get(handlers::order::list_customer_orders),
        )
        .route(
            "/api/orders/:id/authorize-payment",
            post(handlers::order::authorize_payment),
        )
        .route("/api/orders/:id/cancel", post(handlers::order::cancel_order))
        .route("/api/admin/loyalty/run", post(handlers::admin::run_loyalty))
        .layer(from_fn(middleware::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
