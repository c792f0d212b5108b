use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod clock;
mod config;
mod db;
mod error;
mod metrics;
mod models;
mod services;

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::db::{Database, Store};
use crate::services::payment_gateway::HttpPaymentGateway;
use crate::services::{LoyaltyWorker, OrderService, PaymentService};

/// Shared application state handed to every handler via axum's `State`
/// extractor, mirroring the teacher's single `Arc<AppState>` passed to
/// `axum::serve`.
pub struct AppState {
    pub config: AppConfig,
    pub order_service: Arc<OrderService>,
    pub payment_service: Arc<PaymentService>,
    pub loyalty_worker: Arc<LoyaltyWorker>,
    pub metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orderflow_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load()?;

    tracing::info!("starting orderflow-core v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(environment = %config.environment, "environment configured");

    let metrics_handle = metrics::init_metrics();

    let db = Database::connect(&config.database_url).await?;
    tracing::info!("database connected and migrations applied");

    let store = Store::new(db.pool.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gateway = Arc::new(HttpPaymentGateway::new(&config.business.payments));

    let payment_service = Arc::new(PaymentService::new(
        store.clone(),
        gateway,
        clock.clone(),
        &config.business.payments,
    ));

    let order_service = Arc::new(OrderService::new(
        store.clone(),
        clock.clone(),
        config.business.clone(),
        payment_service.clone(),
    ));

    let loyalty_worker = Arc::new(LoyaltyWorker::new(
        store.clone(),
        clock.clone(),
        config.business.loyalty.clone(),
    ));
    loyalty_worker.clone().spawn();
    tracing::info!(
        interval_secs = config.business.loyalty.tick_interval_secs,
        "loyalty worker scheduled"
    );

    let bind_ip: IpAddr = config
        .bind_address
        .parse()
        .unwrap_or_else(|_| IpAddr::from([0, 0, 0, 0]));
    let addr = SocketAddr::from((bind_ip, config.port));

    let state = Arc::new(AppState {
        config,
        order_service,
        payment_service,
        loyalty_worker,
        metrics_handle,
    });

    let app = api::build_router(state).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    tracing::info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
