//! Loyalty Worker (C9): periodic scan of recently-paid orders, accruing
//! points with idempotency and a per-customer cap (§4.8).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::LoyaltyConfig;
use crate::db::Store;
use crate::error::AppError;
use crate::metrics;
use crate::models::idempotency::loyalty_key;
use crate::models::{AuditOperation, Order};

pub struct LoyaltyWorker {
    store: Store,
    clock: Arc<dyn Clock>,
    config: LoyaltyConfig,
}

impl LoyaltyWorker {
    pub fn new(store: Store, clock: Arc<dyn Clock>, config: LoyaltyConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Spawns the periodic tick loop; returns the join handle so the caller
    /// can hold (and, on shutdown, abort) it.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs));
            loop {
                interval.tick().await;
                if let Err(err) = self.run_tick(self.config.lookback_minutes).await {
                    error!(error = %err, "loyalty worker tick failed");
                }
            }
        })
    }

    /// Runs one tick: a manual/admin trigger uses a wider lookback window
    /// (§4.9); the scheduled tick uses the configured default.
    pub async fn run_tick(&self, lookback_minutes: i64) -> Result<LoyaltyRunOutcome, AppError> {
        let Some(lock_conn) = Store::try_acquire_loyalty_lock(self.store.pool())
            .await
            .map_err(AppError::Internal)?
        else {
            info!("loyalty tick skipped; another instance holds the advisory lock");
            return Ok(LoyaltyRunOutcome::Skipped);
        };

        let result = self.process_tick(lookback_minutes).await;

        if let Err(err) = Store::release_loyalty_lock(lock_conn).await {
            warn!(error = %err, "failed to release loyalty advisory lock");
        }

        result.map(LoyaltyRunOutcome::Completed)
    }

    /// Default lookback for the scheduled tick, exposed so the admin
    /// trigger endpoint (§4.9) can fall back to it when no `hours` query
    /// parameter is given.
    pub fn default_lookback_minutes(&self) -> i64 {
        self.config.lookback_minutes
    }

    async fn process_tick(&self, lookback_minutes: i64) -> Result<LoyaltyTickSummary, AppError> {
        let start = std::time::Instant::now();
        let now = self.clock.now();
        let since = now - chrono::Duration::minutes(lookback_minutes);

        let mut summary = LoyaltyTickSummary::default();
        let mut after_id: Option<Uuid> = None;

        loop {
            let batch = Store::find_paid_orders_for_loyalty(
                self.store.pool(),
                since,
                after_id,
                self.config.batch_size,
            )
            .await
            .map_err(AppError::Internal)?;

            if batch.is_empty() {
                break;
            }

            after_id = batch.last().map(|order| order.id);

            for order in &batch {
                match self.process_order(order, now).await {
                    Ok(Some(delta)) => {
                        summary.orders_processed += 1;
                        summary.points_awarded += delta as u64;
                    }
                    Ok(None) => summary.orders_processed += 1,
                    Err(err) => {
                        warn!(order_id = %order.id, error = %err, "loyalty accrual failed for order");
                    }
                }
            }

            if (batch.len() as i64) < self.config.batch_size {
                break;
            }
        }

        let duration = start.elapsed().as_secs_f64();
        metrics::record_loyalty_tick(duration, summary.orders_processed, summary.points_awarded);
        Ok(summary)
    }

    /// Processes a single order in its own transaction (§4.8 concurrency
    /// note: one failure must not poison the batch). Returns the points
    /// delta awarded, or `None` if the order was skipped.
    async fn process_order(&self, order: &Order, now: DateTime<Utc>) -> Result<Option<i64>, AppError> {
        let key = loyalty_key(order.id);

        self.store
            .with_tx(|mut tx| {
                let key = key.clone();
                let order = order.clone();
                async move {
                    if Store::find_idempotency_record(&mut *tx, &key)
                        .await
                        .map_err(AppError::Internal)?
                        .is_some()
                    {
                        return Ok((None, tx));
                    }

                    if order.status != crate::models::OrderStatus::Paid {
                        return Ok((None, tx));
                    }

                    let raw_points = (order.total * self.config.points_per_dollar)
                        .floor()
                        .to_i64()
                        .unwrap_or(0);

                    if raw_points == 0 {
                        Store::try_insert_idempotency_record(
                            &mut tx,
                            &key,
                            crate::models::idempotency::OP_LOYALTY,
                            order.customer_id,
                            None,
                            now,
                        )
                        .await
                        .map_err(AppError::Internal)?;
                        return Ok((None, tx));
                    }

                    let customer = Store::find_customer_by_id(&mut *tx, order.customer_id)
                        .await
                        .map_err(AppError::Internal)?
                        .ok_or_else(|| {
                            AppError::Internal(sqlx::Error::RowNotFound)
                        })?;

                    let headroom = self.config.max_points - customer.loyalty_points;
                    let delta = raw_points.min(headroom.max(0));

                    Store::try_insert_idempotency_record(
                        &mut tx,
                        &key,
                        crate::models::idempotency::OP_LOYALTY,
                        customer.id,
                        Some(&delta.to_string()),
                        now,
                    )
                    .await
                    .map_err(AppError::Internal)?;

                    if delta <= 0 {
                        return Ok((None, tx));
                    }

                    let new_points = customer.loyalty_points + delta;
                    Store::update_customer_loyalty_points(&mut tx, customer.id, new_points, now)
                        .await
                        .map_err(AppError::Internal)?;

                    Store::insert_audit_log(
                        &mut tx,
                        AuditOperation::LoyaltyPointsAdded,
                        "customer",
                        customer.id,
                        &format!(
                            "order {} awarded {} points (new balance {}, cap {})",
                            order.id, delta, new_points, self.config.max_points
                        ),
                        now,
                    )
                    .await
                    .map_err(AppError::Internal)?;

                    Ok((Some(delta), tx))
                }
            })
            .await
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct LoyaltyTickSummary {
    pub orders_processed: u64,
    pub points_awarded: u64,
}

/// Result of one `run_tick` invocation, distinguishing a tick that ran
/// (however few orders it touched) from one skipped because another
/// instance already held the advisory lock (§4.9).
#[derive(Debug, Clone, Copy)]
pub enum LoyaltyRunOutcome {
    Skipped,
    Completed(LoyaltyTickSummary),
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use sqlx::PgPool;

    use super::*;

    async fn insert_customer_with_points(pool: &PgPool, email: &str, points: i64) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO customers (id, email, first_name, last_name, loyalty_points) \
             VALUES ($1, $2, 'Test', 'Customer', $3)",
        )
        .bind(id)
        .bind(email)
        .bind(points)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    async fn insert_paid_order(
        pool: &PgPool,
        customer_id: Uuid,
        total: rust_decimal::Decimal,
        updated_at: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO orders (id, customer_id, status, subtotal, discount_amount, total, updated_at)
            VALUES ($1, $2, 'paid', $3, 0, $3, $4)
            "#,
        )
        .bind(id)
        .bind(customer_id)
        .bind(total)
        .bind(updated_at)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    async fn audit_count(pool: &PgPool, customer_id: Uuid) -> i64 {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM audit_logs WHERE operation = 'LOYALTY_POINTS_ADDED' AND entity_id = $1",
        )
        .bind(customer_id)
        .fetch_one(pool)
        .await
        .unwrap();
        count
    }

    #[sqlx::test]
    async fn awards_points_capped_at_max_and_is_idempotent_on_replay(pool: PgPool) {
        let now = Utc::now();
        let customer_id = insert_customer_with_points(&pool, "loyal@example.com", 490).await;
        insert_paid_order(&pool, customer_id, dec!(75.00), now).await;

        let store = Store::new(pool.clone());
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::FixedClock(now));
        let worker = LoyaltyWorker::new(store, clock, LoyaltyConfig::default());

        let first = worker.run_tick(60).await.unwrap();
        let LoyaltyRunOutcome::Completed(summary) = first else {
            panic!("expected the tick to run, not skip");
        };
        assert_eq!(summary.orders_processed, 1);
        assert_eq!(summary.points_awarded, 10);

        let (points,): (i64,) = sqlx::query_as("SELECT loyalty_points FROM customers WHERE id = $1")
            .bind(customer_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(points, 500);
        assert_eq!(audit_count(&pool, customer_id).await, 1);

        // A second tick over the same window must not award points twice.
        let second = worker.run_tick(60).await.unwrap();
        let LoyaltyRunOutcome::Completed(summary) = second else {
            panic!("expected the tick to run, not skip");
        };
        assert_eq!(summary.orders_processed, 1);
        assert_eq!(summary.points_awarded, 0);

        let (points_after,): (i64,) = sqlx::query_as("SELECT loyalty_points FROM customers WHERE id = $1")
            .bind(customer_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(points_after, 500);
        assert_eq!(audit_count(&pool, customer_id).await, 1);
    }

    #[sqlx::test]
    async fn skips_orders_outside_the_lookback_window(pool: PgPool) {
        let now = Utc::now();
        let stale = now - chrono::Duration::hours(2);
        let customer_id = insert_customer_with_points(&pool, "stale@example.com", 0).await;
        insert_paid_order(&pool, customer_id, dec!(40.00), stale).await;

        let store = Store::new(pool.clone());
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::FixedClock(now));
        let worker = LoyaltyWorker::new(store, clock, LoyaltyConfig::default());

        let outcome = worker.run_tick(60).await.unwrap();
        let LoyaltyRunOutcome::Completed(summary) = outcome else {
            panic!("expected the tick to run, not skip");
        };
        assert_eq!(summary.orders_processed, 0);
        assert_eq!(summary.points_awarded, 0);
    }
}
