//! Store — transactional persistence for products, customers, orders,
//! items, payments, idempotency records and audit logs.
//!
//! Exposes `with_tx` as the single transaction primitive higher layers use
//! (§9 design note), plus narrow repository methods grounded on the
//! teacher's direct `sqlx::query`/`query_as` style (see
//! `api/handlers/order.rs` in the original crate) rather than a generic ORM.

use std::future::Future;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    AuditLog, AuditOperation, Customer, IdempotencyRecord, Order, OrderItem, OrderStatus,
    Payment, PaymentStatus, Product,
};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs `f` inside one transaction; commits on `Ok`, rolls back on `Err`
    /// (the latter happens implicitly when the `Transaction` is dropped
    /// without a call to `commit`).
    pub async fn with_tx<F, Fut, T>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(Transaction<'static, Postgres>) -> Fut,
        Fut: Future<Output = Result<(T, Transaction<'static, Postgres>), AppError>>,
    {
        let tx = self.pool.begin().await.map_err(AppError::Internal)?;
        let (value, tx) = f(tx).await?;
        tx.commit().await.map_err(AppError::Internal)?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Customers
    // ------------------------------------------------------------------

    pub async fn find_customer_by_email(
        tx: &mut Transaction<'static, Postgres>,
        email: &str,
    ) -> Result<Option<Customer>, sqlx::Error> {
        sqlx::query_as::<_, Customer>("SELECT * FROM customers WHERE email = $1")
            .bind(email)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn create_customer(
        tx: &mut Transaction<'static, Postgres>,
        email: &str,
        first_name: &str,
        last_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Customer, sqlx::Error> {
        sqlx::query_as::<_, Customer>(
            r#"
            INSERT INTO customers (id, email, first_name, last_name, loyalty_points, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 0, $5, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(first_name)
        .bind(last_name)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn find_customer_by_id(
        pool: impl sqlx::PgExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Customer>, sqlx::Error> {
        sqlx::query_as::<_, Customer>("SELECT * FROM customers WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn update_customer_loyalty_points(
        tx: &mut Transaction<'static, Postgres>,
        customer_id: Uuid,
        new_points: i64,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE customers SET loyalty_points = $1, updated_at = $2 WHERE id = $3")
            .bind(new_points)
            .bind(now)
            .bind(customer_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Products
    // ------------------------------------------------------------------

    pub async fn find_product_by_sku(
        tx: &mut Transaction<'static, Postgres>,
        sku: &str,
    ) -> Result<Option<Product>, sqlx::Error> {
        sqlx::query_as::<_, Product>("SELECT * FROM products WHERE sku = $1")
            .bind(sku)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn find_product_by_id(
        pool: impl sqlx::PgExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Product>, sqlx::Error> {
        sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Atomic conditional decrement: `None` means the current stock was
    /// insufficient for `quantity` (a genuine business failure, not a race —
    /// Postgres's row-level lock on the `UPDATE` already serializes
    /// concurrent decrements of the same product).
    pub async fn decrement_stock(
        tx: &mut Transaction<'static, Postgres>,
        product_id: Uuid,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Product>, sqlx::Error> {
        sqlx::query_as::<_, Product>(
            r#"
            UPDATE products
            SET stock_quantity = stock_quantity - $1, updated_at = $2
            WHERE id = $3 AND stock_quantity >= $1
            RETURNING *
            "#,
        )
        .bind(quantity)
        .bind(now)
        .bind(product_id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn increment_stock(
        tx: &mut Transaction<'static, Postgres>,
        product_id: Uuid,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<Product, sqlx::Error> {
        sqlx::query_as::<_, Product>(
            r#"
            UPDATE products
            SET stock_quantity = stock_quantity + $1, updated_at = $2
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(quantity)
        .bind(now)
        .bind(product_id)
        .fetch_one(&mut **tx)
        .await
    }

    // ------------------------------------------------------------------
    // Orders & items
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_order(
        tx: &mut Transaction<'static, Postgres>,
        customer_id: Uuid,
        idempotency_key: Option<&str>,
        subtotal: Decimal,
        discount_amount: Decimal,
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Order, sqlx::Error> {
        sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders
                (id, customer_id, status, idempotency_key, subtotal, discount_amount, total, created_at, updated_at, version)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $7, 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(idempotency_key)
        .bind(subtotal)
        .bind(discount_amount)
        .bind(total)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_order_item(
        tx: &mut Transaction<'static, Postgres>,
        order_id: Uuid,
        product_id: Uuid,
        product_sku: &str,
        product_name: &str,
        quantity: i64,
        unit_price: Decimal,
        subtotal: Decimal,
    ) -> Result<OrderItem, sqlx::Error> {
        sqlx::query_as::<_, OrderItem>(
            r#"
            INSERT INTO order_items (id, order_id, product_id, product_sku, product_name, quantity, unit_price, subtotal)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order_id)
        .bind(product_id)
        .bind(product_sku)
        .bind(product_name)
        .bind(quantity)
        .bind(unit_price)
        .bind(subtotal)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn find_order(
        pool: impl sqlx::PgExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Re-reads the order a concurrent creator persisted under `key` after
    /// this caller lost the race on `orders.idempotency_key`'s unique
    /// constraint (§4.1 step 7).
    pub async fn find_order_by_idempotency_key(
        pool: impl sqlx::PgExecutor<'_>,
        key: &str,
    ) -> Result<Option<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_order_items(
        pool: impl sqlx::PgExecutor<'_>,
        order_id: Uuid,
    ) -> Result<Vec<OrderItem>, sqlx::Error> {
        sqlx::query_as::<_, OrderItem>("SELECT * FROM order_items WHERE order_id = $1")
            .bind(order_id)
            .fetch_all(pool)
            .await
    }

    pub async fn find_idempotency_record(
        pool: impl sqlx::PgExecutor<'_>,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, sqlx::Error> {
        sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT * FROM idempotency_records WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(pool)
        .await
    }

    /// Inserts an idempotency record. Returns `Ok(false)` (instead of an
    /// error) on a unique-constraint violation, so the caller can re-read
    /// the winning record — the race between two concurrent creators is
    /// resolved by the database, per §9.
    pub async fn try_insert_idempotency_record(
        tx: &mut Transaction<'static, Postgres>,
        key: &str,
        operation_type: &str,
        result_entity_id: Uuid,
        result_data: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, operation_type, result_entity_id, result_data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(operation_type)
        .bind(result_entity_id)
        .bind(result_data)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn list_customer_orders(
        pool: impl sqlx::PgExecutor<'_> + Copy,
        customer_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Order>, i64), sqlx::Error> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE customer_id = $1
            ORDER BY created_at DESC, id DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(customer_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE customer_id = $1")
            .bind(customer_id)
            .fetch_one(pool)
            .await?;

        Ok((orders, total.0))
    }

    /// Updates order status with an optimistic-lock check on `version`.
    /// Returns `None` if `expected_version` no longer matches (the order
    /// was mutated concurrently since it was read).
    pub async fn update_order_status(
        tx: &mut Transaction<'static, Postgres>,
        order_id: Uuid,
        expected_version: i32,
        new_status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET status = $1, updated_at = $2, version = version + 1
            WHERE id = $3 AND version = $4
            RETURNING *
            "#,
        )
        .bind(new_status)
        .bind(now)
        .bind(order_id)
        .bind(expected_version)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn find_paid_orders_for_loyalty(
        pool: impl sqlx::PgExecutor<'_>,
        since: DateTime<Utc>,
        after_id: Option<Uuid>,
        batch_size: i64,
    ) -> Result<Vec<Order>, sqlx::Error> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders
            WHERE status = 'paid' AND updated_at >= $1
              AND ($2::uuid IS NULL OR id > $2)
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(since)
        .bind(after_id)
        .bind(batch_size)
        .fetch_all(pool)
        .await
    }

    // ------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------

    pub async fn find_payment_by_order(
        pool: impl sqlx::PgExecutor<'_>,
        order_id: Uuid,
    ) -> Result<Option<Payment>, sqlx::Error> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_payment_by_id(
        pool: impl sqlx::PgExecutor<'_>,
        id: Uuid,
    ) -> Result<Option<Payment>, sqlx::Error> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn upsert_pending_payment(
        tx: &mut Transaction<'static, Postgres>,
        order_id: Uuid,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Payment, sqlx::Error> {
        sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (id, order_id, status, amount, retry_attempts, created_at, updated_at)
            VALUES ($1, $2, 'pending', $3, 0, $4, $4)
            ON CONFLICT (order_id) DO UPDATE SET amount = EXCLUDED.amount
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order_id)
        .bind(amount)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn mark_payment_authorized(
        tx: &mut Transaction<'static, Postgres>,
        payment_id: Uuid,
        external_authorization_id: &str,
        retry_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<Payment, sqlx::Error> {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'authorized', external_authorization_id = $1, retry_attempts = $2, updated_at = $3
            WHERE id = $4
            RETURNING *
            "#,
        )
        .bind(external_authorization_id)
        .bind(retry_attempts)
        .bind(now)
        .bind(payment_id)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn mark_payment_failed(
        tx: &mut Transaction<'static, Postgres>,
        payment_id: Uuid,
        failure_reason: &str,
        retry_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<Payment, sqlx::Error> {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = $1, retry_attempts = $2, updated_at = $3
            WHERE id = $4
            RETURNING *
            "#,
        )
        .bind(failure_reason)
        .bind(retry_attempts)
        .bind(now)
        .bind(payment_id)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn increment_payment_retry(
        tx: &mut Transaction<'static, Postgres>,
        payment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Payment, sqlx::Error> {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET retry_attempts = retry_attempts + 1, updated_at = $1
            WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(payment_id)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn mark_payment_voided(
        tx: &mut Transaction<'static, Postgres>,
        payment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Payment, sqlx::Error> {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET status = 'voided', updated_at = $1
            WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(payment_id)
        .fetch_one(&mut **tx)
        .await
    }

    // ------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------

    pub async fn insert_audit_log(
        tx: &mut Transaction<'static, Postgres>,
        operation: AuditOperation,
        entity_type: &str,
        entity_id: Uuid,
        details: &str,
        now: DateTime<Utc>,
    ) -> Result<AuditLog, sqlx::Error> {
        let details = if details.len() > 1000 {
            &details[..1000]
        } else {
            details
        };
        sqlx::query_as::<_, AuditLog>(
            r#"
            INSERT INTO audit_logs (id, operation, entity_type, entity_id, details, "timestamp")
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(operation)
        .bind(entity_type)
        .bind(entity_id)
        .bind(details)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
    }

    // ------------------------------------------------------------------
    // Loyalty worker coordination
    // ------------------------------------------------------------------

    /// Attempts to take the advisory lock used to serialize loyalty-worker
    /// ticks across process instances (§4.8). `pg_advisory_lock` is
    /// session-scoped, so the acquiring connection is checked out of the
    /// pool and handed back to the caller rather than released immediately
    /// — releasing from a *different* pooled connection would be a no-op
    /// and leave the lock dangling until that session eventually closes.
    /// Returns `None` without blocking if another tick already holds it.
    pub async fn try_acquire_loyalty_lock(
        pool: &PgPool,
    ) -> Result<Option<PoolConnection<Postgres>>, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        let (acquired,): (bool,) =
            sqlx::query_as("SELECT pg_try_advisory_lock(hashtext('loyalty_worker'))")
                .fetch_one(&mut *conn)
                .await?;
        Ok(if acquired { Some(conn) } else { None })
    }

    /// Releases a lock obtained from [`try_acquire_loyalty_lock`] on the
    /// same connection that acquired it.
    pub async fn release_loyalty_lock(mut conn: PoolConnection<Postgres>) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_unlock(hashtext('loyalty_worker'))")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
