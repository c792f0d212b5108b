//! Order Service (C7): placement, retrieval, cancellation (§4.1-§4.3).

use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{BusinessConfig, OrdersConfig};
use crate::db::Store;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::customer::first_name_from_email;
use crate::models::idempotency::OP_ORDER_CREATE;
use crate::models::{
    AuditOperation, CreateOrderRequest, Order, OrderItemResponse, OrderResponse, OrderStatus,
    PagedResponse,
};
use crate::services::discount::calculate_discount;
use crate::services::idempotency::{self as idempotency_svc, Reservation};
use crate::services::payment_service::PaymentService;

pub struct OrderService {
    store: Store,
    clock: Arc<dyn Clock>,
    business: BusinessConfig,
    payment_service: Arc<PaymentService>,
}

impl OrderService {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        business: BusinessConfig,
        payment_service: Arc<PaymentService>,
    ) -> Self {
        Self {
            store,
            clock,
            business,
            payment_service,
        }
    }

    fn orders_config(&self) -> &OrdersConfig {
        &self.business.orders
    }

    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
        idempotency_key: Option<String>,
    ) -> AppResult<(OrderResponse, bool)> {
        if self.orders_config().require_idempotency_key && idempotency_key.is_none() {
            return Err(AppError::Validation(
                "Idempotency-Key header is required".to_string(),
            ));
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_create_order_once(&request, idempotency_key.as_deref()).await {
                Ok(result) => return Ok(result),
                Err(OrderCreateError::Conflict) if attempts < self.orders_config().max_stock_contention_retries => {
                    info!(attempts, "order creation retrying after store contention");
                    continue;
                }
                Err(OrderCreateError::Conflict) => {
                    return Err(AppError::BusinessValidation(
                        "Insufficient stock due to concurrent demand; please retry".to_string(),
                    ))
                }
                Err(OrderCreateError::App(err)) => return Err(err),
            }
        }
    }

    async fn try_create_order_once(
        &self,
        request: &CreateOrderRequest,
        idempotency_key: Option<&str>,
    ) -> Result<(OrderResponse, bool), OrderCreateError> {
        let now = self.clock.now();

        let outcome = self
            .store
            .with_tx(|mut tx| {
                let request = request.clone();
                let idempotency_key = idempotency_key.map(str::to_string);
                async move {
                    let result = self
                        .place_order_in_tx(&mut tx, &request, idempotency_key.as_deref(), now)
                        .await;
                    match result {
                        Ok(outcome) => Ok((outcome, tx)),
                        Err(err) => Err(err),
                    }
                }
            })
            .await;

        match outcome {
            Ok((order_id, was_duplicate)) => {
                let response = self.load_order_response(order_id).await.map_err(OrderCreateError::App)?;
                if was_duplicate {
                    metrics::record_idempotent_hit();
                } else {
                    metrics::record_order_created();
                }
                Ok((response, was_duplicate))
            }
            Err(AppError::Internal(sqlx_err)) if is_serialization_failure(&sqlx_err) => {
                Err(OrderCreateError::Conflict)
            }
            // The orders table's own unique constraint on `idempotency_key`
            // can fire before step 7's idempotency-record reservation does
            // (insert_order, step 6, runs first) — so a concurrent creator
            // using the same key can lose the race here instead of at the
            // registry. Per §4.1 step 7: roll back (already done — the
            // transaction was dropped without a commit) and re-read the
            // order the winner created.
            Err(AppError::Internal(sqlx_err)) if is_duplicate_idempotency_key(&sqlx_err) => {
                let key = idempotency_key.expect(
                    "a duplicate idempotency_key violation implies a key was provided",
                );
                let existing = Store::find_order_by_idempotency_key(self.store.pool(), key)
                    .await
                    .map_err(AppError::Internal)
                    .map_err(OrderCreateError::App)?
                    .ok_or_else(|| {
                        OrderCreateError::App(AppError::Internal(sqlx::Error::RowNotFound))
                    })?;
                let response = self
                    .load_order_response(existing.id)
                    .await
                    .map_err(OrderCreateError::App)?;
                metrics::record_idempotent_hit();
                Ok((response, true))
            }
            Err(err) => {
                metrics::record_order_rejected(err.metric_reason());
                Err(OrderCreateError::App(err))
            }
        }
    }

    async fn place_order_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        request: &CreateOrderRequest,
        idempotency_key: Option<&str>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> AppResult<(Uuid, bool)> {
        // Step 1: idempotency pre-check.
        if let Some(key) = idempotency_key {
            if let Some(record) = Store::find_idempotency_record(&mut **tx, key)
                .await
                .map_err(AppError::Internal)?
            {
                return Ok((record.result_entity_id, true));
            }
        }

        // Step 2: find-or-create customer.
        let customer = match Store::find_customer_by_email(tx, &request.customer_email)
            .await
            .map_err(AppError::Internal)?
        {
            Some(customer) => customer,
            None => {
                let first_name = first_name_from_email(&request.customer_email);
                Store::create_customer(
                    tx,
                    &request.customer_email,
                    &first_name,
                    crate::models::customer::DEFAULT_LAST_NAME,
                    now,
                )
                .await
                .map_err(AppError::Internal)?
            }
        };

        // Step 3: line items — lookup, validate, snapshot, decrement stock.
        let mut line_items: Vec<LineItem> = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = Store::find_product_by_sku(tx, &item.product_sku)
                .await
                .map_err(AppError::Internal)?
                .ok_or_else(|| AppError::NotFound(format!("product {} not found", item.product_sku)))?;

            if !product.active {
                return Err(AppError::BusinessValidation(format!(
                    "product {} is not active",
                    product.sku
                )));
            }

            let decremented = Store::decrement_stock(tx, product.id, item.quantity, now)
                .await
                .map_err(AppError::Internal)?;
            let Some(_) = decremented else {
                return Err(AppError::BusinessValidation(format!(
                    "Insufficient stock for product {}. Available: {}, Requested: {}",
                    product.sku, product.stock_quantity, item.quantity
                )));
            };

            let unit_price = product.price;
            let subtotal = unit_price * Decimal::from(item.quantity);
            line_items.push(LineItem {
                product_id: product.id,
                product_sku: product.sku.clone(),
                product_name: product.name.clone(),
                quantity: item.quantity,
                unit_price,
                subtotal,
            });
        }

        // Step 4: pricing.
        let subtotal: Decimal = line_items.iter().map(|item| item.subtotal).sum();
        let discount = calculate_discount(subtotal, &self.business.promotions);
        let total = subtotal - discount;

        // Step 5: minimum order total.
        if total < Decimal::new(1, 2) {
            return Err(AppError::BusinessValidation(
                "Order total must be at least 0.01".to_string(),
            ));
        }

        // Step 6: persist order + items.
        let order = Store::insert_order(tx, customer.id, idempotency_key, subtotal, discount, total, now)
            .await
            .map_err(AppError::Internal)?;

        for item in &line_items {
            Store::insert_order_item(
                tx,
                order.id,
                item.product_id,
                &item.product_sku,
                &item.product_name,
                item.quantity,
                item.unit_price,
                item.subtotal,
            )
            .await
            .map_err(AppError::Internal)?;
        }

        // Step 7: commit the idempotency reservation (races resolved by the
        // unique constraint — a concurrent duplicate wins by losing here).
        if let Some(key) = idempotency_key {
            match idempotency_svc::reserve(tx, key, OP_ORDER_CREATE, order.id, now)
                .await
                .map_err(AppError::Internal)?
            {
                Reservation::Acquired => {}
                Reservation::AlreadyCompleted(existing_order_id) => {
                    return Ok((existing_order_id, true));
                }
            }
        }

        // Step 8: audit.
        Store::insert_audit_log(
            tx,
            AuditOperation::OrderCreated,
            "order",
            order.id,
            &format!("order created for customer {} totaling {}", customer.email, order.total),
            now,
        )
        .await
        .map_err(AppError::Internal)?;

        Ok((order.id, false))
    }

    pub async fn get_order(&self, id: Uuid) -> AppResult<OrderResponse> {
        self.load_order_response(id).await
    }

    pub async fn list_customer_orders(
        &self,
        email: &str,
        page: i64,
        size: i64,
    ) -> AppResult<PagedResponse<OrderResponse>> {
        let size = size.clamp(1, self.orders_config().max_page_size);
        let page = page.max(0);

        let customer = sqlx::query_as::<_, crate::models::Customer>(
            "SELECT * FROM customers WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(self.store.pool())
        .await
        .map_err(AppError::Internal)?;

        let Some(customer) = customer else {
            return Ok(PagedResponse::new(Vec::new(), page, size, 0));
        };

        let (orders, total) =
            Store::list_customer_orders(self.store.pool(), customer.id, page * size, size)
                .await
                .map_err(AppError::Internal)?;

        let mut content = Vec::with_capacity(orders.len());
        for order in orders {
            content.push(self.to_response(order, &customer.email).await?);
        }

        Ok(PagedResponse::new(content, page, size, total))
    }

    pub async fn cancel_order(&self, id: Uuid) -> AppResult<OrderResponse> {
        let now = self.clock.now();

        let order = Store::find_order(self.store.pool(), id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("order {id} not found")))?;

        if order.status == OrderStatus::Cancelled {
            return Err(AppError::BusinessValidation(
                "order is already cancelled".to_string(),
            ));
        }

        let payment = Store::find_payment_by_order(self.store.pool(), id)
            .await
            .map_err(AppError::Internal)?;

        let items = Store::find_order_items(self.store.pool(), id)
            .await
            .map_err(AppError::Internal)?;

        // Void happens before the restoring transaction starts: a network
        // call and its retry delay must not hold a transaction open.
        let authorized_payment = payment
            .as_ref()
            .filter(|payment| payment.status == crate::models::PaymentStatus::Authorized);

        self.store
            .with_tx(|mut tx| {
                let items = items.clone();
                let order = order.clone();
                async move {
                    for item in &items {
                        Store::increment_stock(&mut tx, item.product_id, item.quantity, now)
                            .await
                            .map_err(AppError::Internal)?;
                    }

                    if let Some(payment) = authorized_payment {
                        let authorization_id = payment
                            .external_authorization_id
                            .clone()
                            .expect("authorized payment always carries an authorization id");
                        self.payment_service
                            .void_in_tx(&mut tx, payment.id, &authorization_id)
                            .await?;
                    }

                    Store::update_order_status(&mut tx, order.id, order.version, OrderStatus::Cancelled, now)
                        .await
                        .map_err(AppError::Internal)?
                        .ok_or_else(|| {
                            AppError::BusinessValidation(
                                "order was modified concurrently; retry cancellation".to_string(),
                            )
                        })?;

                    Store::insert_audit_log(
                        &mut tx,
                        AuditOperation::OrderCancelled,
                        "order",
                        order.id,
                        "order cancelled; stock restored",
                        now,
                    )
                    .await
                    .map_err(AppError::Internal)?;

                    Ok(((), tx))
                }
            })
            .await?;

        metrics::record_order_cancelled();
        self.load_order_response(id).await
    }

    async fn load_order_response(&self, id: Uuid) -> AppResult<OrderResponse> {
        let order = Store::find_order(self.store.pool(), id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("order {id} not found")))?;

        let customer = Store::find_customer_by_id(self.store.pool(), order.customer_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::Internal(sqlx::Error::RowNotFound))?;

        self.to_response(order, &customer.email).await
    }

    async fn to_response(&self, order: Order, customer_email: &str) -> AppResult<OrderResponse> {
        let items = Store::find_order_items(self.store.pool(), order.id)
            .await
            .map_err(AppError::Internal)?;

        let payment = Store::find_payment_by_order(self.store.pool(), order.id)
            .await
            .map_err(AppError::Internal)?
            .map(crate::models::payment::PaymentResponse::from);

        Ok(OrderResponse {
            id: order.id,
            customer_email: customer_email.to_string(),
            status: order.status,
            subtotal: order.subtotal,
            discount_amount: order.discount_amount,
            total: order.total,
            items: items.into_iter().map(OrderItemResponse::from).collect(),
            payment,
            created_at: order.created_at,
            updated_at: order.updated_at,
        })
    }
}

struct LineItem {
    product_id: Uuid,
    product_sku: String,
    product_name: String,
    quantity: i64,
    unit_price: Decimal,
    subtotal: Decimal,
}

enum OrderCreateError {
    Conflict,
    App(AppError),
}

fn is_serialization_failure(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("40001"))
}

/// Unique-violation (23505) on `orders.idempotency_key` — a concurrent
/// creator reserved the same key first via `insert_order` (step 6), ahead of
/// this transaction's own idempotency-record reservation (step 7).
fn is_duplicate_idempotency_key(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err)
        if db_err.code().as_deref() == Some("23505")
            && db_err
                .constraint()
                .map_or(false, |constraint| constraint.contains("idempotency_key")))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use sqlx::PgPool;

    use super::*;
    use crate::clock::FixedClock;
    use crate::models::PaymentStatus;
    use crate::services::payment_gateway::test_support::ScriptedGateway;
    use crate::services::payment_gateway::{GatewayOutcome, PaymentGateway};

    /// Gateway for tests that must never place an outbound authorization
    /// call — order placement alone has no business with the gateway.
    struct NeverCalledGateway;

    #[async_trait::async_trait]
    impl PaymentGateway for NeverCalledGateway {
        async fn authorize(&self, _amount: Decimal) -> GatewayOutcome {
            panic!("order placement must not call the payment gateway");
        }
        async fn void(&self, _authorization_id: &str) -> GatewayOutcome {
            panic!("order placement must not call the payment gateway");
        }
    }

    async fn insert_product(pool: &PgPool, sku: &str, price: Decimal, stock: i64) {
        sqlx::query(
            "INSERT INTO products (id, sku, name, price, stock_quantity, active) \
             VALUES ($1, $2, $3, $4, $5, true)",
        )
        .bind(Uuid::new_v4())
        .bind(sku)
        .bind(format!("Product {sku}"))
        .bind(price)
        .bind(stock)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn stock_of(pool: &PgPool, sku: &str) -> i64 {
        let (stock,): (i64,) = sqlx::query_as("SELECT stock_quantity FROM products WHERE sku = $1")
            .bind(sku)
            .fetch_one(pool)
            .await
            .unwrap();
        stock
    }

    fn item(sku: &str, quantity: i64) -> CreateOrderItemRequest {
        CreateOrderItemRequest {
            product_sku: sku.to_string(),
            quantity,
        }
    }

    fn request(email: &str, items: Vec<CreateOrderItemRequest>) -> CreateOrderRequest {
        CreateOrderRequest {
            customer_email: email.to_string(),
            items,
        }
    }

    async fn service_with_gateway(pool: PgPool, gateway: Arc<dyn PaymentGateway>) -> (OrderService, Arc<PaymentService>) {
        let store = Store::new(pool);
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(chrono::Utc::now()));
        let business = BusinessConfig::default();
        let payment_service = Arc::new(PaymentService::new(
            store.clone(),
            gateway,
            clock.clone(),
            &business.payments,
        ));
        let order_service = OrderService::new(store, clock, business, payment_service.clone());
        (order_service, payment_service)
    }

    async fn service(pool: PgPool) -> OrderService {
        service_with_gateway(pool, Arc::new(NeverCalledGateway)).await.0
    }

    #[sqlx::test]
    async fn below_lowest_tier_has_no_discount(pool: PgPool) {
        insert_product(&pool, "A", dec!(25.00), 10).await;
        let order_service = service(pool.clone()).await;

        let (order, was_duplicate) = order_service
            .create_order(request("buyer@example.com", vec![item("A", 1)]), Some("k-s1".to_string()))
            .await
            .unwrap();

        assert!(!was_duplicate);
        assert_eq!(order.subtotal, dec!(25.00));
        assert_eq!(order.discount_amount, dec!(0.00));
        assert_eq!(order.total, dec!(25.00));
        assert_eq!(stock_of(&pool, "A").await, 9);
    }

    #[sqlx::test]
    async fn mid_tier_discount_applies(pool: PgPool) {
        insert_product(&pool, "B", dec!(50.00), 10).await;
        let order_service = service(pool.clone()).await;

        let (order, _) = order_service
            .create_order(request("buyer@example.com", vec![item("B", 2)]), Some("k-s2".to_string()))
            .await
            .unwrap();

        assert_eq!(order.subtotal, dec!(100.00));
        assert_eq!(order.discount_amount, dec!(10.00));
        assert_eq!(order.total, dec!(90.00));
        assert_eq!(stock_of(&pool, "B").await, 8);
    }

    #[sqlx::test]
    async fn highest_qualifying_tier_applies_across_line_items(pool: PgPool) {
        insert_product(&pool, "C", dec!(50.00), 10).await;
        let order_service = service(pool.clone()).await;

        let (order, _) = order_service
            .create_order(request("buyer@example.com", vec![item("C", 4)]), Some("k-s3".to_string()))
            .await
            .unwrap();

        assert_eq!(order.subtotal, dec!(200.00));
        assert_eq!(order.discount_amount, dec!(30.00));
        assert_eq!(order.total, dec!(170.00));
        assert_eq!(stock_of(&pool, "C").await, 6);
    }

    #[sqlx::test]
    async fn replaying_idempotency_key_returns_original_order_without_side_effects(pool: PgPool) {
        insert_product(&pool, "D", dec!(25.00), 10).await;
        let order_service = service(pool.clone()).await;

        let (first, first_duplicate) = order_service
            .create_order(request("buyer@example.com", vec![item("D", 1)]), Some("k-s4".to_string()))
            .await
            .unwrap();
        assert!(!first_duplicate);

        let (second, second_duplicate) = order_service
            .create_order(
                request("someone-else@example.com", vec![item("D", 5)]),
                Some("k-s4".to_string()),
            )
            .await
            .unwrap();

        assert!(second_duplicate);
        assert_eq!(second.id, first.id);
        assert_eq!(stock_of(&pool, "D").await, 9);
    }

    #[sqlx::test]
    async fn insufficient_stock_is_rejected_without_partial_effects(pool: PgPool) {
        insert_product(&pool, "E", dec!(25.00), 1).await;
        let order_service = service(pool.clone()).await;

        let err = order_service
            .create_order(request("buyer@example.com", vec![item("E", 3)]), Some("k-s5".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BusinessValidation(_)));
        assert_eq!(stock_of(&pool, "E").await, 1);
    }

    #[sqlx::test]
    async fn cancelling_a_paid_order_voids_exactly_once_and_restores_stock(pool: PgPool) {
        insert_product(&pool, "F", dec!(50.00), 10).await;
        let gateway = Arc::new(ScriptedGateway::new(
            vec![GatewayOutcome::Authorized {
                authorization_id: "AUTH-1".to_string(),
            }],
            vec![GatewayOutcome::Authorized {
                authorization_id: "void-ok".to_string(),
            }],
        ));
        let (order_service, payment_service) = service_with_gateway(pool.clone(), gateway.clone()).await;

        let (order, _) = order_service
            .create_order(request("buyer@example.com", vec![item("F", 2)]), Some("k-s6".to_string()))
            .await
            .unwrap();
        assert_eq!(stock_of(&pool, "F").await, 8);

        let payment = payment_service.authorize(order.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Authorized);

        let cancelled = order_service.cancel_order(order.id).await.unwrap();

        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(gateway.void_calls(), 1);
        assert_eq!(stock_of(&pool, "F").await, 10);

        let stored_payment = Store::find_payment_by_order(&pool, order.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_payment.status, PaymentStatus::Voided);
    }
}
