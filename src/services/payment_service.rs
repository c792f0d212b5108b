//! Payment Service (C8): authorize/void orchestration with bounded retry
//! (§4.4, §4.5).
//!
//! The database transaction and the outbound gateway call are kept
//! separate — a transaction is never held open across a network round
//! trip or the inter-attempt backoff, matching the three distinct
//! suspension points the spec calls out (store transactions, outbound
//! HTTPS calls, retry delay).

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::PaymentsConfig;
use crate::db::Store;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{AuditOperation, OrderStatus, Payment, PaymentStatus};
use crate::services::payment_gateway::{GatewayOutcome, PaymentGateway};
use crate::services::retry::RetryPolicy;

pub struct PaymentService {
    store: Store,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl PaymentService {
    pub fn new(
        store: Store,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        config: &PaymentsConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            retry: RetryPolicy::from_config(config),
        }
    }

    pub async fn authorize(&self, order_id: Uuid) -> AppResult<Payment> {
        let now = self.clock.now();
        let order = Store::find_order(self.store.pool(), order_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        match order.status {
            OrderStatus::Paid => {
                return Err(AppError::BusinessValidation(
                    "order is already paid".to_string(),
                ))
            }
            OrderStatus::Cancelled => {
                return Err(AppError::BusinessValidation(
                    "order has been cancelled".to_string(),
                ))
            }
            OrderStatus::Pending => {}
        }

        let payment = self
            .store
            .with_tx(|mut tx| {
                let total = order.total;
                async move {
                    let payment = Store::upsert_pending_payment(&mut tx, order_id, total, now)
                        .await
                        .map_err(AppError::Internal)?;
                    Ok((payment, tx))
                }
            })
            .await?;

        let mut attempt = 1;
        let mut retry_attempts = payment.retry_attempts;
        let outcome = loop {
            metrics::record_payment_attempt("authorize");
            let outcome = self.gateway.authorize(order.total).await;

            match &outcome {
                GatewayOutcome::Retryable { reason } if self.retry.should_attempt(attempt + 1) => {
                    warn!(order_id = %order_id, attempt, reason, "payment authorization retrying");
                    retry_attempts += 1;
                    metrics::record_payment_retry("authorize");
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                    continue;
                }
                _ => break outcome,
            }
        };

        self.finalize_authorization(&payment, order_id, retry_attempts, outcome)
            .await
    }

    async fn finalize_authorization(
        &self,
        payment: &Payment,
        order_id: Uuid,
        retry_attempts: i32,
        outcome: GatewayOutcome,
    ) -> AppResult<Payment> {
        let now = self.clock.now();

        match outcome {
            GatewayOutcome::Authorized { authorization_id } => {
                let updated = self
                    .store
                    .with_tx(|mut tx| {
                        let payment_id = payment.id;
                        let authorization_id = authorization_id.clone();
                        async move {
                            let payment = Store::mark_payment_authorized(
                                &mut tx,
                                payment_id,
                                &authorization_id,
                                retry_attempts,
                                now,
                            )
                            .await
                            .map_err(AppError::Internal)?;
                            let order = Store::find_order(&mut *tx, order_id)
                                .await
                                .map_err(AppError::Internal)?
                                .expect("order located by caller still exists inside its own transaction");
                            Store::update_order_status(
                                &mut tx,
                                order_id,
                                order.version,
                                OrderStatus::Paid,
                                now,
                            )
                            .await
                            .map_err(AppError::Internal)?;
                            Store::insert_audit_log(
                                &mut tx,
                                AuditOperation::PaymentAuthorized,
                                "order",
                                order_id,
                                &format!("payment {} authorized as {}", payment.id, authorization_id),
                                now,
                            )
                            .await
                            .map_err(AppError::Internal)?;
                            Ok((payment, tx))
                        }
                    })
                    .await?;
                metrics::record_payment_authorized();
                Ok(updated)
            }
            GatewayOutcome::Terminal { reason } => {
                self.store
                    .with_tx(|mut tx| {
                        let payment_id = payment.id;
                        let reason = reason.clone();
                        async move {
                            let payment = Store::mark_payment_failed(
                                &mut tx,
                                payment_id,
                                &reason,
                                retry_attempts,
                                now,
                            )
                            .await
                            .map_err(AppError::Internal)?;
                            Ok((payment, tx))
                        }
                    })
                    .await?;
                metrics::record_payment_failed();
                Err(AppError::PaymentFailed(reason))
            }
            GatewayOutcome::Retryable { reason } => {
                self.store
                    .with_tx(|mut tx| {
                        let payment_id = payment.id;
                        let reason = reason.clone();
                        async move {
                            let payment = Store::mark_payment_failed(
                                &mut tx,
                                payment_id,
                                &reason,
                                retry_attempts,
                                now,
                            )
                            .await
                            .map_err(AppError::Internal)?;
                            Ok((payment, tx))
                        }
                    })
                    .await?;
                metrics::record_payment_unavailable();
                Err(AppError::PaymentUnavailable(format!(
                    "payment gateway unavailable after {retry_attempts} retries: {reason}"
                )))
            }
        }
    }

    /// Voids a payment, used standalone — callers that need the void
    /// folded into a larger transaction should use
    /// [`void_in_tx`](Self::void_in_tx) instead of this entry point.
    pub async fn void(&self, payment_id: Uuid) -> AppResult<Payment> {
        let payment = Store::find_payment_by_id(self.store.pool(), payment_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("payment {payment_id} not found")))?;

        if payment.status != PaymentStatus::Authorized {
            return Err(AppError::BusinessValidation(
                "payment is not in an authorized state".to_string(),
            ));
        }

        let authorization_id = payment
            .external_authorization_id
            .clone()
            .expect("authorized payment always carries an authorization id");
        let outcome = self.call_void_with_retry(&authorization_id).await;

        match outcome {
            GatewayOutcome::Authorized { .. } => {
                let now = self.clock.now();
                let updated = self
                    .store
                    .with_tx(|mut tx| async move {
                        let payment = Store::mark_payment_voided(&mut tx, payment_id, now)
                            .await
                            .map_err(AppError::Internal)?;
                        Store::insert_audit_log(
                            &mut tx,
                            AuditOperation::PaymentVoided,
                            "payment",
                            payment_id,
                            "payment voided",
                            now,
                        )
                        .await
                        .map_err(AppError::Internal)?;
                        Ok((payment, tx))
                    })
                    .await?;
                metrics::record_payment_voided();
                Ok(updated)
            }
            GatewayOutcome::Terminal { reason } | GatewayOutcome::Retryable { reason } => {
                metrics::record_payment_unavailable();
                Err(AppError::PaymentUnavailable(format!("void failed: {reason}")))
            }
        }
    }

    /// Same gateway-call-and-retry sequence as [`void`](Self::void), but
    /// leaves the state transition to the caller's own transaction (used by
    /// `OrderService::cancel_order`, §4.3 step 2).
    pub async fn void_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        payment_id: Uuid,
        authorization_id: &str,
    ) -> AppResult<()> {
        let outcome = self.call_void_with_retry(authorization_id).await;
        let now = self.clock.now();

        match outcome {
            GatewayOutcome::Authorized { .. } => {
                Store::mark_payment_voided(tx, payment_id, now)
                    .await
                    .map_err(AppError::Internal)?;
                Store::insert_audit_log(
                    tx,
                    AuditOperation::PaymentVoided,
                    "payment",
                    payment_id,
                    "payment voided as part of order cancellation",
                    now,
                )
                .await
                .map_err(AppError::Internal)?;
                metrics::record_payment_voided();
                Ok(())
            }
            GatewayOutcome::Terminal { reason } | GatewayOutcome::Retryable { reason } => {
                metrics::record_payment_unavailable();
                Err(AppError::PaymentUnavailable(format!(
                    "void failed during cancellation: {reason}"
                )))
            }
        }
    }

    async fn call_void_with_retry(&self, authorization_id: &str) -> GatewayOutcome {
        let mut attempt = 1;
        loop {
            metrics::record_payment_attempt("void");
            let outcome = self.gateway.void(authorization_id).await;
            match &outcome {
                GatewayOutcome::Retryable { reason } if self.retry.should_attempt(attempt + 1) => {
                    warn!(attempt, reason, "payment void retrying");
                    metrics::record_payment_retry("void");
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                    continue;
                }
                _ => break outcome,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use sqlx::PgPool;

    use super::*;
    use crate::clock::FixedClock;
    use crate::services::payment_gateway::test_support::ScriptedGateway;

    async fn insert_customer(pool: &PgPool, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO customers (id, email, first_name, last_name, loyalty_points) \
             VALUES ($1, $2, 'Test', 'Customer', 0)",
        )
        .bind(id)
        .bind(email)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    async fn insert_pending_order(pool: &PgPool, customer_id: Uuid, total: rust_decimal::Decimal) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO orders (id, customer_id, status, subtotal, discount_amount, total)
            VALUES ($1, $2, 'pending', $3, 0, $3)
            "#,
        )
        .bind(id)
        .bind(customer_id)
        .bind(total)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    fn fast_payments_config() -> PaymentsConfig {
        PaymentsConfig {
            backoff_ms: 1,
            ..PaymentsConfig::default()
        }
    }

    #[sqlx::test]
    async fn retries_once_then_authorizes(pool: PgPool) {
        let customer_id = insert_customer(&pool, "cust@example.com").await;
        let order_id = insert_pending_order(&pool, customer_id, dec!(25.00)).await;

        let store = Store::new(pool.clone());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(chrono::Utc::now()));
        let gateway = Arc::new(ScriptedGateway::new(
            vec![
                GatewayOutcome::Retryable {
                    reason: "gateway returned retryable status 500".to_string(),
                },
                GatewayOutcome::Authorized {
                    authorization_id: "AUTH-Z".to_string(),
                },
            ],
            vec![],
        ));
        let config = fast_payments_config();
        let service = PaymentService::new(store, gateway.clone(), clock, &config);

        let payment = service.authorize(order_id).await.unwrap();

        assert_eq!(payment.status, PaymentStatus::Authorized);
        assert_eq!(payment.external_authorization_id.as_deref(), Some("AUTH-Z"));
        assert_eq!(payment.retry_attempts, 1);
        assert_eq!(gateway.authorize_calls(), 2);

        let order = Store::find_order(&pool, order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
    }

    #[sqlx::test]
    async fn terminal_decline_does_not_retry(pool: PgPool) {
        let customer_id = insert_customer(&pool, "cust2@example.com").await;
        let order_id = insert_pending_order(&pool, customer_id, dec!(40.00)).await;

        let store = Store::new(pool.clone());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(chrono::Utc::now()));
        let gateway = Arc::new(ScriptedGateway::new(
            vec![GatewayOutcome::Terminal {
                reason: "card declined".to_string(),
            }],
            vec![],
        ));
        let config = fast_payments_config();
        let service = PaymentService::new(store, gateway.clone(), clock, &config);

        let err = service.authorize(order_id).await.unwrap_err();
        assert!(matches!(err, AppError::PaymentFailed(_)));
        assert_eq!(gateway.authorize_calls(), 1);

        let order = Store::find_order(&pool, order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[sqlx::test]
    async fn exhausting_retries_reports_unavailable(pool: PgPool) {
        let customer_id = insert_customer(&pool, "cust3@example.com").await;
        let order_id = insert_pending_order(&pool, customer_id, dec!(10.00)).await;

        let store = Store::new(pool.clone());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(chrono::Utc::now()));
        let gateway = Arc::new(ScriptedGateway::new(
            vec![
                GatewayOutcome::Retryable {
                    reason: "timeout".to_string(),
                },
                GatewayOutcome::Retryable {
                    reason: "timeout".to_string(),
                },
            ],
            vec![],
        ));
        let config = fast_payments_config();
        let service = PaymentService::new(store, gateway.clone(), clock, &config);

        let err = service.authorize(order_id).await.unwrap_err();
        assert!(matches!(err, AppError::PaymentUnavailable(_)));
        assert_eq!(gateway.authorize_calls(), 2);

        let order = Store::find_order(&pool, order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
    }
}
