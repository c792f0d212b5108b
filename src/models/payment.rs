use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Failed,
    Voided,
}

#[derive(Debug, Clone, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub external_authorization_id: Option<String>,
    pub retry_attempts: i32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Embedded payment snapshot carried on `OrderResponse` (§4.2).
#[derive(Debug, Clone, Serialize)]
pub struct PaymentResponse {
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub external_authorization_id: Option<String>,
    pub retry_attempts: i32,
    pub failure_reason: Option<String>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self {
            status: payment.status,
            amount: payment.amount,
            external_authorization_id: payment.external_authorization_id,
            retry_attempts: payment.retry_attempts,
            failure_reason: payment.failure_reason,
        }
    }
}
