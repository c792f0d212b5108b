use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation_type: String,
    pub result_entity_id: Uuid,
    pub result_data: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const OP_ORDER_CREATE: &str = "ORDER_CREATE";
pub const OP_LOYALTY: &str = "LOYALTY";

pub fn loyalty_key(order_id: Uuid) -> String {
    format!("LOYALTY_{order_id}")
}
