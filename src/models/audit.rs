use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "audit_operation", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    OrderCreated,
    OrderCancelled,
    PaymentAuthorized,
    PaymentVoided,
    InventoryReplenishment,
    LoyaltyPointsAdded,
    ProductCreated,
    ProductUpdated,
}

#[derive(Debug, Clone, FromRow)]
pub struct AuditLog {
    pub id: Uuid,
    pub operation: AuditOperation,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}
