//! Idempotency registry (§4.7): reserve a key inside the caller's
//! transaction, let the unique constraint on `idempotency_records.key`
//! arbitrate concurrent creators.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::db::Store;

pub enum Reservation {
    /// This caller won the race and should proceed with the operation.
    Acquired,
    /// Another request already completed this operation; its result entity
    /// id is returned so the caller can load and return it.
    AlreadyCompleted(Uuid),
}

/// Attempts to reserve `key` for `operation_type`. `provisional_entity_id`
/// is written speculatively; if the insert loses the race, the winning
/// record's `result_entity_id` is returned instead.
pub async fn reserve(
    tx: &mut Transaction<'static, Postgres>,
    key: &str,
    operation_type: &str,
    provisional_entity_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Reservation, sqlx::Error> {
    let acquired =
        Store::try_insert_idempotency_record(tx, key, operation_type, provisional_entity_id, None, now)
            .await?;

    if acquired {
        return Ok(Reservation::Acquired);
    }

    let existing = Store::find_idempotency_record(&mut **tx, key)
        .await?
        .expect("insert lost the race so a winning record must exist");
    Ok(Reservation::AlreadyCompleted(existing.result_entity_id))
}
