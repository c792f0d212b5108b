use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub loyalty_points: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Placeholder surname used when a customer is created implicitly on first
/// order placement (§4.1 step 2 — the request carries no name).
pub const DEFAULT_LAST_NAME: &str = "Customer";

/// Derives a first name from the alphabetic characters of an email's
/// local-part, per §4.1 step 2.
pub fn first_name_from_email(email: &str) -> String {
    let local_part = email.split('@').next().unwrap_or(email);
    let letters: String = local_part.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        "Customer".to_string()
    } else {
        let mut chars = letters.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => letters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_first_name_from_local_part() {
        assert_eq!(first_name_from_email("jane.doe123@example.com"), "Janedoe");
        assert_eq!(first_name_from_email("a1@example.com"), "A");
        assert_eq!(first_name_from_email("1234@example.com"), "Customer");
    }
}
