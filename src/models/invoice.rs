use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub owner_id: String,
    /// Public-facing identifier used for unauthenticated share links,
    /// distinct from the internal id.
    pub share_id: Uuid,
    pub amount: Decimal,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn new(owner_id: &str, amount: Decimal) -> Self {
        let now = Utc::now();
        Invoice {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            share_id: Uuid::new_v4(),
            amount: amount.round_dp(2),
            status: InvoiceStatus::Sent,
            created_at: now,
            updated_at: now,
        }
    }
}
