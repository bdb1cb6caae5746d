pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::Result;
use crate::models::invoice::{Invoice, InvoiceStatus};
use crate::models::payment::{PaymentAttempt, TerminalUpdate};

/// Authoritative record of payment attempts. Implementations enforce the
/// storage-boundary invariants: a checkout reference is unique and immutable
/// once set, terminal states are never overwritten, and amounts never change
/// after creation.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn create_attempt(&self, attempt: PaymentAttempt) -> Result<PaymentAttempt>;

    async fn find_attempt(&self, id: Uuid) -> Result<Option<PaymentAttempt>>;

    async fn find_by_checkout_ref(&self, checkout_ref: &str) -> Result<Option<PaymentAttempt>>;

    /// Records the provider-assigned references after a successful push
    /// initiation. Fails with `Conflict` if the checkout reference is already
    /// taken or the attempt already carries one.
    async fn assign_references(
        &self,
        id: Uuid,
        checkout_ref: &str,
        merchant_ref: &str,
    ) -> Result<PaymentAttempt>;

    /// Applies a terminal transition. Fails with `Conflict` if the attempt is
    /// already terminal.
    async fn apply_terminal(&self, id: Uuid, update: TerminalUpdate) -> Result<PaymentAttempt>;

    async fn list_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<PaymentAttempt>>;

    /// Completed attempts only, used for balance aggregation.
    async fn list_completed_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<PaymentAttempt>>;
}

/// Invoice records as seen by the payment core. Creation and the rest of the
/// invoice CRUD surface live with the invoicing collaborator.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn find_invoice(&self, id: Uuid) -> Result<Option<Invoice>>;

    async fn find_invoice_for_owner(&self, id: Uuid, owner_id: &str) -> Result<Option<Invoice>>;

    async fn update_invoice_status(&self, id: Uuid, status: InvoiceStatus) -> Result<()>;

    /// Fails with `Conflict` while the invoice has payment attempts.
    async fn delete_invoice(&self, id: Uuid) -> Result<()>;
}
