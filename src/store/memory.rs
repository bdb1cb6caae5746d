use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::models::invoice::{Invoice, InvoiceStatus};
use crate::models::payment::{PaymentAttempt, PaymentState, TerminalUpdate};
use crate::store::{InvoiceStore, PaymentLedger};

#[derive(Default)]
struct Inner {
    attempts: HashMap<Uuid, PaymentAttempt>,
    by_checkout_ref: HashMap<String, Uuid>,
    invoices: HashMap<Uuid, Invoice>,
}

/// In-memory implementation of both stores behind a single lock, the
/// process-local equivalent of the shared database handle.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoice creation belongs to the invoicing collaborator; this exists so
    /// tests and local setups can seed records.
    pub async fn insert_invoice(&self, invoice: Invoice) -> Invoice {
        let mut inner = self.inner.write().await;
        inner.invoices.insert(invoice.id, invoice.clone());
        invoice
    }
}

#[async_trait]
impl PaymentLedger for MemoryStore {
    async fn create_attempt(&self, attempt: PaymentAttempt) -> Result<PaymentAttempt> {
        let mut inner = self.inner.write().await;
        if inner.attempts.contains_key(&attempt.id) {
            return Err(AppError::conflict(format!(
                "payment attempt {} already exists",
                attempt.id
            )));
        }
        inner.attempts.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    async fn find_attempt(&self, id: Uuid) -> Result<Option<PaymentAttempt>> {
        let inner = self.inner.read().await;
        Ok(inner.attempts.get(&id).cloned())
    }

    async fn find_by_checkout_ref(&self, checkout_ref: &str) -> Result<Option<PaymentAttempt>> {
        let inner = self.inner.read().await;
        let id = match inner.by_checkout_ref.get(checkout_ref) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(inner.attempts.get(&id).cloned())
    }

    async fn assign_references(
        &self,
        id: Uuid,
        checkout_ref: &str,
        merchant_ref: &str,
    ) -> Result<PaymentAttempt> {
        let mut inner = self.inner.write().await;

        if inner.by_checkout_ref.contains_key(checkout_ref) {
            return Err(AppError::conflict(format!(
                "checkout reference {} already recorded",
                checkout_ref
            )));
        }

        let attempt = inner
            .attempts
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found(format!("payment attempt {}", id)))?;

        if attempt.checkout_request_id.is_some() {
            return Err(AppError::conflict(format!(
                "payment attempt {} already has a checkout reference",
                id
            )));
        }

        attempt.checkout_request_id = Some(checkout_ref.to_string());
        attempt.merchant_request_id = Some(merchant_ref.to_string());
        attempt.updated_at = Utc::now();
        let snapshot = attempt.clone();

        inner.by_checkout_ref.insert(checkout_ref.to_string(), id);
        Ok(snapshot)
    }

    async fn apply_terminal(&self, id: Uuid, update: TerminalUpdate) -> Result<PaymentAttempt> {
        if !update.state.is_terminal() {
            return Err(AppError::internal("terminal update with non-terminal state"));
        }

        let mut inner = self.inner.write().await;
        let attempt = inner
            .attempts
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found(format!("payment attempt {}", id)))?;

        if attempt.state.is_terminal() {
            return Err(AppError::conflict(format!(
                "payment attempt {} is already {:?}",
                id, attempt.state
            )));
        }

        attempt.state = update.state;
        attempt.result_code = update.result_code;
        attempt.result_desc = update.result_desc;
        attempt.receipt_number = update.receipt_number;
        attempt.confirmed_amount = update.confirmed_amount;
        attempt.confirmed_phone = update.confirmed_phone;
        attempt.transaction_time = update.transaction_time;
        attempt.raw_callback = update.raw_callback;
        attempt.updated_at = Utc::now();

        Ok(attempt.clone())
    }

    async fn list_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<PaymentAttempt>> {
        let inner = self.inner.read().await;
        let mut attempts: Vec<PaymentAttempt> = inner
            .attempts
            .values()
            .filter(|a| a.invoice_id == invoice_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(attempts)
    }

    async fn list_completed_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<PaymentAttempt>> {
        let attempts = self.list_for_invoice(invoice_id).await?;
        Ok(attempts
            .into_iter()
            .filter(|a| a.state == PaymentState::Completed)
            .collect())
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn find_invoice(&self, id: Uuid) -> Result<Option<Invoice>> {
        let inner = self.inner.read().await;
        Ok(inner.invoices.get(&id).cloned())
    }

    async fn find_invoice_for_owner(&self, id: Uuid, owner_id: &str) -> Result<Option<Invoice>> {
        let inner = self.inner.read().await;
        Ok(inner
            .invoices
            .get(&id)
            .filter(|i| i.owner_id == owner_id)
            .cloned())
    }

    async fn update_invoice_status(&self, id: Uuid, status: InvoiceStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let invoice = inner
            .invoices
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found(format!("invoice {}", id)))?;
        invoice.status = status;
        invoice.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_invoice(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.attempts.values().any(|a| a.invoice_id == id) {
            return Err(AppError::conflict(format!(
                "invoice {} has payment attempts and cannot be deleted",
                id
            )));
        }
        inner
            .invoices
            .remove(&id)
            .ok_or_else(|| AppError::not_found(format!("invoice {}", id)))?;
        Ok(())
    }
}
