// services/balance.rs
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::models::invoice::InvoiceStatus;
use crate::store::{InvoiceStore, PaymentLedger};

/// Re-evaluates an invoice against its completed payment attempts. The
/// invoice becomes `paid` exactly when the completed sum covers the total;
/// a `paid` invoice is never reverted. Safe to call redundantly.
pub async fn recompute_invoice_status(
    ledger: &dyn PaymentLedger,
    invoices: &dyn InvoiceStore,
    invoice_id: Uuid,
) -> Result<InvoiceStatus> {
    let invoice = invoices
        .find_invoice(invoice_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("invoice {}", invoice_id)))?;

    if invoice.status == InvoiceStatus::Paid {
        return Ok(InvoiceStatus::Paid);
    }

    let completed = ledger.list_completed_for_invoice(invoice_id).await?;
    let paid_total: Decimal = completed.iter().map(|a| a.amount).sum();

    if paid_total >= invoice.amount {
        invoices
            .update_invoice_status(invoice_id, InvoiceStatus::Paid)
            .await?;
        info!(
            "invoice {} fully paid ({} of {})",
            invoice_id, paid_total, invoice.amount
        );
        return Ok(InvoiceStatus::Paid);
    }

    Ok(invoice.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::invoice::Invoice;
    use crate::models::payment::{PaymentAttempt, PaymentState, TerminalUpdate};
    use crate::store::memory::MemoryStore;

    async fn completed_attempt(store: &MemoryStore, invoice_id: Uuid, amount: Decimal) {
        let attempt = store
            .create_attempt(PaymentAttempt::new(
                invoice_id,
                "user-1",
                amount,
                "254712345678",
            ))
            .await
            .unwrap();
        store
            .apply_terminal(
                attempt.id,
                TerminalUpdate {
                    state: PaymentState::Completed,
                    result_code: Some(0),
                    result_desc: Some("ok".to_string()),
                    receipt_number: Some("QWE123".to_string()),
                    confirmed_amount: Some(amount),
                    confirmed_phone: None,
                    transaction_time: None,
                    raw_callback: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn partial_payment_leaves_status_unchanged() {
        let store = MemoryStore::new();
        let invoice = store
            .insert_invoice(Invoice::new("user-1", Decimal::from(500)))
            .await;
        completed_attempt(&store, invoice.id, Decimal::from(200)).await;

        let status = recompute_invoice_status(&store, &store, invoice.id)
            .await
            .unwrap();
        assert_eq!(status, InvoiceStatus::Sent);
    }

    #[tokio::test]
    async fn covering_sum_marks_invoice_paid() {
        let store = MemoryStore::new();
        let invoice = store
            .insert_invoice(Invoice::new("user-1", Decimal::from(500)))
            .await;
        completed_attempt(&store, invoice.id, Decimal::from(200)).await;
        completed_attempt(&store, invoice.id, Decimal::from(300)).await;

        let status = recompute_invoice_status(&store, &store, invoice.id)
            .await
            .unwrap();
        assert_eq!(status, InvoiceStatus::Paid);

        // Redundant recomputation is a no-op.
        let status = recompute_invoice_status(&store, &store, invoice.id)
            .await
            .unwrap();
        assert_eq!(status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn overpayment_still_marks_paid() {
        let store = MemoryStore::new();
        let invoice = store
            .insert_invoice(Invoice::new("user-1", Decimal::from(500)))
            .await;
        completed_attempt(&store, invoice.id, Decimal::from(400)).await;
        completed_attempt(&store, invoice.id, Decimal::from(400)).await;

        let status = recompute_invoice_status(&store, &store, invoice.id)
            .await
            .unwrap();
        assert_eq!(status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn paid_invoice_is_never_reverted() {
        let store = MemoryStore::new();
        let invoice = store
            .insert_invoice(Invoice::new("user-1", Decimal::from(500)))
            .await;
        store
            .update_invoice_status(invoice.id, InvoiceStatus::Paid)
            .await
            .unwrap();

        // No completed attempts at all, yet paid stays paid.
        let status = recompute_invoice_status(&store, &store, invoice.id)
            .await
            .unwrap();
        assert_eq!(status, InvoiceStatus::Paid);
    }
}
