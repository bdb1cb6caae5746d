// services/reconciliation.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::{AppError, Result};
use crate::models::payment::{
    PaymentAttempt, PaymentState, ProviderResult, TerminalUpdate, RESULT_CODE_CANCELLED,
    RESULT_CODE_SUCCESS,
};
use crate::services::balance::recompute_invoice_status;
use crate::store::{InvoiceStore, PaymentLedger};

#[derive(Debug)]
pub enum ReconcileOutcome {
    /// A terminal transition was applied.
    Applied(PaymentAttempt),
    /// The attempt was already terminal; the incoming result was verified and
    /// dropped without side effects.
    Duplicate(PaymentAttempt),
    /// Transient provider code: the attempt stays pending.
    StillPending(PaymentAttempt),
}

impl ReconcileOutcome {
    pub fn attempt(&self) -> &PaymentAttempt {
        match self {
            ReconcileOutcome::Applied(a)
            | ReconcileOutcome::Duplicate(a)
            | ReconcileOutcome::StillPending(a) => a,
        }
    }
}

/// The single transition function both ingress paths converge on. A callback
/// and a concurrent poll for the same attempt serialize on a per-checkout-
/// reference lock, so exactly one terminal transition wins.
pub struct ReconciliationEngine {
    ledger: Arc<dyn PaymentLedger>,
    invoices: Arc<dyn InvoiceStore>,
    attempt_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReconciliationEngine {
    pub fn new(ledger: Arc<dyn PaymentLedger>, invoices: Arc<dyn InvoiceStore>) -> Self {
        ReconciliationEngine {
            ledger,
            invoices,
            attempt_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn attempt_lock(&self, checkout_ref: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .attempt_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(checkout_ref.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, checkout_ref: &str) {
        let mut locks = self
            .attempt_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(checkout_ref);
    }

    pub async fn apply(&self, result: &ProviderResult) -> Result<ReconcileOutcome> {
        let lock = self.attempt_lock(&result.checkout_request_id);
        let guard = lock.lock().await;

        let outcome = self.apply_locked(result).await;
        drop(guard);

        // Unmatched references and settled attempts take no further
        // transitions; their entries are evicted so the callback ingress
        // cannot grow the map without bound. A waiter that raced the
        // eviction lands in the duplicate branch or on the ledger's
        // terminal-state guard, so a re-created entry stays harmless.
        match &outcome {
            Ok(ReconcileOutcome::Applied(_))
            | Ok(ReconcileOutcome::Duplicate(_))
            | Err(AppError::NotFound(_)) => {
                self.release_lock(&result.checkout_request_id);
            }
            _ => {}
        }

        outcome
    }

    async fn apply_locked(&self, result: &ProviderResult) -> Result<ReconcileOutcome> {
        let attempt = self
            .ledger
            .find_by_checkout_ref(&result.checkout_request_id)
            .await?
            .ok_or_else(|| {
                AppError::not_found(format!(
                    "no payment attempt for checkout reference {}",
                    result.checkout_request_id
                ))
            })?;

        if attempt.state.is_terminal() {
            if attempt.result_code != Some(result.result_code) {
                warn!(
                    "duplicate result for {} disagrees with stored outcome: stored {:?}, incoming {}",
                    result.checkout_request_id, attempt.result_code, result.result_code
                );
            }
            return Ok(ReconcileOutcome::Duplicate(attempt));
        }

        match result.result_code {
            RESULT_CODE_SUCCESS => {
                let update = TerminalUpdate {
                    state: PaymentState::Completed,
                    result_code: Some(result.result_code),
                    result_desc: Some(result.result_desc.clone()),
                    receipt_number: Some(result.metadata.receipt_number()),
                    confirmed_amount: Some(result.metadata.amount()),
                    confirmed_phone: Some(result.metadata.phone_number()),
                    transaction_time: Some(result.metadata.transaction_date()),
                    raw_callback: Some(result.raw.clone()),
                };
                let updated = self.ledger.apply_terminal(attempt.id, update).await?;
                info!(
                    "payment {} completed, receipt {:?}",
                    result.checkout_request_id, updated.receipt_number
                );

                recompute_invoice_status(
                    self.ledger.as_ref(),
                    self.invoices.as_ref(),
                    updated.invoice_id,
                )
                .await?;
                Ok(ReconcileOutcome::Applied(updated))
            }
            RESULT_CODE_CANCELLED => {
                info!(
                    "payment {} still pending at provider: {}",
                    result.checkout_request_id, result.result_desc
                );
                Ok(ReconcileOutcome::StillPending(attempt))
            }
            code => {
                let mut update =
                    TerminalUpdate::failed(Some(code), result.result_desc.clone());
                update.raw_callback = Some(result.raw.clone());
                let updated = self.ledger.apply_terminal(attempt.id, update).await?;
                info!(
                    "payment {} failed: {} - {}",
                    result.checkout_request_id, code, result.result_desc
                );
                Ok(ReconcileOutcome::Applied(updated))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::invoice::{Invoice, InvoiceStatus};
    use crate::models::payment::{CallbackMetadata, MetadataItem};
    use crate::store::memory::MemoryStore;
    use rust_decimal::Decimal;
    use serde_json::json;

    struct Fixture {
        store: MemoryStore,
        engine: ReconciliationEngine,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let engine = ReconciliationEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        );
        Fixture { store, engine }
    }

    async fn pending_attempt(store: &MemoryStore, amount: i64, checkout_ref: &str) -> (Invoice, PaymentAttempt) {
        let invoice = store
            .insert_invoice(Invoice::new("user-1", Decimal::from(amount)))
            .await;
        let attempt = store
            .create_attempt(PaymentAttempt::new(
                invoice.id,
                "user-1",
                Decimal::from(amount),
                "254712345678",
            ))
            .await
            .unwrap();
        let attempt = store
            .assign_references(attempt.id, checkout_ref, "m_1")
            .await
            .unwrap();
        (invoice, attempt)
    }

    fn success_result(checkout_ref: &str, amount: i64, receipt: &str) -> ProviderResult {
        let raw = json!({
            "Body": {
                "stkCallback": {
                    "CheckoutRequestID": checkout_ref,
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            { "Name": "Amount", "Value": amount },
                            { "Name": "MpesaReceiptNumber", "Value": receipt },
                            { "Name": "PhoneNumber", "Value": 254712345678u64 },
                            { "Name": "TransactionDate", "Value": 20240817154520u64 },
                        ]
                    }
                }
            }
        });
        ProviderResult {
            checkout_request_id: checkout_ref.to_string(),
            result_code: 0,
            result_desc: "The service request is processed successfully.".to_string(),
            metadata: CallbackMetadata {
                items: vec![
                    MetadataItem { name: "Amount".to_string(), value: json!(amount) },
                    MetadataItem { name: "MpesaReceiptNumber".to_string(), value: json!(receipt) },
                    MetadataItem { name: "PhoneNumber".to_string(), value: json!(254712345678u64) },
                    MetadataItem { name: "TransactionDate".to_string(), value: json!(20240817154520u64) },
                ],
            },
            raw,
        }
    }

    fn code_result(checkout_ref: &str, code: i64, desc: &str) -> ProviderResult {
        ProviderResult {
            checkout_request_id: checkout_ref.to_string(),
            result_code: code,
            result_desc: desc.to_string(),
            metadata: CallbackMetadata::default(),
            raw: json!({ "ResultCode": code, "ResultDesc": desc }),
        }
    }

    #[tokio::test]
    async fn successful_result_completes_attempt_and_pays_invoice() {
        let f = fixture();
        let (invoice, _) = pending_attempt(&f.store, 500, "ws_1").await;

        let outcome = f.engine.apply(&success_result("ws_1", 500, "QWE123")).await.unwrap();
        let attempt = match outcome {
            ReconcileOutcome::Applied(a) => a,
            other => panic!("expected Applied, got {:?}", other),
        };

        assert_eq!(attempt.state, PaymentState::Completed);
        assert_eq!(attempt.receipt_number.as_deref(), Some("QWE123"));
        assert_eq!(attempt.confirmed_amount, Some(Decimal::from(500)));
        assert_eq!(attempt.confirmed_phone.as_deref(), Some("254712345678"));
        assert!(attempt.raw_callback.is_some());

        let invoice = f.store.find_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn duplicate_success_is_a_no_op() {
        let f = fixture();
        let (invoice, _) = pending_attempt(&f.store, 500, "ws_1").await;
        let result = success_result("ws_1", 500, "QWE123");

        let first = f.engine.apply(&result).await.unwrap();
        let after_first = first.attempt().clone();

        let second = f.engine.apply(&result).await.unwrap();
        assert!(matches!(second, ReconcileOutcome::Duplicate(_)));

        let stored = f.store.find_by_checkout_ref("ws_1").await.unwrap().unwrap();
        assert_eq!(stored.state, after_first.state);
        assert_eq!(stored.receipt_number, after_first.receipt_number);
        assert_eq!(stored.updated_at, after_first.updated_at);

        let invoice = f.store.find_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn disagreeing_duplicate_is_logged_not_applied() {
        let f = fixture();
        pending_attempt(&f.store, 500, "ws_1").await;

        f.engine.apply(&success_result("ws_1", 500, "QWE123")).await.unwrap();
        let outcome = f.engine.apply(&code_result("ws_1", 1, "failed")).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Duplicate(_)));

        let stored = f.store.find_by_checkout_ref("ws_1").await.unwrap().unwrap();
        assert_eq!(stored.state, PaymentState::Completed);
        assert_eq!(stored.result_code, Some(0));
    }

    #[tokio::test]
    async fn cancelled_code_keeps_attempt_pending_then_failure_lands() {
        let f = fixture();
        let (invoice, _) = pending_attempt(&f.store, 500, "ws_1").await;

        let outcome = f
            .engine
            .apply(&code_result("ws_1", 1032, "Request cancelled by user"))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::StillPending(_)));

        let stored = f.store.find_by_checkout_ref("ws_1").await.unwrap().unwrap();
        assert_eq!(stored.state, PaymentState::Pending);

        // The attempt stays a candidate for a later result.
        let outcome = f
            .engine
            .apply(&code_result("ws_1", 1, "The balance is insufficient"))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Applied(_)));

        let stored = f.store.find_by_checkout_ref("ws_1").await.unwrap().unwrap();
        assert_eq!(stored.state, PaymentState::Failed);
        assert_eq!(stored.result_code, Some(1));

        let invoice = f.store.find_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Sent);
    }

    #[tokio::test]
    async fn unknown_checkout_reference_is_not_fabricated() {
        let f = fixture();
        let err = f
            .engine
            .apply(&success_result("ws_missing", 500, "QWE123"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_results_apply_exactly_one_transition() {
        let f = fixture();
        pending_attempt(&f.store, 500, "ws_1").await;
        let result = success_result("ws_1", 500, "QWE123");

        let (a, b) = tokio::join!(f.engine.apply(&result), f.engine.apply(&result));
        let outcomes = [a.unwrap(), b.unwrap()];
        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, ReconcileOutcome::Applied(_)))
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|o| matches!(o, ReconcileOutcome::Duplicate(_)))
            .count();
        assert_eq!((applied, duplicates), (1, 1));
    }

    #[tokio::test]
    async fn invoices_reconcile_independently() {
        let f = fixture();
        let (invoice_a, _) = pending_attempt(&f.store, 500, "ws_a").await;
        let (invoice_b, _) = pending_attempt(&f.store, 700, "ws_b").await;

        let result_a = success_result("ws_a", 500, "RCP_A");
        let result_b = success_result("ws_b", 700, "RCP_B");
        let (a, b) = tokio::join!(f.engine.apply(&result_a), f.engine.apply(&result_b));
        assert!(matches!(a.unwrap(), ReconcileOutcome::Applied(_)));
        assert!(matches!(b.unwrap(), ReconcileOutcome::Applied(_)));

        let invoice_a = f.store.find_invoice(invoice_a.id).await.unwrap().unwrap();
        let invoice_b = f.store.find_invoice(invoice_b.id).await.unwrap().unwrap();
        assert_eq!(invoice_a.status, InvoiceStatus::Paid);
        assert_eq!(invoice_b.status, InvoiceStatus::Paid);
    }

    fn lock_entries(engine: &ReconciliationEngine) -> usize {
        engine.attempt_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn lock_map_evicts_unmatched_references() {
        let f = fixture();

        // Arbitrary references arrive at the callback ingress unauthenticated;
        // none of them may pin a lock entry.
        for i in 0..1000 {
            let bogus = code_result(&format!("ws_bogus_{}", i), 0, "ok");
            let err = f.engine.apply(&bogus).await.unwrap_err();
            assert!(matches!(err, AppError::NotFound(_)));
        }

        assert_eq!(lock_entries(&f.engine), 0);
    }

    #[tokio::test]
    async fn lock_map_evicts_settled_attempts_but_keeps_pending_ones() {
        let f = fixture();
        pending_attempt(&f.store, 500, "ws_1").await;

        // Transient code: the attempt is still a transition candidate, so the
        // lock entry stays.
        f.engine
            .apply(&code_result("ws_1", 1032, "Request cancelled by user"))
            .await
            .unwrap();
        assert_eq!(lock_entries(&f.engine), 1);

        // Terminal transition releases the entry.
        f.engine
            .apply(&success_result("ws_1", 500, "QWE123"))
            .await
            .unwrap();
        assert_eq!(lock_entries(&f.engine), 0);

        // A duplicate re-creates the entry transiently and evicts it again.
        f.engine
            .apply(&success_result("ws_1", 500, "QWE123"))
            .await
            .unwrap();
        assert_eq!(lock_entries(&f.engine), 0);
    }
}
