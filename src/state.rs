use std::sync::Arc;

use crate::services::mpesa_gateway::PaymentGateway;
use crate::services::reconciliation::ReconciliationEngine;
use crate::store::{InvoiceStore, PaymentLedger};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn PaymentLedger>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub reconciler: Arc<ReconciliationEngine>,
    pub jwt_secret: String,
    pub phone_country_prefix: String,
}

impl AppState {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        invoices: Arc<dyn InvoiceStore>,
        gateway: Arc<dyn PaymentGateway>,
        jwt_secret: String,
        phone_country_prefix: String,
    ) -> Self {
        let reconciler = Arc::new(ReconciliationEngine::new(
            ledger.clone(),
            invoices.clone(),
        ));
        AppState {
            ledger,
            invoices,
            gateway,
            reconciler,
            jwt_secret,
            phone_country_prefix,
        }
    }
}
