// handlers/payment_handlers.rs
use axum::{
    extract::{Extension, Path, State},
    response::Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::models::invoice::InvoiceStatus;
use crate::models::payment::{
    InitiatePaymentRequest, InitiatePaymentResponse, PaymentAttempt, PaymentState,
    ProviderResult, StkCallbackEnvelope, TerminalUpdate,
};
use crate::models::user::Claims;
use crate::services::mpesa_gateway::{normalize_phone, PushOutcome, StatusQueryOutcome};
use crate::state::AppState;

// POST /payments/initiate
pub async fn initiate_payment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<Json<InitiatePaymentResponse>> {
    let phone = normalize_phone(&state.phone_country_prefix, &request.phone_number);
    if phone.len() < 9 || phone.len() > 15 {
        return Err(AppError::Validation(format!(
            "invalid phone number: {}",
            request.phone_number
        )));
    }

    let invoice = state
        .invoices
        .find_invoice_for_owner(request.invoice_id, &claims.sub)
        .await?
        .ok_or_else(|| AppError::not_found(format!("invoice {}", request.invoice_id)))?;

    if invoice.status == InvoiceStatus::Paid {
        return Err(AppError::conflict(format!(
            "invoice {} is already paid",
            invoice.id
        )));
    }

    let completed = state.ledger.list_completed_for_invoice(invoice.id).await?;
    let settled: Decimal = completed.iter().map(|a| a.amount).sum();
    let outstanding = invoice.amount - settled;
    if outstanding <= Decimal::ZERO {
        return Err(AppError::conflict(format!(
            "invoice {} has no outstanding balance",
            invoice.id
        )));
    }

    let attempt = state
        .ledger
        .create_attempt(PaymentAttempt::new(
            invoice.id,
            &claims.sub,
            outstanding,
            &phone,
        ))
        .await?;

    // The provider caps the account reference at 12 characters.
    let share = invoice.share_id.simple().to_string();
    let account_reference = format!("INV{}", &share[..9]);

    match state
        .gateway
        .initiate_push(&phone, attempt.amount, &account_reference, "Invoice payment")
        .await
    {
        Ok(PushOutcome::Accepted(provider)) => {
            let attempt = state
                .ledger
                .assign_references(
                    attempt.id,
                    &provider.checkout_request_id,
                    &provider.merchant_request_id,
                )
                .await?;
            info!(
                "payment attempt {} initiated for invoice {} ({})",
                attempt.id, invoice.id, provider.checkout_request_id
            );
            Ok(Json(InitiatePaymentResponse { attempt, provider }))
        }
        Ok(PushOutcome::Rejected {
            description,
            payload,
        }) => {
            if let Err(e) = state
                .ledger
                .apply_terminal(attempt.id, TerminalUpdate::failed(None, description.clone()))
                .await
            {
                error!("failed to record rejected push on attempt {}: {}", attempt.id, e);
            }
            Err(AppError::provider_with_detail(description, payload))
        }
        // Transport fault or timeout: the attempt stays pending and is
        // eligible for a later poll once references exist, never failed here.
        Err(e) => Err(e),
    }
}

// GET /payments/status/:checkout_reference
pub async fn check_payment_status(
    State(state): State<AppState>,
    Path(checkout_reference): Path<String>,
) -> Result<Json<PaymentAttempt>> {
    let attempt = state
        .ledger
        .find_by_checkout_ref(&checkout_reference)
        .await?
        .ok_or_else(|| {
            AppError::not_found(format!("checkout reference {}", checkout_reference))
        })?;

    // Already settled: no provider round trip, no re-triggered side effects.
    if attempt.state == PaymentState::Completed {
        return Ok(Json(attempt));
    }

    match state.gateway.query_status(&checkout_reference).await? {
        StatusQueryOutcome::StillProcessing => Ok(Json(attempt)),
        StatusQueryOutcome::Resolved(result) => {
            let outcome = state.reconciler.apply(&result).await?;
            Ok(Json(outcome.attempt().clone()))
        }
    }
}

// POST /payments/callback — provider-facing, unauthenticated. Always acks
// with 200 so the provider never retries into a duplicate attempt.
pub async fn mpesa_callback(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let envelope: StkCallbackEnvelope = match serde_json::from_value(payload.clone()) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("malformed provider callback: {}", e);
            return Json(json!({ "ResultCode": 1, "ResultDesc": "Rejected" }));
        }
    };

    let result = ProviderResult::from_callback(envelope.body.stk_callback, payload);
    match state.reconciler.apply(&result).await {
        Ok(outcome) => {
            info!(
                "callback for {} reconciled, attempt state {:?}",
                result.checkout_request_id,
                outcome.attempt().state
            );
        }
        Err(e) => {
            error!(
                "callback reconciliation for {} failed: {}",
                result.checkout_request_id, e
            );
        }
    }

    Json(json!({ "ResultCode": 0, "ResultDesc": "Success" }))
}

// GET /payments/invoice/:invoice_id
pub async fn list_invoice_payments(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Vec<PaymentAttempt>>> {
    state
        .invoices
        .find_invoice_for_owner(invoice_id, &claims.sub)
        .await?
        .ok_or_else(|| AppError::not_found(format!("invoice {}", invoice_id)))?;

    let attempts = state.ledger.list_for_invoice(invoice_id).await?;
    Ok(Json(attempts))
}

// GET /payments/:id — owner-only via the parent invoice.
pub async fn get_payment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentAttempt>> {
    let attempt = state
        .ledger
        .find_attempt(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("payment attempt {}", id)))?;

    state
        .invoices
        .find_invoice_for_owner(attempt.invoice_id, &claims.sub)
        .await?
        .ok_or_else(|| AppError::not_found(format!("payment attempt {}", id)))?;

    Ok(Json(attempt))
}
