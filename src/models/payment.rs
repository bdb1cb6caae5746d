use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Provider result code for an accepted payment.
pub const RESULT_CODE_SUCCESS: i64 = 0;
/// Provider result code while the payer is still on the PIN prompt or has
/// cancelled it. Non-terminal: the attempt stays pending and a later
/// callback or poll may still resolve it.
pub const RESULT_CODE_CANCELLED: i64 = 1032;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Pending,
    Completed,
    Failed,
}

impl PaymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Completed | PaymentState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub requested_by: String,
    pub amount: Decimal,
    pub phone_number: String,
    pub state: PaymentState,
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub confirmed_amount: Option<Decimal>,
    pub confirmed_phone: Option<String>,
    pub transaction_time: Option<String>,
    pub raw_callback: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    pub fn new(invoice_id: Uuid, requested_by: &str, amount: Decimal, phone_number: &str) -> Self {
        let now = Utc::now();
        PaymentAttempt {
            id: Uuid::new_v4(),
            invoice_id,
            requested_by: requested_by.to_string(),
            amount: amount.round_dp(2),
            phone_number: phone_number.to_string(),
            state: PaymentState::Pending,
            merchant_request_id: None,
            checkout_request_id: None,
            result_code: None,
            result_desc: None,
            receipt_number: None,
            confirmed_amount: None,
            confirmed_phone: None,
            transaction_time: None,
            raw_callback: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal mutation applied by the reconciliation engine. The ledger rejects
/// it when the attempt is already terminal.
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub state: PaymentState,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub confirmed_amount: Option<Decimal>,
    pub confirmed_phone: Option<String>,
    pub transaction_time: Option<String>,
    pub raw_callback: Option<serde_json::Value>,
}

impl TerminalUpdate {
    pub fn failed(result_code: Option<i64>, result_desc: impl Into<String>) -> Self {
        TerminalUpdate {
            state: PaymentState::Failed,
            result_code,
            result_desc: Some(result_desc.into()),
            receipt_number: None,
            confirmed_amount: None,
            confirmed_phone: None,
            transaction_time: None,
            raw_callback: None,
        }
    }
}

// ===== Provider wire types (Daraja STK push) =====

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub expires_in: String,
}

#[derive(Debug, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: String,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: String,
    #[serde(rename = "CustomerMessage")]
    pub customer_message: String,
}

#[derive(Debug, Serialize)]
pub struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StkQueryResponse {
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: String,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

// ===== Asynchronous callback envelope =====

#[derive(Debug, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: serde_json::Value,
}

impl CallbackMetadata {
    /// Named-key lookup. The provider does not guarantee item presence or
    /// order, so every accessor tolerates absence.
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.items.iter().find(|i| i.name == name).map(|i| &i.value)
    }

    pub fn receipt_number(&self) -> String {
        self.get("MpesaReceiptNumber")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    pub fn amount(&self) -> Decimal {
        match self.get("Amount") {
            Some(serde_json::Value::Number(n)) => {
                Decimal::from_str(&n.to_string()).unwrap_or(Decimal::ZERO)
            }
            Some(serde_json::Value::String(s)) => {
                Decimal::from_str(s).unwrap_or(Decimal::ZERO)
            }
            _ => Decimal::ZERO,
        }
    }

    pub fn phone_number(&self) -> String {
        match self.get("PhoneNumber") {
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    pub fn transaction_date(&self) -> String {
        match self.get("TransactionDate") {
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }
}

/// One normalized provider outcome, whichever ingress produced it. The
/// callback path and the polling path both reduce to this before hitting the
/// reconciliation engine.
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub checkout_request_id: String,
    pub result_code: i64,
    pub result_desc: String,
    pub metadata: CallbackMetadata,
    /// Verbatim provider payload, retained for audit.
    pub raw: serde_json::Value,
}

impl ProviderResult {
    pub fn from_callback(callback: StkCallback, raw: serde_json::Value) -> Self {
        ProviderResult {
            checkout_request_id: callback.checkout_request_id,
            result_code: callback.result_code,
            result_desc: callback.result_desc,
            metadata: callback.callback_metadata.unwrap_or_default(),
            raw,
        }
    }
}

// ===== API request/response bodies =====

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub invoice_id: Uuid,
    pub phone_number: String,
}

#[derive(Debug, Serialize)]
pub struct InitiatePaymentResponse {
    pub attempt: PaymentAttempt,
    pub provider: StkPushResponse,
}
