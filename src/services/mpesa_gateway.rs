// services/mpesa_gateway.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{header, Client, StatusCode};
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::models::payment::{
    AuthResponse, CallbackMetadata, ProviderResult, StkPushRequest, StkPushResponse,
    StkQueryRequest, StkQueryResponse,
};

/// Tokens are refreshed this many seconds before the provider-declared
/// lifetime runs out.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 600;

/// Daraja errorCode for "the transaction is being processed": the attempt has
/// no result yet and must not be transitioned.
const ERROR_CODE_PROCESSING: &str = "500.001.1001";

/// Outcome of a push initiation. Ordinary provider rejection is a value, not
/// an error; `Err` is reserved for transport faults and malformed responses.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    Accepted(StkPushResponse),
    Rejected {
        description: String,
        payload: serde_json::Value,
    },
}

/// Outcome of a status query.
#[derive(Debug, Clone)]
pub enum StatusQueryOutcome {
    Resolved(ProviderResult),
    /// The provider has no result yet; the attempt stays as-is.
    StillProcessing,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate_push(
        &self,
        phone_number: &str,
        amount: Decimal,
        account_reference: &str,
        transaction_desc: &str,
    ) -> Result<PushOutcome>;

    async fn query_status(&self, checkout_ref: &str) -> Result<StatusQueryOutcome>;
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

pub struct MpesaGateway {
    config: AppConfig,
    client: Client,
    // Async mutex held across the refresh round trip: concurrent callers on a
    // cache miss share a single in-flight acquisition.
    cached_token: Mutex<Option<CachedToken>>,
}

impl MpesaGateway {
    pub fn new(config: AppConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(MpesaGateway {
            config,
            client,
            cached_token: Mutex::new(None),
        })
    }

    pub async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached_token.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        info!("requesting new M-Pesa access token");
        let (auth_url, _, _) = self.config.get_mpesa_urls();

        let response = self
            .client
            .get(&auth_url)
            .basic_auth(
                &self.config.mpesa_consumer_key,
                Some(&self.config.mpesa_consumer_secret),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("M-Pesa auth failed: {} - {}", status, body);
            return Err(AppError::provider(format!("M-Pesa auth failed: {}", status)));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| AppError::provider(format!("malformed auth response: {}", e)))?;

        let lifetime = token_lifetime_secs(&auth.expires_in);
        *cached = Some(CachedToken {
            value: auth.access_token.clone(),
            expires_at: Utc::now() + ChronoDuration::seconds(lifetime),
        });

        info!("access token obtained, usable for {}s", lifetime);
        Ok(auth.access_token)
    }

    async fn invalidate_token(&self) {
        *self.cached_token.lock().await = None;
    }

    /// POSTs with a bearer token; a 401 triggers exactly one token
    /// re-acquisition and retry.
    async fn post_authorized<T: Serialize>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("provider rejected credentials, re-acquiring token once");
        self.invalidate_token().await;
        let token = self.access_token().await?;
        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;
        Ok(response)
    }

    fn stk_credentials(&self) -> (String, String) {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = stk_password(
            &self.config.mpesa_short_code,
            &self.config.mpesa_passkey,
            &timestamp,
        );
        (timestamp, password)
    }
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    async fn initiate_push(
        &self,
        phone_number: &str,
        amount: Decimal,
        account_reference: &str,
        transaction_desc: &str,
    ) -> Result<PushOutcome> {
        if amount <= Decimal::ZERO {
            return Err(AppError::Validation(
                "amount must be greater than 0".to_string(),
            ));
        }

        let formatted_phone =
            normalize_phone(&self.config.phone_country_prefix, phone_number);
        info!("STK push for {} - {}", formatted_phone, amount);

        let (timestamp, password) = self.stk_credentials();
        let (_, stk_url, _) = self.config.get_mpesa_urls();

        let request = StkPushRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: amount.normalize().to_string(),
            party_a: formatted_phone.clone(),
            party_b: self.config.mpesa_short_code.clone(),
            phone_number: formatted_phone,
            callback_url: self.config.mpesa_callback_url.clone(),
            account_reference: account_reference.to_string(),
            transaction_desc: transaction_desc.to_string(),
        };

        let response = self.post_authorized(&stk_url, &request).await?;
        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::provider(format!("malformed push response: {}", e)))?;

        if !status.is_success() {
            warn!("STK push rejected: {} - {}", status, payload);
            let description = payload
                .get("errorMessage")
                .and_then(|v| v.as_str())
                .unwrap_or("push rejected by provider")
                .to_string();
            return Ok(PushOutcome::Rejected {
                description,
                payload,
            });
        }

        let parsed: StkPushResponse = serde_json::from_value(payload.clone())
            .map_err(|e| AppError::provider(format!("malformed push response: {}", e)))?;

        if parsed.response_code != "0" {
            warn!(
                "STK push not accepted: {} - {}",
                parsed.response_code, parsed.response_description
            );
            return Ok(PushOutcome::Rejected {
                description: parsed.response_description,
                payload,
            });
        }

        info!("STK push accepted: {}", parsed.checkout_request_id);
        Ok(PushOutcome::Accepted(parsed))
    }

    async fn query_status(&self, checkout_ref: &str) -> Result<StatusQueryOutcome> {
        let (timestamp, password) = self.stk_credentials();
        let (_, _, query_url) = self.config.get_mpesa_urls();

        let request = StkQueryRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            checkout_request_id: checkout_ref.to_string(),
        };

        let response = self.post_authorized(&query_url, &request).await?;
        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::provider(format!("malformed query response: {}", e)))?;

        if !status.is_success() {
            let error_code = payload.get("errorCode").and_then(|v| v.as_str());
            if error_code == Some(ERROR_CODE_PROCESSING) {
                return Ok(StatusQueryOutcome::StillProcessing);
            }
            error!("status query failed: {} - {}", status, payload);
            return Err(AppError::provider_with_detail(
                format!("status query failed: {}", status),
                payload,
            ));
        }

        let parsed: StkQueryResponse = serde_json::from_value(payload.clone())
            .map_err(|e| AppError::provider(format!("malformed query response: {}", e)))?;

        let result_code = parsed.result_code.parse::<i64>().map_err(|_| {
            AppError::provider(format!("non-numeric result code: {}", parsed.result_code))
        })?;

        Ok(StatusQueryOutcome::Resolved(ProviderResult {
            checkout_request_id: parsed.checkout_request_id,
            result_code,
            result_desc: parsed.result_desc,
            metadata: CallbackMetadata::default(),
            raw: payload,
        }))
    }
}

/// Canonical international format: digits only, leading `0` swapped for the
/// country prefix, already-prefixed numbers pass through.
pub fn normalize_phone(country_prefix: &str, phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Some(rest) = digits.strip_prefix('0') {
        return format!("{}{}", country_prefix, rest);
    }
    digits
}

pub fn stk_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    base64.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

fn token_lifetime_secs(expires_in: &str) -> i64 {
    let declared = expires_in.parse::<i64>().unwrap_or(3599);
    (declared - TOKEN_EXPIRY_MARGIN_SECS).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_with_leading_zero_gets_country_prefix() {
        assert_eq!(normalize_phone("254", "0712345678"), "254712345678");
    }

    #[test]
    fn phone_with_plus_is_stripped() {
        assert_eq!(normalize_phone("254", "+254712345678"), "254712345678");
    }

    #[test]
    fn prefixed_phone_passes_through() {
        assert_eq!(normalize_phone("254", "254712345678"), "254712345678");
    }

    #[test]
    fn phone_non_digits_are_dropped() {
        assert_eq!(normalize_phone("254", "0712 345-678"), "254712345678");
    }

    #[test]
    fn password_is_base64_of_shortcode_passkey_timestamp() {
        let password = stk_password("174379", "passkey", "20240817154520");
        let decoded = base64.decode(password).unwrap();
        assert_eq!(decoded, b"174379passkey20240817154520");
    }

    #[test]
    fn token_lifetime_applies_safety_margin() {
        assert_eq!(token_lifetime_secs("3599"), 2999);
        assert_eq!(token_lifetime_secs("400"), 0);
        // Unparseable lifetime falls back to the provider default.
        assert_eq!(token_lifetime_secs("soon"), 2999);
    }

    #[tokio::test]
    async fn cached_token_is_reused_until_expiry() {
        let gateway = MpesaGateway::new(AppConfig::for_tests()).unwrap();
        {
            let mut cached = gateway.cached_token.lock().await;
            *cached = Some(CachedToken {
                value: "tok-1".to_string(),
                expires_at: Utc::now() + ChronoDuration::seconds(60),
            });
        }
        // Fresh cache entry: no network call is made.
        assert_eq!(gateway.access_token().await.unwrap(), "tok-1");
    }
}
