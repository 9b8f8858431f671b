//! PayPal Orders v2 client.
//!
//! Implements [`PaymentProvider`] with client-credentials OAuth. The access
//! token is cached until shortly before PayPal says it expires.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{PosError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Refresh this long before the advertised expiry.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

/// Result of capturing an approved order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub order_id: String,
    /// Provider status; only `COMPLETED` means money moved.
    pub status: String,
    pub payer_email: Option<String>,
    pub payer_name: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
}

impl Capture {
    pub fn is_completed(&self) -> bool {
        self.status == "COMPLETED"
    }
}

/// External payment collaborator.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a provider order and return its id.
    async fn create_order(&self, amount: Decimal, currency: &str, description: &str) -> Result<String>;
    async fn capture(&self, order_id: &str) -> Result<Capture>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PayPalMode {
    Sandbox,
    Live,
}

impl PayPalMode {
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Sandbox => "https://api-m.sandbox.paypal.com",
            Self::Live => "https://api-m.paypal.com",
        }
    }
}

struct CachedToken {
    value: Zeroizing<String>,
    expires_at: Instant,
}

pub struct PayPalClient {
    http: Client,
    base_url: String,
    client_id: String,
    secret: Zeroizing<String>,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

fn friendly_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return "PayPal request timed out".to_string();
    }
    if err.is_connect() {
        return "Cannot reach PayPal".to_string();
    }
    format!("Network error talking to PayPal: {err}")
}

/// Prefer PayPal's own `message`/`details` over a bare status line.
fn status_error(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        let message = json.get("message").and_then(Value::as_str)?.to_string();
        let issue = json
            .pointer("/details/0/issue")
            .and_then(Value::as_str)
            .map(|i| format!(" ({i})"))
            .unwrap_or_default();
        Some(format!("{message}{issue}"))
    });
    match detail {
        Some(detail) => format!("PayPal HTTP {}: {detail}", status.as_u16()),
        None => format!("PayPal HTTP {}", status.as_u16()),
    }
}

/// Pull the fields we keep out of a capture response.
fn parse_capture(body: &Value) -> Result<Capture> {
    let order_id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| PosError::Payment("Capture response without order id".into()))?;
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");
    let payer_name = match (
        body.pointer("/payer/name/given_name").and_then(Value::as_str),
        body.pointer("/payer/name/surname").and_then(Value::as_str),
    ) {
        (Some(given), Some(surname)) => Some(format!("{given} {surname}")),
        (Some(given), None) => Some(given.to_string()),
        _ => None,
    };
    let amount_node = body.pointer("/purchase_units/0/payments/captures/0/amount");
    let amount = amount_node
        .and_then(|a| a.get("value"))
        .and_then(Value::as_str)
        .and_then(|v| Decimal::from_str(v).ok());
    let currency = amount_node
        .and_then(|a| a.get("currency_code"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Capture {
        order_id: order_id.to_string(),
        status: status.to_string(),
        payer_email: body
            .pointer("/payer/email_address")
            .and_then(Value::as_str)
            .map(str::to_string),
        payer_name,
        amount,
        currency,
    })
}

fn order_body(amount: Decimal, currency: &str, description: &str) -> Value {
    json!({
        "intent": "CAPTURE",
        "purchase_units": [{
            "description": description,
            "amount": {
                "currency_code": currency,
                "value": format!("{:.2}", amount.round_dp(2)),
            }
        }]
    })
}

impl PayPalClient {
    pub fn new(mode: PayPalMode, client_id: String, secret: Zeroizing<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PosError::Internal(format!("Failed to create HTTP client: {e}")))?;
        info!(?mode, "PayPal client configured");
        Ok(Self {
            http,
            base_url: mode.base_url().to_string(),
            client_id,
            secret,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<Zeroizing<String>> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        debug!("Requesting PayPal access token");
        let resp = self
            .http
            .post(format!("{}/v1/oauth2/token", self.base_url))
            .basic_auth(&self.client_id, Some(self.secret.as_str()))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| PosError::Payment(friendly_error(&e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PosError::Payment(status_error(status, &body)));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| PosError::Payment(format!("Invalid PayPal token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SLACK);
        let value = Zeroizing::new(token.access_token);
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let token = self.access_token().await?;
        let mut req = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token.as_str())
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| PosError::Payment(friendly_error(&e)))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(path, status = status.as_u16(), "PayPal request failed");
            return Err(PosError::Payment(status_error(status, &text)));
        }
        serde_json::from_str(&text)
            .map_err(|e| PosError::Payment(format!("Invalid JSON from PayPal: {e}")))
    }
}

#[async_trait]
impl PaymentProvider for PayPalClient {
    async fn create_order(&self, amount: Decimal, currency: &str, description: &str) -> Result<String> {
        let body = self
            .post("/v2/checkout/orders", Some(order_body(amount, currency, description)))
            .await?;
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| PosError::Payment("PayPal order response without id".into()))?;
        info!(paypal_order_id = %id, %amount, currency, "PayPal order created");
        Ok(id.to_string())
    }

    async fn capture(&self, order_id: &str) -> Result<Capture> {
        let body = self
            .post(&format!("/v2/checkout/orders/{order_id}/capture"), None)
            .await?;
        let capture = parse_capture(&body)?;
        info!(paypal_order_id = %order_id, status = %capture.status, "PayPal order captured");
        Ok(capture)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that approves or declines everything without a network.
    pub struct FakeProvider {
        pub capture_status: String,
        pub fail_capture: bool,
        pub created: AtomicUsize,
        pub captures: AtomicUsize,
        pub last_amount: std::sync::Mutex<Option<Decimal>>,
    }

    impl FakeProvider {
        pub fn completing() -> Self {
            Self::with_status("COMPLETED")
        }

        pub fn with_status(status: &str) -> Self {
            Self {
                capture_status: status.to_string(),
                fail_capture: false,
                created: AtomicUsize::new(0),
                captures: AtomicUsize::new(0),
                last_amount: std::sync::Mutex::new(None),
            }
        }

        pub fn unreachable() -> Self {
            Self {
                fail_capture: true,
                ..Self::completing()
            }
        }
    }

    #[async_trait]
    impl PaymentProvider for FakeProvider {
        async fn create_order(&self, amount: Decimal, _currency: &str, _description: &str) -> Result<String> {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            *self.last_amount.lock().unwrap() = Some(amount);
            Ok(format!("PAYPAL-{n}"))
        }

        async fn capture(&self, order_id: &str) -> Result<Capture> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            if self.fail_capture {
                return Err(PosError::Payment("PayPal request timed out".into()));
            }
            Ok(Capture {
                order_id: order_id.to_string(),
                status: self.capture_status.clone(),
                payer_email: Some("payer@example.com".into()),
                payer_name: Some("Pat Payer".into()),
                amount: *self.last_amount.lock().unwrap(),
                currency: Some("USD".into()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completed_capture() {
        let body = json!({
            "id": "5O190127TN364715T",
            "status": "COMPLETED",
            "payer": {
                "name": { "given_name": "John", "surname": "Doe" },
                "email_address": "customer@example.com"
            },
            "purchase_units": [{
                "payments": { "captures": [{
                    "status": "COMPLETED",
                    "amount": { "currency_code": "USD", "value": "30.00" }
                }]}
            }]
        });
        let capture = parse_capture(&body).unwrap();
        assert!(capture.is_completed());
        assert_eq!(capture.payer_name.as_deref(), Some("John Doe"));
        assert_eq!(capture.payer_email.as_deref(), Some("customer@example.com"));
        assert_eq!(capture.amount, Some(Decimal::new(3000, 2)));
        assert_eq!(capture.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn pending_capture_is_not_completed() {
        let capture = parse_capture(&json!({ "id": "X", "status": "PENDING" })).unwrap();
        assert!(!capture.is_completed());
        assert_eq!(capture.amount, None);
        assert!(parse_capture(&json!({ "status": "COMPLETED" })).is_err());
    }

    #[test]
    fn order_amount_has_two_decimals() {
        let body = order_body(Decimal::from(30), "USD", "3 x Noche Latina");
        assert_eq!(body["purchase_units"][0]["amount"]["value"], "30.00");
        assert_eq!(body["intent"], "CAPTURE");
    }

    #[test]
    fn error_detail_from_paypal_body() {
        let body = r#"{"name":"UNPROCESSABLE_ENTITY","message":"The requested action could not be performed.","details":[{"issue":"ORDER_NOT_APPROVED"}]}"#;
        let msg = status_error(StatusCode::UNPROCESSABLE_ENTITY, body);
        assert!(msg.contains("422"));
        assert!(msg.contains("ORDER_NOT_APPROVED"));
        assert_eq!(status_error(StatusCode::BAD_GATEWAY, "<html>"), "PayPal HTTP 502");
    }

    #[test]
    fn mode_urls() {
        assert!(PayPalMode::Sandbox.base_url().contains("sandbox"));
        assert_eq!(PayPalMode::Live.base_url(), "https://api-m.paypal.com");
    }
}
