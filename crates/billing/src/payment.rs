//! Payment collaborator boundary
//!
//! The engine never charges cards itself. A finalized invoice is handed to
//! the payment collaborator as a [`PaymentRequest`]; the collaborator later
//! reports the outcome through a signed HTTP callback.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;
use vidbill_shared::TenantId;

use crate::config::PaymentGatewayConfig;
use crate::error::{BillingError, BillingResult};
use crate::invoice::{InvoiceStatus, TenantInvoice};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of a callback body
pub const SIGNATURE_HEADER: &str = "X-Payment-Signature";

/// Request to collect one invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub invoice_id: Uuid,
    pub tenant_id: TenantId,
    pub amount: Decimal,
    pub currency: String,
    /// Stable per invoice so retried requests never double charge
    pub idempotency_key: String,
    pub description: String,
}

impl PaymentRequest {
    pub fn for_invoice(invoice: &TenantInvoice) -> Self {
        Self {
            invoice_id: invoice.id,
            tenant_id: invoice.tenant_id,
            amount: invoice.total_amount,
            currency: invoice.currency.clone(),
            idempotency_key: format!("invoice-{}", invoice.id),
            description: format!(
                "Usage invoice {} for {} - {}",
                invoice.id,
                invoice.period().start_rfc3339(),
                invoice.period().end_rfc3339()
            ),
        }
    }
}

/// Acknowledgement from the collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    /// Collaborator's reference for the payment request
    pub reference: String,
}

/// Final result reported by the collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Paid,
    Failed,
}

impl PaymentOutcome {
    pub fn invoice_status(&self) -> InvoiceStatus {
        match self {
            PaymentOutcome::Paid => InvoiceStatus::Paid,
            PaymentOutcome::Failed => InvoiceStatus::Failed,
        }
    }
}

/// Body of the collaborator's status callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub invoice_id: Uuid,
    pub outcome: PaymentOutcome,
    #[serde(default)]
    pub payment_reference: Option<String>,
}

/// Hands finalized invoices to the payment collaborator
#[async_trait]
pub trait PaymentRequestDispatcher: Send + Sync {
    async fn request_payment(&self, request: &PaymentRequest) -> BillingResult<PaymentReceipt>;
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    id: String,
}

/// Dispatcher posting JSON payment requests to the collaborator over HTTP
pub struct HttpPaymentDispatcher {
    client: reqwest::Client,
    config: PaymentGatewayConfig,
}

impl HttpPaymentDispatcher {
    pub fn new(config: PaymentGatewayConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    async fn send_once(&self, request: &PaymentRequest) -> BillingResult<PaymentReceipt> {
        let url = format!("{}/payment-requests", self.config.gateway_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| BillingError::PaymentDispatch {
                message: format!("request to {} failed: {}", url, e),
                transient: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::PaymentDispatch {
                message: format!("gateway returned {}: {}", status, body),
                transient: status.is_server_error() || status.as_u16() == 429,
            });
        }

        let body: GatewayResponse =
            response
                .json()
                .await
                .map_err(|e| BillingError::PaymentDispatch {
                    message: format!("unreadable gateway response: {}", e),
                    transient: false,
                })?;

        Ok(PaymentReceipt { reference: body.id })
    }
}

#[async_trait]
impl PaymentRequestDispatcher for HttpPaymentDispatcher {
    async fn request_payment(&self, request: &PaymentRequest) -> BillingResult<PaymentReceipt> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(100)
            .max_delay(std::time::Duration::from_secs(5))
            .take(self.config.max_retries)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.send_once(request).await;

            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        invoice_id = %request.invoice_id,
                        error = %e,
                        "Transient payment dispatch error - will retry"
                    );
                    Err(result) // Return error to trigger retry
                }
                Err(e) => {
                    tracing::debug!(
                        invoice_id = %request.invoice_id,
                        error = %e,
                        "Permanent payment dispatch error - will not retry"
                    );
                    Ok(result) // Return error wrapped in Ok to stop retrying
                }
            }
        })
        .await
        .unwrap_or_else(|e| e) // Extract the inner result
    }
}

/// Hex HMAC-SHA256 of a callback body
pub fn sign_callback(secret: &str, body: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a callback signature in constant time
pub fn verify_callback_signature(secret: &str, body: &[u8], signature: &str) -> BillingResult<()> {
    let expected = hex::decode(signature.trim()).map_err(|_| BillingError::WebhookSignatureInvalid)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| BillingError::WebhookSignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"invoice_id":"00000000-0000-0000-0000-000000000000","outcome":"paid"}"#;
        let signature = sign_callback("whsec", body).unwrap();
        assert!(verify_callback_signature("whsec", body, &signature).is_ok());
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let signature = sign_callback("whsec", b"{\"outcome\":\"failed\"}").unwrap();
        assert!(matches!(
            verify_callback_signature("whsec", b"{\"outcome\":\"paid\"}", &signature),
            Err(BillingError::WebhookSignatureInvalid)
        ));
        assert!(matches!(
            verify_callback_signature("whsec", b"{}", "not-hex"),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_request_key_is_stable_per_invoice() {
        let now = time::OffsetDateTime::now_utc();
        let invoice = TenantInvoice {
            id: Uuid::new_v4(),
            tenant_id: TenantId::new(),
            plan_id: "pro".into(),
            period_start: datetime!(2026-02-01 00:00 UTC),
            period_end: datetime!(2026-03-01 00:00 UTC),
            base_amount: dec!(49),
            overage_amount: dec!(5),
            total_amount: dec!(54),
            currency: "EUR".into(),
            usage_breakdown: vec![],
            status: InvoiceStatus::Finalized,
            payment_reference: None,
            created_at: now,
            updated_at: now,
            finalized_at: Some(now),
        };

        let first = PaymentRequest::for_invoice(&invoice);
        let second = PaymentRequest::for_invoice(&invoice);
        assert_eq!(first.idempotency_key, second.idempotency_key);
        assert_eq!(first.amount, dec!(54));
        assert_eq!(first.currency, "EUR");
    }

    fn gateway_config(url: String) -> PaymentGatewayConfig {
        PaymentGatewayConfig {
            gateway_url: url,
            api_key: "key".into(),
            webhook_secret: "secret".into(),
            max_retries: 2,
            timeout: std::time::Duration::from_secs(2),
        }
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            invoice_id: Uuid::new_v4(),
            tenant_id: TenantId::new(),
            amount: dec!(54.00),
            currency: "USD".into(),
            idempotency_key: "invoice-test".into(),
            description: "Usage invoice".into(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_sends_idempotency_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payment-requests")
            .match_header("authorization", "Bearer key")
            .match_header("idempotency-key", "invoice-test")
            .with_status(201)
            .with_body(r#"{"id":"pr_42"}"#)
            .expect(1)
            .create_async()
            .await;

        let dispatcher = HttpPaymentDispatcher::new(gateway_config(server.url())).unwrap();
        let receipt = dispatcher.request_payment(&request()).await.unwrap();

        assert_eq!(receipt.reference, "pr_42");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payment-requests")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let dispatcher = HttpPaymentDispatcher::new(gateway_config(server.url())).unwrap();
        let result = dispatcher.request_payment(&request()).await;

        assert!(matches!(
            result,
            Err(BillingError::PaymentDispatch { transient: true, .. })
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payment-requests")
            .with_status(422)
            .with_body("currency not supported")
            .expect(1)
            .create_async()
            .await;

        let dispatcher = HttpPaymentDispatcher::new(gateway_config(server.url())).unwrap();
        let result = dispatcher.request_payment(&request()).await;

        assert!(matches!(
            result,
            Err(BillingError::PaymentDispatch { transient: false, .. })
        ));
        mock.assert_async().await;
    }

    #[test]
    fn test_callback_shape() {
        let callback: PaymentCallback = serde_json::from_str(
            r#"{"invoice_id":"5b0f6a4e-8d0c-4c57-9a0e-1c3f2a9b7d11","outcome":"failed"}"#,
        )
        .unwrap();
        assert_eq!(callback.outcome.invoice_status(), InvoiceStatus::Failed);
        assert!(callback.payment_reference.is_none());
    }
}
