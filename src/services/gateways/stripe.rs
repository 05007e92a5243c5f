use super::{
    classify_status, transport_error, GatewayCallback, GatewayProvider, GatewaySession,
    PaymentGateway, SessionRequest, Verification, VerifiedPayment,
};
use crate::{config::StripeConfig, errors::ServiceError, signing};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Header carrying `t=<unix>,v1=<hex hmac>` on webhook deliveries.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

const CONFIRMING_EVENTS: [&str; 2] = [
    "checkout.session.completed",
    "checkout.session.async_payment_succeeded",
];

/// Builds a signature header the way the gateway does. Used by the admin
/// tooling and tests to produce deliverable payloads.
pub fn signature_header(secret: &str, payload: &[u8], timestamp: i64) -> Result<String, ServiceError> {
    let signature = signing::sign_hex(secret.as_bytes(), &signed_payload(timestamp, payload))?;
    Ok(format!("t={},v1={}", timestamp, signature))
}

/// Verifies a signature header against the raw payload. Any `v1` entry may
/// match; the timestamp must be within `tolerance_secs` of `now`.
pub fn verify_signature(
    header: &str,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        ServiceError::InvalidWebhookSignature("signature header has no timestamp".to_string())
    })?;
    if signatures.is_empty() {
        return Err(ServiceError::InvalidWebhookSignature(
            "signature header has no v1 signature".to_string(),
        ));
    }

    if now.abs_diff(timestamp) > tolerance_secs {
        return Err(ServiceError::InvalidWebhookSignature(format!(
            "timestamp {} outside tolerance",
            timestamp
        )));
    }

    let signed = signed_payload(timestamp, payload);
    if signatures
        .iter()
        .any(|sig| signing::verify_hex(secret.as_bytes(), &signed, sig))
    {
        Ok(())
    } else {
        Err(ServiceError::InvalidWebhookSignature(
            "no signature matches the payload".to_string(),
        ))
    }
}

fn signed_payload(timestamp: i64, payload: &[u8]) -> Vec<u8> {
    let prefix = format!("{}.", timestamp);
    let mut signed = Vec::with_capacity(prefix.len() + payload.len());
    signed.extend_from_slice(prefix.as_bytes());
    signed.extend_from_slice(payload);
    signed
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
struct WebhookEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    payment_status: Option<String>,
    /// Either an id or an expanded object
    #[serde(default)]
    payment_intent: Option<serde_json::Value>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

impl CheckoutSessionObject {
    fn order_reference(&self) -> Option<Uuid> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("order_id"))
            .or(self.client_reference_id.as_ref())
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    fn payment_intent_id(&self) -> Option<String> {
        match &self.payment_intent {
            Some(serde_json::Value::String(id)) => Some(id.clone()),
            Some(serde_json::Value::Object(obj)) => {
                obj.get("id").and_then(|v| v.as_str()).map(str::to_string)
            }
            _ => None,
        }
    }

    fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid") | Some("no_payment_required")
        )
    }
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
    url: Option<String>,
}

/// Hosted-checkout gateway. The customer is redirected away and the outcome
/// arrives later as a signed webhook.
pub struct StripeGateway {
    config: StripeConfig,
    client: reqwest::Client,
}

impl StripeGateway {
    pub fn new(config: StripeConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn parse_event(&self, payload: &[u8]) -> Result<Verification, ServiceError> {
        let event: WebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::BadRequest(format!("malformed webhook event: {}", e)))?;

        if !CONFIRMING_EVENTS.contains(&event.event_type.as_str()) {
            return Ok(Verification::Ignored {
                event_type: event.event_type,
            });
        }

        let session: CheckoutSessionObject = serde_json::from_value(event.data.object)
            .map_err(|e| ServiceError::BadRequest(format!("malformed checkout session: {}", e)))?;

        // Completed but still settling; the async success event follows
        if !session.is_paid() {
            info!(session_id = %session.id, "checkout session completed without payment yet");
            return Ok(Verification::Ignored {
                event_type: event.event_type,
            });
        }

        Ok(Verification::Payment(VerifiedPayment {
            provider: GatewayProvider::Stripe,
            order_id: session.order_reference(),
            payment_id: session.payment_intent_id(),
            amount_minor: session.amount_total,
            currency: session.currency.as_ref().map(|c| c.to_uppercase()),
            session_id: session.id,
        }))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> GatewayProvider {
        GatewayProvider::Stripe
    }

    fn places_order(&self) -> bool {
        true
    }

    #[instrument(skip(self), fields(order_id = %request.order_id))]
    async fn create_session(&self, request: &SessionRequest) -> Result<GatewaySession, ServiceError> {
        let secret_key = self.config.secret_key.as_deref().ok_or_else(|| {
            ServiceError::GatewayUnavailable("stripe secret key is not configured".to_string())
        })?;

        let order_id = request.order_id.to_string();
        let form: Vec<(&str, String)> = vec![
            ("mode", "payment".to_string()),
            ("success_url", self.config.success_url.clone()),
            ("cancel_url", self.config.cancel_url.clone()),
            ("client_reference_id", order_id.clone()),
            ("metadata[order_id]", order_id.clone()),
            ("payment_intent_data[metadata][order_id]", order_id),
            ("line_items[0][quantity]", "1".to_string()),
            (
                "line_items[0][price_data][currency]",
                request.currency.to_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]",
                request.amount_minor.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]",
                request.description.clone(),
            ),
        ];

        let url = format!(
            "{}/v1/checkout/sessions",
            self.config.api_base.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(secret_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error(GatewayProvider::Stripe, e))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "stripe session creation failed");
            return Err(classify_status(GatewayProvider::Stripe, status));
        }

        let created: CreatedSession = response
            .json()
            .await
            .map_err(|e| transport_error(GatewayProvider::Stripe, e))?;

        Ok(GatewaySession {
            provider: GatewayProvider::Stripe,
            session_id: created.id,
            redirect_url: created.url,
            public_key: None,
            amount_minor: request.amount_minor,
            currency: request.currency.clone(),
        })
    }

    fn verify(&self, callback: GatewayCallback<'_>) -> Result<Verification, ServiceError> {
        let GatewayCallback::Webhook {
            signature_header,
            payload,
        } = callback
        else {
            return Err(ServiceError::BadRequest(
                "stripe payments are confirmed by webhook only".to_string(),
            ));
        };

        let secret = self
            .config
            .webhook_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::InvalidWebhookSignature("no webhook secret configured".to_string())
            })?;
        let header = signature_header.ok_or_else(|| {
            ServiceError::InvalidWebhookSignature("missing signature header".to_string())
        })?;

        verify_signature(
            header,
            payload,
            secret,
            self.config.webhook_tolerance_secs,
            Utc::now().timestamp(),
        )?;

        self.parse_event(payload)
    }
}
