//! Payment gateway strategies.
//!
//! Both providers converge on the same order model: a gateway opens a
//! payable session for a local order, and later proves a payment happened
//! through a verified callback. The redirect gateway proves it with a signed
//! server push; the modal gateway with a signature the client relays.

pub mod razorpay;
pub mod stripe;

use crate::{config::AppConfig, errors::ServiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use utoipa::ToSchema;
use uuid::Uuid;

pub use razorpay::RazorpayGateway;
pub use stripe::StripeGateway;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum GatewayProvider {
    Stripe,
    Razorpay,
}

/// What a gateway needs to size a payable session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub order_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub description: String,
}

/// Handle returned to the client for the hand-off.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct GatewaySession {
    pub provider: GatewayProvider,
    /// Redirect session id, or the gateway's own order id for modal checkout
    pub session_id: String,
    /// Hosted page to send the customer to (redirect gateway only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    /// Public key for the in-page widget (modal gateway only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
}

/// Payment completion as reported by the browser after the modal closes.
#[derive(Debug, Clone, PartialEq, Deserialize, ToSchema)]
pub struct ClientConfirmation {
    pub order_id: Uuid,
    pub gateway_order_id: String,
    pub payment_id: String,
    pub signature: String,
}

/// Untrusted input a gateway authenticates.
#[derive(Debug, Clone, Copy)]
pub enum GatewayCallback<'a> {
    Webhook {
        signature_header: Option<&'a str>,
        payload: &'a [u8],
    },
    Client(&'a ClientConfirmation),
}

/// Facts extracted from an authenticated callback.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPayment {
    pub provider: GatewayProvider,
    /// Local order reference carried by the callback, if any
    pub order_id: Option<Uuid>,
    pub session_id: String,
    pub payment_id: Option<String>,
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Payment(VerifiedPayment),
    /// Authentic, but not a payment completion
    Ignored { event_type: String },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> GatewayProvider;

    /// Whether opening a session moves the order from `draft` to `placed`.
    fn places_order(&self) -> bool;

    async fn create_session(&self, request: &SessionRequest) -> Result<GatewaySession, ServiceError>;

    /// Authenticates a callback before any field of it is trusted.
    fn verify(&self, callback: GatewayCallback<'_>) -> Result<Verification, ServiceError>;
}

/// Configured gateways keyed by provider.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<GatewayProvider, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.provider(), gateway);
        self
    }

    /// Registers every gateway that has credentials in `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.gateway_timeout())
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;

        let mut registry = Self::new();
        let stripe = &config.stripe;
        if non_blank(&stripe.secret_key).is_some() || non_blank(&stripe.webhook_secret).is_some() {
            registry = registry.with_gateway(Arc::new(StripeGateway::new(
                stripe.clone(),
                client.clone(),
            )));
        }
        if let (Some(key_id), Some(key_secret)) = (
            non_blank(&config.razorpay.key_id),
            non_blank(&config.razorpay.key_secret),
        ) {
            registry = registry.with_gateway(Arc::new(RazorpayGateway::new(
                config.razorpay.api_base.clone(),
                key_id.to_string(),
                key_secret.to_string(),
                client,
            )));
        }
        Ok(registry)
    }

    pub fn get(&self, provider: GatewayProvider) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.gateways.get(&provider).cloned().ok_or_else(|| {
            ServiceError::GatewayUnavailable(format!("{} is not configured", provider))
        })
    }
}

/// An empty credential is no credential; an empty HMAC key signs for anyone.
fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Maps a failed gateway HTTP exchange to the service taxonomy. Transport
/// failures, throttling and 5xx are retryable; other statuses are not.
pub(crate) fn classify_status(provider: GatewayProvider, status: reqwest::StatusCode) -> ServiceError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ServiceError::GatewayUnavailable(format!("{} responded {}", provider, status))
    } else {
        ServiceError::ExternalServiceError(format!("{} rejected the request: {}", provider, status))
    }
}

pub(crate) fn transport_error(provider: GatewayProvider, err: reqwest::Error) -> ServiceError {
    if err.is_decode() {
        ServiceError::GatewayUnavailable(format!("{} sent a malformed response: {}", provider, err))
    } else {
        ServiceError::GatewayUnavailable(format!("{} unreachable: {}", provider, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn provider_names_round_trip_through_strum() {
        assert_eq!(GatewayProvider::Stripe.to_string(), "stripe");
        assert_eq!(
            GatewayProvider::from_str("razorpay").unwrap(),
            GatewayProvider::Razorpay
        );
    }

    #[test]
    fn unconfigured_provider_is_unavailable() {
        let registry = GatewayRegistry::new();
        assert!(matches!(
            registry.get(GatewayProvider::Stripe),
            Err(ServiceError::GatewayUnavailable(_))
        ));
    }

    #[test]
    fn blank_credentials_register_nothing() {
        let mut config = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        );
        config.stripe.secret_key = Some(String::new());
        config.stripe.webhook_secret = Some("   ".to_string());
        config.razorpay.key_id = Some("rzp_test_key".to_string());
        config.razorpay.key_secret = Some(String::new());

        let registry = GatewayRegistry::from_config(&config).unwrap();
        assert!(registry.get(GatewayProvider::Stripe).is_err());
        assert!(registry.get(GatewayProvider::Razorpay).is_err());

        config.stripe.webhook_secret = Some("whsec_live".to_string());
        let registry = GatewayRegistry::from_config(&config).unwrap();
        assert!(registry.get(GatewayProvider::Stripe).is_ok());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(GatewayProvider::Stripe, reqwest::StatusCode::BAD_GATEWAY),
            ServiceError::GatewayUnavailable(_)
        ));
        assert!(matches!(
            classify_status(GatewayProvider::Stripe, reqwest::StatusCode::TOO_MANY_REQUESTS),
            ServiceError::GatewayUnavailable(_)
        ));
        assert!(matches!(
            classify_status(GatewayProvider::Razorpay, reqwest::StatusCode::UNAUTHORIZED),
            ServiceError::ExternalServiceError(_)
        ));
    }
}
