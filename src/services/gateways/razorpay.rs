use super::{
    classify_status, transport_error, GatewayCallback, GatewayProvider, GatewaySession,
    PaymentGateway, SessionRequest, Verification, VerifiedPayment,
};
use crate::{errors::ServiceError, signing};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{instrument, warn};

/// Message the gateway signs for a completed modal payment.
pub fn signed_message(gateway_order_id: &str, payment_id: &str) -> String {
    format!("{}|{}", gateway_order_id, payment_id)
}

#[derive(Debug, Deserialize)]
struct CreatedOrder {
    id: String,
    amount: i64,
    currency: String,
}

/// In-page modal gateway. The gateway creates its own order object; the
/// browser reports the payment back together with an HMAC the server
/// recomputes before trusting anything.
pub struct RazorpayGateway {
    api_base: String,
    key_id: String,
    key_secret: String,
    client: reqwest::Client,
}

impl RazorpayGateway {
    pub fn new(api_base: String, key_id: String, key_secret: String, client: reqwest::Client) -> Self {
        Self {
            api_base,
            key_id,
            key_secret,
            client,
        }
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn provider(&self) -> GatewayProvider {
        GatewayProvider::Razorpay
    }

    /// The order stays a draft until the client reports back.
    fn places_order(&self) -> bool {
        false
    }

    #[instrument(skip(self), fields(order_id = %request.order_id))]
    async fn create_session(&self, request: &SessionRequest) -> Result<GatewaySession, ServiceError> {
        let body = json!({
            "amount": request.amount_minor,
            "currency": request.currency,
            "receipt": request.order_id.to_string(),
            "notes": { "order_id": request.order_id.to_string() },
        });

        let url = format!("{}/v1/orders", self.api_base.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(GatewayProvider::Razorpay, e))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "razorpay order creation failed");
            return Err(classify_status(GatewayProvider::Razorpay, status));
        }

        let created: CreatedOrder = response
            .json()
            .await
            .map_err(|e| transport_error(GatewayProvider::Razorpay, e))?;

        Ok(GatewaySession {
            provider: GatewayProvider::Razorpay,
            session_id: created.id,
            redirect_url: None,
            public_key: Some(self.key_id.clone()),
            amount_minor: created.amount,
            currency: created.currency,
        })
    }

    fn verify(&self, callback: GatewayCallback<'_>) -> Result<Verification, ServiceError> {
        let GatewayCallback::Client(confirmation) = callback else {
            return Err(ServiceError::BadRequest(
                "razorpay payments are confirmed by the client".to_string(),
            ));
        };

        let message = signed_message(&confirmation.gateway_order_id, &confirmation.payment_id);
        if !signing::verify_hex(
            self.key_secret.as_bytes(),
            message.as_bytes(),
            &confirmation.signature,
        ) {
            return Err(ServiceError::SignatureMismatch(format!(
                "signature does not match gateway order {}",
                confirmation.gateway_order_id
            )));
        }

        Ok(Verification::Payment(VerifiedPayment {
            provider: GatewayProvider::Razorpay,
            order_id: Some(confirmation.order_id),
            session_id: confirmation.gateway_order_id.clone(),
            payment_id: Some(confirmation.payment_id.clone()),
            amount_minor: None,
            currency: None,
        }))
    }
}
