use crate::handlers::common::{success_response, validate_input};
use crate::{
    entities::OrderStatus,
    errors::{ErrorResponse, ServiceError},
    services::{
        gateways::{stripe, ClientConfirmation, GatewayProvider},
        reconciler::ReconcileOutcome,
    },
    ApiResponse, AppState,
};
use axum::{
    body::Bytes,
    extract::{Json, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for payment callbacks
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/stripe/webhook", post(stripe_webhook))
        .route("/razorpay/verify", post(verify_razorpay_payment))
}

/// Signed webhook from the redirect gateway
///
/// The raw body is verified before it is parsed. Redeliveries of an already
/// applied event are acknowledged with 200 so the gateway stops retrying.
#[utoipa::path(
    post,
    path = "/api/v1/payments/stripe/webhook",
    summary = "Redirect gateway webhook",
    request_body(content = String, description = "Raw event payload", content_type = "application/json"),
    params(("Stripe-Signature" = String, Header, description = "t=<unix>,v1=<hex hmac>")),
    responses(
        (status = 200, description = "Event processed or already processed", body = WebhookAck),
        (status = 400, description = "Signature could not be verified", body = ErrorResponse),
        (status = 404, description = "Referenced order does not exist", body = ErrorResponse),
        (status = 422, description = "Reported amount does not match the order", body = ErrorResponse),
    ),
    tag = "payments"
)]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let signature = headers
        .get(stripe::SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome = state
        .services
        .reconciler
        .handle_webhook(GatewayProvider::Stripe, signature, &body)
        .await?;

    Ok(Json(WebhookAck::from(outcome)))
}

/// Client-reported payment from the modal gateway
#[utoipa::path(
    post,
    path = "/api/v1/payments/razorpay/verify",
    summary = "Verify modal payment",
    request_body = VerifyPaymentRequest,
    responses(
        (status = 200, description = "Payment verified and order confirmed", body = ApiResponse<PaymentVerified>),
        (status = 400, description = "Payment could not be verified", body = ErrorResponse),
        (status = 404, description = "Order not found", body = ErrorResponse),
    ),
    tag = "payments"
)]
pub async fn verify_razorpay_payment(
    State(state): State<AppState>,
    Json(payload): Json<VerifyPaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let confirmation = ClientConfirmation {
        order_id: payload.order_id,
        gateway_order_id: payload.razorpay_order_id,
        payment_id: payload.razorpay_payment_id,
        signature: payload.razorpay_signature,
    };

    let outcome = state
        .services
        .reconciler
        .verify_client_payment(GatewayProvider::Razorpay, &confirmation)
        .await?;

    Ok(success_response(PaymentVerified {
        order_id: confirmation.order_id,
        status: OrderStatus::Confirmed,
        already_confirmed: matches!(outcome, ReconcileOutcome::AlreadyConfirmed { .. }),
    }))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct VerifyPaymentRequest {
    /// Local order id returned at checkout
    pub order_id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub razorpay_order_id: String,
    #[validate(length(min = 1, max = 64))]
    pub razorpay_payment_id: String,
    #[validate(length(min = 1, max = 128))]
    pub razorpay_signature: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaymentVerified {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub already_confirmed: bool,
}

/// Webhook acknowledgement
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    /// confirmed, already_confirmed or ignored
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
}

impl From<ReconcileOutcome> for WebhookAck {
    fn from(outcome: ReconcileOutcome) -> Self {
        let label = match &outcome {
            ReconcileOutcome::Confirmed { .. } => "confirmed",
            ReconcileOutcome::AlreadyConfirmed { .. } => "already_confirmed",
            ReconcileOutcome::Ignored { .. } => "ignored",
        };
        Self {
            received: true,
            outcome: label.to_string(),
            order_id: outcome.order_id(),
        }
    }
}
