use crate::handlers::common::{created_response, validate_input};
use crate::{
    entities::OrderSource,
    errors::{ErrorResponse, ServiceError},
    identity::Identity,
    services::{
        checkout::CheckoutSession,
        gateways::GatewayProvider,
        orders::OrderLineRequest,
    },
    ApiResponse, AppState,
};
use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/stripe/session", post(create_stripe_session))
        .route("/razorpay/order", post(create_razorpay_order))
}

/// Open a hosted checkout session and return the redirect URL
#[utoipa::path(
    post,
    path = "/api/v1/checkout/stripe/session",
    summary = "Create redirect checkout session",
    description = "Builds an order from the given lines (or the caller's cart when omitted) and opens a hosted payment page for its total",
    request_body = CheckoutRequest,
    params(("X-Customer-Id" = Option<String>, Header, description = "Customer identity; absent for guests")),
    responses(
        (status = 201, description = "Session opened", body = ApiResponse<CheckoutSession>),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 422, description = "Nothing payable in the order", body = ErrorResponse),
        (status = 503, description = "Gateway unavailable; retry later", body = ErrorResponse),
    ),
    tag = "checkout"
)]
pub async fn create_stripe_session(
    State(state): State<AppState>,
    identity: Identity,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    open_session(state, identity, payload, GatewayProvider::Stripe).await
}

/// Create a gateway order for the in-page payment widget
#[utoipa::path(
    post,
    path = "/api/v1/checkout/razorpay/order",
    summary = "Create modal checkout order",
    description = "Builds a local draft order and a matching gateway order; returns both ids and the amount in minor units",
    request_body = CheckoutRequest,
    params(("X-Customer-Id" = Option<String>, Header, description = "Customer identity; absent for guests")),
    responses(
        (status = 201, description = "Gateway order created", body = ApiResponse<CheckoutSession>),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 422, description = "Nothing payable in the order", body = ErrorResponse),
        (status = 503, description = "Gateway unavailable; retry later", body = ErrorResponse),
    ),
    tag = "checkout"
)]
pub async fn create_razorpay_order(
    State(state): State<AppState>,
    identity: Identity,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    open_session(state, identity, payload, GatewayProvider::Razorpay).await
}

async fn open_session(
    state: AppState,
    identity: Identity,
    payload: CheckoutRequest,
    provider: GatewayProvider,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let (source, lines) = resolve_lines(&state, identity, payload).await?;

    let session = state
        .services
        .checkout
        .open_session(provider, identity.owner_id(), source, &lines)
        .await?;

    Ok(created_response(session))
}

/// Explicit lines win; otherwise the caller's cart is snapshotted.
async fn resolve_lines(
    state: &AppState,
    identity: Identity,
    payload: CheckoutRequest,
) -> Result<(OrderSource, Vec<OrderLineRequest>), ServiceError> {
    let Some(items) = payload.items else {
        let owner_id = identity.require()?;
        let lines = state.services.cart.order_lines(owner_id).await?;
        if lines.is_empty() {
            return Err(ServiceError::ValidationError("cart is empty".to_string()));
        }
        return Ok((OrderSource::Cart, lines));
    };

    for item in &items {
        validate_input(item)?;
    }

    if payload.buy_now && items.len() != 1 {
        return Err(ServiceError::ValidationError(
            "buy-now checkout takes exactly one line".to_string(),
        ));
    }

    let source = if payload.buy_now {
        OrderSource::BuyNow
    } else {
        OrderSource::Cart
    };
    let lines = items
        .into_iter()
        .map(|item| OrderLineRequest {
            product_id: item.product_id,
            quantity: item.quantity,
        })
        .collect();

    Ok((source, lines))
}

// Request DTOs

#[derive(Debug, Deserialize, Serialize, Validate, ToSchema)]
pub struct CheckoutLine {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct CheckoutRequest {
    /// Lines to buy; omit to check out the caller's cart
    #[serde(default)]
    #[validate(length(min = 1, max = 100))]
    pub items: Option<Vec<CheckoutLine>>,
    /// Direct purchase of a single line; the cart is left untouched
    #[serde(default)]
    pub buy_now: bool,
}
