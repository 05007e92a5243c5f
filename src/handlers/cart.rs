use crate::handlers::common::{created_response, success_response, validate_input};
use crate::{
    errors::{ErrorResponse, ServiceError},
    identity::Identity,
    services::{
        cart::{CartLineResult, SetQuantityResult},
        pricing::CartBreakdown,
    },
    ApiResponse, AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_to_cart))
        .route(
            "/items/:product_id",
            put(set_cart_item_quantity).delete(remove_cart_item),
        )
}

/// Read the caller's cart with live pricing
#[utoipa::path(
    get,
    path = "/api/v1/cart",
    summary = "Get cart",
    description = "Price every cart line against the live catalog and return the full breakdown",
    params(("X-Customer-Id" = String, Header, description = "Customer identity")),
    responses(
        (status = 200, description = "Cart breakdown", body = ApiResponse<CartBreakdown>),
        (status = 401, description = "No customer identity", body = ErrorResponse),
    ),
    tag = "cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<impl IntoResponse, ServiceError> {
    let owner_id = identity.require()?;
    let breakdown = state.services.cart.read_cart(owner_id).await?;
    Ok(success_response(breakdown))
}

/// Add units of a product to the cart
#[utoipa::path(
    post,
    path = "/api/v1/cart/items",
    summary = "Add to cart",
    request_body = AddCartItemRequest,
    params(("X-Customer-Id" = String, Header, description = "Customer identity")),
    responses(
        (status = 201, description = "Resulting cart line", body = ApiResponse<CartLineResult>),
        (status = 400, description = "Invalid quantity or unavailable product", body = ErrorResponse),
        (status = 404, description = "Unknown product", body = ErrorResponse),
        (status = 409, description = "Not enough stock; details carry the remaining quantity", body = ErrorResponse),
    ),
    tag = "cart"
)]
pub async fn add_to_cart(
    State(state): State<AppState>,
    identity: Identity,
    Json(payload): Json<AddCartItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let owner_id = identity.require()?;

    let result = state
        .services
        .cart
        .add_item(owner_id, payload.product_id, payload.quantity)
        .await?;

    Ok(created_response(result))
}

/// Set the absolute quantity of a cart line; zero removes it
#[utoipa::path(
    put,
    path = "/api/v1/cart/items/{product_id}",
    summary = "Set cart line quantity",
    request_body = SetQuantityRequest,
    params(
        ("product_id" = Uuid, Path, description = "Product ID"),
        ("X-Customer-Id" = String, Header, description = "Customer identity"),
    ),
    responses(
        (status = 200, description = "Updated line or removal", body = ApiResponse<SetQuantityResult>),
        (status = 404, description = "No such cart line", body = ErrorResponse),
        (status = 409, description = "Not enough stock", body = ErrorResponse),
    ),
    tag = "cart"
)]
pub async fn set_cart_item_quantity(
    State(state): State<AppState>,
    identity: Identity,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<SetQuantityRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let owner_id = identity.require()?;

    let result = state
        .services
        .cart
        .set_quantity(owner_id, product_id, payload.quantity)
        .await?;

    Ok(success_response(result))
}

/// Remove a line from the cart
#[utoipa::path(
    delete,
    path = "/api/v1/cart/items/{product_id}",
    summary = "Remove cart line",
    params(
        ("product_id" = Uuid, Path, description = "Product ID"),
        ("X-Customer-Id" = String, Header, description = "Customer identity"),
    ),
    responses(
        (status = 200, description = "Line removed", body = ApiResponse<RemovedLine>),
        (status = 404, description = "No such cart line", body = ErrorResponse),
    ),
    tag = "cart"
)]
pub async fn remove_cart_item(
    State(state): State<AppState>,
    identity: Identity,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let owner_id = identity.require()?;
    let cart_count = state
        .services
        .cart
        .remove_item(owner_id, product_id)
        .await?;

    Ok(success_response(RemovedLine {
        product_id,
        cart_count,
    }))
}

// Request DTOs

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddCartItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SetQuantityRequest {
    #[validate(range(min = 0, max = 1000))]
    pub quantity: i32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RemovedLine {
    pub product_id: Uuid,
    pub cart_count: u64,
}
