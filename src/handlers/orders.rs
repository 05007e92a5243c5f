use crate::handlers::common::success_response;
use crate::{
    errors::{ErrorResponse, ServiceError},
    identity::Identity,
    services::orders::OrderWithItems,
    ApiResponse, AppState,
};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use uuid::Uuid;

/// Creates the router for order endpoints
pub fn order_routes() -> Router<AppState> {
    Router::new().route("/:id", get(get_order))
}

/// Get an order with its captured lines
///
/// Owned orders are only visible to their owner; anyone else gets 404.
/// Guest orders are readable by id, which is what the payment return page
/// polls with.
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    params(
        ("id" = Uuid, Path, description = "Order ID"),
        ("X-Customer-Id" = Option<String>, Header, description = "Customer identity"),
    ),
    responses(
        (status = 200, description = "Order retrieved successfully", body = ApiResponse<OrderWithItems>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 404, description = "Order not found", body = ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.get_order_with_items(id).await?;

    if let Some(owner_id) = order.order.owner_id {
        if identity.owner_id() != Some(owner_id) {
            return Err(ServiceError::NotFound(format!(
                "Order with ID {} not found",
                id
            )));
        }
    }

    Ok(success_response(order))
}
