use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront Checkout API",
        version = "1.0.0",
        description = r#"
# Storefront Checkout API

Cart, order lifecycle and payment reconciliation for the furniture storefront.

## Identity

The upstream auth layer sets `X-Customer-Id` to the signed-in customer's id.
Requests without it are guests: they may check out explicit lines but have no cart.

## Payments

- **Redirect checkout**: `POST /api/v1/checkout/stripe/session` returns a hosted page URL.
  The outcome arrives as a signed webhook.
- **Modal checkout**: `POST /api/v1/checkout/razorpay/order` returns a gateway order id
  for the in-page widget. The browser reports the payment to `POST /api/v1/payments/razorpay/verify`.

## Error Handling

Errors share one body:

```json
{
  "error": "Conflict",
  "code": "out_of_stock",
  "message": "Out of stock: only 1 more available",
  "details": {"product_id": "...", "remaining": 1},
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "cart", description = "Per-customer cart"),
        (name = "checkout", description = "Order building and gateway sessions"),
        (name = "payments", description = "Gateway callbacks"),
        (name = "orders", description = "Order status"),
        (name = "ops", description = "Health and metrics")
    ),
    paths(
        // Cart
        crate::handlers::cart::get_cart,
        crate::handlers::cart::add_to_cart,
        crate::handlers::cart::set_cart_item_quantity,
        crate::handlers::cart::remove_cart_item,

        // Checkout
        crate::handlers::checkout::create_stripe_session,
        crate::handlers::checkout::create_razorpay_order,

        // Payments
        crate::handlers::payments::stripe_webhook,
        crate::handlers::payments::verify_razorpay_payment,

        // Orders
        crate::handlers::orders::get_order,

        // Health
        crate::handlers::health::health_check,
    ),
    components(
        schemas(
            // Cart types
            crate::handlers::cart::AddCartItemRequest,
            crate::handlers::cart::SetQuantityRequest,
            crate::handlers::cart::RemovedLine,
            crate::services::pricing::CartBreakdown,
            crate::services::pricing::CartLineView,
            crate::services::cart::CartLineResult,
            crate::services::cart::SetQuantityResult,

            // Checkout types
            crate::handlers::checkout::CheckoutRequest,
            crate::handlers::checkout::CheckoutLine,
            crate::services::checkout::CheckoutSession,
            crate::services::gateways::GatewaySession,
            crate::services::gateways::GatewayProvider,

            // Payment types
            crate::handlers::payments::VerifyPaymentRequest,
            crate::handlers::payments::PaymentVerified,
            crate::handlers::payments::WebhookAck,

            // Order types
            crate::services::orders::OrderWithItems,
            crate::entities::OrderStatus,
            crate::entities::OrderSource,

            // Health
            crate::handlers::health::HealthResponse,
            crate::handlers::health::ComponentHealth,
            crate::handlers::health::ComponentStatus,

            // Error types
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_checkout_routes() {
        let json = serde_json::to_string(&ApiDocV1::openapi()).unwrap();
        assert!(json.contains("Storefront Checkout API"));
        assert!(json.contains("/api/v1/cart/items"));
        assert!(json.contains("/api/v1/payments/stripe/webhook"));
        assert!(json.contains("/api/v1/payments/razorpay/verify"));
    }
}
