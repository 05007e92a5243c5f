use crate::{
    entities::OrderSource,
    errors::ServiceError,
    metrics,
    services::{
        gateways::{GatewayProvider, GatewayRegistry, GatewaySession, SessionRequest},
        orders::{OrderLineRequest, OrderService},
        pricing::to_minor_units,
    },
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

/// What the client needs to hand the customer off to a gateway.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutSession {
    pub order_id: Uuid,
    #[schema(value_type = String)]
    pub total: Decimal,
    #[serde(flatten)]
    pub session: GatewaySession,
}

/// Opens payable gateway sessions for freshly built orders.
#[derive(Clone)]
pub struct CheckoutService {
    orders: Arc<OrderService>,
    gateways: GatewayRegistry,
}

impl CheckoutService {
    pub fn new(orders: Arc<OrderService>, gateways: GatewayRegistry) -> Self {
        Self { orders, gateways }
    }

    /// Builds a draft order from `lines` and asks `provider` for a session
    /// sized to its total.
    ///
    /// Zero-item and non-positive orders are rejected before any gateway
    /// call. When the gateway fails the order stays a draft and the error is
    /// returned as retryable.
    #[instrument(skip(self, lines), fields(provider = %provider, lines = lines.len()))]
    pub async fn open_session(
        &self,
        provider: GatewayProvider,
        owner_id: Option<Uuid>,
        source: OrderSource,
        lines: &[OrderLineRequest],
    ) -> Result<CheckoutSession, ServiceError> {
        let gateway = self.gateways.get(provider)?;

        let built = self.orders.build_order(owner_id, source, lines).await?;
        if built.item_count == 0 {
            return Err(ServiceError::EmptyOrder(built.order_id));
        }
        // Guard the amount the gateway will actually charge
        let amount_minor = to_minor_units(built.total)?;
        if amount_minor <= 0 {
            return Err(ServiceError::InvalidOrderAmount {
                order_id: built.order_id,
            });
        }

        let request = SessionRequest {
            order_id: built.order_id,
            amount_minor,
            currency: built.currency.clone(),
            description: format!("Order {}", built.order_id),
        };

        let session = match gateway.create_session(&request).await {
            Ok(session) => session,
            Err(e) => {
                metrics::GATEWAY_FAILURES
                    .with_label_values(&[&provider.to_string()])
                    .inc();
                error!(order_id = %built.order_id, "gateway session failed: {}", e);
                return Err(e);
            }
        };

        self.orders
            .attach_session(
                built.order_id,
                provider,
                &session.session_id,
                gateway.places_order(),
            )
            .await?;

        metrics::GATEWAY_SESSIONS
            .with_label_values(&[&provider.to_string()])
            .inc();
        info!(order_id = %built.order_id, session_id = %session.session_id, "gateway session opened");

        Ok(CheckoutSession {
            order_id: built.order_id,
            total: built.total,
            session,
        })
    }
}
