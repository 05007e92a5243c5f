pub mod cart;
pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod payments;

use crate::{
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{
        cart::CartService,
        catalog::{CatalogLookup, DbCatalog},
        checkout::CheckoutService,
        gateways::GatewayRegistry,
        orders::OrderService,
        pricing::PricingRules,
        reconciler::PaymentReconciler,
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub checkout: Arc<CheckoutService>,
    pub reconciler: Arc<PaymentReconciler>,
}

impl AppServices {
    /// Wires the services over one catalog and one gateway registry.
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
        gateways: GatewayRegistry,
    ) -> Self {
        let catalog: Arc<dyn CatalogLookup> = Arc::new(DbCatalog::new(db_pool.clone()));

        let cart = Arc::new(CartService::new(
            db_pool.clone(),
            catalog.clone(),
            PricingRules::from(&config.pricing),
            event_sender.clone(),
        ));
        let orders = Arc::new(OrderService::new(
            db_pool.clone(),
            catalog,
            event_sender.clone(),
            config.currency.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(orders.clone(), gateways.clone()));
        let reconciler = Arc::new(PaymentReconciler::new(
            db_pool,
            orders.clone(),
            gateways,
            event_sender,
            config.currency.clone(),
        ));

        Self {
            cart,
            orders,
            checkout,
            reconciler,
        }
    }

    /// Same as `new`, with gateways built from the configured credentials.
    pub fn from_config(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
    ) -> Result<Self, ServiceError> {
        let gateways = GatewayRegistry::from_config(config)?;
        Ok(Self::new(db_pool, config, event_sender, gateways))
    }
}
