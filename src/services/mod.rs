// Catalog and pricing
pub mod catalog;
pub mod pricing;

// Pre-order state
pub mod cart;

// Order lifecycle
pub mod checkout;
pub mod orders;
pub mod reconciler;

// Payment gateway strategies
pub mod gateways;
