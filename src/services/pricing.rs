use crate::{config::PricingConfig, errors::ServiceError, services::catalog::CatalogEntry};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// Rounds a money amount to cents, halves away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts a major-unit amount to the integer minor units gateways expect.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (round_money(amount) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| ServiceError::InternalError(format!("amount {} out of range", amount)))
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// One priced cart line.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CartLineView {
    pub id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
    #[schema(value_type = String)]
    pub original_price: Decimal,
    #[schema(value_type = String)]
    pub line_subtotal: Decimal,
    #[schema(value_type = String)]
    pub line_discount: Decimal,
}

impl CartLineView {
    pub fn priced(id: Uuid, entry: &CatalogEntry, quantity: i32) -> Self {
        let qty = Decimal::from(quantity);
        Self {
            id,
            product_id: entry.id,
            name: entry.name.clone(),
            quantity,
            unit_price: entry.unit_price(),
            original_price: entry.price,
            line_subtotal: entry.unit_price() * qty,
            line_discount: entry.unit_discount() * qty,
        }
    }
}

/// Full cart breakdown. Tax and shipping are informational; orders charge
/// the item sum only.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CartBreakdown {
    pub lines: Vec<CartLineView>,
    #[schema(value_type = String)]
    pub subtotal: Decimal,
    #[schema(value_type = String)]
    pub discount: Decimal,
    #[schema(value_type = String)]
    pub tax: Decimal,
    #[schema(value_type = String)]
    pub shipping: Decimal,
    #[schema(value_type = String)]
    pub total: Decimal,
    /// Number of distinct lines
    pub count: usize,
    /// Sum of quantities across lines
    pub item_count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricingRules {
    pub tax_rate: Decimal,
    pub shipping_flat_fee: Decimal,
    pub free_shipping_threshold: Decimal,
}

impl Default for PricingRules {
    fn default() -> Self {
        PricingRules::from(&PricingConfig::default())
    }
}

impl From<&PricingConfig> for PricingRules {
    fn from(cfg: &PricingConfig) -> Self {
        Self {
            tax_rate: cfg.tax_rate,
            shipping_flat_fee: cfg.shipping_flat_fee,
            free_shipping_threshold: cfg.free_shipping_threshold,
        }
    }
}

impl PricingRules {
    pub fn tax(&self, subtotal: Decimal) -> Decimal {
        round_money(subtotal * self.tax_rate)
    }

    /// Flat fee unless the subtotal is strictly above the threshold. An empty
    /// cart ships nothing.
    pub fn shipping(&self, subtotal: Decimal, has_lines: bool) -> Decimal {
        if !has_lines || subtotal > self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            self.shipping_flat_fee
        }
    }

    pub fn breakdown(&self, lines: Vec<CartLineView>) -> CartBreakdown {
        let subtotal: Decimal = lines.iter().map(|l| l.line_subtotal).sum();
        let discount: Decimal = lines.iter().map(|l| l.line_discount).sum();
        let tax = self.tax(subtotal);
        let shipping = self.shipping(subtotal, !lines.is_empty());
        let item_count = lines.iter().map(|l| i64::from(l.quantity)).sum();

        CartBreakdown {
            count: lines.len(),
            item_count,
            subtotal,
            discount,
            tax,
            shipping,
            total: subtotal + tax + shipping,
            lines,
        }
    }
}
