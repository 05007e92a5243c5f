use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// None for guest checkouts
    #[sea_orm(nullable)]
    pub owner_id: Option<Uuid>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total: Decimal,
    pub currency: String,
    pub status: OrderStatus,
    pub source: OrderSource,
    #[sea_orm(nullable)]
    pub gateway_provider: Option<String>,
    /// Redirect session id or modal gateway order id; unique across orders
    #[sea_orm(nullable, unique)]
    pub gateway_session_id: Option<String>,
    #[sea_orm(nullable)]
    pub gateway_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Order lifecycle. `Confirmed` is terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "draft")]
    Draft,
    #[sea_orm(string_value = "placed")]
    Placed,
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    #[sea_orm(string_value = "expired")]
    Expired,
}

impl OrderStatus {
    /// Forward-only transition table. An expired order may still be
    /// confirmed because the gateway already took the money.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Draft, Placed)
                | (Draft, Confirmed)
                | (Placed, Confirmed)
                | (Draft, Expired)
                | (Placed, Expired)
                | (Expired, Confirmed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == OrderStatus::Confirmed
    }

    /// Statuses from which a payment confirmation is accepted.
    pub fn confirmable() -> [OrderStatus; 3] {
        [OrderStatus::Draft, OrderStatus::Placed, OrderStatus::Expired]
    }
}

/// Where the order lines came from. Only cart orders clear the cart.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderSource {
    #[sea_orm(string_value = "cart")]
    Cart,
    #[sea_orm(string_value = "buy_now")]
    BuyNow,
    /// Synthesized from a gateway event that lacked a local order reference
    #[sea_orm(string_value = "gateway")]
    Gateway,
}
