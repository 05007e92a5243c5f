use crate::{
    entities::{order, order_item, Order, OrderItem, OrderItemModel, OrderModel, OrderSource, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
    services::{catalog::CatalogLookup, gateways::GatewayProvider, pricing::round_money},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// One requested purchase line; price always comes from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderLineRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Outcome of `build_order`.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltOrder {
    pub order_id: Uuid,
    pub total: Decimal,
    pub currency: String,
    pub item_count: usize,
}

/// Order with its captured lines.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderWithItems {
    #[schema(value_type = Object)]
    pub order: OrderModel,
    #[schema(value_type = Vec<Object>)]
    pub items: Vec<OrderItemModel>,
}

/// Builds orders from cart snapshots or direct-purchase lines and owns the
/// forward-only status transitions.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn CatalogLookup>,
    event_sender: Arc<EventSender>,
    currency: String,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn CatalogLookup>,
        event_sender: Arc<EventSender>,
        currency: String,
    ) -> Self {
        Self {
            db,
            catalog,
            event_sender,
            currency,
        }
    }

    /// Persists a draft order with server-priced item snapshots.
    ///
    /// Lines are re-resolved through the catalog; lines whose product is gone
    /// or inactive are skipped. The order row, its items and the final total
    /// are written in one transaction, so no partial order is ever visible.
    /// An order where every line was skipped is still persisted, with total
    /// zero and no items; callers must reject it before charging.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn build_order(
        &self,
        owner_id: Option<Uuid>,
        source: OrderSource,
        lines: &[OrderLineRequest],
    ) -> Result<BuiltOrder, ServiceError> {
        if let Some(bad) = lines.iter().find(|l| l.quantity < 1) {
            return Err(ServiceError::ValidationError(format!(
                "quantity for product {} must be at least 1",
                bad.product_id
            )));
        }

        let merged = merge_lines(lines);
        let ids: Vec<Uuid> = merged.iter().map(|l| l.product_id).collect();
        // Resolve before opening the transaction; the lookup may share the pool
        let products = self.catalog.lookup_many(&ids).await?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let mut items = Vec::with_capacity(merged.len());
        let mut total = Decimal::ZERO;

        for line in &merged {
            let product = match products.get(&line.product_id) {
                Some(p) if p.is_active => p,
                _ => {
                    warn!(%order_id, product_id = %line.product_id, "skipping unavailable product");
                    continue;
                }
            };

            // Captured at cents so item sum, stored total and charge agree
            let unit_price = round_money(product.unit_price());
            total += unit_price * Decimal::from(line.quantity);
            items.push(order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                name: Set(product.name.clone()),
                unit_price: Set(unit_price),
                quantity: Set(line.quantity),
                created_at: Set(now),
            });
        }

        let item_count = items.len();
        let txn = self.db.begin().await?;

        let draft = order::ActiveModel {
            id: Set(order_id),
            owner_id: Set(owner_id),
            total: Set(Decimal::ZERO),
            currency: Set(self.currency.clone()),
            status: Set(OrderStatus::Draft),
            source: Set(source),
            gateway_provider: Set(None),
            gateway_session_id: Set(None),
            gateway_payment_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            confirmed_at: Set(None),
        };
        Order::insert(draft).exec_without_returning(&txn).await?;

        if !items.is_empty() {
            OrderItem::insert_many(items)
                .exec_without_returning(&txn)
                .await?;
        }

        // The one permitted total write, still inside the building transaction
        Order::update_many()
            .col_expr(order::Column::Total, Expr::value(total))
            .filter(order::Column::Id.eq(order_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        metrics::ORDERS_BUILT
            .with_label_values(&[&source.to_string()])
            .inc();
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id,
                total,
                item_count,
            })
            .await;

        info!(%order_id, %total, item_count, source = %source, "order built");

        Ok(BuiltOrder {
            order_id,
            total,
            currency: self.currency.clone(),
            item_count,
        })
    }

    /// Records the gateway session on a draft order. With `mark_placed` the
    /// order also moves to `placed`.
    #[instrument(skip(self))]
    pub async fn attach_session(
        &self,
        order_id: Uuid,
        provider: GatewayProvider,
        session_id: &str,
        mark_placed: bool,
    ) -> Result<(), ServiceError> {
        let mut update = Order::update_many()
            .col_expr(
                order::Column::GatewayProvider,
                Expr::value(provider.to_string()),
            )
            .col_expr(
                order::Column::GatewaySessionId,
                Expr::value(session_id.to_string()),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()));
        if mark_placed {
            update = update.col_expr(order::Column::Status, Expr::value(OrderStatus::Placed));
        }

        let result = update
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Draft))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} is no longer a draft",
                order_id
            )));
        }

        self.event_sender
            .send_or_log(Event::OrderSessionOpened {
                order_id,
                provider: provider.to_string(),
                session_id: session_id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Compare-and-set to `confirmed`. Returns false when the order was
    /// already confirmed, in which case nothing was written.
    pub async fn confirm_in<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
        payment_id: Option<&str>,
        confirmed_at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut update = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Confirmed))
            .col_expr(order::Column::ConfirmedAt, Expr::value(confirmed_at))
            .col_expr(order::Column::UpdatedAt, Expr::value(confirmed_at));
        if let Some(payment_id) = payment_id {
            update = update.col_expr(
                order::Column::GatewayPaymentId,
                Expr::value(payment_id.to_string()),
            );
        }

        let result = update
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.ne(OrderStatus::Confirmed))
            .exec(conn)
            .await?;

        Ok(result.rows_affected > 0)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderModel>, ServiceError> {
        Ok(Order::find_by_id(order_id).one(&*self.db).await?)
    }

    pub async fn find_by_session(&self, session_id: &str) -> Result<Option<OrderModel>, ServiceError> {
        Ok(Order::find()
            .filter(order::Column::GatewaySessionId.eq(session_id))
            .one(&*self.db)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn get_order_with_items(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order = self
            .get_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(OrderWithItems { order, items })
    }

    /// Moves draft and placed orders older than `ttl` to `expired`.
    #[instrument(skip(self))]
    pub async fn expire_stale_drafts(&self, ttl: chrono::Duration) -> Result<Vec<Uuid>, ServiceError> {
        let cutoff = Utc::now() - ttl;
        let open = [OrderStatus::Draft, OrderStatus::Placed];

        let stale: Vec<Uuid> = Order::find()
            .select_only()
            .column(order::Column::Id)
            .filter(order::Column::Status.is_in(open))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .into_tuple()
            .all(&*self.db)
            .await?;

        if stale.is_empty() {
            return Ok(stale);
        }

        // Per-row status guard: a confirmation may land between select and update
        let now = Utc::now();
        let mut expired = Vec::with_capacity(stale.len());
        for order_id in stale {
            let result = Order::update_many()
                .col_expr(order::Column::Status, Expr::value(OrderStatus::Expired))
                .col_expr(order::Column::UpdatedAt, Expr::value(now))
                .filter(order::Column::Id.eq(order_id))
                .filter(order::Column::Status.is_in(open))
                .exec(&*self.db)
                .await?;
            if result.rows_affected == 1 {
                expired.push(order_id);
            }
        }

        if expired.is_empty() {
            return Ok(expired);
        }

        metrics::ORDERS_EXPIRED.inc_by(expired.len() as u64);
        info!(expired = expired.len(), "expired stale orders");

        self.event_sender
            .send_or_log(Event::OrdersExpired {
                order_ids: expired.clone(),
            })
            .await;
        Ok(expired)
    }
}

/// Runs `expire_stale_drafts` every `interval` until the runtime shuts down.
pub fn spawn_expiry_sweeper(
    orders: Arc<OrderService>,
    ttl: chrono::Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = orders.expire_stale_drafts(ttl).await {
                error!("Order expiry sweep failed: {}", e);
            }
        }
    })
}

/// Collapses repeated products into one line, keeping first-seen order.
fn merge_lines(lines: &[OrderLineRequest]) -> Vec<OrderLineRequest> {
    let mut merged: Vec<OrderLineRequest> = Vec::with_capacity(lines.len());
    for line in lines {
        match merged.iter_mut().find(|m| m.product_id == line.product_id) {
            Some(existing) => existing.quantity += line.quantity,
            None => merged.push(*line),
        }
    }
    merged
}
