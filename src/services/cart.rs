use crate::{
    entities::{cart_item, CartItem, CartItemModel},
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
    services::{
        catalog::{CatalogEntry, CatalogLookup},
        orders::OrderLineRequest,
        pricing::{CartBreakdown, CartLineView, PricingRules},
    },
};
use chrono::Utc;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Attempts at the increment/insert pair before giving up on a contended line.
const MAX_ADD_ATTEMPTS: usize = 3;

/// Result of a successful add or set-quantity.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CartLineResult {
    pub line: CartLineView,
    /// Distinct lines now in the caller's cart
    pub cart_count: u64,
}

/// Result of set-quantity: either the updated line or a removal.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SetQuantityResult {
    Updated(CartLineResult),
    Removed { product_id: Uuid, cart_count: u64 },
}

/// Per-customer cart store.
///
/// Quantities are guarded against the live catalog stock with a single
/// conditional `UPDATE`, so concurrent adds for the same line can never
/// jointly exceed stock. Prices are never stored; every read re-prices the
/// lines through the catalog.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn CatalogLookup>,
    pricing: PricingRules,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        catalog: Arc<dyn CatalogLookup>,
        pricing: PricingRules,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            catalog,
            pricing,
            event_sender,
        }
    }

    /// Adds `quantity` units of a product to the owner's cart.
    ///
    /// # Arguments
    ///
    /// * `owner_id` - Identity owning the cart
    /// * `product_id` - Catalog product to add
    /// * `quantity` - Units to add, at least 1
    ///
    /// # Returns
    ///
    /// * `Ok(CartLineResult)` - Resulting line and the new line count
    /// * `Err(ServiceError::ValidationError)` - Quantity below 1 or product inactive
    /// * `Err(ServiceError::NotFound)` - Unknown product
    /// * `Err(ServiceError::OutOfStock)` - Existing plus requested quantity exceeds stock;
    ///   `remaining` is how many more units could still be added
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        owner_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartLineResult, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }

        let product = self.active_product(product_id).await?;

        for attempt in 0..MAX_ADD_ATTEMPTS {
            // Increment only while the result stays within stock
            let updated = CartItem::update_many()
                .col_expr(
                    cart_item::Column::Quantity,
                    Expr::col(cart_item::Column::Quantity).add(quantity),
                )
                .col_expr(cart_item::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(cart_item::Column::OwnerId.eq(owner_id))
                .filter(cart_item::Column::ProductId.eq(product_id))
                .filter(cart_item::Column::Quantity.lte(product.stock - quantity))
                .exec(&*self.db)
                .await?;

            if updated.rows_affected > 0 {
                return self.line_result(owner_id, &product, "add", quantity).await;
            }

            if let Some(existing) = self.find_line(owner_id, product_id).await? {
                return Err(self.out_of_stock(&product, existing.quantity));
            }

            if quantity > product.stock {
                return Err(self.out_of_stock(&product, 0));
            }

            let now = Utc::now();
            let line = cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                owner_id: Set(owner_id),
                product_id: Set(product_id),
                quantity: Set(quantity),
                created_at: Set(now),
                updated_at: Set(now),
            };

            let inserted = CartItem::insert(line)
                .on_conflict(
                    OnConflict::columns([
                        cart_item::Column::OwnerId,
                        cart_item::Column::ProductId,
                    ])
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(&*self.db)
                .await?;

            if inserted > 0 {
                return self.line_result(owner_id, &product, "add", quantity).await;
            }

            // A concurrent add created the line first; retry as an increment
            warn!(%owner_id, %product_id, attempt, "cart line insert lost a race, retrying");
        }

        Err(ServiceError::InternalError(format!(
            "cart line for product {} is contended",
            product_id
        )))
    }

    /// Sets the absolute quantity of a line. Zero removes it.
    #[instrument(skip(self))]
    pub async fn set_quantity(
        &self,
        owner_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<SetQuantityResult, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(
                "quantity must not be negative".to_string(),
            ));
        }

        if quantity == 0 {
            let cart_count = self.remove_item(owner_id, product_id).await?;
            return Ok(SetQuantityResult::Removed {
                product_id,
                cart_count,
            });
        }

        let product = self.active_product(product_id).await?;
        if quantity > product.stock {
            metrics::OUT_OF_STOCK_REJECTIONS.inc();
            return Err(ServiceError::OutOfStock {
                product_id,
                remaining: product.stock.max(0),
            });
        }

        let updated = CartItem::update_many()
            .col_expr(cart_item::Column::Quantity, Expr::value(quantity))
            .col_expr(cart_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(cart_item::Column::OwnerId.eq(owner_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&*self.db)
            .await?;

        if updated.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Cart line for product {} not found",
                product_id
            )));
        }

        self.line_result(owner_id, &product, "set", quantity)
            .await
            .map(SetQuantityResult::Updated)
    }

    /// Removes a line and returns the remaining line count.
    #[instrument(skip(self))]
    pub async fn remove_item(&self, owner_id: Uuid, product_id: Uuid) -> Result<u64, ServiceError> {
        let deleted = CartItem::delete_many()
            .filter(cart_item::Column::OwnerId.eq(owner_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&*self.db)
            .await?;

        if deleted.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Cart line for product {} not found",
                product_id
            )));
        }

        metrics::CART_MUTATIONS.with_label_values(&["remove"]).inc();
        self.event_sender
            .send_or_log(Event::CartItemRemoved {
                owner_id,
                product_id,
            })
            .await;

        self.line_count(owner_id).await
    }

    /// Prices every line against the live catalog. Lines whose product is
    /// gone or inactive are left out of the breakdown.
    #[instrument(skip(self))]
    pub async fn read_cart(&self, owner_id: Uuid) -> Result<CartBreakdown, ServiceError> {
        let lines = self.lines(owner_id).await?;
        let ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
        let products = self.catalog.lookup_many(&ids).await?;

        let priced = lines
            .iter()
            .filter_map(|line| match products.get(&line.product_id) {
                Some(entry) if entry.is_active => {
                    Some(CartLineView::priced(line.id, entry, line.quantity))
                }
                _ => None,
            })
            .collect();

        Ok(self.pricing.breakdown(priced))
    }

    /// Snapshot of the cart as order lines, oldest first.
    pub async fn order_lines(&self, owner_id: Uuid) -> Result<Vec<OrderLineRequest>, ServiceError> {
        Ok(self
            .lines(owner_id)
            .await?
            .into_iter()
            .map(|l| OrderLineRequest {
                product_id: l.product_id,
                quantity: l.quantity,
            })
            .collect())
    }

    /// Deletes every line of a cart on the given connection, so the clear can
    /// share the confirming transaction.
    pub async fn clear_in<C: ConnectionTrait>(conn: &C, owner_id: Uuid) -> Result<u64, ServiceError> {
        let deleted = CartItem::delete_many()
            .filter(cart_item::Column::OwnerId.eq(owner_id))
            .exec(conn)
            .await?;
        Ok(deleted.rows_affected)
    }

    async fn lines(&self, owner_id: Uuid) -> Result<Vec<CartItemModel>, ServiceError> {
        Ok(CartItem::find()
            .filter(cart_item::Column::OwnerId.eq(owner_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    async fn find_line(
        &self,
        owner_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<CartItemModel>, ServiceError> {
        Ok(CartItem::find()
            .filter(cart_item::Column::OwnerId.eq(owner_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&*self.db)
            .await?)
    }

    async fn line_count(&self, owner_id: Uuid) -> Result<u64, ServiceError> {
        Ok(CartItem::find()
            .filter(cart_item::Column::OwnerId.eq(owner_id))
            .count(&*self.db)
            .await?)
    }

    async fn active_product(&self, product_id: Uuid) -> Result<CatalogEntry, ServiceError> {
        let product = self
            .catalog
            .lookup(product_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        if !product.is_active {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is not available",
                product_id
            )));
        }
        Ok(product)
    }

    fn out_of_stock(&self, product: &CatalogEntry, in_cart: i32) -> ServiceError {
        metrics::OUT_OF_STOCK_REJECTIONS.inc();
        ServiceError::OutOfStock {
            product_id: product.id,
            remaining: (product.stock - in_cart).max(0),
        }
    }

    async fn line_result(
        &self,
        owner_id: Uuid,
        product: &CatalogEntry,
        operation: &str,
        requested: i32,
    ) -> Result<CartLineResult, ServiceError> {
        let line = self
            .find_line(owner_id, product.id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart line for product {} not found", product.id)))?;
        let cart_count = self.line_count(owner_id).await?;

        metrics::CART_MUTATIONS.with_label_values(&[operation]).inc();
        let event = if operation == "add" {
            Event::CartItemAdded {
                owner_id,
                product_id: product.id,
                quantity: requested,
            }
        } else {
            Event::CartItemUpdated {
                owner_id,
                product_id: product.id,
                quantity: requested,
            }
        };
        self.event_sender.send_or_log(event).await;

        info!(%owner_id, product_id = %product.id, quantity = line.quantity, "cart line {}", operation);

        Ok(CartLineResult {
            line: CartLineView::priced(line.id, product, line.quantity),
            cart_count,
        })
    }
}
