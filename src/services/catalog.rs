use crate::{
    entities::{product, Product, ProductModel},
    errors::ServiceError,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

/// Live view of a product as priced at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub discount_price: Option<Decimal>,
    pub stock: i32,
    pub is_active: bool,
}

impl CatalogEntry {
    /// Price charged per unit: the discount price when one is set.
    pub fn unit_price(&self) -> Decimal {
        self.discount_price.unwrap_or(self.price)
    }

    /// Per-unit saving against the list price, never negative.
    pub fn unit_discount(&self) -> Decimal {
        (self.price - self.unit_price()).max(Decimal::ZERO)
    }
}

impl From<ProductModel> for CatalogEntry {
    fn from(model: ProductModel) -> Self {
        Self {
            id: model.id,
            name: model.name,
            price: model.price,
            discount_price: model.discount_price,
            stock: model.stock,
            is_active: model.is_active,
        }
    }
}

/// Read-only source of price, discount and stock.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn lookup(&self, product_id: Uuid) -> Result<Option<CatalogEntry>, ServiceError>;

    /// Batch lookup; ids with no product are absent from the map.
    async fn lookup_many(
        &self,
        product_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, CatalogEntry>, ServiceError>;
}

/// Catalog backed by the shared `products` table.
#[derive(Clone)]
pub struct DbCatalog {
    db: Arc<DatabaseConnection>,
}

impl DbCatalog {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogLookup for DbCatalog {
    async fn lookup(&self, product_id: Uuid) -> Result<Option<CatalogEntry>, ServiceError> {
        let product = Product::find_by_id(product_id).one(&*self.db).await?;
        Ok(product.map(CatalogEntry::from))
    }

    async fn lookup_many(
        &self,
        product_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, CatalogEntry>, ServiceError> {
        if product_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let products = Product::find()
            .filter(product::Column::Id.is_in(product_ids.iter().copied()))
            .all(&*self.db)
            .await?;

        Ok(products
            .into_iter()
            .map(|p| (p.id, CatalogEntry::from(p)))
            .collect())
    }
}
