use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::Product;

#[derive(Debug, Serialize, ToSchema)]
pub struct ProductList {
    pub items: Vec<Product>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateProductRequest {
    pub name: String,
    pub description: Option<String>,
    /// List price in cents.
    pub price: i64,
    pub sale_price: Option<i64>,
    pub min_purchase: Option<i32>,
    pub max_purchase: Option<i32>,
    pub stock: i32,
    pub available: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StockAdjustRequest {
    /// Relative adjustment; negative values remove stock.
    pub delta: i32,
}
