//! Quantity validation against a product's purchase-limit and on-hand-stock
//! constraints. Pure; every cart mutation funnels through [`clamp`].

use crate::{error::AppError, models::Product};

/// Validate a requested quantity against a product.
///
/// Asking for more than is on hand is a hard rejection carrying the
/// available stock. The per-order min/max purchase limits are soft UX
/// bounds and are clamped silently.
pub fn clamp(product: &Product, requested: i32) -> Result<i32, AppError> {
    if requested < 1 {
        return Err(AppError::InvalidQuantity(format!(
            "quantity must be at least 1, got {requested}"
        )));
    }
    if requested > product.stock {
        return Err(AppError::StockExceeded {
            available: product.stock,
        });
    }

    let quantity = requested
        .max(product.min_purchase)
        .min(product.max_purchase);

    // Raising to the purchase minimum can overshoot what is on hand.
    if quantity > product.stock {
        return Err(AppError::StockExceeded {
            available: product.stock,
        });
    }

    Ok(quantity)
}
