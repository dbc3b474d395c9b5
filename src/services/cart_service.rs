use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::cart::{AddToCartRequest, CartLine, CartSummary, CartView},
    error::{AppError, AppResult},
    models::{CartItem, Identity, Product},
    response::{ApiResponse, Meta},
    services::{pricing, stock},
    state::AppState,
};

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

async fn load_product(state: &AppState, product_id: Uuid) -> AppResult<Product> {
    let product: Option<Product> = sqlx::query_as("SELECT * FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_optional(&state.pool)
        .await?;
    product.ok_or_else(|| AppError::BadRequest("product not found".to_string()))
}

#[derive(FromRow)]
struct CartWithProductRow {
    cart_id: Uuid,
    quantity: i32,
    basket_no: Uuid,
    item_created_at: DateTime<Utc>,
    product_id: Uuid,
    name: String,
    description: Option<String>,
    price: i64,
    sale_price: Option<i64>,
    min_purchase: i32,
    max_purchase: i32,
    stock: i32,
    available: bool,
    product_created_at: DateTime<Utc>,
}

pub async fn list_cart(state: &AppState, identity: &Identity) -> AppResult<ApiResponse<CartView>> {
    let rows = sqlx::query_as::<_, CartWithProductRow>(
        r#"
        SELECT ci.id AS cart_id, ci.quantity, ci.basket_no, ci.created_at AS item_created_at,
               p.id AS product_id, p.name, p.description, p.price, p.sale_price,
               p.min_purchase, p.max_purchase, p.stock, p.available,
               p.created_at AS product_created_at
        FROM cart_items ci
        JOIN products p ON p.id = ci.product_id
        WHERE ci.user_id IS NOT DISTINCT FROM $1
          AND ci.session_key IS NOT DISTINCT FROM $2
          AND NOT ci.paid
        ORDER BY ci.created_at DESC
        "#,
    )
    .bind(identity.user_id())
    .bind(identity.session_key())
    .fetch_all(&state.pool)
    .await?;

    let mut item_count = 0i64;
    let mut subtotal = 0i64;
    let items: Vec<CartLine> = rows
        .into_iter()
        .map(|row| {
            let unit_price = pricing::effective_price(row.price, row.sale_price);
            item_count += row.quantity as i64;
            subtotal += unit_price * row.quantity as i64;
            CartLine {
                id: row.cart_id,
                product: Product {
                    id: row.product_id,
                    name: row.name,
                    description: row.description,
                    price: row.price,
                    sale_price: row.sale_price,
                    min_purchase: row.min_purchase,
                    max_purchase: row.max_purchase,
                    stock: row.stock,
                    available: row.available,
                    created_at: row.product_created_at,
                },
                quantity: row.quantity,
                basket_no: row.basket_no,
                unit_price,
                line_total: unit_price * row.quantity as i64,
                created_at: row.item_created_at,
            }
        })
        .collect();

    let totals = pricing::cart_totals(subtotal, state.config.vat_permille, 0);
    let view = CartView {
        items,
        summary: CartSummary {
            item_count,
            subtotal: totals.subtotal,
            vat: totals.vat,
            total: totals.total,
        },
    };

    Ok(ApiResponse::success("OK", view, Some(Meta::empty())))
}

/// Add a product to the cart. An existing row for the same product gains
/// the requested quantity; the combined amount is re-validated, and a
/// rejection leaves the existing row untouched.
pub async fn add_item(
    state: &AppState,
    identity: &Identity,
    payload: AddToCartRequest,
) -> AppResult<ApiResponse<CartItem>> {
    if payload.quantity < 1 {
        return Err(AppError::InvalidQuantity(format!(
            "quantity must be at least 1, got {}",
            payload.quantity
        )));
    }

    let product = load_product(state, payload.product_id).await?;
    if !product.available {
        return Err(AppError::BadRequest(
            "this product is currently unavailable".to_string(),
        ));
    }

    let mut txn = state.pool.begin().await?;

    let existing: Option<CartItem> = sqlx::query_as(
        r#"
        SELECT * FROM cart_items
        WHERE user_id IS NOT DISTINCT FROM $1
          AND session_key IS NOT DISTINCT FROM $2
          AND product_id = $3
          AND NOT paid
        FOR UPDATE
        "#,
    )
    .bind(identity.user_id())
    .bind(identity.session_key())
    .bind(payload.product_id)
    .fetch_optional(&mut *txn)
    .await?;

    let requested = existing.as_ref().map(|i| i.quantity).unwrap_or(0) + payload.quantity;
    // Dropping the transaction on rejection rolls back with the row untouched.
    let accepted = stock::clamp(&product, requested)?;

    let cart_item = if let Some(item) = existing {
        sqlx::query_as::<_, CartItem>(
            "UPDATE cart_items SET quantity = $2 WHERE id = $1 RETURNING *",
        )
        .bind(item.id)
        .bind(accepted)
        .fetch_one(&mut *txn)
        .await?
    } else {
        let open_basket: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT basket_no FROM cart_items
            WHERE user_id IS NOT DISTINCT FROM $1
              AND session_key IS NOT DISTINCT FROM $2
              AND NOT paid
            LIMIT 1
            "#,
        )
        .bind(identity.user_id())
        .bind(identity.session_key())
        .fetch_optional(&mut *txn)
        .await?;
        let basket_no = open_basket.map(|b| b.0).unwrap_or_else(Uuid::new_v4);

        sqlx::query_as::<_, CartItem>(
            r#"
            INSERT INTO cart_items (id, user_id, session_key, product_id, quantity, basket_no)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(identity.user_id())
        .bind(identity.session_key())
        .bind(payload.product_id)
        .bind(accepted)
        .bind(basket_no)
        .fetch_one(&mut *txn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict("cart item was created concurrently, retry".to_string())
            } else {
                e.into()
            }
        })?
    };

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        identity.user_id(),
        "cart_add",
        Some("cart_items"),
        Some(serde_json::json!({
            "product_id": payload.product_id,
            "requested": payload.quantity,
            "quantity": accepted,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("OK", cart_item, None))
}

async fn locked_item(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    identity: &Identity,
    item_id: Uuid,
) -> AppResult<CartItem> {
    let item: Option<CartItem> = sqlx::query_as(
        r#"
        SELECT * FROM cart_items
        WHERE id = $1
          AND user_id IS NOT DISTINCT FROM $2
          AND session_key IS NOT DISTINCT FROM $3
          AND NOT paid
        FOR UPDATE
        "#,
    )
    .bind(item_id)
    .bind(identity.user_id())
    .bind(identity.session_key())
    .fetch_optional(&mut **txn)
    .await?;
    item.ok_or(AppError::NotFound)
}

/// Bump the quantity by one, re-validated against the product's limits. A
/// row already at its purchase maximum stays put; exceeding stock rejects.
pub async fn increase(
    state: &AppState,
    identity: &Identity,
    item_id: Uuid,
) -> AppResult<ApiResponse<CartItem>> {
    let mut txn = state.pool.begin().await?;
    let item = locked_item(&mut txn, identity, item_id).await?;
    let product = load_product(state, item.product_id).await?;
    let accepted = stock::clamp(&product, item.quantity + 1)?;

    let item = if accepted != item.quantity {
        sqlx::query_as::<_, CartItem>(
            "UPDATE cart_items SET quantity = $2 WHERE id = $1 RETURNING *",
        )
        .bind(item.id)
        .bind(accepted)
        .fetch_one(&mut *txn)
        .await?
    } else {
        item
    };
    txn.commit().await?;

    Ok(ApiResponse::success("OK", item, None))
}

/// Drop the quantity by one, floored at 1. Going below one unit is only
/// reachable through removal.
pub async fn decrease(
    state: &AppState,
    identity: &Identity,
    item_id: Uuid,
) -> AppResult<ApiResponse<CartItem>> {
    let mut txn = state.pool.begin().await?;
    let item = locked_item(&mut txn, identity, item_id).await?;

    let item = if item.quantity > 1 {
        sqlx::query_as::<_, CartItem>(
            "UPDATE cart_items SET quantity = quantity - 1 WHERE id = $1 RETURNING *",
        )
        .bind(item.id)
        .fetch_one(&mut *txn)
        .await?
    } else {
        item
    };
    txn.commit().await?;

    Ok(ApiResponse::success("OK", item, None))
}

pub async fn remove(
    state: &AppState,
    identity: &Identity,
    item_id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let result = sqlx::query(
        r#"
        DELETE FROM cart_items
        WHERE id = $1
          AND user_id IS NOT DISTINCT FROM $2
          AND session_key IS NOT DISTINCT FROM $3
          AND NOT paid
        "#,
    )
    .bind(item_id)
    .bind(identity.user_id())
    .bind(identity.session_key())
    .execute(&state.pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }

    if let Err(err) = log_audit(
        &state.pool,
        identity.user_id(),
        "cart_remove",
        Some("cart_items"),
        Some(serde_json::json!({ "cart_item_id": item_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Removed from cart",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

/// Fold a guest cart into a user's cart after sign-in. Each product pair is
/// handled in its own transaction: quantities for a product present in both
/// carts are summed and capped at the purchase maximum and the guest row is
/// deleted; a product only the guest has is re-keyed to the user. A race
/// with a concurrent add from the freshly authenticated session is retried
/// once before surfacing a merge conflict.
pub async fn merge_guest_into_user(
    state: &AppState,
    session_key: &str,
    user_id: Uuid,
) -> AppResult<u64> {
    let guest_items: Vec<CartItem> = sqlx::query_as(
        "SELECT * FROM cart_items WHERE session_key = $1 AND NOT paid",
    )
    .bind(session_key)
    .fetch_all(&state.pool)
    .await?;

    if guest_items.is_empty() {
        return Ok(0);
    }

    let mut merged = 0u64;
    for item in &guest_items {
        let mut attempts = 0;
        loop {
            match merge_one(state, item, user_id).await {
                Ok(()) => break,
                Err(AppError::MergeConflict) if attempts == 0 => {
                    attempts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        merged += 1;
    }

    // Staged buy-now intents follow their owner.
    sqlx::query(
        "UPDATE pending_intents SET user_id = $2, session_key = NULL WHERE session_key = $1",
    )
    .bind(session_key)
    .bind(user_id)
    .execute(&state.pool)
    .await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user_id),
        "cart_merge",
        Some("cart_items"),
        Some(serde_json::json!({ "merged": merged })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(merged)
}

async fn merge_one(state: &AppState, guest_item: &CartItem, user_id: Uuid) -> AppResult<()> {
    let mut txn = state.pool.begin().await?;

    // The row may already be gone if a previous attempt or another worker
    // finished the merge.
    let guest: Option<CartItem> =
        sqlx::query_as("SELECT * FROM cart_items WHERE id = $1 AND NOT paid FOR UPDATE")
            .bind(guest_item.id)
            .fetch_optional(&mut *txn)
            .await?;
    let Some(guest) = guest else {
        return Ok(());
    };

    let user_row: Option<CartItem> = sqlx::query_as(
        r#"
        SELECT * FROM cart_items
        WHERE user_id = $1 AND product_id = $2 AND NOT paid
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .bind(guest.product_id)
    .fetch_optional(&mut *txn)
    .await?;

    if let Some(user_item) = user_row {
        let product = load_product(state, guest.product_id).await?;
        let combined = (user_item.quantity + guest.quantity).min(product.max_purchase);
        sqlx::query("UPDATE cart_items SET quantity = $2 WHERE id = $1")
            .bind(user_item.id)
            .bind(combined)
            .execute(&mut *txn)
            .await?;
        sqlx::query("DELETE FROM cart_items WHERE id = $1")
            .bind(guest.id)
            .execute(&mut *txn)
            .await?;
    } else {
        // Adopt the user's open basket when one exists so a single checkout
        // sweeps the whole cart.
        let open_basket: Option<(Uuid,)> = sqlx::query_as(
            "SELECT basket_no FROM cart_items WHERE user_id = $1 AND NOT paid LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&mut *txn)
        .await?;
        let basket_no = open_basket.map(|b| b.0).unwrap_or(guest.basket_no);

        sqlx::query(
            "UPDATE cart_items SET user_id = $2, session_key = NULL, basket_no = $3 WHERE id = $1",
        )
        .bind(guest.id)
        .bind(user_id)
        .bind(basket_no)
        .execute(&mut *txn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::MergeConflict
            } else {
                e.into()
            }
        })?;
    }

    txn.commit().await?;
    Ok(())
}
