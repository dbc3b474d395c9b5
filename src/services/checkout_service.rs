use chrono::{Duration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::checkout::{BuyNowRequest, CheckoutRequest, CheckoutSessionDto},
    error::{AppError, AppResult},
    gateway::{CreateSessionRequest, SessionLineItem, SessionMetadata},
    models::{CartItem, Identity},
    response::{ApiResponse, Meta},
    services::{pricing, stock},
    state::AppState,
};

const BUY_NOW_TTL_MINUTES: i64 = 60;

#[derive(FromRow)]
struct SnapshotRow {
    id: Uuid,
    quantity: i32,
    product_id: Uuid,
    name: String,
    price: i64,
    sale_price: Option<i64>,
}

#[derive(FromRow)]
struct BuyNowIntent {
    product_id: Uuid,
}

/// Stage a single-product checkout: the cart row for the product is set to
/// the requested quantity and a transient, expiring intent scopes the next
/// checkout attempt to that product.
pub async fn buy_now(
    state: &AppState,
    identity: &Identity,
    payload: BuyNowRequest,
) -> AppResult<ApiResponse<CartItem>> {
    let quantity = payload.quantity.unwrap_or(1);
    let product: Option<crate::models::Product> =
        sqlx::query_as("SELECT * FROM products WHERE id = $1")
            .bind(payload.product_id)
            .fetch_optional(&state.pool)
            .await?;
    let product = product.ok_or_else(|| AppError::BadRequest("product not found".to_string()))?;
    if !product.available {
        return Err(AppError::BadRequest(
            "this product is currently unavailable".to_string(),
        ));
    }
    let accepted = stock::clamp(&product, quantity)?;

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

    // Buy-now restates the wanted quantity rather than accumulating.
    let cart_item = if let Some(item) = existing {
        sqlx::query_as::<_, CartItem>(
            "UPDATE cart_items SET quantity = $2 WHERE id = $1 RETURNING *",
        )
        .bind(item.id)
        .bind(accepted)
        .fetch_one(&mut *txn)
        .await?
    } else {
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
        .bind(Uuid::new_v4())
        .fetch_one(&mut *txn)
        .await?
    };

    sqlx::query(
        r#"
        DELETE FROM pending_intents
        WHERE user_id IS NOT DISTINCT FROM $1
          AND session_key IS NOT DISTINCT FROM $2
          AND kind = 'buy_now'
        "#,
    )
    .bind(identity.user_id())
    .bind(identity.session_key())
    .execute(&mut *txn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO pending_intents (id, user_id, session_key, kind, product_id, quantity, expires_at)
        VALUES ($1, $2, $3, 'buy_now', $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(identity.user_id())
    .bind(identity.session_key())
    .bind(payload.product_id)
    .bind(accepted)
    .bind(Utc::now() + Duration::minutes(BUY_NOW_TTL_MINUTES))
    .execute(&mut *txn)
    .await?;

    txn.commit().await?;

    Ok(ApiResponse::success("OK", cart_item, None))
}

/// Start a checkout attempt: snapshot the active cart under a fresh basket
/// number, open a payment record for the computed amount, and create a
/// hosted checkout session at the gateway. A gateway failure leaves the
/// payment record `initiated` and the cart intact; the attempt can simply
/// be repeated.
pub async fn initiate(
    state: &AppState,
    identity: &Identity,
    payload: CheckoutRequest,
) -> AppResult<ApiResponse<CheckoutSessionDto>> {
    let intent: Option<BuyNowIntent> = sqlx::query_as(
        r#"
        SELECT product_id FROM pending_intents
        WHERE user_id IS NOT DISTINCT FROM $1
          AND session_key IS NOT DISTINCT FROM $2
          AND kind = 'buy_now'
          AND expires_at > now()
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(identity.user_id())
    .bind(identity.session_key())
    .fetch_optional(&state.pool)
    .await?;

    let mut txn = state.pool.begin().await?;

    let mut sql = String::from(
        r#"
        SELECT ci.id, ci.quantity, p.id AS product_id, p.name, p.price, p.sale_price
        FROM cart_items ci
        JOIN products p ON p.id = ci.product_id
        WHERE ci.user_id IS NOT DISTINCT FROM $1
          AND ci.session_key IS NOT DISTINCT FROM $2
          AND NOT ci.paid
        "#,
    );
    if intent.is_some() {
        sql.push_str(" AND ci.product_id = $3");
    }
    sql.push_str(" ORDER BY ci.created_at FOR UPDATE OF ci");

    let mut query = sqlx::query_as::<_, SnapshotRow>(&sql)
        .bind(identity.user_id())
        .bind(identity.session_key());
    if let Some(intent) = &intent {
        query = query.bind(intent.product_id);
    }
    let snapshot = query.fetch_all(&mut *txn).await?;

    if snapshot.is_empty() {
        return Err(AppError::EmptyCart);
    }

    let subtotal: i64 = snapshot
        .iter()
        .map(|row| pricing::effective_price(row.price, row.sale_price) * row.quantity as i64)
        .sum();
    let totals = pricing::cart_totals(
        subtotal,
        state.config.vat_permille,
        state.config.shipping_flat_cents,
    );

    // A fresh basket number groups exactly the rows of this attempt; the
    // materializer later sweeps by it.
    let basket_no = Uuid::new_v4();
    let ids: Vec<Uuid> = snapshot.iter().map(|row| row.id).collect();
    sqlx::query("UPDATE cart_items SET basket_no = $1 WHERE id = ANY($2)")
        .bind(basket_no)
        .bind(&ids)
        .execute(&mut *txn)
        .await?;

    txn.commit().await?;

    let payment = super::payment_service::open(
        state,
        identity,
        basket_no,
        totals.total,
        totals.shipping,
        &payload.shipping,
    )
    .await?;

    let line_items: Vec<SessionLineItem> = snapshot
        .iter()
        .map(|row| SessionLineItem {
            name: row.name.clone(),
            unit_amount: pricing::effective_price(row.price, row.sale_price),
            quantity: row.quantity,
        })
        .collect();

    let session = state
        .gateway
        .create_session(&CreateSessionRequest {
            amount: totals.total,
            currency: "usd".to_string(),
            line_items,
            metadata: SessionMetadata {
                payment_id: payment.id,
                basket_no,
            },
            success_url: format!("{}/api/checkout/complete", state.config.public_base_url),
            cancel_url: format!("{}/api/cart", state.config.public_base_url),
        })
        .await
        .map_err(|e| {
            tracing::warn!(payment_id = %payment.id, error = %e, "gateway session creation failed");
            AppError::GatewayUnavailable(e.to_string())
        })?;

    super::payment_service::attach_gateway_reference(state, payment.id, &session.session_id)
        .await?;

    // The staged intent is consumed by a successful initiation.
    if intent.is_some() {
        sqlx::query(
            r#"
            DELETE FROM pending_intents
            WHERE user_id IS NOT DISTINCT FROM $1
              AND session_key IS NOT DISTINCT FROM $2
              AND kind = 'buy_now'
            "#,
        )
        .bind(identity.user_id())
        .bind(identity.session_key())
        .execute(&state.pool)
        .await?;
    }

    if let Err(err) = log_audit(
        &state.pool,
        identity.user_id(),
        "checkout_initiated",
        Some("payments"),
        Some(serde_json::json!({
            "payment_id": payment.id,
            "basket_no": basket_no,
            "amount": totals.total,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Checkout session created",
        CheckoutSessionDto {
            payment_id: payment.id,
            basket_no,
            amount: totals.total,
            redirect_url: session.redirect_url,
        },
        Some(Meta::empty()),
    ))
}
