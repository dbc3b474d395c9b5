use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{OrderList, OrderWithItems, UpdateOrderStatusRequest},
    entity::{
        cart_items::{Column as CartCol, Entity as CartItems},
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{
            ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel,
        },
        products::{Column as ProdCol, Entity as Products},
    },
    error::{AppError, AppResult},
    middleware::identity::{AuthUser, ensure_admin},
    models::{Identity, Order, OrderItem, OrderStatus, PaymentRecord, PaymentStatus},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    services::{payment_service, pricing},
    state::AppState,
};

const MATERIALIZE_ATTEMPTS: u32 = 5;
const MATERIALIZE_BACKOFF: Duration = Duration::from_millis(50);

/// Turn a paid payment record and its cart snapshot into a durable order,
/// exactly once. Both completion paths (the browser redirect and the
/// gateway webhook) enter here, possibly concurrently for the same payment.
///
/// Whoever actually flips the record `initiated -> paid` creates the order
/// inside the same transaction; every other caller observes the existing
/// order and returns it unchanged. The unique constraint on
/// `orders.payment_id` backstops any race that slips past the flip.
pub async fn materialize(state: &AppState, payment_id: Uuid) -> AppResult<OrderWithItems> {
    for attempt in 0..MATERIALIZE_ATTEMPTS {
        let payment = payment_service::get(state, payment_id).await?;

        // The common case when the webhook races the redirect: the other
        // path already materialized, return its order unchanged.
        if let Some(existing) = find_by_payment(state, payment_id).await? {
            if attempt > 0 {
                tracing::debug!(%payment_id, "lost the materialization race, returning existing order");
            }
            return Ok(existing);
        }

        if payment.status == PaymentStatus::Failed.as_str() {
            return Err(AppError::BadRequest(
                "payment record is marked failed".to_string(),
            ));
        }

        match try_materialize(state, &payment).await {
            Ok(order) => {
                if let Err(err) = log_audit(
                    &state.pool,
                    payment.user_id,
                    "order_materialized",
                    Some("orders"),
                    Some(serde_json::json!({
                        "order_id": order.order.id,
                        "order_no": order.order.order_no,
                        "payment_id": payment_id,
                    })),
                )
                .await
                {
                    tracing::warn!(error = %err, "audit log failed");
                }
                return Ok(order);
            }
            // A concurrent caller holds the flip or won the insert; give it
            // a moment to commit, then observe its order.
            Err(AppError::Conflict(reason)) => {
                tracing::debug!(%payment_id, %reason, "materialization attempt lost, backing off");
                tokio::time::sleep(MATERIALIZE_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(AppError::Conflict(
        "order materialization contended, retry".to_string(),
    ))
}

async fn try_materialize(state: &AppState, payment: &PaymentRecord) -> AppResult<OrderWithItems> {
    let txn = state.orm.begin().await?;

    // The monotonic flip is the admission ticket: exactly one caller per
    // payment record gets `true`. Running it inside the transaction means a
    // crash before commit releases the ticket rather than wedging the record.
    let flipped = payment_service::mark_paid(&txn, payment.id).await?;
    if !flipped {
        txn.rollback().await?;
        return Err(AppError::Conflict(
            "payment is being processed by a concurrent caller".to_string(),
        ));
    }

    let owner = match (payment.user_id, payment.session_key.as_deref()) {
        (Some(user_id), _) => Condition::all().add(CartCol::UserId.eq(user_id)),
        (None, Some(key)) => Condition::all().add(CartCol::SessionKey.eq(key)),
        (None, None) => {
            txn.rollback().await?;
            return Err(AppError::Internal(anyhow::anyhow!(
                "payment record {} has no owner",
                payment.id
            )));
        }
    };

    let cart_rows = CartItems::find()
        .filter(owner)
        .filter(CartCol::BasketNo.eq(payment.basket_no))
        .filter(CartCol::Paid.eq(false))
        .lock(LockType::Update)
        .all(&txn)
        .await?;

    let product_ids: Vec<Uuid> = cart_rows.iter().map(|row| row.product_id).collect();
    let products = Products::find()
        .filter(ProdCol::Id.is_in(product_ids))
        .lock(LockType::Update)
        .all(&txn)
        .await?;
    let unit_prices: HashMap<Uuid, i64> = products
        .iter()
        .map(|p| (p.id, pricing::effective_price(p.price, p.sale_price)))
        .collect();

    let subtotal: i64 = cart_rows
        .iter()
        .map(|row| unit_prices.get(&row.product_id).copied().unwrap_or(0) * row.quantity as i64)
        .sum();
    let totals = pricing::cart_totals(subtotal, state.config.vat_permille, payment.shipping_fee);
    if totals.total != payment.amount {
        // The ledger snapshot stays authoritative for what was charged;
        // flag the divergence for reconciliation.
        tracing::warn!(
            payment_id = %payment.id,
            ledger_amount = payment.amount,
            materialized_total = totals.total,
            "ledger amount and materialized cart total diverge"
        );
    }

    let order_no = generate_order_no(&txn).await?;
    let order = OrderActive {
        id: Set(Uuid::new_v4()),
        order_no: Set(order_no),
        payment_id: Set(payment.id),
        customer_id: Set(payment.user_id),
        session_key: Set(payment.session_key.clone()),
        subtotal: Set(totals.subtotal),
        tax: Set(totals.vat),
        shipping: Set(totals.shipping),
        total: Set(totals.total),
        status: Set(OrderStatus::Processing.as_str().to_string()),
        shipping_address: Set(shipping_address(payment)),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await
    .map_err(|e| match e.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            AppError::Conflict("an order for this payment already exists".to_string())
        }
        _ => AppError::OrmError(e),
    })?;

    let mut items = Vec::with_capacity(cart_rows.len());
    for row in &cart_rows {
        let unit_price = unit_prices.get(&row.product_id).copied().unwrap_or(0);
        let item = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(row.product_id),
            quantity: Set(row.quantity),
            unit_price: Set(unit_price),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
        items.push(order_item_from_entity(item));

        Products::update_many()
            .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).sub(row.quantity))
            .filter(ProdCol::Id.eq(row.product_id))
            .exec(&txn)
            .await?;
    }

    // Retire the snapshot.
    let cart_ids: Vec<Uuid> = cart_rows.iter().map(|row| row.id).collect();
    if !cart_ids.is_empty() {
        CartItems::delete_many()
            .filter(CartCol::Id.is_in(cart_ids))
            .exec(&txn)
            .await?;
    }

    txn.commit().await?;

    Ok(OrderWithItems {
        order: order_from_entity(order),
        items,
    })
}

async fn find_by_payment(state: &AppState, payment_id: Uuid) -> AppResult<Option<OrderWithItems>> {
    let order = Orders::find()
        .filter(OrderCol::PaymentId.eq(payment_id))
        .one(&state.orm)
        .await?;
    let Some(order) = order else {
        return Ok(None);
    };

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    Ok(Some(OrderWithItems {
        order: order_from_entity(order),
        items,
    }))
}

async fn generate_order_no<C: ConnectionTrait>(conn: &C) -> AppResult<String> {
    for _ in 0..5 {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect::<String>()
            .to_uppercase();
        let candidate = format!("SO-{suffix}");
        let taken = Orders::find()
            .filter(OrderCol::OrderNo.eq(candidate.clone()))
            .count(conn)
            .await?;
        if taken == 0 {
            return Ok(candidate);
        }
    }
    Err(AppError::Internal(anyhow::anyhow!(
        "could not generate a unique order number"
    )))
}

fn shipping_address(payment: &PaymentRecord) -> String {
    [
        payment.address.as_str(),
        payment.city.as_str(),
        payment.state.as_str(),
        payment.postal_code.as_str(),
        payment.country.as_str(),
    ]
    .iter()
    .filter(|part| !part.is_empty())
    .copied()
    .collect::<Vec<_>>()
    .join(", ")
}

fn owner_condition(identity: &Identity) -> Condition {
    match identity {
        Identity::User(id) => Condition::all().add(OrderCol::CustomerId.eq(*id)),
        Identity::Guest(key) => Condition::all().add(OrderCol::SessionKey.eq(key.clone())),
    }
}

pub async fn list_orders(
    state: &AppState,
    identity: &Identity,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = owner_condition(identity);
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(OrderCol::Status.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_from_entity)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Ok",
        OrderList { items: orders },
        Some(meta),
    ))
}

pub async fn get_order(
    state: &AppState,
    identity: &Identity,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find()
        .filter(owner_condition(identity))
        .filter(OrderCol::Id.eq(id))
        .one(&state.orm)
        .await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems {
            order: order_from_entity(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

/// Append-only status transition, driven by the logistics collaborator.
pub async fn update_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderStatusRequest,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;
    let next = OrderStatus::parse(&payload.status)?;

    let txn = state.orm.begin().await?;
    let existing = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?;
    let existing = match existing {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let current = OrderStatus::parse(&existing.status)?;
    if current.is_terminal() {
        return Err(AppError::BadRequest(format!(
            "order is {} and can no longer change",
            current.as_str()
        )));
    }
    if !current.can_transition_to(next) {
        return Err(AppError::BadRequest(format!(
            "cannot transition order from {} to {}",
            current.as_str(),
            next.as_str()
        )));
    }

    let mut active: OrderActive = existing.into();
    active.status = Set(next.as_str().to_string());
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;
    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_status_update",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "status": order.status })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order updated",
        order_from_entity(order),
        Some(Meta::empty()),
    ))
}

pub fn order_from_entity(model: OrderModel) -> Order {
    Order {
        id: model.id,
        order_no: model.order_no,
        payment_id: model.payment_id,
        customer_id: model.customer_id,
        subtotal: model.subtotal,
        tax: model.tax,
        shipping: model.shipping,
        total: model.total,
        status: model.status,
        shipping_address: model.shipping_address,
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    }
}

pub fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        quantity: model.quantity,
        unit_price: model.unit_price,
        created_at: model.created_at.with_timezone(&Utc),
    }
}
