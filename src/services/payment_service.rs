use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;

use crate::{
    dto::checkout::ShippingDetails,
    entity::payments::{
        ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments,
        Model as PaymentModel,
    },
    error::{AppError, AppResult},
    models::{Identity, PaymentRecord, PaymentStatus},
    state::AppState,
};

fn owner_condition(identity: &Identity) -> Condition {
    match identity {
        Identity::User(id) => Condition::all().add(PaymentCol::UserId.eq(*id)),
        Identity::Guest(key) => Condition::all().add(PaymentCol::SessionKey.eq(key.clone())),
    }
}

/// Open a new payment record in `initiated` state, snapshotting the amount
/// to charge. A principal may accumulate several initiated records over
/// time; resumption always goes through [`latest_unpaid`].
pub async fn open(
    state: &AppState,
    identity: &Identity,
    basket_no: Uuid,
    amount: i64,
    shipping_fee: i64,
    shipping: &ShippingDetails,
) -> AppResult<PaymentRecord> {
    let record = PaymentActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(identity.user_id()),
        session_key: Set(identity.session_key().map(str::to_string)),
        basket_no: Set(basket_no),
        amount: Set(amount),
        shipping_fee: Set(shipping_fee),
        gateway_reference: Set(None),
        status: Set(PaymentStatus::Initiated.as_str().to_string()),
        recipient_name: Set(shipping.recipient_name.clone()),
        phone: Set(shipping.phone.clone()),
        address: Set(shipping.address.clone()),
        city: Set(shipping.city.clone()),
        state: Set(shipping.state.clone()),
        postal_code: Set(shipping.postal_code.clone()),
        country: Set(shipping.country.clone()),
        paid_at: Set(None),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(payment_from_entity(record))
}

/// Record the gateway's session reference on a payment. Safe to call
/// repeatedly with the same value; a different value for a record that
/// already has one is refused, keeping the first reference.
pub async fn attach_gateway_reference(
    state: &AppState,
    payment_id: Uuid,
    reference: &str,
) -> AppResult<()> {
    let result = Payments::update_many()
        .col_expr(PaymentCol::GatewayReference, Expr::value(reference))
        .filter(PaymentCol::Id.eq(payment_id))
        .filter(
            Condition::any()
                .add(PaymentCol::GatewayReference.is_null())
                .add(PaymentCol::GatewayReference.eq(reference)),
        )
        .exec(&state.orm)
        .await?;

    if result.rows_affected > 0 {
        return Ok(());
    }

    match Payments::find_by_id(payment_id).one(&state.orm).await? {
        None => Err(AppError::PaymentRecordNotFound),
        Some(existing) => {
            tracing::warn!(
                %payment_id,
                existing = ?existing.gateway_reference,
                attempted = reference,
                "refusing to overwrite gateway reference"
            );
            Ok(())
        }
    }
}

/// Flip `initiated -> paid`. Returns `true` only for the call that actually
/// performs the transition; every later call is a no-op returning `false`.
/// The order materializer's exactly-once guarantee hangs on this.
///
/// Generic over the connection so the materializer can run the flip inside
/// its own transaction.
pub async fn mark_paid<C: ConnectionTrait>(conn: &C, payment_id: Uuid) -> AppResult<bool> {
    let result = Payments::update_many()
        .col_expr(PaymentCol::Status, Expr::value(PaymentStatus::Paid.as_str()))
        .col_expr(PaymentCol::PaidAt, Expr::value(Utc::now()))
        .filter(PaymentCol::Id.eq(payment_id))
        .filter(PaymentCol::Status.eq(PaymentStatus::Initiated.as_str()))
        .exec(conn)
        .await?;

    if result.rows_affected > 0 {
        return Ok(true);
    }
    if Payments::find_by_id(payment_id).one(conn).await?.is_none() {
        return Err(AppError::PaymentRecordNotFound);
    }
    Ok(false)
}

/// Flip `initiated -> failed`. A record that is already paid stays paid.
pub async fn mark_failed(state: &AppState, payment_id: Uuid) -> AppResult<bool> {
    let result = Payments::update_many()
        .col_expr(
            PaymentCol::Status,
            Expr::value(PaymentStatus::Failed.as_str()),
        )
        .filter(PaymentCol::Id.eq(payment_id))
        .filter(PaymentCol::Status.eq(PaymentStatus::Initiated.as_str()))
        .exec(&state.orm)
        .await?;

    Ok(result.rows_affected > 0)
}

pub async fn get(state: &AppState, payment_id: Uuid) -> AppResult<PaymentRecord> {
    Payments::find_by_id(payment_id)
        .one(&state.orm)
        .await?
        .map(payment_from_entity)
        .ok_or(AppError::PaymentRecordNotFound)
}

/// The record the redirect-path completion handler resumes from.
pub async fn latest_unpaid(
    state: &AppState,
    identity: &Identity,
) -> AppResult<Option<PaymentRecord>> {
    let record = Payments::find()
        .filter(owner_condition(identity))
        .filter(PaymentCol::Status.eq(PaymentStatus::Initiated.as_str()))
        .order_by_desc(PaymentCol::CreatedAt)
        .one(&state.orm)
        .await?;
    Ok(record.map(payment_from_entity))
}

pub async fn find_by_reference(
    state: &AppState,
    reference: &str,
) -> AppResult<Option<PaymentRecord>> {
    let record = Payments::find()
        .filter(PaymentCol::GatewayReference.eq(reference))
        .order_by_desc(PaymentCol::CreatedAt)
        .one(&state.orm)
        .await?;
    Ok(record.map(payment_from_entity))
}

pub async fn latest_for_basket(
    state: &AppState,
    basket_no: Uuid,
) -> AppResult<Option<PaymentRecord>> {
    let record = Payments::find()
        .filter(PaymentCol::BasketNo.eq(basket_no))
        .order_by_desc(PaymentCol::CreatedAt)
        .one(&state.orm)
        .await?;
    Ok(record.map(payment_from_entity))
}

pub fn payment_from_entity(model: PaymentModel) -> PaymentRecord {
    PaymentRecord {
        id: model.id,
        user_id: model.user_id,
        session_key: model.session_key,
        basket_no: model.basket_no,
        amount: model.amount,
        shipping_fee: model.shipping_fee,
        gateway_reference: model.gateway_reference,
        status: model.status,
        recipient_name: model.recipient_name,
        phone: model.phone,
        address: model.address,
        city: model.city,
        state: model.state,
        postal_code: model.postal_code,
        country: model.country,
        paid_at: model.paid_at.map(|dt| dt.with_timezone(&Utc)),
        created_at: model.created_at.with_timezone(&Utc),
    }
}
