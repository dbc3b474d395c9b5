use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};

use crate::{
    dto::{
        checkout::{BuyNowRequest, CheckoutRequest, CheckoutSessionDto},
        orders::OrderWithItems,
    },
    error::{AppError, AppResult},
    middleware::identity::Caller,
    models::{CartItem, Identity},
    response::{ApiResponse, Meta},
    services::{cart_service, checkout_service, order_service, payment_service},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/buy-now", post(buy_now))
        .route("/complete", get(complete))
}

async fn merge_residual(state: &AppState, caller: &Caller) -> AppResult<()> {
    if let (Identity::User(user_id), Some(session_key)) =
        (&caller.identity, caller.residual_session.as_deref())
    {
        cart_service::merge_guest_into_user(state, session_key, *user_id).await?;
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/api/checkout/sessions",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Gateway checkout session created", body = ApiResponse<CheckoutSessionDto>),
        (status = 400, description = "Cart is empty"),
        (status = 502, description = "Gateway unavailable; the attempt can be retried"),
    ),
    security(("bearer_auth" = [])),
    tag = "Checkout"
)]
pub async fn create_session(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CheckoutRequest>,
) -> AppResult<Json<ApiResponse<CheckoutSessionDto>>> {
    merge_residual(&state, &caller).await?;
    let resp = checkout_service::initiate(&state, &caller.identity, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/api/checkout/buy-now",
    request_body = BuyNowRequest,
    responses(
        (status = 200, description = "Buy-now intent staged", body = ApiResponse<CartItem>),
        (status = 409, description = "Stock exceeded"),
    ),
    security(("bearer_auth" = [])),
    tag = "Checkout"
)]
pub async fn buy_now(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<BuyNowRequest>,
) -> AppResult<Json<ApiResponse<CartItem>>> {
    let resp = checkout_service::buy_now(&state, &caller.identity, payload).await?;
    Ok(Json(resp))
}

/// Redirect-path completion: the browser lands here after the gateway's
/// hosted page. Resolves the caller's latest unpaid payment record and
/// drives the same idempotent materializer the webhook uses; whichever
/// path ran first, both see the same order.
#[utoipa::path(
    get,
    path = "/api/checkout/complete",
    responses(
        (status = 200, description = "The materialized order", body = ApiResponse<OrderWithItems>),
        (status = 404, description = "No pending payment for this caller"),
    ),
    security(("bearer_auth" = [])),
    tag = "Checkout"
)]
pub async fn complete(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<ApiResponse<OrderWithItems>>> {
    let payment = payment_service::latest_unpaid(&state, &caller.identity)
        .await?
        .ok_or(AppError::PaymentRecordNotFound)?;
    let order = order_service::materialize(&state, payment.id).await?;
    Ok(Json(ApiResponse::success(
        "Order created",
        order,
        Some(Meta::empty()),
    )))
}
