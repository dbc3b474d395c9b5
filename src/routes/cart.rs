use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{delete, get, post},
};
use uuid::Uuid;

use crate::{
    dto::cart::{AddToCartRequest, CartView},
    error::AppResult,
    middleware::identity::Caller,
    models::{CartItem, Identity},
    response::ApiResponse,
    services::cart_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(cart_list))
        .route("/items", post(add_to_cart))
        .route("/items/{id}/inc", post(increase_quantity))
        .route("/items/{id}/dec", post(decrease_quantity))
        .route("/items/{id}", delete(remove_from_cart))
}

/// A signed-in request that still carries its pre-login guest session key
/// gets that guest cart folded in before the operation proceeds.
async fn merge_residual(state: &AppState, caller: &Caller) -> AppResult<()> {
    if let (Identity::User(user_id), Some(session_key)) =
        (&caller.identity, caller.residual_session.as_deref())
    {
        cart_service::merge_guest_into_user(state, session_key, *user_id).await?;
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/api/cart",
    responses(
        (status = 200, description = "Cart items and totals for the caller", body = ApiResponse<CartView>)
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn cart_list(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<ApiResponse<CartView>>> {
    merge_residual(&state, &caller).await?;
    let resp = cart_service::list_cart(&state, &caller.identity).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/api/cart/items",
    request_body = AddToCartRequest,
    responses(
        (status = 200, description = "Add to cart, accumulating with any existing row", body = ApiResponse<CartItem>),
        (status = 400, description = "Invalid quantity or unknown product"),
        (status = 409, description = "Requested quantity exceeds stock"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn add_to_cart(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<AddToCartRequest>,
) -> AppResult<Json<ApiResponse<CartItem>>> {
    merge_residual(&state, &caller).await?;
    let resp = cart_service::add_item(&state, &caller.identity, payload).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/api/cart/items/{id}/inc",
    params(("id" = Uuid, Path, description = "Cart item ID")),
    responses(
        (status = 200, description = "Quantity increased by one", body = ApiResponse<CartItem>),
        (status = 404, description = "Cart item not found"),
        (status = 409, description = "Stock exceeded"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn increase_quantity(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<CartItem>>> {
    let resp = cart_service::increase(&state, &caller.identity, id).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    post,
    path = "/api/cart/items/{id}/dec",
    params(("id" = Uuid, Path, description = "Cart item ID")),
    responses(
        (status = 200, description = "Quantity decreased by one, floored at 1", body = ApiResponse<CartItem>),
        (status = 404, description = "Cart item not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn decrease_quantity(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<CartItem>>> {
    let resp = cart_service::decrease(&state, &caller.identity, id).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    delete,
    path = "/api/cart/items/{id}",
    params(("id" = Uuid, Path, description = "Cart item ID")),
    responses(
        (status = 200, description = "Removed", body = ApiResponse<serde_json::Value>),
        (status = 404, description = "Cart item not found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn remove_from_cart(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<serde_json::Value>>> {
    let resp = cart_service::remove(&state, &caller.identity, id).await?;
    Ok(Json(resp))
}
