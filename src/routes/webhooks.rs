use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};

use crate::{
    dto::webhook::WebhookAck,
    error::AppResult,
    response::ApiResponse,
    services::webhook_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/payment", post(payment_webhook))
}

/// Inbound gateway events. The raw body is needed for signature
/// verification, so this handler takes `Bytes` rather than a typed JSON
/// extractor.
#[utoipa::path(
    post,
    path = "/api/webhooks/payment",
    request_body(content = String, description = "Raw gateway event payload", content_type = "application/json"),
    responses(
        (status = 200, description = "Event acknowledged", body = ApiResponse<WebhookAck>),
        (status = 401, description = "Missing or invalid signature; nothing was processed"),
        (status = 400, description = "Unparseable payload"),
    ),
    tag = "Webhooks"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<ApiResponse<WebhookAck>>> {
    let signature = headers
        .get(webhook_service::SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let resp = webhook_service::ingest(&state, &body, signature).await?;
    Ok(Json(resp))
}
