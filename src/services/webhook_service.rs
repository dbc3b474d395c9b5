use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{
    dto::webhook::{GatewayEventData, WebhookAck},
    error::{AppError, AppResult},
    models::PaymentRecord,
    response::{ApiResponse, Meta},
    services::{order_service, payment_service},
    state::AppState,
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Check the hex-encoded HMAC-SHA256 of the raw body against the shared
/// webhook secret. Comparison happens in constant time. This runs before
/// anything is parsed; a request that fails here has no side effects.
pub fn verify_signature(secret: &str, payload: &[u8], signature_hex: &str) -> AppResult<()> {
    if secret.is_empty() {
        tracing::error!("webhook secret is not configured; rejecting event");
        return Err(AppError::SignatureInvalid);
    }
    let signature = hex::decode(signature_hex.trim()).map_err(|_| AppError::SignatureInvalid)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AppError::SignatureInvalid)?;
    mac.update(payload);
    mac.verify_slice(&signature)
        .map_err(|_| AppError::SignatureInvalid)
}

/// Resolve the payment record an event refers to. Metadata carries the
/// payment id on current flows; older sessions only carry the gateway
/// reference, and the basket number is the last resort.
async fn resolve_payment(
    state: &AppState,
    data: &GatewayEventData,
) -> AppResult<Option<PaymentRecord>> {
    if let Some(payment_id) = data.metadata.payment_id {
        match payment_service::get(state, payment_id).await {
            Ok(payment) => return Ok(Some(payment)),
            Err(AppError::PaymentRecordNotFound) => {}
            Err(e) => return Err(e),
        }
    }

    for reference in [data.payment_intent_id.as_deref(), data.id.as_deref()]
        .into_iter()
        .flatten()
    {
        if let Some(payment) = payment_service::find_by_reference(state, reference).await? {
            return Ok(Some(payment));
        }
    }

    if let Some(basket_no) = data.metadata.basket_no {
        return payment_service::latest_for_basket(state, basket_no).await;
    }

    Ok(None)
}

fn ack(outcome: impl Into<String>, order_no: Option<String>) -> ApiResponse<WebhookAck> {
    ApiResponse::success(
        "OK",
        WebhookAck {
            received: true,
            outcome: outcome.into(),
            order_no,
        },
        Some(Meta::empty()),
    )
}

/// Verify, parse, and process one gateway event.
///
/// Processing failures after a valid signature are logged and acknowledged
/// so the gateway stops retrying; idempotency lives in the materializer, so
/// a redelivered event is always safe. Only a bad signature or an
/// unparseable body is refused.
pub async fn ingest(
    state: &AppState,
    payload: &[u8],
    signature: Option<&str>,
) -> AppResult<ApiResponse<WebhookAck>> {
    let signature = signature.ok_or(AppError::SignatureInvalid)?;
    verify_signature(&state.config.webhook_secret, payload, signature)?;

    let event: crate::dto::webhook::GatewayEvent = serde_json::from_slice(payload)
        .map_err(|e| AppError::BadRequest(format!("malformed webhook payload: {e}")))?;

    match event.event_type.as_str() {
        "checkout.session.completed" | "payment_intent.succeeded" => {
            let payment = match resolve_payment(state, &event.data).await {
                Ok(Some(payment)) => payment,
                Ok(None) => {
                    // Nothing a gateway retry would fix.
                    tracing::warn!(
                        event_type = %event.event_type,
                        reference = ?event.data.id,
                        "payment record not found for webhook event"
                    );
                    return Ok(ack("payment record not found", None));
                }
                Err(e) => {
                    tracing::error!(error = %e, "payment lookup failed while ingesting webhook");
                    return Ok(ack("lookup failed", None));
                }
            };

            // Keep the reference current for later by-reference lookups.
            if let Some(reference) = event
                .data
                .payment_intent_id
                .as_deref()
                .or(event.data.id.as_deref())
            {
                if let Err(e) =
                    payment_service::attach_gateway_reference(state, payment.id, reference).await
                {
                    tracing::warn!(error = %e, payment_id = %payment.id, "could not attach gateway reference");
                }
            }

            match order_service::materialize(state, payment.id).await {
                Ok(order) => Ok(ack("processed", Some(order.order.order_no))),
                Err(AppError::PaymentRecordNotFound) => Ok(ack("payment record not found", None)),
                Err(e) => {
                    tracing::error!(error = %e, payment_id = %payment.id, "webhook materialization failed");
                    Ok(ack("processing failed", None))
                }
            }
        }
        "payment_intent.payment_failed" => {
            match resolve_payment(state, &event.data).await {
                Ok(Some(payment)) => {
                    let flipped = payment_service::mark_failed(state, payment.id).await?;
                    if !flipped {
                        tracing::info!(payment_id = %payment.id, "failure event for a non-initiated payment, ignored");
                    }
                }
                Ok(None) => {
                    tracing::warn!(reference = ?event.data.id, "failure event for unknown payment");
                }
                Err(e) => {
                    tracing::error!(error = %e, "payment lookup failed for failure event");
                }
            }
            Ok(ack("failure recorded", None))
        }
        other => {
            tracing::debug!(event_type = %other, "ignoring unhandled webhook event type");
            Ok(ack("ignored", None))
        }
    }
}
