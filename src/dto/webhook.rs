use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A signed event as delivered by the payment gateway.
#[derive(Debug, Deserialize)]
pub struct GatewayEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: GatewayEventData,
}

#[derive(Debug, Default, Deserialize)]
pub struct GatewayEventData {
    /// Gateway-side object id (checkout session or payment intent).
    pub id: Option<String>,
    #[serde(alias = "paymentIntentId", alias = "payment_intent")]
    pub payment_intent_id: Option<String>,
    #[serde(default)]
    pub metadata: GatewayEventMetadata,
}

/// Opaque metadata round-tripped through the gateway from session creation.
/// Absent on older flows, hence the by-reference and by-basket fallbacks.
#[derive(Debug, Default, Deserialize)]
pub struct GatewayEventMetadata {
    pub payment_id: Option<Uuid>,
    pub basket_no: Option<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_no: Option<String>,
}
