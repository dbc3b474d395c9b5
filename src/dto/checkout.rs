use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ShippingDetails {
    pub recipient_name: String,
    #[serde(default)]
    pub phone: String,
    pub address: String,
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub postal_code: String,
    pub country: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    #[serde(flatten)]
    pub shipping: ShippingDetails,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BuyNowRequest {
    pub product_id: Uuid,
    pub quantity: Option<i32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutSessionDto {
    pub payment_id: Uuid,
    pub basket_no: Uuid,
    /// Total charge in cents, as recorded on the payment ledger.
    pub amount: i64,
    pub redirect_url: String,
}
