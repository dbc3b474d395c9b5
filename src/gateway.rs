use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Could not initialize gateway client: {0}")]
    Initialization(String),
    #[error("Gateway request failed: {0}")]
    Request(String),
    #[error("Gateway returned error {status}: {message}")]
    Response { status: u16, message: String },
    #[error("Could not deserialize gateway response: {0}")]
    Json(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionLineItem {
    pub name: String,
    /// Unit amount in cents.
    pub unit_amount: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub payment_id: Uuid,
    pub basket_no: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    /// Total charge in cents, as snapshotted by the payment ledger.
    pub amount: i64,
    pub currency: String,
    pub line_items: Vec<SessionLineItem>,
    pub metadata: SessionMetadata,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySession {
    pub session_id: String,
    pub redirect_url: String,
}

/// Client for the hosted-checkout payment gateway. When no GATEWAY_URL is
/// configured the client runs in sandbox mode and mints deterministic
/// sessions without any network traffic, which is what the integration
/// tests (and local development) run against.
pub enum GatewayClient {
    Http { client: Client, base_url: String },
    Sandbox { public_base_url: String },
}

impl GatewayClient {
    pub fn from_config(config: &AppConfig) -> Result<Self, GatewayError> {
        match &config.gateway_url {
            Some(url) => {
                let client = Client::builder()
                    .timeout(Duration::from_secs(config.gateway_timeout_secs))
                    .build()
                    .map_err(|e| GatewayError::Initialization(e.to_string()))?;
                Ok(GatewayClient::Http {
                    client,
                    base_url: url.trim_end_matches('/').to_string(),
                })
            }
            None => Ok(GatewayClient::Sandbox {
                public_base_url: config.public_base_url.clone(),
            }),
        }
    }

    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<GatewaySession, GatewayError> {
        match self {
            GatewayClient::Http { client, base_url } => {
                let url = format!("{base_url}/v1/checkout/sessions");
                tracing::debug!(%url, amount = request.amount, "creating gateway session");
                let response = client
                    .post(url)
                    .json(request)
                    .send()
                    .await
                    .map_err(|e| GatewayError::Request(e.to_string()))?;
                if response.status().is_success() {
                    response
                        .json::<GatewaySession>()
                        .await
                        .map_err(|e| GatewayError::Json(e.to_string()))
                } else {
                    let status = response.status().as_u16();
                    let message = response
                        .text()
                        .await
                        .map_err(|e| GatewayError::Request(e.to_string()))?;
                    Err(GatewayError::Response { status, message })
                }
            }
            GatewayClient::Sandbox { public_base_url } => {
                let payment_id = request.metadata.payment_id;
                Ok(GatewaySession {
                    session_id: format!("sandbox_{payment_id}"),
                    redirect_url: format!("{public_base_url}/sandbox/checkout/{payment_id}"),
                })
            }
        }
    }
}
