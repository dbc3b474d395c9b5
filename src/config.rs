use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub public_base_url: String,
    pub gateway_url: Option<String>,
    pub gateway_timeout_secs: u64,
    pub webhook_secret: String,
    /// Flat VAT rate in permille of the subtotal, e.g. 75 for 7.5%.
    pub vat_permille: i64,
    pub shipping_flat_cents: i64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(3000);
        let public_base_url =
            env::var("PUBLIC_BASE_URL").unwrap_or_else(|_| format!("http://{host}:{port}"));
        let gateway_url = env::var("GATEWAY_URL").ok().filter(|s| !s.is_empty());
        let gateway_timeout_secs = env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10);
        let webhook_secret = env::var("GATEWAY_WEBHOOK_SECRET").unwrap_or_default();
        let vat_permille = env::var("VAT_PERMILLE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(75);
        let shipping_flat_cents = env::var("SHIPPING_FLAT_CENTS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        Ok(Self {
            database_url,
            host,
            port,
            public_base_url,
            gateway_url,
            gateway_timeout_secs,
            webhook_secret,
            vat_permille,
            shipping_flat_cents,
        })
    }
}
