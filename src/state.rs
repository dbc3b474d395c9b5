use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::{DbPool, OrmConn},
    gateway::GatewayClient,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub orm: OrmConn,
    pub gateway: Arc<GatewayClient>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(pool: DbPool, orm: OrmConn, gateway: GatewayClient, config: AppConfig) -> Self {
        Self {
            pool,
            orm,
            gateway: Arc::new(gateway),
            config: Arc::new(config),
        }
    }
}
