use std::time::Duration;

use conveyor_core::config::BrokerConfig;
use conveyor_core::{ConveyorError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Connection pool to the postgres broker.
#[derive(Clone)]
pub struct BrokerPool {
    pool: PgPool,
}

impl BrokerPool {
    /// Connect using the `[broker]` section.
    pub async fn from_config(config: &BrokerConfig) -> Result<Self> {
        Self::connect(&config.url, config.pool_size, config.pool_timeout()).await
    }

    pub async fn connect(url: &str, size: u32, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(size.max(1))
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| ConveyorError::Transport(format!("Failed to connect to broker: {}", e)))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ConveyorError::Transport(format!("Broker health check failed: {}", e)))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
