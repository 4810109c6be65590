//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::error::Result;
use crate::transfer::TransferEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    engine: TransferEngine,
}

impl AppState {
    /// Build the transfer engine over `db` and wrap it for the router
    pub async fn new(config: Config, db: SqlitePool) -> Result<Self> {
        let engine = TransferEngine::new(config.engine.clone(), db.clone()).await?;
        Ok(Self::with_engine(config, db, engine))
    }

    pub fn with_engine(config: Config, db: SqlitePool, engine: TransferEngine) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, db, engine }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.inner.engine
    }
}
