//! Process-level wiring. One `SyncContext` is built at startup and passed by
//! reference to whatever consumes it; there are no ambient singletons and no
//! import-time side effects.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::info;
use sqlx::SqlitePool;

use crate::connectivity::ConnectivityMonitor;
use crate::db;
use crate::remote::RemoteClient;
use crate::sync::{DEFAULT_SYNC_INTERVAL, SyncEngine};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: String,
    pub api_base_url: String,
    /// Platform-reported connectivity at startup.
    pub start_online: bool,
    pub sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: "ironsync.db".to_string(),
            api_base_url: "http://localhost:8080".to_string(),
            start_online: true,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// The offline subsystem as one object: store, monitor, engine.
///
/// `open` fails only when the local store cannot be opened; callers should
/// treat that as "offline capability unavailable" and fall back to
/// online-only behavior rather than abort.
pub struct SyncContext {
    pub pool: SqlitePool,
    pub monitor: Arc<ConnectivityMonitor>,
    pub engine: Arc<SyncEngine>,
}

impl SyncContext {
    pub async fn open(config: &SyncConfig) -> Result<Self> {
        let pool = db::open(&config.db_path).await?;
        let monitor = ConnectivityMonitor::new(config.start_online, &config.api_base_url)?;
        let remote = RemoteClient::new_http(&config.api_base_url)?;
        let engine = SyncEngine::new(pool.clone(), remote, monitor.clone(), config.sync_interval);
        info!(
            "Sync context ready (store {}, api {})",
            config.db_path, config.api_base_url
        );
        Ok(Self {
            pool,
            monitor,
            engine,
        })
    }

    /// Begin background syncing (periodic timer + connectivity trigger).
    pub fn start(&self) {
        self.engine.start();
    }

    /// Tear down the triggers and close the store.
    pub async fn stop(&self) {
        self.engine.stop();
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_start_stop_lifecycle() {
        let path = std::env::temp_dir().join(format!("ironsync-ctx-{}.db", uuid::Uuid::new_v4()));
        let config = SyncConfig {
            db_path: path.to_str().unwrap().to_string(),
            start_online: false,
            ..SyncConfig::default()
        };

        let context = SyncContext::open(&config).await.unwrap();
        assert!(!context.monitor.is_online());

        context.start();
        context.start(); // idempotent
        context.stop().await;

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn open_fails_cleanly_on_bad_path() {
        let config = SyncConfig {
            db_path: "/definitely/not/a/writable/path/ironsync.db".to_string(),
            ..SyncConfig::default()
        };
        // The error is returned, not panicked; the caller degrades to
        // online-only mode.
        assert!(SyncContext::open(&config).await.is_err());
    }
}
