use std::sync::Arc;

use sqlx::SqlitePool;

use loft_core::catalog::MediaCatalog;
use loft_core::credentials::{CredentialStore, EncryptedFileStore};
use loft_core::registry::SourceRegistry;
use loft_core::scan::ScanEngine;
use loft_core::source::{BackendFactory, BackendProvider, BackendSettings};
use loft_core::thumbs::ThumbnailService;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub registry: Arc<SourceRegistry>,
    pub catalog: MediaCatalog,
    pub engine: Arc<ScanEngine>,
    pub thumbs: Arc<ThumbnailService>,
    pub provider: Arc<dyn BackendProvider>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub async fn new(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let credentials: Arc<dyn CredentialStore> =
            Arc::new(EncryptedFileStore::open(&config.data_dir).await?);
        let factory = BackendFactory::new(BackendSettings {
            smb: config.smb_settings(),
        });
        Self::with_parts(config, pool, factory, credentials).await
    }

    /// Wiring shared with the integration tests, which substitute a
    /// volatile credential store.
    pub async fn with_parts(
        config: &Config,
        pool: SqlitePool,
        factory: BackendFactory,
        credentials: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Self> {
        let provider: Arc<dyn BackendProvider> = Arc::new(factory.clone());
        let registry = Arc::new(SourceRegistry::new(pool.clone(), factory, credentials));
        let catalog = MediaCatalog::new(pool.clone());
        let engine = ScanEngine::new(pool.clone(), provider.clone());
        let thumbs = Arc::new(
            ThumbnailService::new(config.thumbnail_cache_dir.clone(), catalog.clone()).await?,
        );

        Ok(Self {
            pool,
            registry,
            catalog,
            engine,
            thumbs,
            provider,
        })
    }
}
