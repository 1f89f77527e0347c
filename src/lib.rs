pub mod config;
pub mod fingerprint;
pub mod metrics;
pub mod profile;
pub mod query;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod upstream;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{RuntimeConfig, default_config_path};
use crate::metrics::ProxyMetrics;
use crate::profile::ProfileStore;
use crate::query::QueryEngine;
use crate::store::{CacheStore, MemoryEdgeCache, SqliteKvStore};
use crate::upstream::{HttpUpstream, ProviderTable, Upstream};

/// A fully wired proxy: configuration, stores, upstream client and the
/// decision engine built on top of them.
pub struct RabbitDns {
    config: RuntimeConfig,
    engine: QueryEngine,
    profiles: Option<ProfileStore>,
    metrics: Arc<ProxyMetrics>,
}

impl RabbitDns {
    /// Load configuration from the default path (or `config_path_override`)
    /// and wire the proxy against the real upstream client.
    pub fn bootstrap(config_path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path_override {
            Some(path) => path,
            None => default_config_path()?,
        };
        let config = RuntimeConfig::load_or_default(&config_path)?;
        info!(config = %config_path.display(), "Loaded rabbitdns configuration");
        Self::from_config(config)
    }

    pub fn from_config(config: RuntimeConfig) -> Result<Self> {
        let upstream = HttpUpstream::new(&config.upstream)?;
        Self::with_upstream(config, Arc::new(upstream))
    }

    pub fn with_upstream(config: RuntimeConfig, upstream: Arc<dyn Upstream>) -> Result<Self> {
        let metrics =
            Arc::new(ProxyMetrics::new().context("Failed to initialise rabbitdns metrics")?);
        let providers = ProviderTable::from_section(&config.upstream);

        // Only profiles need the durable tier; responses stay at the edge.
        let cache = open_store(&config, config.features.profiles)?;
        let profiles = config
            .features
            .profiles
            .then(|| ProfileStore::new(cache.clone(), config.profiles.clone()));

        let mut engine = QueryEngine::new(config.features, upstream, providers, metrics.clone());
        if config.features.caching {
            engine = engine.with_cache(cache, config.cache.response_ttl());
        }
        if let Some(profiles) = profiles.clone() {
            engine = engine.with_profiles(profiles);
        }

        info!(
            caching = config.features.caching,
            profiles = config.features.profiles,
            default_provider = %config.upstream.default_provider,
            "Initialised rabbitdns proxy"
        );

        Ok(Self {
            config,
            engine,
            profiles,
            metrics,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn profiles(&self) -> Option<&ProfileStore> {
        self.profiles.as_ref()
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub async fn serve(self) -> Result<()> {
        server::DohServer::new(self).run().await
    }
}

/// Open the profile store named by `config` directly, independent of the
/// `features.profiles` switch. Used by offline profile administration.
pub fn open_profile_store(config: &RuntimeConfig) -> Result<ProfileStore> {
    let cache = open_store(config, true)?;
    Ok(ProfileStore::new(cache, config.profiles.clone()))
}

fn open_store(config: &RuntimeConfig, durable: bool) -> Result<CacheStore> {
    let edge = Arc::new(MemoryEdgeCache::new(config.cache.edge_capacity));
    if !durable {
        return Ok(CacheStore::new(edge, None));
    }
    let path = config.cache.resolve_store_path()?;
    let kv = SqliteKvStore::open(&path)?;
    Ok(CacheStore::new(edge, Some(Arc::new(kv))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::tests::CountingUpstream;
    use axum::http::StatusCode;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.cache.store_path = Some(dir.join("store.sqlite"));
        config
    }

    #[test]
    fn bootstrap_reads_config_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("rabbitdns.toml");
        std::fs::write(
            &path,
            format!(
                "[cache]\nstore_path = {:?}\n",
                dir.path().join("store.sqlite").display().to_string()
            ),
        )?;
        let proxy = RabbitDns::bootstrap(Some(path))?;
        assert!(proxy.profiles().is_some());
        assert_eq!(proxy.config().server.doh_path, "/dns-query");
        Ok(())
    }

    #[test]
    fn disabling_profiles_skips_durable_store() -> Result<()> {
        let dir = tempdir()?;
        let mut config = config_in(dir.path());
        config.features.profiles = false;
        let proxy = RabbitDns::with_upstream(config, CountingUpstream::new(StatusCode::OK, b""))?;
        assert!(proxy.profiles().is_none());
        assert!(!dir.path().join("store.sqlite").exists());
        Ok(())
    }

    #[tokio::test]
    async fn profiles_persist_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let config = config_in(dir.path());
        let id = {
            let store = open_profile_store(&config)?;
            store
                .create(br#"{"blocked":["ads.example.com"]}"#)
                .await?
                .id()
                .to_string()
        };

        let reopened = open_profile_store(&config)?;
        let profile = reopened.lookup(&id).await?.expect("profile persisted");
        assert!(profile.blocks("ads.example.com"));
        Ok(())
    }
}
