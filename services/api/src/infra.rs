use async_trait::async_trait;
use metrics_exporter_prometheus::PrometheusHandle;
use propsearch::config::{AppConfig, ConfigError};
use propsearch::error::AppError;
use propsearch::search::{
    normalize_address, Coordinates, HttpPropertyProvider, MemoryStore, OrchestratorConfig,
    PropertyDataProvider, ProviderError, ProviderLookup, SearchStore, SqliteStore, SystemClock,
};
use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Offline stand-in for the property-data API. Answers deterministically from the
/// address so repeated demos print the same figures.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DemoPropertyProvider;

#[async_trait]
impl PropertyDataProvider for DemoPropertyProvider {
    fn name(&self) -> &str {
        "demo"
    }

    async fn lookup(
        &self,
        address: &str,
        coordinates: Coordinates,
    ) -> Result<ProviderLookup, ProviderError> {
        let normalized = normalize_address(address);
        let has_street_number = normalized
            .split_whitespace()
            .next()
            .is_some_and(|token| token.chars().all(|c| c.is_ascii_digit()));
        if !has_street_number {
            return Ok(ProviderLookup::not_found("address not found"));
        }

        let seed = normalized
            .bytes()
            .fold(17u64, |acc, byte| acc.wrapping_mul(31).wrapping_add(u64::from(byte)));
        Ok(ProviderLookup::found(json!({
            "beds": 1 + seed % 5,
            "baths": 1 + seed % 3,
            "square_feet": 650 + seed % 2400,
            "year_built": 1900 + seed % 124,
            "estimated_value": 150_000 + (seed % 850) * 1_000,
            "latitude": coordinates.latitude,
            "longitude": coordinates.longitude,
        })))
    }
}

/// SQLite when `DATABASE_URL` is set, otherwise a process-local memory store.
pub(crate) async fn build_store(config: &AppConfig) -> Result<Arc<dyn SearchStore>, AppError> {
    match &config.storage.database_url {
        Some(url) => {
            let store = SqliteStore::connect(url).await?;
            info!(database = %url, "using sqlite search store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; credits and history are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Durable store for commands that must not silently fall back to memory.
pub(crate) async fn durable_store(config: &AppConfig) -> Result<SqliteStore, AppError> {
    let url = config
        .storage
        .database_url
        .as_deref()
        .ok_or(ConfigError::MissingDatabase)?;
    Ok(SqliteStore::connect(url).await?)
}

pub(crate) fn build_provider(
    config: &AppConfig,
) -> Result<Arc<dyn PropertyDataProvider>, AppError> {
    match HttpPropertyProvider::from_config(&config.provider)? {
        Some(provider) => {
            info!(base_url = ?config.provider.base_url, "using http property provider");
            Ok(Arc::new(provider))
        }
        None => {
            warn!("PROVIDER_BASE_URL not set; smart searches use the demo provider");
            Ok(Arc::new(DemoPropertyProvider))
        }
    }
}

pub(crate) fn orchestrator_config(config: &AppConfig) -> OrchestratorConfig {
    OrchestratorConfig {
        provider_timeout: config.provider.timeout,
        duplicate_window: Duration::from_secs(config.search.duplicate_window_secs),
        clock: Arc::new(SystemClock),
    }
}
