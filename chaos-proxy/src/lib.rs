mod admin_service;
pub mod chaos;
pub mod config;
pub mod errors;
pub mod forwarder;
pub mod metrics_defs;
mod proxy_service;
pub mod resolver;
pub mod sandbox;
pub mod selector;
pub mod store;
#[cfg(test)]
mod testutils;
pub mod types;
pub mod usage;

use admin_service::AdminService;
use errors::ProxyError;
use forwarder::HttpForwarder;
use http::header::HeaderName;
use proxy_service::ProxyService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;
use store::{CachedStore, ConfigStore, StaticStore};
use usage::SystemClock;

/// Name advertised in `Via` headers.
pub const PROXY_NAME: &str = "latency-poison";

/// Builds the store for the keys listed in `config`, behind the routing config cache
/// unless its TTL is 0.
pub fn build_store(config: &config::Config) -> Result<Arc<dyn ConfigStore>, ProxyError> {
    let store = StaticStore::from_config(config)?;

    Ok(match config.cache_ttl_secs {
        0 => Arc::new(store),
        ttl => Arc::new(CachedStore::new(store, Duration::from_secs(ttl))),
    })
}

/// Serves the proxy and admin listeners until either fails.
pub async fn run(config: config::Config, store: Arc<dyn ConfigStore>) -> Result<(), ProxyError> {
    config.validate()?;

    // The access key must never reach an upstream.
    let key_header = HeaderName::from_bytes(config.key_header.as_bytes())
        .map_err(|_| config::ValidationError::InvalidKeyHeader(config.key_header.clone()))?;
    let forwarder = HttpForwarder::new(
        Duration::from_secs(config.upstream_timeout_secs),
        vec![key_header],
    )?;

    let proxy_service = ProxyService::new(
        &config,
        store.clone(),
        Arc::new(forwarder),
        Arc::new(SystemClock),
    )?;
    let admin_service = AdminService::new(store);

    let proxy_task = run_http_service(&config.listener.host, config.listener.port, proxy_service);
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tokio::try_join!(proxy_task, admin_task)?;
    Ok(())
}
