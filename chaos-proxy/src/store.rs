//! Read access to routing configurations and the usage sink, as provided by the
//! persistence layer.

use crate::config::{Config, ValidationError};
use crate::errors::StoreError;
use crate::metrics_defs::{CONFIG_CACHE_HIT, CONFIG_CACHE_MISS};
use crate::types::{KeyId, RoutingConfig, TargetId};
use crate::usage::{UsageReport, UsageStats};
use async_trait::async_trait;
use moka::sync::Cache;
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const CACHE_SIZE: u64 = 10_000;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Returns the configuration for `key`, active or not.
    async fn get_config_by_key(&self, key: &str)
    -> Result<Option<Arc<RoutingConfig>>, StoreError>;

    async fn increment_usage(
        &self,
        key_id: &str,
        target_id: Option<&str>,
        at: SystemTime,
    ) -> Result<(), StoreError>;

    async fn usage(&self, _key_id: &str) -> Result<Option<UsageReport>, StoreError> {
        Ok(None)
    }

    fn is_ready(&self) -> bool {
        true
    }
}

struct Entry {
    config: Arc<RoutingConfig>,
    usage: UsageStats,
    targets: HashMap<TargetId, UsageStats>,
}

/// Store backed by the keys listed in the configuration file.
///
/// The maps are fixed at construction, so lookups take no lock and counters are plain
/// atomics per entry.
pub struct StaticStore {
    by_key: HashMap<String, Arc<Entry>>,
    by_id: HashMap<KeyId, Arc<Entry>>,
}

impl StaticStore {
    pub fn new(configs: Vec<RoutingConfig>) -> Self {
        let mut by_key = HashMap::new();
        let mut by_id = HashMap::new();

        for config in configs {
            let targets = config
                .targets()
                .iter()
                .map(|t| (t.id.clone(), UsageStats::default()))
                .collect();
            let entry = Arc::new(Entry {
                config: Arc::new(config),
                usage: UsageStats::default(),
                targets,
            });
            by_key.insert(entry.config.key.clone(), entry.clone());
            by_id.insert(entry.config.id.clone(), entry);
        }

        StaticStore { by_key, by_id }
    }

    pub fn from_config(config: &Config) -> Result<Self, ValidationError> {
        Ok(Self::new(config.routing_configs()?))
    }
}

#[async_trait]
impl ConfigStore for StaticStore {
    async fn get_config_by_key(
        &self,
        key: &str,
    ) -> Result<Option<Arc<RoutingConfig>>, StoreError> {
        Ok(self.by_key.get(key).map(|entry| entry.config.clone()))
    }

    async fn increment_usage(
        &self,
        key_id: &str,
        target_id: Option<&str>,
        at: SystemTime,
    ) -> Result<(), StoreError> {
        let entry = self
            .by_id
            .get(key_id)
            .ok_or_else(|| StoreError::UnknownKey(key_id.to_string()))?;

        entry.usage.record(at);

        if let Some(target_id) = target_id {
            entry
                .targets
                .get(target_id)
                .ok_or_else(|| StoreError::UnknownTarget(target_id.to_string()))?
                .record(at);
        }
        Ok(())
    }

    async fn usage(&self, key_id: &str) -> Result<Option<UsageReport>, StoreError> {
        Ok(self.by_id.get(key_id).map(|entry| UsageReport {
            key_id: key_id.to_string(),
            usage: entry.usage.snapshot(),
            targets: entry
                .targets
                .iter()
                .map(|(id, stats)| (id.clone(), stats.snapshot()))
                .collect(),
        }))
    }
}

/// Read-through cache in front of another store. Misses are cached too, so unknown keys
/// don't hit the backing store on every request.
pub struct CachedStore<S> {
    inner: S,
    cache: Cache<String, Option<Arc<RoutingConfig>>>,
}

impl<S: ConfigStore> CachedStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(CACHE_SIZE)
            .time_to_live(ttl)
            .build();

        CachedStore { inner, cache }
    }
}

#[async_trait]
impl<S: ConfigStore> ConfigStore for CachedStore<S> {
    async fn get_config_by_key(
        &self,
        key: &str,
    ) -> Result<Option<Arc<RoutingConfig>>, StoreError> {
        if let Some(cached) = self.cache.get(key) {
            counter!(CONFIG_CACHE_HIT).increment(1);
            return Ok(cached);
        }
        counter!(CONFIG_CACHE_MISS).increment(1);

        let config = self.inner.get_config_by_key(key).await?;
        self.cache.insert(key.to_string(), config.clone());
        Ok(config)
    }

    async fn increment_usage(
        &self,
        key_id: &str,
        target_id: Option<&str>,
        at: SystemTime,
    ) -> Result<(), StoreError> {
        self.inner.increment_usage(key_id, target_id, at).await
    }

    async fn usage(&self, key_id: &str) -> Result<Option<UsageReport>, StoreError> {
        self.inner.usage(key_id).await
    }

    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{direct_config, tunnel_config};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::UNIX_EPOCH;

    struct CountingStore {
        inner: StaticStore,
        lookups: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ConfigStore for CountingStore {
        async fn get_config_by_key(
            &self,
            key: &str,
        ) -> Result<Option<Arc<RoutingConfig>>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Unavailable("down".into()));
            }
            self.inner.get_config_by_key(key).await
        }

        async fn increment_usage(
            &self,
            key_id: &str,
            target_id: Option<&str>,
            at: SystemTime,
        ) -> Result<(), StoreError> {
            self.inner.increment_usage(key_id, target_id, at).await
        }
    }

    #[tokio::test]
    async fn test_static_store_lookup() {
        let store = StaticStore::new(vec![tunnel_config(), direct_config("http://127.0.0.1:1")]);

        let config = store.get_config_by_key("lp_tunnel").await.unwrap().unwrap();
        assert_eq!(config.id, "tunnel");
        assert!(store.get_config_by_key("tunnel").await.unwrap().is_none());
        assert!(store.get_config_by_key("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_static_store_usage() {
        let store = StaticStore::new(vec![tunnel_config()]);
        let at = UNIX_EPOCH + Duration::from_millis(1_234);

        store.increment_usage("tunnel", Some("api"), at).await.unwrap();
        store.increment_usage("tunnel", None, at).await.unwrap();

        let report = store.usage("tunnel").await.unwrap().unwrap();
        assert_eq!(report.usage.requests, 2);
        assert_eq!(report.usage.last_used_at_ms, Some(1_234));
        assert_eq!(report.targets["api"].requests, 1);
        assert_eq!(report.targets["api-v1"].requests, 0);

        assert!(matches!(
            store.increment_usage("missing", None, at).await,
            Err(StoreError::UnknownKey(_))
        ));
        assert!(matches!(
            store.increment_usage("tunnel", Some("missing"), at).await,
            Err(StoreError::UnknownTarget(_))
        ));
        assert!(store.usage("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cached_store() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let store = CachedStore::new(
            CountingStore {
                inner: StaticStore::new(vec![tunnel_config()]),
                lookups: lookups.clone(),
                fail: false,
            },
            Duration::from_secs(60),
        );

        for _ in 0..3 {
            assert!(store.get_config_by_key("lp_tunnel").await.unwrap().is_some());
            assert!(store.get_config_by_key("missing").await.unwrap().is_none());
        }
        // one lookup per distinct key, hits and misses both cached
        assert_eq!(lookups.load(Ordering::SeqCst), 2);

        store
            .increment_usage("tunnel", None, SystemTime::now())
            .await
            .unwrap();
        assert_eq!(
            store.usage("tunnel").await.unwrap().map(|r| r.usage.requests),
            None,
            "counting store does not report usage"
        );
    }

    #[tokio::test]
    async fn test_cached_store_does_not_cache_errors() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let store = CachedStore::new(
            CountingStore {
                inner: StaticStore::new(vec![]),
                lookups: lookups.clone(),
                fail: true,
            },
            Duration::from_secs(60),
        );

        assert!(store.get_config_by_key("lp_tunnel").await.is_err());
        assert!(store.get_config_by_key("lp_tunnel").await.is_err());
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
    }
}
