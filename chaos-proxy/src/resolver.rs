use crate::errors::ProxyError;
use crate::store::ConfigStore;
use crate::types::RoutingConfig;
use http::Request;
use http::header::HeaderName;
use std::sync::Arc;

/// Access key and the path to forward, as found on an inbound request.
#[derive(Debug, PartialEq, Eq)]
pub struct KeyedPath {
    pub key: String,
    pub path: String,
}

/// Finds the access key on a request.
///
/// The key header wins when present and the full path is forwarded. A header that is not
/// valid text yields no key at all. Otherwise the first
/// path segment is the key and the remainder is forwarded: `/{key}/rest` becomes `/rest`
/// and `/{key}` becomes `/`.
pub fn extract_key<B>(req: &Request<B>, key_header: &HeaderName) -> Option<KeyedPath> {
    let path = req.uri().path();

    if let Some(value) = req.headers().get(key_header) {
        // An unreadable header is a missing key, not a reason to look at the path.
        let key = value.to_str().ok()?.trim();
        if !key.is_empty() {
            return Some(KeyedPath {
                key: key.to_string(),
                path: path.to_string(),
            });
        }
    }

    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (key, rest) = match trimmed.split_once('/') {
        Some((key, rest)) => (key, format!("/{rest}")),
        None => (trimmed, "/".to_string()),
    };

    if key.is_empty() {
        return None;
    }

    Some(KeyedPath {
        key: key.to_string(),
        path: rest,
    })
}

/// Maps an access key to its active routing configuration.
#[derive(Clone)]
pub struct KeyResolver {
    store: Arc<dyn ConfigStore>,
}

impl KeyResolver {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, key: &str) -> Result<Arc<RoutingConfig>, ProxyError> {
        match self.store.get_config_by_key(key).await? {
            None => Err(ProxyError::KeyNotFound),
            Some(config) if !config.active => Err(ProxyError::KeyInactive),
            Some(config) => Ok(config),
        }
    }
}
