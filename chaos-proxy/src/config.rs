use crate::chaos::ChaosConfig;
use crate::types::{RoutingConfig, RoutingMode, Target};
use http::header::HeaderName;
use http::Method;
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Invalid key header name: {0}")]
    InvalidKeyHeader(String),

    #[error("Upstream timeout must be greater than zero")]
    InvalidUpstreamTimeout,

    #[error("Empty key id")]
    EmptyKeyId,

    #[error("Empty access key for {0}")]
    EmptyKey(String),

    #[error("Duplicate key id: {0}")]
    DuplicateKeyId(String),

    #[error("Duplicate access key for {0}")]
    DuplicateKey(String),

    #[error("Key {0} must set exactly one of target_url or targets")]
    AmbiguousMode(String),

    #[error("Invalid target url for {0}: {1}")]
    InvalidTargetUrl(String, String),

    #[error("Duplicate target id {1} in key {0}")]
    DuplicateTargetId(String, String),

    #[error("Empty target host for {0}")]
    EmptyTargetHost(String),

    #[error("Invalid method for {0}: {1}")]
    InvalidMethod(String, String),

    #[error("min_latency {min} is greater than max_latency {max}")]
    InvalidLatencyRange { min: u64, max: u64 },

    #[error("failure_percentage {0} is greater than 100")]
    InvalidFailurePercentage(u8),

    #[error("error code {0} is not a valid HTTP status")]
    InvalidErrorCode(u16),
}

/// Proxy configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for proxied traffic
    pub listener: Listener,
    /// Listener for health, readiness and usage endpoints
    pub admin_listener: Listener,
    /// Header carrying the access key. Without it the first path segment is the key.
    #[serde(default = "default_key_header")]
    pub key_header: String,
    /// Upper bound on the full upstream round trip, body included.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// Largest inbound body the proxy buffers before forwarding.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// TTL of the read-through routing config cache. 0 disables caching.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Seed for reproducible chaos decisions.
    #[serde(default)]
    pub chaos_seed: Option<u64>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Access keys served by the in-memory store.
    #[serde(default)]
    pub keys: Vec<AccessKeyConfig>,
}

fn default_key_header() -> String {
    "x-api-key".into()
}

fn default_upstream_timeout_secs() -> u64 {
    10
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_cache_ttl_secs() -> u64 {
    5
}

impl Config {
    /// Validates the proxy configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        HeaderName::from_bytes(self.key_header.as_bytes())
            .map_err(|_| ValidationError::InvalidKeyHeader(self.key_header.clone()))?;

        if self.upstream_timeout_secs == 0 {
            return Err(ValidationError::InvalidUpstreamTimeout);
        }

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for key in &self.keys {
            key.validate()?;

            if !ids.insert(&key.id) {
                return Err(ValidationError::DuplicateKeyId(key.id.clone()));
            }
            if !keys.insert(&key.key) {
                return Err(ValidationError::DuplicateKey(key.id.clone()));
            }
        }

        Ok(())
    }

    /// Validates and converts the configured keys into routing configs.
    pub fn routing_configs(&self) -> Result<Vec<RoutingConfig>, ValidationError> {
        self.validate()?;
        self.keys.iter().cloned().map(RoutingConfig::try_from).collect()
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SandboxConfig {
    /// Serves `/sandbox` without an access key when set.
    #[serde(default)]
    pub enabled: bool,
}

/// One access key as written in the configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AccessKeyConfig {
    pub id: String,
    pub key: String,
    pub owner_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Allowed method for direct keys. Absent or "ANY" allows all methods.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub defaults: ChaosConfig,
    /// Direct mode: every request goes to this URL.
    #[serde(default)]
    pub target_url: Option<Url>,
    /// Tunnel mode: requests are routed by path prefix.
    #[serde(default)]
    pub targets: Option<Vec<Target>>,
}

fn default_active() -> bool {
    true
}

impl AccessKeyConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyKeyId);
        }
        if self.key.is_empty() {
            return Err(ValidationError::EmptyKey(self.id.clone()));
        }

        self.defaults.validate()?;
        self.allowed_method()?;

        match (&self.target_url, &self.targets) {
            (Some(url), None) => {
                direct_target(&self.id, url)?;
            }
            (None, Some(targets)) => {
                let mut target_ids = HashSet::new();
                for target in targets {
                    if target.host.is_empty() {
                        return Err(ValidationError::EmptyTargetHost(target.id.clone()));
                    }
                    if !target_ids.insert(&target.id) {
                        return Err(ValidationError::DuplicateTargetId(
                            self.id.clone(),
                            target.id.clone(),
                        ));
                    }
                    target.chaos.validate()?;
                }
            }
            _ => return Err(ValidationError::AmbiguousMode(self.id.clone())),
        }

        Ok(())
    }

    fn allowed_method(&self) -> Result<Option<Method>, ValidationError> {
        match self.method.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(m) if m.eq_ignore_ascii_case("any") => Ok(None),
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map(Some)
                .map_err(|_| ValidationError::InvalidMethod(self.id.clone(), m.to_string())),
        }
    }
}

/// Builds the single target of a direct key from its URL.
pub(crate) fn direct_target(key_id: &str, url: &Url) -> Result<Target, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidTargetUrl(key_id.into(), reason.into());

    let use_tls = match url.scheme() {
        "http" => false,
        "https" => true,
        other => return Err(invalid(&format!("unsupported scheme {other}"))),
    };
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port"))?;
    if url.query().is_some() {
        return Err(invalid("query strings are not supported"));
    }

    Ok(Target {
        id: key_id.to_string(),
        name: String::new(),
        host: host.to_string(),
        port,
        use_tls,
        base_path: url.path().trim_end_matches('/').to_string(),
        path_prefix: String::new(),
        chaos: Default::default(),
        active: true,
    })
}

impl TryFrom<AccessKeyConfig> for RoutingConfig {
    type Error = ValidationError;

    fn try_from(config: AccessKeyConfig) -> Result<Self, Self::Error> {
        config.validate()?;
        let allowed_method = config.allowed_method()?;

        let mode = match (&config.target_url, config.targets) {
            (Some(url), None) => RoutingMode::Direct(direct_target(&config.id, url)?),
            (None, Some(targets)) => RoutingMode::Tunnel(targets),
            _ => return Err(ValidationError::AmbiguousMode(config.id)),
        };

        Ok(RoutingConfig {
            id: config.id,
            key: config.key,
            owner_id: config.owner_id,
            name: config.name,
            active: config.active,
            allowed_method,
            defaults: config.defaults,
            mode,
        })
    }
}
