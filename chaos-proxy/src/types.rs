use crate::chaos::{ChaosConfig, ChaosOverride};
use http::Method;
use serde::Deserialize;

pub type KeyId = String;
pub type TargetId = String;

/// One upstream destination.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Target {
    pub id: TargetId,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// Prefix prepended to the forwarded path. Only set for direct targets built from a URL.
    #[serde(skip)]
    pub base_path: String,
    /// Literal request path prefix this target serves. Empty matches everything.
    #[serde(default)]
    pub path_prefix: String,
    #[serde(flatten)]
    pub chaos: ChaosOverride,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Target {
    pub fn scheme(&self) -> &'static str {
        if self.use_tls { "https" } else { "http" }
    }
}

fn default_port() -> u16 {
    443
}

fn default_true() -> bool {
    true
}

/// How an access key maps onto upstreams.
#[derive(Clone, Debug, PartialEq)]
pub enum RoutingMode {
    /// A single fixed upstream.
    Direct(Target),
    /// An ordered set of targets chosen by path prefix. Order is creation order.
    Tunnel(Vec<Target>),
}

/// The resolved configuration behind one access key.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingConfig {
    pub id: KeyId,
    pub key: String,
    pub owner_id: String,
    pub name: Option<String>,
    pub active: bool,
    /// `None` allows every method.
    pub allowed_method: Option<Method>,
    pub defaults: ChaosConfig,
    pub mode: RoutingMode,
}

impl RoutingConfig {
    pub fn targets(&self) -> &[Target] {
        match &self.mode {
            RoutingMode::Direct(target) => std::slice::from_ref(target),
            RoutingMode::Tunnel(targets) => targets,
        }
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.allowed_method
            .as_ref()
            .is_none_or(|allowed| allowed == method)
    }
}
