//! Provider configuration, loaded from YAML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which pods the provider watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Only pods scheduled on the local node.
    #[default]
    Node,
    /// Every pod in the cluster.
    Cluster,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Node => "node",
            Scope::Cluster => "cluster",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Enabled {
    pub enabled: bool,
}

impl Default for Enabled {
    fn default() -> Self { Self { enabled: true } }
}

/// Which related resources feed pod metadata (and trigger cross-updates).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddResourceMetadata {
    pub node: Enabled,
    pub namespace: Enabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HintsConfig {
    /// When false every container goes to the local registry.
    pub enabled: bool,
}

impl Default for HintsConfig {
    fn default() -> Self { Self { enabled: true } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Generated at startup when unset.
    pub agent_id: Option<String>,
    pub proxy_disable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub scope: Scope,
    pub node: Option<String>,
    pub namespace: Option<String>,
    #[serde(with = "humantime_serde")]
    pub sync_period: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_timeout: Duration,
    pub add_resource_metadata: AddResourceMetadata,
    pub hints: HintsConfig,
    pub fleet: Option<FleetConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: Scope::Node,
            node: None,
            namespace: None,
            sync_period: Duration::from_secs(10 * 60),
            cleanup_timeout: Duration::from_secs(60),
            add_resource_metadata: AddResourceMetadata::default(),
            hints: HintsConfig::default(),
            fleet: None,
        }
    }
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scope == Scope::Node && self.node.as_deref() == Some("") {
            return Err(ConfigError::Invalid("node must not be empty in node scope".into()));
        }
        if self.cleanup_timeout.is_zero() {
            return Err(ConfigError::Invalid("cleanup_timeout must be greater than zero".into()));
        }
        if let Some(f) = &self.fleet {
            let ok = url::Url::parse(&f.url).map(|u| u.has_host()).unwrap_or(false);
            if !ok {
                return Err(ConfigError::Invalid(format!("fleet.url '{}' is not an absolute url", f.url)));
            }
        }
        Ok(())
    }

    /// Node the pod watcher is restricted to. Node scope falls back to
    /// `NODE_NAME`; cluster scope never restricts.
    pub fn effective_node(&self) -> Option<String> {
        match self.scope {
            Scope::Cluster => None,
            Scope::Node => {
                let node = self.node.clone().or_else(|| std::env::var("NODE_NAME").ok()).filter(|n| !n.is_empty());
                if node.is_none() {
                    warn!("node scope without a node name (set `node` or NODE_NAME); watching pods on all nodes");
                }
                node
            }
        }
    }
}
