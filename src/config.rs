//! Configuration management for gates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};
use crate::gate::GateOptions;
use crate::window::{Limits, WindowLayout};

pub use crate::window::FloorPolicy;

/// Prefix of environment variables that override file settings,
/// e.g. `FRAMEGATE__FRAME_LIMIT=10`.
const ENV_PREFIX: &str = "FRAMEGATE";

/// Configuration of one gate and its storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Gate name, also the namespace of shared segments and remote keys
    pub name: String,

    /// Total window duration in milliseconds
    pub window_size_ms: u64,

    /// Duration of one frame in milliseconds
    pub frame_step_ms: u64,

    /// Maximum value of the current frame (0 disables)
    #[serde(default)]
    pub frame_limit: u64,

    /// Maximum window sum (0 disables)
    #[serde(default)]
    pub window_limit: u64,

    /// How decrements below zero are handled
    pub floor: FloorPolicy,

    /// Offset buckets are aligned to, e.g. `+02:00` (UTC when unset)
    #[serde(default)]
    pub utc_offset: Option<String>,

    /// Storage backend
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Which storage backend holds the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Process memory.
    #[default]
    Local,
    /// Shared memory segment; `dir` defaults to `/dev/shm` when present.
    Shared {
        #[serde(default)]
        dir: Option<PathBuf>,
    },
    /// Redis, single node or cluster.
    Remote(RemoteConfig),
}

/// Connection parameters of the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Single-node URL
    #[serde(default)]
    pub url: Option<String>,

    /// Cluster seed node URLs
    #[serde(default)]
    pub cluster_nodes: Vec<String>,

    /// Bound on every store call in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Bound on connecting and the health check in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            cluster_nodes: Vec::new(),
            operation_timeout_ms: default_operation_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

fn default_operation_timeout() -> u64 {
    500
}

fn default_connect_timeout() -> u64 {
    2000
}

impl GateConfig {
    /// Load configuration from a YAML file, with `FRAMEGATE__*` environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| GateError::Config(format!("{}: {}", path.display(), e)))?;

        let config: GateConfig = settings
            .try_deserialize()
            .map_err(|e| GateError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig =
            serde_yaml::from_str(yaml).map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without touching a backend.
    pub fn validate(&self) -> Result<()> {
        self.options().map(|_| ())?;
        match &self.backend {
            BackendConfig::Local | BackendConfig::Shared { .. } => Ok(()),
            BackendConfig::Remote(remote) => remote.validate(),
        }
    }

    /// The validated gate options this configuration describes.
    pub fn options(&self) -> Result<GateOptions> {
        if self.name.trim().is_empty() {
            return Err(GateError::Config("gate name must not be empty".to_string()));
        }
        Limits::new(self.frame_limit, self.window_limit)?;
        let window_size = Duration::from_millis(self.window_size_ms);
        let frame_step = Duration::from_millis(self.frame_step_ms);
        WindowLayout::new(window_size, frame_step)?;

        Ok(GateOptions {
            name: self.name.clone(),
            window_size,
            frame_step,
            frame_limit: self.frame_limit,
            window_limit: self.window_limit,
            floor: self.floor,
            timezone: parse_offset(self.utc_offset.as_deref())?,
        })
    }
}

impl RemoteConfig {
    fn validate(&self) -> Result<()> {
        match (&self.url, self.cluster_nodes.is_empty()) {
            (Some(_), false) => Err(GateError::Config(
                "remote url and cluster_nodes are mutually exclusive".to_string(),
            )),
            (None, true) => Err(GateError::Config(
                "remote backend needs a url or cluster_nodes".to_string(),
            )),
            _ if self.operation_timeout_ms == 0 || self.connect_timeout_ms == 0 => Err(
                GateError::Config("remote timeouts must be positive".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

/// Parse `+HH:MM` / `-HH:MM` (or `Z`/`UTC`) into a fixed offset.
pub fn parse_offset(offset: Option<&str>) -> Result<FixedOffset> {
    let utc = FixedOffset::east_opt(0)
        .ok_or_else(|| GateError::Config("invalid utc offset".to_string()))?;
    match offset.map(str::trim) {
        None | Some("") | Some("Z") | Some("UTC") => Ok(utc),
        Some(raw) => raw
            .parse::<FixedOffset>()
            .map_err(|e| GateError::Config(format!("invalid utc offset {:?}: {}", raw, e))),
    }
}
