//! Pool configuration loaded from JSON and the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::engine::spec::WorkerSpec;
use crate::engine::supervisor::RespawnPolicy;
use crate::error::{Error, Result};
use crate::ipc::codec::WireProtocol;
use crate::ipc::multiplexer::TimeoutPolicy;

/// Path of the configuration file, overriding the per-user default.
pub const CONFIG_ENV: &str = "ENGINE_BROKER_CONFIG";

/// Engine name used when a request names none, overriding the file.
pub const DEFAULT_ENGINE_ENV: &str = "ENGINE_BROKER_DEFAULT_ENGINE";

/// Everything needed to build an `EnginePool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Engine that receives requests naming no engine or an unknown one
    #[serde(default = "defaults::default_engine")]
    pub default_engine: String,
    /// Worker specs, in start order
    #[serde(default)]
    pub engines: Vec<WorkerSpec>,
    #[serde(default)]
    pub timeout: TimeoutPolicy,
    #[serde(default)]
    pub respawn: RespawnPolicy,
    #[serde(default)]
    pub protocol: WireProtocol,
    /// How long `shutdown_all` waits for each worker to exit
    #[serde(default = "defaults::shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl PoolConfig {
    pub fn new(engines: Vec<WorkerSpec>) -> Self {
        Self {
            default_engine: defaults::default_engine(),
            engines,
            timeout: TimeoutPolicy::default(),
            respawn: RespawnPolicy::default(),
            protocol: WireProtocol::default(),
            shutdown_grace_ms: defaults::SHUTDOWN_GRACE_MS,
        }
    }

    pub fn with_default_engine(mut self, name: impl Into<String>) -> Self {
        self.default_engine = name.into();
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Parse a configuration file. Environment overrides are not applied.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid configuration {}: {}", path.display(), e)))
    }

    /// Locate, parse and apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = config_path(explicit, std::env::var(CONFIG_ENV).ok()).ok_or_else(|| {
            Error::Config(format!(
                "no configuration file: pass --config or set {}",
                CONFIG_ENV
            ))
        })?;
        log::debug!("loading configuration from {}", path.display());

        let mut config = Self::from_file(&path)?;
        config.override_default_engine(std::env::var(DEFAULT_ENGINE_ENV).ok());
        Ok(config)
    }

    fn override_default_engine(&mut self, value: Option<String>) {
        if let Some(name) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            log::info!("default engine overridden by {}: {}", DEFAULT_ENGINE_ENV, name);
            self.default_engine = name;
        }
    }
}

/// Resolve the configuration file location.
///
/// An explicit path wins, then the environment, then
/// `<config dir>/engine-broker/engines.json`.
pub fn config_path(explicit: Option<&Path>, env: Option<String>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    // ENGINE_BROKER_CONFIG is an escape hatch for development or containerized environments.
    if let Some(path) = env.filter(|p| !p.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("engine-broker").join("engines.json"))
}
