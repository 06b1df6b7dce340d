//! Engine registry: a fixed, named set of supervised workers.
//!
//! The pool is an ordinary value owned by whoever composes the application.
//! Several pools can live side by side; nothing here is global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::PoolConfig;
use crate::engine::metadata::{EngineMetadata, MetadataStore};
use crate::engine::supervisor::{EngineStatus, Supervisor};
use crate::error::{Error, Result};
use crate::ipc::multiplexer::TimeoutPolicy;
use crate::pool::reply::AskReply;

/// One named engine: its supervisor plus the timeout policy for its requests.
pub struct Engine {
    supervisor: Supervisor,
    timeouts: TimeoutPolicy,
}

impl Engine {
    pub fn name(&self) -> &str {
        self.supervisor.name()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Send a request using the timeout window derived from the payload.
    pub async fn send(&self, payload: Value) -> Result<Value> {
        let window = self.timeouts.window_for(&payload);
        self.supervisor.request(payload, window).await
    }

    /// Send a request with an explicit timeout window.
    pub async fn send_with_timeout(&self, payload: Value, timeout: Duration) -> Result<Value> {
        self.supervisor.request(payload, timeout).await
    }
}

/// Registry of named engines.
pub struct EnginePool {
    /// Engines in configuration order
    engines: Vec<Engine>,
    /// Normalized name -> position in `engines`
    index: HashMap<String, usize>,
    /// Canonical name of the fallback engine
    default_engine: String,
    metadata: Arc<MetadataStore>,
    shutdown_grace: Duration,
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

impl EnginePool {
    /// Build the pool. No process is started until `start_all`.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let metadata = Arc::new(MetadataStore::new());
        let shutdown_grace = config.shutdown_grace();
        let mut engines = Vec::with_capacity(config.engines.len());
        let mut index = HashMap::new();

        for spec in config.engines {
            let key = normalize(&spec.name);
            if key.is_empty() {
                return Err(Error::Config("engine name must not be empty".into()));
            }
            if index.contains_key(&key) {
                return Err(Error::Config(format!("duplicate engine name: {}", spec.name)));
            }
            index.insert(key, engines.len());
            engines.push(Engine {
                supervisor: Supervisor::new(
                    spec,
                    config.respawn.clone(),
                    config.protocol.clone(),
                    Arc::clone(&metadata),
                ),
                timeouts: config.timeout.clone(),
            });
        }

        let default_engine = index
            .get(&normalize(&config.default_engine))
            .map(|&i| engines[i].name().to_string())
            .ok_or_else(|| Error::UnknownEngine(config.default_engine.clone()))?;

        Ok(Self {
            engines,
            index,
            default_engine,
            metadata,
            shutdown_grace,
        })
    }

    pub fn default_engine(&self) -> &str {
        &self.default_engine
    }

    /// How long `shutdown_all` waits for each worker to exit.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn names(&self) -> Vec<&str> {
        self.engines.iter().map(Engine::name).collect()
    }

    /// Look up an engine by name. Case-insensitive, no fallback.
    pub fn engine(&self, name: &str) -> Option<&Engine> {
        self.index.get(&normalize(name)).map(|&i| &self.engines[i])
    }

    /// Canonical engine name for a requested one.
    ///
    /// Missing, empty or unknown names fall back to the default engine.
    pub fn resolve_name(&self, requested: Option<&str>) -> &str {
        if let Some(name) = requested {
            if let Some(engine) = self.engine(name) {
                return engine.name();
            }
            if !name.trim().is_empty() {
                log::debug!(
                    "unknown engine {:?}, routing to {}",
                    name,
                    self.default_engine
                );
            }
        }
        &self.default_engine
    }

    fn route(&self, requested: Option<&str>) -> Result<&Engine> {
        let name = self.resolve_name(requested);
        self.engine(name)
            .ok_or_else(|| Error::UnknownEngine(name.to_string()))
    }

    /// Send a payload to the named engine (or the default) and await its final response.
    ///
    /// Failures propagate unchanged; nothing is retried.
    pub async fn ask(&self, engine: Option<&str>, payload: Value) -> Result<Value> {
        self.route(engine)?.send(payload).await
    }

    pub async fn ask_with_timeout(
        &self,
        engine: Option<&str>,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.route(engine)?.send_with_timeout(payload, timeout).await
    }

    /// Like `ask`, shaped for a caller that wants a single JSON reply.
    pub async fn ask_reply(&self, engine: Option<&str>, payload: Value) -> AskReply {
        let name = self.resolve_name(engine).to_string();
        let result = self.ask(Some(&name), payload).await;
        AskReply::from_result(name, result)
    }

    /// Start every engine. One failure does not prevent the others from starting.
    pub fn start_all(&self) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for engine in &self.engines {
            if let Err(e) = engine.supervisor.start() {
                log::error!("[{}] failed to start: {}", engine.name(), e);
                failures.push((engine.name().to_string(), e));
            }
        }
        failures
    }

    /// Shut every engine down and wait for the workers to exit.
    pub async fn shutdown_all(&self) {
        let grace = self.shutdown_grace;
        let handles: Vec<_> = self
            .engines
            .iter()
            .map(|engine| {
                let supervisor = engine.supervisor.clone();
                tokio::spawn(async move { supervisor.shutdown(grace).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("shutdown task failed: {}", e);
            }
        }
        log::info!("all engines shut down");
    }

    pub fn statuses(&self) -> Vec<EngineStatus> {
        self.engines.iter().map(|e| e.supervisor.status()).collect()
    }

    /// Latest scraped metadata for an engine, `None` if the engine does not exist.
    pub fn metadata(&self, name: &str) -> Option<EngineMetadata> {
        self.engine(name).map(|e| self.metadata.get(e.name()))
    }
}
