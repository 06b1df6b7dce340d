//! engine-broker - supervise line-protocol analysis engines and multiplex requests to them.

mod defaults;
pub mod error;

pub mod config;
pub mod engine;
pub mod ipc;
pub mod pool;

pub use error::{DependencyRole, Error, Result};

pub use config::PoolConfig;
pub use engine::metadata::{EngineMetadata, MetadataStore};
pub use engine::spec::WorkerSpec;
pub use engine::supervisor::{EngineStatus, RespawnPolicy, Supervisor, WorkerState};
pub use ipc::codec::WireProtocol;
pub use ipc::multiplexer::{LineOutcome, Multiplexer, MultiplexerStats, TimeoutPolicy};
pub use pool::registry::{Engine, EnginePool};
pub use pool::reply::{AskReply, Summary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
