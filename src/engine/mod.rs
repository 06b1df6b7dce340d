//! Worker processes.
//!
//! This module provides:
//! - What to run for a named engine (`spec`)
//! - Process supervision and respawn (`supervisor`)
//! - Exit status reporting (`exit`)
//! - Metadata scraped from worker diagnostics (`metadata`)

pub mod exit;
pub mod metadata;
pub mod spec;
pub mod supervisor;

pub use exit::describe_exit;
pub use metadata::{EngineMetadata, MetadataStore};
pub use spec::WorkerSpec;
pub use supervisor::{EngineStatus, RespawnPolicy, Supervisor, WorkerState};
