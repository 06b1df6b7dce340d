//! Named engine pool and reply shaping.

pub mod registry;
pub mod reply;

pub use registry::{Engine, EnginePool};
pub use reply::{AskReply, Summary};
