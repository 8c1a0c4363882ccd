pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod event_stream;
pub mod gateway;
pub mod orchestrator;
pub mod persistence;
pub mod retry;
pub mod run_lock;
pub mod scheduler;
pub mod store;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 39731;

pub use circuit_breaker::*;
pub use config::*;
pub use error::*;
pub use event_stream::*;
pub use gateway::*;
pub use orchestrator::*;
pub use persistence::*;
pub use retry::*;
pub use run_lock::*;
pub use scheduler::*;
pub use store::{MemoryStore, SharedStore};
