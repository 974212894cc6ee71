pub mod canonical;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod errors;
pub mod fetcher;
pub mod host_state;
pub mod metrics;
pub mod parser;
pub mod robots;
pub mod run_manager;
pub mod scheduler;
pub mod semaphore;
pub mod storage;
pub mod task;
pub mod telemetry;

// Re-export the main types for library usage
pub use canonical::{canonicalize, host_key};
pub use config::{CrawlerDefaults, RunConfig};
pub use dedup::Deduper;
pub use engine::{Engine, EngineError, StopSignal};
pub use host_state::{CircuitState, HostState};
pub use metrics::{Metrics, SharedMetrics};
pub use robots::{RobotsCache, RobotsState};
pub use run_manager::{RunManager, RunManagerError};
pub use scheduler::Scheduler;
pub use semaphore::Semaphore;
pub use storage::{MemoryStore, PageRecord, RunId, RunStatus, Store};
pub use task::Task;
pub use telemetry::{Frame, Subscription, Telemetry};
