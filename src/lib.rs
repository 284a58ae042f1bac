//! hivefarm - device-farm orchestration engine
//!
//! A multiprocess farming orchestrator: a dispatcher partitions accounts and
//! proxies across worker processes; each worker schedules its devices against
//! a remote task service, fetching pages and extracting fields with
//! declarative YAML rule documents.
//!
//! # Architecture
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Accounts, devices, fingerprints, schedule marks
//! - [`proxy`] - Shared proxy pool with rotation
//! - [`api`] - Task-service HTTP client and page fetcher
//! - [`rules`] - Rule-document execution and HTML field extraction
//! - [`store`] - SQLite persistence
//! - [`farm`] - Dispatcher, per-worker scheduler, device units
//! - [`utils`] - Retry policy and shutdown signaling
//!
//! # Example
//!
//! ```no_run
//! use hivefarm::config::Config;
//! use hivefarm::farm::worker_count;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load(std::path::Path::new("config.toml"))?;
//! let workers = worker_count(config.workers.max_processes, 8, 100);
//! println!("would start {workers} workers");
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod farm;
pub mod models;
pub mod proxy;
pub mod rules;
pub mod store;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{TaskAssignment, TaskServiceClient};
    pub use crate::config::Config;
    pub use crate::error::{ApiError, Error, FailureClass, Result};
    pub use crate::farm::{FarmContext, FarmScheduler, WorkerDispatcher};
    pub use crate::models::{Account, Device, ProxyHolder};
    pub use crate::proxy::ProxyPool;
    pub use crate::rules::TaskRun;
    pub use crate::store::Store;
}

pub use error::{Error, Result};
