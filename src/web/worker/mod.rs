//! Out-of-process landmark inference.
//!
//! The model runs in separate child processes for:
//! - Parallelism: one model instance per process, no shared interpreter state
//! - Crash isolation: a model crash doesn't take down the server

pub mod inference;
pub mod process_manager;
pub mod worker_bridge;
pub mod worker_main;
pub mod worker_pool;

pub use process_manager::WorkerSpec;
pub use worker_bridge::{Worker, WorkerError};
pub use worker_pool::{PoolError, SharedWorkerPool, WorkerPool};
