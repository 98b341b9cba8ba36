//! Error types for handoff.

use thiserror::Error;

/// Main error type for the worker pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Failed to spawn worker for slot {slot}: {message}")]
    Spawn { slot: usize, message: String },

    #[error("{0}")]
    Worker(String),

    #[error("Invalid frame: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Slot {index} is out of range (pool has {size} workers)")]
    InvalidSlot { index: usize, size: usize },

    #[error("Worker pool is not running")]
    NotRunning,

    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Worker at slot {0} is unavailable: restart budget exhausted")]
    StaleWorker(usize),

    #[error("Handoff queue for slot {slot} is full ({capacity} pending)")]
    HandoffQueueFull { slot: usize, capacity: usize },

    #[error("Timed out waiting for workers: {ready}/{expected} ready")]
    StartupTimeout { ready: usize, expected: usize },

    #[error("Pool event loop has shut down")]
    ClusterGone,
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
