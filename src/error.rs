//! Crate-wide error types.
//!
//! Each subsystem gets its own `thiserror` enum, following the pattern of
//! the crawler this scheduler was adapted from (one error type per backend
//! / repository). `anyhow` is reserved for the CLI boundary in `main.rs`.

use thiserror::Error;

/// Errors from the Redis-backed priority queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to serialize request record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors from the distributed moderated throttle.
#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors from the dedup filter.
#[derive(Debug, Error)]
pub enum DupeFilterError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors from configuration parsing and the config watcher.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid config document: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Errors surfaced by the scheduler's top-level operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Throttle(#[from] ThrottleError),

    #[error(transparent)]
    DupeFilter(#[from] DupeFilterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("could not parse url {0:?} even with an http:// prefix")]
    InvalidUrl(String),
}
