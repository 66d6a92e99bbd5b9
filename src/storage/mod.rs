//! Counter and block storage backends.
//!
//! The rate limiter only talks to the [`Storage`] trait. Two backends
//! implement it: [`MemoryStorage`] for a single process and
//! [`RedisStorage`] for state shared by several instances.

mod memory;
mod redis;

pub use self::memory::MemoryStorage;
pub use self::redis::{RedisStorage, RedisStorageConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Prefix for the derived key holding an identity's block state.
pub const BLOCK_KEY_PREFIX: &str = "block:";

/// Derive the block key for an identity key.
pub fn block_key(key: &str) -> String {
    format!("{}{}", BLOCK_KEY_PREFIX, key)
}

/// Request count for one identity key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterRecord {
    /// Requests observed in the current window
    pub count: u64,
    /// When the count resets to zero
    pub window_expiry: DateTime<Utc>,
}

impl LimiterRecord {
    /// Whether the window is still open at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.window_expiry
    }
}

/// Errors surfaced by a storage backend.
///
/// None of these may be read as "allow": callers fail closed.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend rejected the command or could not be reached
    #[error("storage backend error: {0}")]
    Backend(#[from] ::redis::RedisError),

    /// The backend returned data that is not a valid counter
    #[error("malformed value for key {key}: {reason}")]
    Malformed { key: String, reason: String },

    /// The operation did not complete in time
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),

    /// The storage has been closed
    #[error("storage is closed")]
    Closed,
}

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Counting and blocking capability shared by all backends.
///
/// Every method may be called concurrently from any number of tasks.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Current window state for `key`, or `None` if absent or lapsed.
    async fn get(&self, key: &str) -> StorageResult<Option<LimiterRecord>>;

    /// Atomically add one to the counter for `key`, opening a window of
    /// `window` length if none is live, and return the new count.
    async fn increment(&self, key: &str, window: Duration) -> StorageResult<u64>;

    /// Block `key` until `blocked_until`. A time already in the past is a no-op.
    async fn set_block(&self, key: &str, blocked_until: DateTime<Utc>) -> StorageResult<()>;

    /// The block expiry for `key` if a block is active.
    async fn is_blocked(&self, key: &str) -> StorageResult<Option<DateTime<Utc>>>;

    /// Remove both the counter and any block for `key`.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Release backend resources.
    async fn close(&self) -> StorageResult<()>;
}
