//! Redis-backed storage.
//!
//! Lets several limiter instances share counters and blocks through one
//! Redis server. Keys follow a plain layout:
//!
//! - `ip:<addr>` / `token:<value>`: counter as a native Redis integer,
//!   expiring with the window
//! - `block:ip:<addr>` / `block:token:<value>`: placeholder value whose
//!   remaining TTL is the block
//!
//! Expiry is delegated entirely to Redis.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{
    AsyncCommands, Client, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo,
};
use tracing::{debug, info};

use super::{block_key, LimiterRecord, Storage, StorageError, StorageResult};
use crate::clock::{add_duration, remaining, Clock, SystemClock};

const BLOCK_MARKER: &str = "blocked";

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStorageConfig {
    /// Prepended to every key (default: empty)
    pub key_prefix: String,
    /// Bound on connecting and the initial `PING` (default: 5s)
    pub connect_timeout: Duration,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisStorageConfig {
    fn counter_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn block_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, block_key(key))
    }
}

/// Storage shared across instances through Redis.
pub struct RedisStorage {
    connection: Mutex<Option<ConnectionManager>>,
    config: RedisStorageConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage")
            .field("config", &self.config)
            .field("open", &self.connection.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the server is unreachable or does not answer `PING`.
    pub async fn connect<T: IntoConnectionInfo>(info: T) -> StorageResult<Self> {
        Self::connect_with_config(info, RedisStorageConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if the server is unreachable, does not answer `PING`,
    /// or takes longer than `config.connect_timeout`.
    pub async fn connect_with_config<T: IntoConnectionInfo>(
        info: T,
        config: RedisStorageConfig,
    ) -> StorageResult<Self> {
        let timeout = config.connect_timeout;
        let connect = async {
            let client = Client::open(info)?;
            let mut connection = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<_, StorageError>(connection)
        };

        let connection = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| StorageError::Timeout(timeout))??;

        info!(prefix = %config.key_prefix, "Connected to Redis storage");

        Ok(Self {
            connection: Mutex::new(Some(connection)),
            config,
            clock: Arc::new(SystemClock::new()),
        })
    }

    /// Connection parameters for a TCP server.
    ///
    /// The password is passed through as-is, so it may contain characters
    /// that are reserved in a URL. An empty password means none.
    pub fn connection_info(host: &str, port: u16, password: &str, db: i64) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.to_string(), port),
            redis: RedisConnectionInfo {
                db,
                password: (!password.is_empty()).then(|| password.to_string()),
                ..Default::default()
            },
        }
    }

    fn connection(&self) -> StorageResult<ConnectionManager> {
        self.connection.lock().clone().ok_or(StorageError::Closed)
    }
}

fn to_count(key: &str, value: i64) -> StorageResult<u64> {
    u64::try_from(value).map_err(|_| StorageError::Malformed {
        key: key.to_string(),
        reason: format!("negative counter {}", value),
    })
}

#[async_trait]
impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<LimiterRecord>> {
        let counter_key = self.config.counter_key(key);
        let mut conn = self.connection()?;

        let (value, ttl_ms): (Option<String>, i64) = redis::pipe()
            .atomic()
            .get(&counter_key)
            .pttl(&counter_key)
            .query_async(&mut conn)
            .await?;

        let Some(value) = value else {
            return Ok(None);
        };
        let count = value
            .parse::<i64>()
            .map_err(|e| StorageError::Malformed {
                key: counter_key.clone(),
                reason: e.to_string(),
            })
            .and_then(|count| to_count(&counter_key, count))?;

        match ttl_ms {
            // key is gone
            -2 => Ok(None),
            ms if ms > 0 => Ok(Some(LimiterRecord {
                count,
                window_expiry: add_duration(self.clock.now(), Duration::from_millis(ms as u64)),
            })),
            _ => Err(StorageError::Malformed {
                key: counter_key,
                reason: "counter has no expiry".to_string(),
            }),
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> StorageResult<u64> {
        let counter_key = self.config.counter_key(key);
        let window_ms = window.as_millis().max(1) as u64;
        let mut conn = self.connection()?;

        // SET NX only opens a window when none is live, keeping its expiry
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&counter_key)
            .arg(0)
            .arg("PX")
            .arg(window_ms)
            .arg("NX")
            .ignore()
            .incr(&counter_key, 1)
            .query_async(&mut conn)
            .await?;

        to_count(&counter_key, count)
    }

    async fn set_block(&self, key: &str, blocked_until: DateTime<Utc>) -> StorageResult<()> {
        let Some(duration) = remaining(self.clock.now(), blocked_until) else {
            return Ok(());
        };
        let block_key = self.config.block_key(key);
        let mut conn = self.connection()?;

        let _: () = conn
            .pset_ex(&block_key, BLOCK_MARKER, duration.as_millis().max(1) as u64)
            .await?;

        debug!(key = %block_key, ttl_ms = duration.as_millis() as u64, "Block stored");
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> StorageResult<Option<DateTime<Utc>>> {
        let block_key = self.config.block_key(key);
        let mut conn = self.connection()?;

        let ttl_ms: i64 = conn.pttl(&block_key).await?;
        if ttl_ms <= 0 {
            return Ok(None);
        }

        Ok(Some(add_duration(
            self.clock.now(),
            Duration::from_millis(ttl_ms as u64),
        )))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut conn = self.connection()?;

        let _: () = redis::pipe()
            .atomic()
            .del(self.config.counter_key(key))
            .ignore()
            .del(self.config.block_key(key))
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        if self.connection.lock().take().is_some() {
            info!("Redis storage closed");
        }
        Ok(())
    }
}
