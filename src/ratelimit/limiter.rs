//! Core rate limiter implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::identity::Identity;
use super::quota::{LimiterConfig, WINDOW};
use crate::clock::{add_duration, Clock, SystemClock};
use crate::storage::{Storage, StorageResult};

/// Why a request was turned away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The identity is inside an active block window
    #[error("{} blocked until {until}", .identity.kind())]
    Blocked {
        identity: Identity,
        until: DateTime<Utc>,
    },

    /// This request pushed the count past the limit and started a block
    #[error("rate limit exceeded, blocked until {until}")]
    QuotaExceeded {
        identity: Identity,
        until: DateTime<Utc>,
    },
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(Denial),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Decides per request whether to allow it, counting against the IP or
/// the access token.
///
/// Shares its storage with any number of concurrent callers; the
/// configuration is fixed at construction.
pub struct RateLimiter {
    storage: Arc<dyn Storage>,
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter over `storage` on the system clock.
    pub fn new(storage: Arc<dyn Storage>, config: LimiterConfig) -> Self {
        Self::with_clock(storage, config, Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter computing block expiry from `clock`.
    pub fn with_clock(storage: Arc<dyn Storage>, config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            config,
            clock,
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Check and count one request.
    ///
    /// An existing block on the IP or on the token denies the request
    /// without counting it. Otherwise the request is counted against the
    /// token if one is present, else the IP. The request that exceeds the
    /// limit is itself denied and blocks its identity.
    ///
    /// The block checks and the increment are separate storage calls, so a
    /// concurrent request may set a block in between without this one
    /// seeing it.
    ///
    /// # Errors
    /// Any storage failure is returned unchanged; callers must treat it as a
    /// denial.
    pub async fn check_request(&self, ip: &str, token: Option<&str>) -> StorageResult<Decision> {
        let ip_identity = Identity::Ip(ip.to_string());
        if let Some(denial) = self.active_block(&ip_identity).await? {
            return Ok(Decision::Denied(denial));
        }

        let identity = Identity::select(ip, token);
        if identity.is_token() {
            if let Some(denial) = self.active_block(&identity).await? {
                return Ok(Decision::Denied(denial));
            }
        }

        let quota = self.config.quota_for(&identity);
        let key = identity.key();

        let count = self.storage.increment(&key, WINDOW).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to increment request count");
            e
        })?;

        trace!(key = %key, count = count, limit = quota.limit, "Checked rate limit");

        if count <= quota.limit {
            return Ok(Decision::Allowed);
        }

        let until = add_duration(self.clock.now(), quota.block_duration);
        self.storage.set_block(&key, until).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to set block");
            e
        })?;

        debug!(
            key = %key,
            count = count,
            limit = quota.limit,
            until = %until,
            "Rate limit exceeded, identity blocked"
        );

        Ok(Decision::Denied(Denial::QuotaExceeded { identity, until }))
    }

    /// Requests left in the current window for the selected identity.
    ///
    /// Read-only: nothing is counted or created.
    pub async fn get_remaining_requests(&self, ip: &str, token: Option<&str>) -> StorageResult<u64> {
        let identity = Identity::select(ip, token);
        let quota = self.config.quota_for(&identity);

        let remaining = match self.storage.get(&identity.key()).await? {
            Some(record) => quota.limit.saturating_sub(record.count),
            None => quota.limit,
        };

        Ok(remaining)
    }

    /// Clear the counter and any block for the selected identity.
    pub async fn reset(&self, ip: &str, token: Option<&str>) -> StorageResult<()> {
        let identity = Identity::select(ip, token);
        self.storage.delete(&identity.key()).await?;

        debug!(key = %identity, "Rate limit reset");
        Ok(())
    }

    async fn active_block(&self, identity: &Identity) -> StorageResult<Option<Denial>> {
        let key = identity.key();
        let until = self.storage.is_blocked(&key).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to check block status");
            e
        })?;

        Ok(until.map(|until| {
            trace!(key = %key, until = %until, "Identity is blocked");
            Denial::Blocked {
                identity: identity.clone(),
                until,
            }
        }))
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
