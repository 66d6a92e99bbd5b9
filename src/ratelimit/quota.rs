//! Limiter quotas and their environment configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::identity::Identity;

/// Length of the counting window.
pub const WINDOW: Duration = Duration::from_secs(1);

pub const ENV_IP_REQUESTS_PER_SECOND: &str = "RATE_LIMIT_IP_REQUESTS_PER_SECOND";
pub const ENV_IP_BLOCK_MINUTES: &str = "RATE_LIMIT_IP_BLOCK_DURATION_MINUTES";
pub const ENV_TOKEN_REQUESTS_PER_SECOND: &str = "RATE_LIMIT_TOKEN_REQUESTS_PER_SECOND";
pub const ENV_TOKEN_BLOCK_MINUTES: &str = "RATE_LIMIT_TOKEN_BLOCK_DURATION_MINUTES";

/// The four limiter parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests per second allowed for a client identified by IP
    #[serde(default = "default_ip_requests_per_second")]
    pub ip_requests_per_second: u64,

    /// Minutes an IP stays blocked after exceeding its quota
    #[serde(default = "default_block_minutes")]
    pub ip_block_minutes: u64,

    /// Requests per second allowed for a client presenting a token
    #[serde(default = "default_token_requests_per_second")]
    pub token_requests_per_second: u64,

    /// Minutes a token stays blocked after exceeding its quota
    #[serde(default = "default_block_minutes")]
    pub token_block_minutes: u64,
}

fn default_ip_requests_per_second() -> u64 {
    5
}

fn default_token_requests_per_second() -> u64 {
    10
}

fn default_block_minutes() -> u64 {
    5
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            ip_requests_per_second: default_ip_requests_per_second(),
            ip_block_minutes: default_block_minutes(),
            token_requests_per_second: default_token_requests_per_second(),
            token_block_minutes: default_block_minutes(),
        }
    }
}

/// The limit and block length applied to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Requests allowed per window
    pub limit: u64,
    /// How long the identity is blocked once the limit is exceeded
    pub block_duration: Duration,
}

impl LimiterConfig {
    /// Override each setting for which `lookup` yields a value.
    ///
    /// A value that does not parse leaves the current setting in place.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        override_setting(&mut self.ip_requests_per_second, ENV_IP_REQUESTS_PER_SECOND, &lookup);
        override_setting(&mut self.ip_block_minutes, ENV_IP_BLOCK_MINUTES, &lookup);
        override_setting(&mut self.token_requests_per_second, ENV_TOKEN_REQUESTS_PER_SECOND, &lookup);
        override_setting(&mut self.token_block_minutes, ENV_TOKEN_BLOCK_MINUTES, &lookup);
        self
    }

    /// Block length for IP identities.
    pub fn ip_block_duration(&self) -> Duration {
        minutes(self.ip_block_minutes)
    }

    /// Block length for token identities.
    pub fn token_block_duration(&self) -> Duration {
        minutes(self.token_block_minutes)
    }

    /// The quota applying to `identity`.
    pub fn quota_for(&self, identity: &Identity) -> Quota {
        match identity {
            Identity::Ip(_) => Quota {
                limit: self.ip_requests_per_second,
                block_duration: self.ip_block_duration(),
            },
            Identity::Token(_) => Quota {
                limit: self.token_requests_per_second,
                block_duration: self.token_block_duration(),
            },
        }
    }
}

fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}

fn override_setting<F>(setting: &mut u64, name: &str, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name).filter(|value| !value.is_empty()) else {
        return;
    };

    match raw.trim().parse::<u64>() {
        Ok(value) => *setting = value,
        Err(e) => warn!(
            variable = name,
            value = %raw,
            error = %e,
            fallback = *setting,
            "Ignoring unparsable rate limit setting"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = LimiterConfig::default();

        assert_eq!(config.ip_requests_per_second, 5);
        assert_eq!(config.ip_block_minutes, 5);
        assert_eq!(config.token_requests_per_second, 10);
        assert_eq!(config.token_block_minutes, 5);
        assert_eq!(config.ip_block_duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_overrides_apply() {
        let config = LimiterConfig::default().with_overrides(lookup(&[
            (ENV_IP_REQUESTS_PER_SECOND, "2"),
            (ENV_TOKEN_BLOCK_MINUTES, "1"),
        ]));

        assert_eq!(config.ip_requests_per_second, 2);
        assert_eq!(config.ip_block_minutes, 5);
        assert_eq!(config.token_requests_per_second, 10);
        assert_eq!(config.token_block_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_unparsable_value_keeps_default() {
        let config = LimiterConfig::default().with_overrides(lookup(&[
            (ENV_IP_REQUESTS_PER_SECOND, "lots"),
            (ENV_IP_BLOCK_MINUTES, "-3"),
            (ENV_TOKEN_REQUESTS_PER_SECOND, ""),
            (ENV_TOKEN_BLOCK_MINUTES, " 7 "),
        ]));

        assert_eq!(config.ip_requests_per_second, 5);
        assert_eq!(config.ip_block_minutes, 5);
        assert_eq!(config.token_requests_per_second, 10);
        assert_eq!(config.token_block_minutes, 7);
    }

    #[test]
    fn test_quota_selection() {
        let config = LimiterConfig {
            ip_requests_per_second: 1,
            ip_block_minutes: 2,
            token_requests_per_second: 3,
            token_block_minutes: 4,
        };

        let ip = config.quota_for(&Identity::Ip("192.0.2.1".to_string()));
        assert_eq!(ip.limit, 1);
        assert_eq!(ip.block_duration, Duration::from_secs(120));

        let token = config.quota_for(&Identity::Token("abc".to_string()));
        assert_eq!(token.limit, 3);
        assert_eq!(token.block_duration, Duration::from_secs(240));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: LimiterConfig = serde_yaml::from_str("ip_requests_per_second: 20\n").unwrap();

        assert_eq!(config.ip_requests_per_second, 20);
        assert_eq!(config.token_requests_per_second, 10);
    }
}
