//! Identity key selection.

use std::fmt;

/// The subject a request is counted against.
///
/// A non-empty token takes over completely: the IP is not counted for
/// that request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Client IP address
    Ip(String),
    /// Client-supplied access token
    Token(String),
}

impl Identity {
    /// Select the identity for a request.
    pub fn select(ip: &str, token: Option<&str>) -> Self {
        match token {
            Some(token) if !token.is_empty() => Identity::Token(token.to_string()),
            _ => Identity::Ip(ip.to_string()),
        }
    }

    /// The storage key for this identity: `ip:<addr>` or `token:<value>`.
    pub fn key(&self) -> String {
        match self {
            Identity::Ip(ip) => format!("ip:{}", ip),
            Identity::Token(token) => format!("token:{}", token),
        }
    }

    /// Whether this identity is a token.
    pub fn is_token(&self) -> bool {
        matches!(self, Identity::Token(_))
    }

    /// Short label for logs and messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Identity::Ip(_) => "IP",
            Identity::Token(_) => "token",
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
