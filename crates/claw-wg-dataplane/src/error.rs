//! Error types for the WireGuard dataplane.
//!
//! Ports and callbacks return [`DataplaneError`]. The manager wraps those in
//! [`WireguardError`], which names the apply step and the object that failed.

use std::fmt;

use ipnet::IpNet;
use thiserror::Error;

use crate::types::RuleSpec;

/// Result alias for manager-level operations.
pub type Result<T, E = WireguardError> = std::result::Result<T, E>;

/// Errors raised by a dataplane port or callback.
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// The object to modify does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object to create already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An external command exited unsuccessfully.
    #[error("command `{command}` failed: {stderr}")]
    Command {
        /// The command line that was run.
        command: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Output from the kernel or a tool could not be parsed.
    #[error("unable to parse {what}: {detail}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Parser detail.
        detail: String,
    },

    /// A kernel call failed.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DataplaneError {
    /// Whether the object was already absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// The stage of [`crate::WireguardManager::apply`] that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyStep {
    /// Creating, updating or tearing down the device.
    Device,
    /// Reporting the local public key upstream.
    Status,
    /// Peer reconciliation.
    Peers,
    /// Route reconciliation.
    Routes,
    /// Policy-rule reconciliation.
    Rules,
}

impl fmt::Display for ApplyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Status => write!(f, "status"),
            Self::Peers => write!(f, "peers"),
            Self::Routes => write!(f, "routes"),
            Self::Rules => write!(f, "rules"),
        }
    }
}

/// Errors returned by the WireGuard manager.
#[derive(Debug, Error)]
pub enum WireguardError {
    /// The configuration is invalid.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Invalid key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The device could not be created, updated or removed.
    #[error("device {interface}: {source}")]
    Device {
        /// Interface name.
        interface: String,
        /// Underlying failure.
        #[source]
        source: DataplaneError,
    },

    /// A kernel tunable could not be written.
    #[error("writing {path}: {source}")]
    Sysctl {
        /// Path of the tunable.
        path: String,
        /// Underlying failure.
        #[source]
        source: DataplaneError,
    },

    /// The status callback rejected the local public key.
    #[error("reporting public key: {0}")]
    Status(#[source] DataplaneError),

    /// A peer could not be listed, set or removed.
    #[error("peer {peer}: {source}")]
    Peer {
        /// Base64 public key, or `*` for listing.
        peer: String,
        /// Underlying failure.
        #[source]
        source: DataplaneError,
    },

    /// A route could not be listed, added or deleted.
    #[error("route {}: {source}", .cidr.as_ref().map_or_else(|| "*".to_string(), ToString::to_string))]
    Route {
        /// Destination, or `None` for listing.
        cidr: Option<IpNet>,
        /// Underlying failure.
        #[source]
        source: DataplaneError,
    },

    /// A policy rule could not be listed, added or deleted.
    #[error("rule {}: {source}", .rule.as_ref().map_or_else(|| "*".to_string(), ToString::to_string))]
    Rule {
        /// The rule, or `None` for listing.
        rule: Option<RuleSpec>,
        /// Underlying failure.
        #[source]
        source: DataplaneError,
    },

    /// The kernel cannot match on an inverted firewall mark with a mask.
    #[error("kernel does not support inverted fwmark/mask rule matching")]
    UnsupportedRuleMatching,
}

impl WireguardError {
    /// Returns the apply step this error belongs to, if any.
    #[must_use]
    pub fn step(&self) -> Option<ApplyStep> {
        match self {
            Self::InvalidConfig(_) | Self::InvalidKey(_) => None,
            Self::Device { .. } | Self::Sysctl { .. } => Some(ApplyStep::Device),
            Self::Status(_) => Some(ApplyStep::Status),
            Self::Peer { .. } => Some(ApplyStep::Peers),
            Self::Route { .. } => Some(ApplyStep::Routes),
            Self::Rule { .. } | Self::UnsupportedRuleMatching => Some(ApplyStep::Rules),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_report_their_step() {
        let err = WireguardError::Route {
            cidr: Some("10.0.0.0/16".parse().expect("cidr")),
            source: DataplaneError::Kernel("EBUSY".into()),
        };
        assert_eq!(err.step(), Some(ApplyStep::Routes));
        assert_eq!(err.to_string(), "route 10.0.0.0/16: kernel error: EBUSY");

        let err = WireguardError::Rule { rule: None, source: DataplaneError::NotFound("x".into()) };
        assert_eq!(err.step(), Some(ApplyStep::Rules));
        assert!(err.to_string().starts_with("rule *:"));

        assert_eq!(WireguardError::InvalidConfig("x".into()).step(), None);
        assert_eq!(WireguardError::UnsupportedRuleMatching.step(), Some(ApplyStep::Rules));
    }

    #[test]
    fn source_is_preserved() {
        use std::error::Error as _;
        let err = WireguardError::Status(DataplaneError::Kernel("down".into()));
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "kernel error: down");
    }
}
