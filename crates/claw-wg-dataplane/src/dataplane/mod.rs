//! Ports through which the manager touches the kernel.
//!
//! Each port has a production implementation (`ip`, `sys`, `linux`) and an
//! in-memory double in [`fake`]. All calls are blocking.

pub mod fake;
pub mod ip;
#[cfg(feature = "linux")]
pub mod linux;
pub mod sys;

use std::fmt;

use crate::error::DataplaneError;
use crate::keys::PublicKey;
use crate::types::{DesiredPeer, DeviceConfig, RouteEntry, RuleSpec};

/// Policy-rule table access.
pub trait RulePort: Send {
    /// Lists the rules installed at `priority`.
    fn list_rules(&mut self, priority: u32) -> Result<Vec<RuleSpec>, DataplaneError>;

    /// Adds a rule.
    fn add_rule(&mut self, rule: &RuleSpec) -> Result<(), DataplaneError>;

    /// Deletes a rule matching every field of `rule`.
    fn delete_rule(&mut self, rule: &RuleSpec) -> Result<(), DataplaneError>;
}

/// Route table access.
pub trait RoutePort: Send {
    /// Lists routes in `table` carrying the `protocol` tag.
    fn list_routes(&mut self, table: u32, protocol: u8) -> Result<Vec<RouteEntry>, DataplaneError>;

    /// Adds or replaces the route to `route.cidr` in `route.table`.
    fn add_route(&mut self, route: &RouteEntry) -> Result<(), DataplaneError>;

    /// Deletes a route.
    fn delete_route(&mut self, route: &RouteEntry) -> Result<(), DataplaneError>;
}

/// WireGuard device control.
pub trait WireguardPort: Send {
    /// Creates the device if missing and applies `config`.
    ///
    /// Returns `true` when the device was created by this call.
    fn ensure_device(&mut self, config: &DeviceConfig) -> Result<bool, DataplaneError>;

    /// Deletes the device; succeeds if it does not exist.
    fn delete_device(&mut self, name: &str) -> Result<(), DataplaneError>;

    /// Lists the public keys of the device's peers.
    fn list_peers(&mut self, name: &str) -> Result<Vec<PublicKey>, DataplaneError>;

    /// Creates or replaces a peer, including its allowed CIDRs.
    fn set_peer(&mut self, name: &str, peer: &DesiredPeer) -> Result<(), DataplaneError>;

    /// Removes a peer.
    fn remove_peer(&mut self, name: &str, public_key: &PublicKey) -> Result<(), DataplaneError>;
}

/// Kernel capability checks.
pub trait FeatureDetector: Send {
    /// Whether rules can match an inverted firewall mark under a mask.
    fn supports_inverted_mark_mask(&self) -> bool;
}

/// Receives the local device public key for upstream publication.
pub trait StatusReporter: Send {
    /// Publishes `public_key`.
    fn report_public_key(&mut self, public_key: &PublicKey) -> Result<(), DataplaneError>;
}

impl<F> StatusReporter for F
where
    F: FnMut(&PublicKey) -> Result<(), DataplaneError> + Send,
{
    fn report_public_key(&mut self, public_key: &PublicKey) -> Result<(), DataplaneError> {
        self(public_key)
    }
}

/// Writes kernel tunables under `/proc/sys`.
pub trait SysctlWriter: Send {
    /// Writes `value` to `path`.
    fn write(&mut self, path: &str, value: &str) -> Result<(), DataplaneError>;
}

impl<F> SysctlWriter for F
where
    F: FnMut(&str, &str) -> Result<(), DataplaneError> + Send,
{
    fn write(&mut self, path: &str, value: &str) -> Result<(), DataplaneError> {
        self(path, value)
    }
}

/// The full set of ports a manager needs.
pub struct Dataplane {
    /// Policy rules.
    pub rules: Box<dyn RulePort>,
    /// Routes.
    pub routes: Box<dyn RoutePort>,
    /// WireGuard device.
    pub wireguard: Box<dyn WireguardPort>,
    /// Kernel features.
    pub features: Box<dyn FeatureDetector>,
    /// Public-key publication.
    pub status: Box<dyn StatusReporter>,
    /// `/proc/sys` writes.
    pub sysctl: Box<dyn SysctlWriter>,
}

impl fmt::Debug for Dataplane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataplane").finish_non_exhaustive()
    }
}

#[cfg(feature = "linux")]
impl Dataplane {
    /// Builds the production dataplane: iproute2 for rules and routes,
    /// kernel WireGuard over netlink, `/proc/sys` writes.
    #[must_use]
    pub fn linux(family: crate::types::IpFamily, status: impl StatusReporter + 'static) -> Self {
        Self {
            rules: Box::new(ip::IpRules::new(family)),
            routes: Box::new(ip::IpRoutes::new(family)),
            wireguard: Box::new(linux::LinuxWireguard::new()),
            features: Box::new(sys::KernelFeatures::detect()),
            status: Box::new(status),
            sysctl: Box::new(sys::ProcSysWriter),
        }
    }
}
