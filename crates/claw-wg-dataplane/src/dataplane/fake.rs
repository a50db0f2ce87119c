//! In-memory dataplane for tests.
//!
//! One [`FakeDataplane`] backs every port. Clones share state, so a test
//! keeps a handle while the manager owns the boxed ports. Besides the
//! current kernel contents it records every mutation as a delta, and can
//! inject a failure into any operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;

use crate::dataplane::{
    Dataplane, FeatureDetector, RoutePort, RulePort, StatusReporter, SysctlWriter, WireguardPort,
};
use crate::error::DataplaneError;
use crate::keys::PublicKey;
use crate::types::{DesiredPeer, DeviceConfig, RouteEntry, RuleSpec};

/// A port operation, for call tracking and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    /// [`RulePort::list_rules`].
    ListRules,
    /// [`RulePort::add_rule`].
    AddRule,
    /// [`RulePort::delete_rule`].
    DeleteRule,
    /// [`RoutePort::list_routes`].
    ListRoutes,
    /// [`RoutePort::add_route`].
    AddRoute,
    /// [`RoutePort::delete_route`].
    DeleteRoute,
    /// [`WireguardPort::ensure_device`].
    EnsureDevice,
    /// [`WireguardPort::delete_device`].
    DeleteDevice,
    /// [`WireguardPort::list_peers`].
    ListPeers,
    /// [`WireguardPort::set_peer`].
    SetPeer,
    /// [`WireguardPort::remove_peer`].
    RemovePeer,
    /// [`StatusReporter::report_public_key`].
    ReportStatus,
    /// [`SysctlWriter::write`].
    WriteSysctl,
}

impl FakeOp {
    /// Whether the operation touches peers or routes.
    #[must_use]
    pub const fn is_peer_or_route(self) -> bool {
        matches!(
            self,
            Self::ListRoutes
                | Self::AddRoute
                | Self::DeleteRoute
                | Self::ListPeers
                | Self::SetPeer
                | Self::RemovePeer
        )
    }
}

/// A fake WireGuard device.
#[derive(Debug, Clone)]
pub struct FakeDevice {
    /// Last applied configuration.
    pub config: DeviceConfig,
    /// Index assigned at creation.
    pub index: u32,
    /// Peers by public key.
    pub peers: BTreeMap<PublicKey, DesiredPeer>,
}

#[derive(Debug)]
struct FakeState {
    rules: Vec<RuleSpec>,
    routes: BTreeMap<(u32, IpNet), RouteEntry>,
    devices: BTreeMap<String, FakeDevice>,
    next_index: u32,
    supports_mark_mask: bool,

    added_rules: Vec<RuleSpec>,
    deleted_rules: Vec<RuleSpec>,
    added_routes: Vec<RouteEntry>,
    deleted_routes: Vec<RouteEntry>,
    set_peers: Vec<DesiredPeer>,
    removed_peers: Vec<PublicKey>,
    reported_keys: Vec<PublicKey>,
    sysctl_writes: Vec<(String, String)>,
    calls: Vec<FakeOp>,

    // Calls of an op to let through before failing one.
    failures: HashMap<FakeOp, usize>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            routes: BTreeMap::new(),
            devices: BTreeMap::new(),
            next_index: 1,
            supports_mark_mask: true,
            added_rules: Vec::new(),
            deleted_rules: Vec::new(),
            added_routes: Vec::new(),
            deleted_routes: Vec::new(),
            set_peers: Vec::new(),
            removed_peers: Vec::new(),
            reported_keys: Vec::new(),
            sysctl_writes: Vec::new(),
            calls: Vec::new(),
            failures: HashMap::new(),
        }
    }
}

impl FakeState {
    fn enter(&mut self, op: FakeOp) -> Result<(), DataplaneError> {
        self.calls.push(op);
        match self.failures.get_mut(&op) {
            Some(0) => {
                self.failures.remove(&op);
                Err(DataplaneError::Kernel(format!("injected {op:?} failure")))
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn device_mut(&mut self, name: &str) -> Result<&mut FakeDevice, DataplaneError> {
        self.devices.get_mut(name).ok_or_else(|| DataplaneError::NotFound(format!("link {name}")))
    }
}

/// Shared in-memory kernel.
#[derive(Debug, Clone, Default)]
pub struct FakeDataplane {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDataplane {
    /// Creates an empty fake kernel that supports mark/mask rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Boxes clones of this fake as a full [`Dataplane`].
    #[must_use]
    pub fn dataplane(&self) -> Dataplane {
        Dataplane {
            rules: Box::new(self.clone()),
            routes: Box::new(self.clone()),
            wireguard: Box::new(self.clone()),
            features: Box::new(self.clone()),
            status: Box::new(self.clone()),
            sysctl: Box::new(self.clone()),
        }
    }

    /// Sets the answer of the feature detector.
    pub fn set_mark_mask_support(&self, supported: bool) {
        self.state.lock().supports_mark_mask = supported;
    }

    /// Fails the next call of `op`.
    pub fn fail_next(&self, op: FakeOp) {
        self.fail_after(op, 0);
    }

    /// Lets `successes` calls of `op` through, then fails the next one.
    pub fn fail_after(&self, op: FakeOp, successes: usize) {
        self.state.lock().failures.insert(op, successes);
    }

    /// Installs a rule without recording a delta, as if left by another run.
    pub fn install_rule(&self, rule: RuleSpec) {
        self.state.lock().rules.push(rule);
    }

    /// Installs a route without recording a delta.
    pub fn install_route(&self, route: RouteEntry) {
        self.state.lock().routes.insert((route.table, route.cidr), route);
    }

    /// Clears recorded deltas and calls; kernel contents are kept.
    pub fn reset_deltas(&self) {
        let mut state = self.state.lock();
        state.added_rules.clear();
        state.deleted_rules.clear();
        state.added_routes.clear();
        state.deleted_routes.clear();
        state.set_peers.clear();
        state.removed_peers.clear();
        state.reported_keys.clear();
        state.sysctl_writes.clear();
        state.calls.clear();
    }

    /// Rules currently installed.
    #[must_use]
    pub fn rules(&self) -> Vec<RuleSpec> {
        self.state.lock().rules.clone()
    }

    /// Routes currently installed.
    #[must_use]
    pub fn routes(&self) -> Vec<RouteEntry> {
        self.state.lock().routes.values().cloned().collect()
    }

    /// A device, if it exists.
    #[must_use]
    pub fn device(&self, name: &str) -> Option<FakeDevice> {
        self.state.lock().devices.get(name).cloned()
    }

    /// Rules added since the last reset.
    #[must_use]
    pub fn added_rules(&self) -> Vec<RuleSpec> {
        self.state.lock().added_rules.clone()
    }

    /// Rules deleted since the last reset.
    #[must_use]
    pub fn deleted_rules(&self) -> Vec<RuleSpec> {
        self.state.lock().deleted_rules.clone()
    }

    /// Routes added or replaced since the last reset.
    #[must_use]
    pub fn added_routes(&self) -> Vec<RouteEntry> {
        self.state.lock().added_routes.clone()
    }

    /// Routes deleted since the last reset.
    #[must_use]
    pub fn deleted_routes(&self) -> Vec<RouteEntry> {
        self.state.lock().deleted_routes.clone()
    }

    /// Peers set since the last reset.
    #[must_use]
    pub fn set_peers(&self) -> Vec<DesiredPeer> {
        self.state.lock().set_peers.clone()
    }

    /// Peers removed since the last reset.
    #[must_use]
    pub fn removed_peers(&self) -> Vec<PublicKey> {
        self.state.lock().removed_peers.clone()
    }

    /// Keys reported through the status callback since the last reset.
    #[must_use]
    pub fn reported_keys(&self) -> Vec<PublicKey> {
        self.state.lock().reported_keys.clone()
    }

    /// Sysctl writes since the last reset.
    #[must_use]
    pub fn sysctl_writes(&self) -> Vec<(String, String)> {
        self.state.lock().sysctl_writes.clone()
    }

    /// Every port call since the last reset, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<FakeOp> {
        self.state.lock().calls.clone()
    }
}

impl RulePort for FakeDataplane {
    fn list_rules(&mut self, priority: u32) -> Result<Vec<RuleSpec>, DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::ListRules)?;
        Ok(state.rules.iter().filter(|r| r.priority == priority).copied().collect())
    }

    fn add_rule(&mut self, rule: &RuleSpec) -> Result<(), DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::AddRule)?;
        state.rules.push(*rule);
        state.added_rules.push(*rule);
        Ok(())
    }

    fn delete_rule(&mut self, rule: &RuleSpec) -> Result<(), DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::DeleteRule)?;
        let pos = state
            .rules
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| DataplaneError::NotFound(format!("rule {rule}")))?;
        state.rules.remove(pos);
        state.deleted_rules.push(*rule);
        Ok(())
    }
}

impl RoutePort for FakeDataplane {
    fn list_routes(&mut self, table: u32, protocol: u8) -> Result<Vec<RouteEntry>, DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::ListRoutes)?;
        Ok(state
            .routes
            .values()
            .filter(|r| r.table == table && r.protocol == protocol)
            .cloned()
            .collect())
    }

    fn add_route(&mut self, route: &RouteEntry) -> Result<(), DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::AddRoute)?;
        state.routes.insert((route.table, route.cidr), route.clone());
        state.added_routes.push(route.clone());
        Ok(())
    }

    fn delete_route(&mut self, route: &RouteEntry) -> Result<(), DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::DeleteRoute)?;
        if state.routes.remove(&(route.table, route.cidr)).is_none() {
            return Err(DataplaneError::NotFound(format!("route {route}")));
        }
        state.deleted_routes.push(route.clone());
        Ok(())
    }
}

impl WireguardPort for FakeDataplane {
    fn ensure_device(&mut self, config: &DeviceConfig) -> Result<bool, DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::EnsureDevice)?;
        if let Some(device) = state.devices.get_mut(&config.spec.name) {
            device.config = config.clone();
            return Ok(false);
        }
        let index = state.next_index;
        state.next_index += 1;
        state.devices.insert(
            config.spec.name.clone(),
            FakeDevice { config: config.clone(), index, peers: BTreeMap::new() },
        );
        Ok(true)
    }

    fn delete_device(&mut self, name: &str) -> Result<(), DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::DeleteDevice)?;
        if state.devices.remove(name).is_some() {
            // Routes via the link go with it.
            state.routes.retain(|_, r| !matches!(&r.kind, crate::types::RouteKind::Interface { name: n, .. } if n == name));
        }
        Ok(())
    }

    fn list_peers(&mut self, name: &str) -> Result<Vec<PublicKey>, DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::ListPeers)?;
        Ok(state.device_mut(name)?.peers.keys().copied().collect())
    }

    fn set_peer(&mut self, name: &str, peer: &DesiredPeer) -> Result<(), DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::SetPeer)?;
        state.device_mut(name)?.peers.insert(peer.public_key, peer.clone());
        state.set_peers.push(peer.clone());
        Ok(())
    }

    fn remove_peer(&mut self, name: &str, public_key: &PublicKey) -> Result<(), DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::RemovePeer)?;
        if state.device_mut(name)?.peers.remove(public_key).is_none() {
            return Err(DataplaneError::NotFound(format!("peer {public_key}")));
        }
        state.removed_peers.push(*public_key);
        Ok(())
    }
}

impl FeatureDetector for FakeDataplane {
    fn supports_inverted_mark_mask(&self) -> bool {
        self.state.lock().supports_mark_mask
    }
}

impl StatusReporter for FakeDataplane {
    fn report_public_key(&mut self, public_key: &PublicKey) -> Result<(), DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::ReportStatus)?;
        state.reported_keys.push(*public_key);
        Ok(())
    }
}

impl SysctlWriter for FakeDataplane {
    fn write(&mut self, path: &str, value: &str) -> Result<(), DataplaneError> {
        let mut state = self.state.lock();
        state.enter(FakeOp::WriteSysctl)?;
        state.sysctl_writes.push((path.to_string(), value.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{PrivateKey, KEY_SIZE};
    use crate::types::{DeviceSpec, RouteKind};

    fn rule(src: &str) -> RuleSpec {
        RuleSpec { priority: 99, table: 1000, invert: true, mark: 0xa, mask: 0xa, src: Some(src.parse().expect("cidr")) }
    }

    fn device_config(name: &str) -> DeviceConfig {
        DeviceConfig {
            spec: DeviceSpec { name: name.into(), listen_port: 51820, mtu: 1420, firewall_mark: 0xa, address: None },
            private_key: PrivateKey::from_bytes([1u8; KEY_SIZE]),
        }
    }

    #[test]
    fn clones_share_state() {
        let fake = FakeDataplane::new();
        let mut port = fake.clone();
        port.add_rule(&rule("10.0.0.0/16")).expect("add");
        assert_eq!(fake.rules().len(), 1);
        assert_eq!(fake.added_rules().len(), 1);
        fake.reset_deltas();
        assert!(fake.added_rules().is_empty());
        assert_eq!(fake.rules().len(), 1);
    }

    #[test]
    fn delete_missing_rule_fails() {
        let mut fake = FakeDataplane::new();
        assert!(matches!(fake.delete_rule(&rule("10.0.0.0/16")), Err(DataplaneError::NotFound(_))));
    }

    #[test]
    fn injected_failure_fires_once() {
        let mut fake = FakeDataplane::new();
        fake.fail_after(FakeOp::AddRule, 1);
        assert!(fake.add_rule(&rule("10.0.0.0/16")).is_ok());
        assert!(fake.add_rule(&rule("10.1.0.0/16")).is_err());
        assert!(fake.add_rule(&rule("10.1.0.0/16")).is_ok());
        assert_eq!(fake.rules().len(), 2);
    }

    #[test]
    fn device_lifecycle() {
        let mut fake = FakeDataplane::new();
        assert!(fake.ensure_device(&device_config("wg0")).expect("create"));
        assert!(!fake.ensure_device(&device_config("wg0")).expect("update"));

        let peer = DesiredPeer {
            public_key: PublicKey::from_bytes([2u8; KEY_SIZE]),
            endpoint: "10.0.0.2:51820".parse().expect("endpoint"),
            allowed_cidrs: ["10.162.0.0/16".parse().expect("cidr")].into(),
        };
        fake.set_peer("wg0", &peer).expect("set");
        assert_eq!(fake.list_peers("wg0").expect("list"), vec![peer.public_key]);
        assert!(fake.set_peer("wg1", &peer).is_err());

        fake.install_route(RouteEntry {
            table: 1000,
            cidr: "10.162.0.0/16".parse().expect("cidr"),
            kind: RouteKind::Interface { name: "wg0".into(), index: 1 },
            protocol: 80,
        });
        fake.delete_device("wg0").expect("delete");
        assert!(fake.device("wg0").is_none());
        assert!(fake.routes().is_empty());
        fake.delete_device("wg0").expect("delete is idempotent");
    }
}
