//! The WireGuard dataplane manager.
//!
//! [`WireguardManager`] owns the fact store, the interface state machine and
//! the three reconcilers. Upstream feeds it facts and link notifications;
//! the control loop calls [`WireguardManager::apply`], retrying with backoff
//! on error. Nothing here is shared across threads.

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dataplane::Dataplane;
use crate::desired::{compute_desired_state, DesiredState};
use crate::error::{Result, WireguardError};
use crate::facts::FactStore;
use crate::iface::{InterfaceState, InterfaceStateMachine, Transition};
use crate::keys::{PrivateKey, PublicKey};
use crate::peers::{PeerDelta, PeerReconciler};
use crate::routes::{RouteDelta, RouteReconciler};
use crate::rules::{RuleDelta, RuleReconciler};
use crate::types::{DeviceConfig, IpFamily, OperStatus};

/// Makes reverse-path filtering honour the firewall mark.
pub const SRC_VALID_MARK_SYSCTL: &str = "/proc/sys/net/ipv4/conf/all/src_valid_mark";

/// What one successful [`WireguardManager::apply`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// The device was created by this apply.
    pub device_created: bool,
    /// The manager is disabled and removed its device and rules.
    pub torn_down: bool,
    /// Peers and routes were not programmed because the link is not up.
    pub deferred: bool,
    /// Rule operations.
    pub rules: RuleDelta,
    /// Peer operations.
    pub peers: PeerDelta,
    /// Route operations.
    pub routes: RouteDelta,
}

impl ApplySummary {
    /// Whether any kernel object was created, changed or removed.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.device_created
            || self.torn_down
            || self.rules != RuleDelta::default()
            || self.peers != PeerDelta::default()
            || self.routes != RouteDelta::default()
    }
}

/// Reconciles one node's WireGuard device, peers, routes and rules.
#[derive(Debug)]
pub struct WireguardManager {
    config: Config,
    private_key: PrivateKey,
    dataplane: Dataplane,
    facts: FactStore,
    iface: InterfaceStateMachine,
    rules: RuleReconciler,
    peers: PeerReconciler,
    routes: RouteReconciler,
    reported_key: Option<PublicKey>,
    // Set from device creation until its follow-up work has succeeded.
    device_pending: bool,
    torn_down: bool,
}

impl WireguardManager {
    /// Creates a manager with a freshly generated private key.
    ///
    /// # Errors
    ///
    /// Returns [`WireguardError::InvalidConfig`] if `config` does not validate.
    pub fn new(config: Config, dataplane: Dataplane) -> Result<Self> {
        config.validate()?;
        info!(
            interface = %config.interface_name,
            node = %config.node_name,
            enabled = config.enabled,
            family = %config.family,
            "creating WireGuard manager"
        );
        Ok(Self {
            iface: InterfaceStateMachine::new(config.interface_name.clone()),
            rules: RuleReconciler::new(config.routing_rule_priority, config.routing_table_index),
            peers: PeerReconciler::new(),
            routes: RouteReconciler::new(config.routing_table_index, config.route_protocol),
            private_key: PrivateKey::generate(),
            facts: FactStore::new(),
            reported_key: None,
            device_pending: false,
            torn_down: false,
            dataplane,
            config,
        })
    }

    /// Uses `key` as the device private key instead of a generated one.
    #[must_use]
    pub fn with_private_key(mut self, key: PrivateKey) -> Self {
        self.private_key = key;
        self
    }

    /// The device public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The current facts.
    #[must_use]
    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    /// Last known link state.
    #[must_use]
    pub fn interface_state(&self) -> &InterfaceState {
        self.iface.state()
    }

    /// The state the next apply would converge to.
    #[must_use]
    pub fn desired_state(&self) -> DesiredState {
        compute_desired_state(&self.facts, &self.config)
    }

    /// Records a node's public key and tunnel interface address.
    pub fn upsert_peer_identity(&mut self, node: &str, public_key: Option<PublicKey>, interface_addr: Option<IpAddr>) {
        self.facts.upsert_peer_identity(node, public_key, interface_addr);
    }

    /// Forgets a node's public key and tunnel interface address.
    pub fn remove_peer_identity(&mut self, node: &str) {
        self.facts.remove_peer_identity(node);
    }

    /// Records a node's underlay address.
    pub fn upsert_peer_address(&mut self, node: &str, addr: Option<IpAddr>) {
        self.facts.upsert_peer_address(node, addr);
    }

    /// Forgets a node's underlay address.
    pub fn remove_peer_address(&mut self, node: &str) {
        self.facts.remove_peer_address(node);
    }

    /// Records that `cidr` is reachable through `node`.
    pub fn upsert_route(&mut self, node: &str, cidr: IpNet) {
        self.facts.upsert_route(node, cidr);
    }

    /// Forgets `cidr`.
    pub fn remove_route(&mut self, cidr: IpNet) {
        self.facts.remove_route(cidr);
    }

    /// Handles a link-state notification.
    ///
    /// Coming up, or changing index while up, schedules a full peer and
    /// route resync for the next apply.
    pub fn on_interface_state_changed(&mut self, name: &str, index: u32, status: OperStatus) -> Transition {
        let transition = self.iface.on_state_changed(name, index, status);
        if transition.needs_resync() {
            self.peers.mark_resync();
            self.routes.mark_resync();
        }
        transition
    }

    /// Converges the kernel to the current facts.
    ///
    /// Runs device, status, peers, routes and rules in that order and stops
    /// at the first error. Work completed before the error is kept, so a
    /// retry only repeats what is left.
    pub fn apply(&mut self) -> Result<ApplySummary> {
        if !self.config.enabled {
            return self.teardown();
        }

        let desired = self.desired_state();
        let mut summary = ApplySummary { device_created: self.ensure_device(&desired)?, ..ApplySummary::default() };

        self.report_status()?;

        let name = self.config.interface_name.as_str();
        if self.iface.is_up() {
            summary.peers = self.peers.reconcile(self.dataplane.wireguard.as_mut(), name, &desired.peers)?;
            summary.routes =
                self.routes.reconcile(self.dataplane.routes.as_mut(), &desired.routes, self.iface.index())?;
        } else {
            debug!(interface = name, status = %self.iface.state().oper_status, "interface not up, deferring peers and routes");
            summary.deferred = true;
        }

        if !self.dataplane.features.supports_inverted_mark_mask() {
            warn!(interface = name, "kernel lacks inverted fwmark/mask rule matching");
            return Err(WireguardError::UnsupportedRuleMatching);
        }
        summary.rules = self.rules.reconcile(self.dataplane.rules.as_mut(), &desired.rules)?;

        if summary.has_changes() {
            info!(interface = name, ?summary, "applied WireGuard dataplane");
        }
        Ok(summary)
    }

    fn ensure_device(&mut self, desired: &DesiredState) -> Result<bool> {
        let config = DeviceConfig { spec: desired.device.clone(), private_key: self.private_key.clone() };
        let interface = &self.config.interface_name;
        let created = match self.dataplane.wireguard.ensure_device(&config) {
            Ok(created) => created,
            Err(source) => {
                // The device may exist half-configured; treat the retry as a creation.
                self.device_pending = true;
                return Err(WireguardError::Device { interface: interface.clone(), source });
            }
        };
        if created {
            info!(interface = %interface, port = config.spec.listen_port, "created WireGuard device");
            self.device_pending = true;
        }
        if !self.device_pending {
            return Ok(created);
        }

        // A new device starts without peers or routes.
        self.peers.mark_resync();
        self.routes.mark_resync();
        if self.config.family == IpFamily::V4 {
            self.dataplane
                .sysctl
                .write(SRC_VALID_MARK_SYSCTL, "1")
                .map_err(|source| WireguardError::Sysctl { path: SRC_VALID_MARK_SYSCTL.to_string(), source })?;
        }
        self.device_pending = false;
        Ok(created)
    }

    fn report_status(&mut self) -> Result<()> {
        let public_key = self.public_key();
        let published = self.facts.node(&self.config.node_name).and_then(|n| n.public_key);
        let stale = published.is_some_and(|k| k != public_key);
        if self.reported_key == Some(public_key) && !stale {
            return Ok(());
        }
        debug!(key = %public_key, ?published, "reporting device public key");
        self.dataplane.status.report_public_key(&public_key).map_err(WireguardError::Status)?;
        self.reported_key = Some(public_key);
        Ok(())
    }

    fn teardown(&mut self) -> Result<ApplySummary> {
        if self.torn_down {
            return Ok(ApplySummary::default());
        }
        let interface = &self.config.interface_name;
        info!(interface = %interface, "WireGuard disabled, removing device and rules");
        self.dataplane
            .wireguard
            .delete_device(interface)
            .map_err(|source| WireguardError::Device { interface: interface.clone(), source })?;
        self.peers.clear();
        self.routes.clear();
        self.iface.reset();
        self.device_pending = false;

        let deleted = self.rules.clear(self.dataplane.rules.as_mut())?;
        self.torn_down = true;
        Ok(ApplySummary {
            torn_down: true,
            rules: RuleDelta { added: 0, deleted },
            ..ApplySummary::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::fake::{FakeDataplane, FakeOp};
    use crate::dataplane::WireguardPort;
    use crate::error::ApplyStep;
    use crate::keys::KEY_SIZE;

    const LOCAL: &str = "local";

    fn manager(fake: &FakeDataplane, config: Config) -> WireguardManager {
        WireguardManager::new(config, fake.dataplane())
            .expect("valid config")
            .with_private_key(PrivateKey::from_bytes([7u8; KEY_SIZE]))
    }

    fn config() -> Config {
        Config::new(LOCAL).with_interface_name("wg0").with_firewall_mark(0xa).with_table_index(1000)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let fake = FakeDataplane::new();
        let err = WireguardManager::new(Config::new(""), fake.dataplane()).expect_err("empty node");
        assert!(matches!(err, WireguardError::InvalidConfig(_)));
    }

    #[test]
    fn first_apply_creates_device_and_reports_key() {
        let fake = FakeDataplane::new();
        let mut mgr = manager(&fake, config());
        let summary = mgr.apply().expect("apply");

        assert!(summary.device_created);
        assert!(summary.deferred);
        let device = fake.device("wg0").expect("device");
        assert_eq!(device.config.spec.firewall_mark, 0xa);
        assert_eq!(device.config.private_key, PrivateKey::from_bytes([7u8; KEY_SIZE]));
        assert_eq!(fake.reported_keys(), vec![mgr.public_key()]);
        assert_eq!(fake.sysctl_writes(), vec![(SRC_VALID_MARK_SYSCTL.to_string(), "1".to_string())]);
    }

    #[test]
    fn status_is_reported_once_unless_upstream_disagrees() {
        let fake = FakeDataplane::new();
        let mut mgr = manager(&fake, config());
        mgr.apply().expect("first");
        fake.reset_deltas();

        mgr.apply().expect("second");
        assert!(fake.reported_keys().is_empty());

        // Upstream holds a stale key for us.
        mgr.upsert_peer_identity(LOCAL, Some(PublicKey::from_bytes([1u8; KEY_SIZE])), None);
        mgr.apply().expect("third");
        assert_eq!(fake.reported_keys(), vec![mgr.public_key()]);

        fake.reset_deltas();
        mgr.upsert_peer_identity(LOCAL, Some(mgr.public_key()), None);
        mgr.apply().expect("fourth");
        assert!(fake.reported_keys().is_empty());
    }

    #[test]
    fn no_sysctl_for_ipv6() {
        let fake = FakeDataplane::new();
        let mut mgr = manager(&fake, config().with_family(IpFamily::V6).with_mtu(1420));
        mgr.apply().expect("apply");
        assert!(fake.sysctl_writes().is_empty());
    }

    #[test]
    fn errors_name_the_failed_step() {
        let cases = [
            (FakeOp::EnsureDevice, ApplyStep::Device),
            (FakeOp::WriteSysctl, ApplyStep::Device),
            (FakeOp::ReportStatus, ApplyStep::Status),
            (FakeOp::ListRules, ApplyStep::Rules),
        ];
        for (op, step) in cases {
            let fake = FakeDataplane::new();
            let mut mgr = manager(&fake, config());
            fake.fail_next(op);
            let err = mgr.apply().expect_err("injected failure");
            assert_eq!(err.step(), Some(step), "{op:?}");
        }
    }

    #[test]
    fn half_configured_device_is_finished_on_retry() {
        let fake = FakeDataplane::new();
        let mut mgr = manager(&fake, config());
        // The link was created but configuring it failed.
        let device = DeviceConfig {
            spec: mgr.desired_state().device,
            private_key: PrivateKey::from_bytes([7u8; KEY_SIZE]),
        };
        fake.clone().ensure_device(&device).expect("create link");
        fake.fail_next(FakeOp::EnsureDevice);
        let err = mgr.apply().expect_err("configure fails");
        assert_eq!(err.step(), Some(ApplyStep::Device));
        assert!(fake.sysctl_writes().is_empty());

        let summary = mgr.apply().expect("retry");
        assert!(!summary.device_created);
        assert_eq!(fake.sysctl_writes(), vec![(SRC_VALID_MARK_SYSCTL.to_string(), "1".to_string())]);

        fake.reset_deltas();
        mgr.apply().expect("steady");
        assert!(fake.sysctl_writes().is_empty());
    }

    #[test]
    fn unsupported_kernel_fails_before_touching_rules() {
        let fake = FakeDataplane::new();
        fake.set_mark_mask_support(false);
        let mut mgr = manager(&fake, config());
        mgr.upsert_route(LOCAL, "10.161.0.0/16".parse().expect("cidr"));

        let err = mgr.apply().expect_err("unsupported");
        assert!(matches!(err, WireguardError::UnsupportedRuleMatching));
        assert!(!fake.calls().iter().any(|op| matches!(op, FakeOp::ListRules | FakeOp::AddRule | FakeOp::DeleteRule)));
        assert!(fake.rules().is_empty());
    }

    #[test]
    fn disabled_manager_tears_down_once() {
        let fake = FakeDataplane::new();
        let mut enabled = manager(&fake, config());
        enabled.upsert_route(LOCAL, "10.161.0.0/16".parse().expect("cidr"));
        enabled.apply().expect("enabled apply");
        assert_eq!(fake.rules().len(), 1);

        // A later run with the feature turned off.
        let mut disabled = manager(&fake, config().with_enabled(false));
        let summary = disabled.apply().expect("teardown");
        assert!(summary.torn_down);
        assert_eq!(summary.rules.deleted, 1);
        assert!(fake.device("wg0").is_none());
        assert!(fake.rules().is_empty());

        fake.reset_deltas();
        assert_eq!(disabled.apply().expect("again"), ApplySummary::default());
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn interface_events_for_other_links_are_ignored() {
        let fake = FakeDataplane::new();
        let mut mgr = manager(&fake, config());
        assert_eq!(mgr.on_interface_state_changed("eth0", 2, OperStatus::Up), Transition::Ignored);
        assert_ne!(mgr.interface_state().oper_status, OperStatus::Up);
    }
}
