//! Derives the rules, peers, routes and device settings that should exist.
//!
//! [`compute_desired_state`] is a pure function of the fact store and the
//! config, so every apply can recompute it from scratch.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use ipnet::IpNet;
use tracing::debug;

use crate::config::Config;
use crate::facts::{FactStore, NodeFacts};
use crate::keys::PublicKey;
use crate::types::{DesiredPeer, DesiredRoute, DeviceSpec, RouteClass, RouteTarget, RuleSpec};

/// Everything the kernel should hold after a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    /// Policy rules, compared as a whole set.
    pub rules: BTreeSet<RuleSpec>,
    /// Peers keyed by public key.
    pub peers: BTreeMap<PublicKey, DesiredPeer>,
    /// Routes keyed by destination.
    pub routes: BTreeMap<IpNet, DesiredRoute>,
    /// Device settings.
    pub device: DeviceSpec,
}

/// The rule every rule this manager programs is derived from.
#[must_use]
pub fn base_rule(config: &Config) -> RuleSpec {
    RuleSpec {
        priority: config.routing_rule_priority,
        table: config.routing_table_index,
        invert: true,
        mark: config.firewall_mark,
        mask: config.firewall_mark,
        src: None,
    }
}

/// Computes the desired state from the current facts.
#[must_use]
pub fn compute_desired_state(facts: &FactStore, config: &Config) -> DesiredState {
    let family = config.family;
    let local = facts.node(&config.node_name);

    let rules = desired_rules(local, config);

    let device = DeviceSpec {
        name: config.interface_name.clone(),
        listen_port: config.listening_port,
        mtu: config.mtu,
        firewall_mark: config.firewall_mark,
        address: local.and_then(|l| l.interface_addr).filter(|a| family.contains_addr(a)),
    };

    let mut key_users: BTreeMap<PublicKey, usize> = BTreeMap::new();
    for (_, node) in facts.nodes().filter(|(name, _)| *name != config.node_name) {
        if let Some(key) = node.public_key {
            *key_users.entry(key).or_default() += 1;
        }
    }
    let local_key = local.and_then(|l| l.public_key);

    let mut peers = BTreeMap::new();
    let mut routes = BTreeMap::new();
    for (name, node) in facts.nodes().filter(|(name, _)| *name != config.node_name) {
        let key = node.public_key.filter(|k| {
            let unique = key_users.get(k).copied() == Some(1) && Some(*k) != local_key;
            if !unique {
                debug!(node = name, key = %k, "public key shared with another node, not peering");
            }
            unique
        });
        let endpoint = node.underlay_addr.filter(|a| family.contains_addr(a));
        if node.underlay_addr.is_some() && endpoint.is_none() {
            debug!(node = name, %family, "underlay address is of another family, not peering");
        }

        let mut cidrs: BTreeSet<IpNet> =
            node.cidrs.iter().copied().filter(|c| family.contains_net(c)).collect();

        match (key, endpoint) {
            (Some(public_key), Some(addr)) => {
                if let Some(tunnel_net) = node
                    .interface_addr
                    .filter(|a| family.contains_addr(a))
                    .and_then(|a| IpNet::new(a, family.full_prefix_len()).ok())
                {
                    cidrs.insert(tunnel_net);
                }
                for cidr in &cidrs {
                    routes.insert(
                        *cidr,
                        DesiredRoute {
                            cidr: *cidr,
                            target: RouteTarget::Interface(config.interface_name.clone()),
                            protocol: config.route_protocol,
                        },
                    );
                }
                peers.insert(
                    public_key,
                    DesiredPeer {
                        public_key,
                        endpoint: SocketAddr::new(addr, config.listening_port),
                        allowed_cidrs: cidrs,
                    },
                );
            }
            _ => {
                for cidr in cidrs {
                    routes.insert(
                        cidr,
                        DesiredRoute { cidr, target: RouteTarget::Throw, protocol: config.route_protocol },
                    );
                }
            }
        }
    }

    DesiredState { rules, peers, routes, device }
}

fn desired_rules(local: Option<&NodeFacts>, config: &Config) -> BTreeSet<RuleSpec> {
    let base = base_rule(config);
    if config.encrypt_host_traffic {
        return BTreeSet::from([base]);
    }
    // Source-scope to the local node's pools; host routes never get a rule.
    local
        .map(|node| {
            node.cidrs
                .iter()
                .filter(|c| config.family.contains_net(c) && RouteClass::of(c) == RouteClass::Pool)
                .map(|c| RuleSpec { src: Some(*c), ..base })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_SIZE;

    const LOCAL: &str = "test-node";

    fn net(s: &str) -> IpNet {
        s.parse().expect("valid cidr")
    }

    fn key(b: u8) -> PublicKey {
        PublicKey::from_bytes([b; KEY_SIZE])
    }

    fn config() -> Config {
        Config::new(LOCAL).with_firewall_mark(0xa).with_table_index(1000).with_interface_name("wg0")
    }

    fn facts_with_peer() -> FactStore {
        let mut facts = FactStore::new();
        facts.upsert_peer_identity(LOCAL, Some(key(1)), Some("172.16.0.1".parse().expect("addr")));
        facts.upsert_peer_address(LOCAL, Some("10.0.0.1".parse().expect("addr")));
        facts.upsert_route(LOCAL, net("10.161.0.0/16"));
        facts.upsert_peer_identity("peer1", Some(key(2)), Some("172.16.0.2".parse().expect("addr")));
        facts.upsert_peer_address("peer1", Some("10.0.0.2".parse().expect("addr")));
        facts.upsert_route("peer1", net("10.162.0.0/16"));
        facts.upsert_route("peer1", net("10.170.1.5/32"));
        facts
    }

    #[test]
    fn rules_scoped_to_local_pools() {
        let mut facts = facts_with_peer();
        facts.upsert_route(LOCAL, net("10.161.100.10/32"));
        let state = compute_desired_state(&facts, &config());

        let srcs: Vec<_> = state.rules.iter().map(|r| r.src).collect();
        assert_eq!(srcs, vec![Some(net("10.161.0.0/16"))]);
        let rule = state.rules.iter().next().expect("rule");
        assert!(rule.invert);
        assert_eq!((rule.priority, rule.table, rule.mark, rule.mask), (99, 1000, 0xa, 0xa));
    }

    #[test]
    fn no_rules_without_local_pools() {
        let state = compute_desired_state(&FactStore::new(), &config());
        assert!(state.rules.is_empty());
    }

    #[test]
    fn encrypt_host_traffic_yields_one_unscoped_rule() {
        let config = config().with_encrypt_host_traffic(true);
        let empty = compute_desired_state(&FactStore::new(), &config);
        let full = compute_desired_state(&facts_with_peer(), &config);
        assert_eq!(empty.rules, full.rules);
        assert_eq!(full.rules.len(), 1);
        assert!(full.rules.iter().all(|r| r.src.is_none()));
    }

    #[test]
    fn peers_exclude_local_node_and_carry_all_cidrs() {
        let state = compute_desired_state(&facts_with_peer(), &config());
        assert_eq!(state.peers.len(), 1);
        let peer = state.peers.get(&key(2)).expect("peer1");
        assert_eq!(peer.endpoint, "10.0.0.2:51820".parse().expect("endpoint"));
        let allowed: Vec<_> = peer.allowed_cidrs.iter().map(ToString::to_string).collect();
        assert_eq!(allowed, vec!["10.162.0.0/16", "10.170.1.5/32", "172.16.0.2/32"]);
        assert_eq!(state.device.address, Some("172.16.0.1".parse().expect("addr")));
    }

    #[test]
    fn routes_follow_peer_usability() {
        let mut facts = facts_with_peer();
        facts.upsert_route("no-key", net("10.180.0.0/16"));
        let state = compute_desired_state(&facts, &config());

        assert_eq!(
            state.routes.get(&net("10.162.0.0/16")).map(|r| &r.target),
            Some(&RouteTarget::Interface("wg0".into()))
        );
        assert_eq!(state.routes.get(&net("10.180.0.0/16")).map(|r| &r.target), Some(&RouteTarget::Throw));
        // Local CIDRs are never routed through the table.
        assert!(!state.routes.contains_key(&net("10.161.0.0/16")));
        assert!(state.routes.values().all(|r| r.protocol == 80));
    }

    #[test]
    fn shared_keys_are_not_peered() {
        let mut facts = facts_with_peer();
        facts.upsert_peer_identity("peer2", Some(key(2)), None);
        facts.upsert_peer_address("peer2", Some("10.0.0.3".parse().expect("addr")));
        facts.upsert_route("peer2", net("10.163.0.0/16"));
        let state = compute_desired_state(&facts, &config());

        assert!(state.peers.is_empty());
        assert_eq!(state.routes.get(&net("10.162.0.0/16")).map(|r| &r.target), Some(&RouteTarget::Throw));
        assert_eq!(state.routes.get(&net("10.163.0.0/16")).map(|r| &r.target), Some(&RouteTarget::Throw));
    }

    #[test]
    fn remote_node_reusing_local_key_is_not_peered() {
        let mut facts = facts_with_peer();
        facts.upsert_peer_identity("peer1", Some(key(1)), None);
        assert!(compute_desired_state(&facts, &config()).peers.is_empty());
    }

    #[test]
    fn other_family_facts_are_ignored() {
        let mut facts = facts_with_peer();
        facts.upsert_route(LOCAL, net("fd00:1::/64"));
        facts.upsert_route("peer1", net("fd00:2::/64"));
        let state = compute_desired_state(&facts, &config());
        assert_eq!(state.rules.len(), 1);
        assert!(!state.routes.contains_key(&net("fd00:2::/64")));

        let v6 = compute_desired_state(&facts, &config().with_family(crate::types::IpFamily::V6));
        assert_eq!(v6.rules.iter().map(|r| r.src).collect::<Vec<_>>(), vec![Some(net("fd00:1::/64"))]);
        // No v6 underlay address, so peer1's v6 pool is thrown.
        assert!(v6.peers.is_empty());
        assert_eq!(v6.routes.get(&net("fd00:2::/64")).map(|r| &r.target), Some(&RouteTarget::Throw));
    }

    #[test]
    fn computation_is_deterministic() {
        let facts = facts_with_peer();
        assert_eq!(compute_desired_state(&facts, &config()), compute_desired_state(&facts, &config()));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn pool() -> impl Strategy<Value = IpNet> {
            (any::<[u8; 2]>(), 8u8..31).prop_map(|([a, b], len)| {
                IpNet::new(std::net::Ipv4Addr::new(10, a, b, 0).into(), len).expect("prefix").trunc()
            })
        }

        fn host() -> impl Strategy<Value = IpNet> {
            any::<[u8; 4]>().prop_map(|o| IpNet::new(std::net::IpAddr::from(o), 32).expect("prefix"))
        }

        proptest! {
            #[test]
            fn one_rule_per_local_pool(pools in prop::collection::btree_set(pool(), 0..12),
                                       hosts in prop::collection::vec(host(), 0..6)) {
                let mut facts = FactStore::new();
                for p in &pools {
                    facts.upsert_route(LOCAL, *p);
                }
                for h in &hosts {
                    facts.upsert_route(LOCAL, *h);
                }
                let remaining: BTreeSet<IpNet> = facts
                    .node(LOCAL)
                    .map(|n| n.cidrs.iter().copied().filter(|c| RouteClass::of(c) == RouteClass::Pool).collect())
                    .unwrap_or_default();

                let state = compute_desired_state(&facts, &config());
                prop_assert_eq!(state.rules.len(), remaining.len());
                for rule in &state.rules {
                    let src = rule.src.expect("scoped");
                    prop_assert!(remaining.contains(&src));
                    prop_assert_eq!(RouteClass::of(&src), RouteClass::Pool);
                    prop_assert_eq!(rule.mask, rule.mark);
                    prop_assert!(rule.invert);
                }

                let encrypted = compute_desired_state(&facts, &config().with_encrypt_host_traffic(true));
                prop_assert_eq!(encrypted.rules.len(), 1);
                prop_assert!(encrypted.rules.iter().all(|r| r.src.is_none()));
            }
        }
    }
}
