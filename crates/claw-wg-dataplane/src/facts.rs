//! In-memory record of what upstream has told us about each node.
//!
//! Mutations never fail and never touch the kernel; the manager recomputes
//! desired state from a snapshot of this store on every apply.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ipnet::IpNet;
use tracing::{debug, warn};

use crate::keys::PublicKey;

/// Everything known about one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFacts {
    /// Published WireGuard public key; `None` means "not a peer".
    pub public_key: Option<PublicKey>,
    /// Address of the node's tunnel interface.
    pub interface_addr: Option<IpAddr>,
    /// Underlay (host) address used as the peer endpoint.
    pub underlay_addr: Option<IpAddr>,
    /// CIDRs reachable through this node.
    pub cidrs: BTreeSet<IpNet>,
}

impl NodeFacts {
    fn is_empty(&self) -> bool {
        self.public_key.is_none()
            && self.interface_addr.is_none()
            && self.underlay_addr.is_none()
            && self.cidrs.is_empty()
    }
}

/// Per-node identity, address and route facts.
#[derive(Debug, Clone, Default)]
pub struct FactStore {
    nodes: BTreeMap<String, NodeFacts>,
    cidr_owner: BTreeMap<IpNet, String>,
}

impl FactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a node's public key and tunnel interface address.
    ///
    /// A `None` key marks the node as not (or no longer) a peer.
    pub fn upsert_peer_identity(
        &mut self,
        node: &str,
        public_key: Option<PublicKey>,
        interface_addr: Option<IpAddr>,
    ) {
        if let Some(key) = public_key {
            let holders = self.nodes_with_key(&key);
            if holders.iter().any(|holder| *holder != node) {
                warn!(node, key = %key, ?holders, "public key already held by another node");
            }
        }
        let entry = self.nodes.entry(node.to_string()).or_default();
        entry.public_key = public_key;
        entry.interface_addr = interface_addr;
        self.prune(node);
    }

    /// Nodes currently publishing `key`.
    #[must_use]
    pub fn nodes_with_key(&self, key: &PublicKey) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, facts)| facts.public_key.as_ref() == Some(key))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Clears a node's public key and tunnel interface address.
    pub fn remove_peer_identity(&mut self, node: &str) {
        self.upsert_peer_identity(node, None, None);
    }

    /// Records a node's underlay address.
    pub fn upsert_peer_address(&mut self, node: &str, addr: Option<IpAddr>) {
        self.nodes.entry(node.to_string()).or_default().underlay_addr = addr;
        self.prune(node);
    }

    /// Clears a node's underlay address.
    pub fn remove_peer_address(&mut self, node: &str) {
        self.upsert_peer_address(node, None);
    }

    /// Records that `cidr` is reachable through `node`.
    ///
    /// A CIDR has a single owner; re-upserting it for another node moves it.
    pub fn upsert_route(&mut self, node: &str, cidr: IpNet) {
        let cidr = cidr.trunc();
        if let Some(previous) = self.cidr_owner.insert(cidr, node.to_string()) {
            if previous != node {
                debug!(%cidr, from = %previous, to = node, "route moved between nodes");
                if let Some(facts) = self.nodes.get_mut(&previous) {
                    facts.cidrs.remove(&cidr);
                }
                self.prune(&previous);
            }
        }
        self.nodes.entry(node.to_string()).or_default().cidrs.insert(cidr);
    }

    /// Forgets `cidr`, whichever node owned it.
    pub fn remove_route(&mut self, cidr: IpNet) {
        let cidr = cidr.trunc();
        if let Some(owner) = self.cidr_owner.remove(&cidr) {
            if let Some(facts) = self.nodes.get_mut(&owner) {
                facts.cidrs.remove(&cidr);
            }
            self.prune(&owner);
        }
    }

    /// Returns the facts for one node.
    #[must_use]
    pub fn node(&self, node: &str) -> Option<&NodeFacts> {
        self.nodes.get(node)
    }

    /// Iterates over all nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeFacts)> {
        self.nodes.iter().map(|(name, facts)| (name.as_str(), facts))
    }

    /// Returns the node owning `cidr`.
    #[must_use]
    pub fn owner_of(&self, cidr: &IpNet) -> Option<&str> {
        self.cidr_owner.get(&cidr.trunc()).map(String::as_str)
    }

    /// Number of nodes with at least one fact.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn prune(&mut self, node: &str) {
        if self.nodes.get(node).is_some_and(NodeFacts::is_empty) {
            self.nodes.remove(node);
        }
    }
}
