//! Peer reconciliation by public key.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::dataplane::WireguardPort;
use crate::error::{Result, WireguardError};
use crate::keys::PublicKey;
use crate::types::DesiredPeer;

/// Counts of peer operations issued by one reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerDelta {
    /// Peers created.
    pub added: usize,
    /// Peers removed.
    pub removed: usize,
    /// Existing peers reprogrammed.
    pub updated: usize,
}

/// Keeps a device's peers equal to a desired map.
///
/// Starts in resync mode: the first reconcile lists the device and
/// rewrites every desired peer.
#[derive(Debug, Clone)]
pub struct PeerReconciler {
    applied: BTreeMap<PublicKey, DesiredPeer>,
    resync: bool,
}

impl Default for PeerReconciler {
    fn default() -> Self {
        Self { applied: BTreeMap::new(), resync: true }
    }
}

impl PeerReconciler {
    /// Creates a reconciler that resyncs on first use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a full resync on the next reconcile.
    pub fn mark_resync(&mut self) {
        self.resync = true;
    }

    /// Whether the next reconcile is a full resync.
    #[must_use]
    pub fn needs_resync(&self) -> bool {
        self.resync
    }

    /// Peers last programmed.
    #[must_use]
    pub fn applied(&self) -> &BTreeMap<PublicKey, DesiredPeer> {
        &self.applied
    }

    /// Forgets programmed peers, e.g. after the device was deleted.
    pub fn clear(&mut self) {
        self.applied.clear();
        self.resync = true;
    }

    /// Brings the device's peers to `desired`.
    pub fn reconcile(
        &mut self,
        port: &mut dyn WireguardPort,
        interface: &str,
        desired: &BTreeMap<PublicKey, DesiredPeer>,
    ) -> Result<PeerDelta> {
        if self.resync {
            let delta = self.resync(port, interface, desired)?;
            self.resync = false;
            return Ok(delta);
        }

        let mut delta = PeerDelta::default();
        let gone: Vec<PublicKey> = self.applied.keys().filter(|k| !desired.contains_key(k)).copied().collect();
        for key in gone {
            self.remove(port, interface, &key)?;
            delta.removed += 1;
        }
        for (key, peer) in desired {
            match self.applied.get(key) {
                Some(applied) if applied == peer => continue,
                Some(_) => delta.updated += 1,
                None => delta.added += 1,
            }
            self.set(port, interface, peer)?;
        }
        Ok(delta)
    }

    fn resync(
        &mut self,
        port: &mut dyn WireguardPort,
        interface: &str,
        desired: &BTreeMap<PublicKey, DesiredPeer>,
    ) -> Result<PeerDelta> {
        let listed: BTreeSet<PublicKey> = port
            .list_peers(interface)
            .map_err(|source| WireguardError::Peer { peer: "*".into(), source })?
            .into_iter()
            .collect();
        debug!(interface, count = listed.len(), "resyncing peers");
        self.applied.clear();

        let mut delta = PeerDelta::default();
        for key in listed.iter().filter(|k| !desired.contains_key(k)) {
            self.remove(port, interface, key)?;
            delta.removed += 1;
        }
        for (key, peer) in desired {
            self.set(port, interface, peer)?;
            if listed.contains(key) {
                delta.updated += 1;
            } else {
                delta.added += 1;
            }
        }
        Ok(delta)
    }

    fn set(&mut self, port: &mut dyn WireguardPort, interface: &str, peer: &DesiredPeer) -> Result<()> {
        port.set_peer(interface, peer)
            .map_err(|source| WireguardError::Peer { peer: peer.public_key.to_base64(), source })?;
        debug!(interface, peer = %peer.public_key, endpoint = %peer.endpoint, "programmed peer");
        self.applied.insert(peer.public_key, peer.clone());
        Ok(())
    }

    fn remove(&mut self, port: &mut dyn WireguardPort, interface: &str, key: &PublicKey) -> Result<()> {
        match port.remove_peer(interface, key) {
            Ok(()) => debug!(interface, peer = %key, "removed peer"),
            Err(err) if err.is_not_found() => debug!(interface, peer = %key, "peer already gone"),
            Err(source) => return Err(WireguardError::Peer { peer: key.to_base64(), source }),
        }
        self.applied.remove(key);
        Ok(())
    }
}
