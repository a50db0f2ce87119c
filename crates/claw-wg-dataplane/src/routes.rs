//! Route reconciliation by destination.
//!
//! Only routes in the WireGuard table carrying our protocol tag are ever
//! listed or deleted; routes from other sources in the same table survive.

use std::collections::BTreeMap;

use ipnet::IpNet;
use tracing::debug;

use crate::dataplane::RoutePort;
use crate::error::{Result, WireguardError};
use crate::types::{DesiredRoute, RouteEntry};

/// Counts of route operations issued by one reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteDelta {
    /// Routes added or replaced in place.
    pub added: usize,
    /// Routes deleted.
    pub removed: usize,
}

/// Keeps one table's tagged routes equal to a desired map.
#[derive(Debug, Clone)]
pub struct RouteReconciler {
    table: u32,
    protocol: u8,
    applied: BTreeMap<IpNet, RouteEntry>,
    resync: bool,
}

impl RouteReconciler {
    /// Creates a reconciler for `table`, owning routes tagged `protocol`.
    #[must_use]
    pub fn new(table: u32, protocol: u8) -> Self {
        Self { table, protocol, applied: BTreeMap::new(), resync: true }
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

    /// Routes last programmed.
    #[must_use]
    pub fn applied(&self) -> &BTreeMap<IpNet, RouteEntry> {
        &self.applied
    }

    /// Forgets programmed routes.
    pub fn clear(&mut self) {
        self.applied.clear();
        self.resync = true;
    }

    /// Brings the table to `desired`, resolving interface routes to `ifindex`.
    pub fn reconcile(
        &mut self,
        port: &mut dyn RoutePort,
        desired: &BTreeMap<IpNet, DesiredRoute>,
        ifindex: u32,
    ) -> Result<RouteDelta> {
        let wanted: BTreeMap<IpNet, RouteEntry> = desired
            .iter()
            .map(|(cidr, route)| (*cidr, RouteEntry::resolve(route, self.table, ifindex)))
            .collect();

        if self.resync {
            let delta = self.resync(port, &wanted)?;
            self.resync = false;
            return Ok(delta);
        }

        let mut delta = RouteDelta::default();
        let gone: Vec<RouteEntry> =
            self.applied.iter().filter(|(cidr, _)| !wanted.contains_key(cidr)).map(|(_, r)| r.clone()).collect();
        for route in &gone {
            self.delete(port, route)?;
            delta.removed += 1;
        }
        for (cidr, route) in &wanted {
            if self.applied.get(cidr) == Some(route) {
                continue;
            }
            self.add(port, route)?;
            delta.added += 1;
        }
        Ok(delta)
    }

    fn resync(&mut self, port: &mut dyn RoutePort, wanted: &BTreeMap<IpNet, RouteEntry>) -> Result<RouteDelta> {
        let listed = port
            .list_routes(self.table, self.protocol)
            .map_err(|source| WireguardError::Route { cidr: None, source })?;
        debug!(table = self.table, count = listed.len(), "resyncing routes");
        self.applied.clear();

        let mut delta = RouteDelta::default();
        for route in listed.iter().filter(|r| !wanted.contains_key(&r.cidr)) {
            self.delete(port, route)?;
            delta.removed += 1;
        }
        for route in wanted.values() {
            self.add(port, route)?;
            delta.added += 1;
        }
        Ok(delta)
    }

    fn add(&mut self, port: &mut dyn RoutePort, route: &RouteEntry) -> Result<()> {
        port.add_route(route).map_err(|source| WireguardError::Route { cidr: Some(route.cidr), source })?;
        debug!(%route, "programmed route");
        self.applied.insert(route.cidr, route.clone());
        Ok(())
    }

    fn delete(&mut self, port: &mut dyn RoutePort, route: &RouteEntry) -> Result<()> {
        match port.delete_route(route) {
            Ok(()) => debug!(%route, "deleted route"),
            Err(err) if err.is_not_found() => debug!(%route, "route already gone"),
            Err(source) => return Err(WireguardError::Route { cidr: Some(route.cidr), source }),
        }
        self.applied.remove(&route.cidr);
        Ok(())
    }
}
