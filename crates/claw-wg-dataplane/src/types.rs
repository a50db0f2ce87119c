//! Core types for the WireGuard dataplane.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::keys::{PrivateKey, PublicKey};

/// The IP family a manager instance programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    /// IPv4.
    #[default]
    V4,
    /// IPv6.
    V6,
}

impl IpFamily {
    /// Prefix length of a single address in this family.
    #[must_use]
    pub const fn full_prefix_len(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }

    /// Whether the network belongs to this family.
    #[must_use]
    pub fn contains_net(self, net: &IpNet) -> bool {
        matches!((self, net), (Self::V4, IpNet::V4(_)) | (Self::V6, IpNet::V6(_)))
    }

    /// Whether the address belongs to this family.
    #[must_use]
    pub fn contains_addr(self, addr: &IpAddr) -> bool {
        matches!((self, addr), (Self::V4, IpAddr::V4(_)) | (Self::V6, IpAddr::V6(_)))
    }

    /// The unspecified address (`0.0.0.0` or `::`).
    #[must_use]
    pub const fn unspecified(self) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            Self::V6 => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        }
    }

    /// The `ip` command family flag.
    #[must_use]
    pub const fn ip_flag(self) -> &'static str {
        match self {
            Self::V4 => "-4",
            Self::V6 => "-6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

/// Whether a CIDR is an aggregate pool or a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Prefix shorter than the family's full length.
    Pool,
    /// Prefix equal to the family's full length (/32, /128).
    Host,
}

impl RouteClass {
    /// Classifies a CIDR by its prefix length.
    #[must_use]
    pub fn of(cidr: &IpNet) -> Self {
        if cidr.prefix_len() == cidr.max_prefix_len() {
            Self::Host
        } else {
            Self::Pool
        }
    }
}

/// A policy rule as programmed into the kernel.
///
/// Matches packets whose firewall mark is *not* set (under `mask`) and,
/// when `src` is present, that originate from `src`; matching packets
/// look up `table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Rule priority ("pref").
    pub priority: u32,
    /// Routing table to look up.
    pub table: u32,
    /// Invert the match.
    pub invert: bool,
    /// Firewall mark.
    pub mark: u32,
    /// Firewall mark mask.
    pub mask: u32,
    /// Optional source constraint.
    pub src: Option<IpNet>,
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pref {} ", self.priority)?;
        if self.invert {
            write!(f, "not ")?;
        }
        match &self.src {
            Some(src) => write!(f, "from {src} ")?,
            None => write!(f, "from all ")?,
        }
        write!(f, "fwmark {:#x}/{:#x} lookup {}", self.mark, self.mask, self.table)
    }
}

/// A peer that should exist on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredPeer {
    /// Peer public key.
    pub public_key: PublicKey,
    /// Underlay endpoint.
    pub endpoint: SocketAddr,
    /// Destinations routed to this peer (pool and host routes).
    pub allowed_cidrs: BTreeSet<IpNet>,
}

/// Where a route sends matching traffic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RouteTarget {
    /// Via the named interface.
    Interface(String),
    /// Stop the table lookup and fall through to the next rule.
    Throw,
}

/// A route that should exist in the WireGuard table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredRoute {
    /// Destination.
    pub cidr: IpNet,
    /// Route target.
    pub target: RouteTarget,
    /// Ownership tag ("proto") written on the route.
    pub protocol: u8,
}

/// Kind of a programmed route.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RouteKind {
    /// Unicast via an interface.
    Interface {
        /// Interface name.
        name: String,
        /// Interface index at programming time.
        index: u32,
    },
    /// Throw route.
    Throw,
}

/// A route as programmed into (or listed from) a kernel table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteEntry {
    /// Routing table.
    pub table: u32,
    /// Destination.
    pub cidr: IpNet,
    /// Route kind.
    pub kind: RouteKind,
    /// Ownership tag.
    pub protocol: u8,
}

impl RouteEntry {
    /// Resolves a desired route against a table and interface index.
    #[must_use]
    pub fn resolve(route: &DesiredRoute, table: u32, ifindex: u32) -> Self {
        let kind = match &route.target {
            RouteTarget::Interface(name) => RouteKind::Interface { name: name.clone(), index: ifindex },
            RouteTarget::Throw => RouteKind::Throw,
        };
        Self { table, cidr: route.cidr, kind, protocol: route.protocol }
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RouteKind::Interface { name, .. } => write!(f, "{} dev {}", self.cidr, name)?,
            RouteKind::Throw => write!(f, "throw {}", self.cidr)?,
        }
        write!(f, " table {} proto {}", self.table, self.protocol)
    }
}

/// Device settings derived from config and facts, without key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Interface name.
    pub name: String,
    /// UDP listen port.
    pub listen_port: u16,
    /// Interface MTU.
    pub mtu: u32,
    /// Firewall mark applied to the device's own packets.
    pub firewall_mark: u32,
    /// Local tunnel address, if the local node published one.
    pub address: Option<IpAddr>,
}

/// Full device configuration handed to the WireGuard-control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Derived settings.
    pub spec: DeviceSpec,
    /// Device private key.
    pub private_key: PrivateKey,
}

/// Operational status of the WireGuard link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OperStatus {
    /// No notification seen yet.
    #[default]
    Unknown,
    /// Link exists but is not passing traffic.
    Down,
    /// Link is up.
    Up,
}

impl FromStr for OperStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "up" => Self::Up,
            "down" | "lowerlayerdown" | "dormant" | "notpresent" => Self::Down,
            _ => Self::Unknown,
        })
    }
}

impl fmt::Display for OperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Down => write!(f, "down"),
            Self::Up => write!(f, "up"),
        }
    }
}
