//! # claw-wg-dataplane
//!
//! WireGuard dataplane reconciler for a Clawbernetes node.
//!
//! The manager turns facts about other nodes (public keys, underlay
//! addresses, reachable CIDRs) into kernel state: one WireGuard device,
//! its peers, routes in a dedicated table, and policy rules steering
//! unmarked traffic into that table.
//!
//! ## Features
//!
//! - [`WireguardManager`]: fact intake, link-state tracking and `apply`
//! - [`Config`]: static settings, loadable from JSON
//! - [`dataplane`]: kernel ports, with an in-memory [`dataplane::fake::FakeDataplane`]
//! - Linux backends for rules and routes (`ip`), and for the device
//!   (`defguard_wireguard_rs`, behind the `linux` feature)
//!
//! ## Example
//!
//! ```rust
//! use claw_wg_dataplane::dataplane::fake::FakeDataplane;
//! use claw_wg_dataplane::{Config, OperStatus, WireguardManager};
//!
//! let fake = FakeDataplane::new();
//! let mut manager = WireguardManager::new(Config::new("node-a"), fake.dataplane())?;
//!
//! manager.upsert_route("node-a", "10.161.0.0/16".parse()?);
//! manager.on_interface_state_changed("wireguard.cali", 12, OperStatus::Up);
//! let summary = manager.apply()?;
//!
//! assert_eq!(summary.rules.added, 1);
//! assert_eq!(fake.rules().len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dataplane;
pub mod desired;
pub mod error;
pub mod facts;
pub mod iface;
pub mod keys;
pub mod manager;
pub mod peers;
pub mod routes;
pub mod rules;
pub mod types;

pub use config::Config;
pub use dataplane::Dataplane;
pub use desired::{compute_desired_state, DesiredState};
pub use error::{ApplyStep, DataplaneError, Result, WireguardError};
pub use facts::{FactStore, NodeFacts};
pub use iface::{InterfaceState, Transition};
pub use keys::{PrivateKey, PublicKey, KEY_SIZE};
pub use manager::{ApplySummary, WireguardManager};
pub use types::{
    DesiredPeer, DesiredRoute, DeviceSpec, IpFamily, OperStatus, RouteClass, RouteEntry, RouteKind, RouteTarget,
    RuleSpec,
};
