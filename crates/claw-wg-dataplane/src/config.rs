//! Static configuration for one manager instance.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WireguardError};
use crate::types::IpFamily;

/// Route protocol number used to tag routes owned by this component.
pub const DEFAULT_ROUTE_PROTOCOL: u8 = 80;

/// Maximum Linux interface name length (`IFNAMSIZ - 1`).
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Configuration for the WireGuard dataplane.
///
/// Fixed for the lifetime of a [`crate::WireguardManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Whether WireGuard is enabled on this node.
    pub enabled: bool,
    /// UDP listen port of the device and of every peer.
    pub listening_port: u16,
    /// Firewall mark set on tunnel packets; also the rule's match mask.
    pub firewall_mark: u32,
    /// Priority of the policy rules.
    pub routing_rule_priority: u32,
    /// Routing table holding the tunnel routes.
    pub routing_table_index: u32,
    /// WireGuard interface name.
    pub interface_name: String,
    /// Interface MTU.
    pub mtu: u32,
    /// Route all unmarked traffic through the tunnel, not only workload traffic.
    pub encrypt_host_traffic: bool,
    /// Name of the node this agent runs on.
    pub node_name: String,
    /// IP family handled by this instance.
    pub family: IpFamily,
    /// Ownership tag written on every route.
    pub route_protocol: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            listening_port: 51820,
            firewall_mark: 0x0010_0000,
            routing_rule_priority: 99,
            routing_table_index: 1,
            interface_name: "wireguard.cali".to_string(),
            mtu: 1440,
            encrypt_host_traffic: false,
            node_name: String::new(),
            family: IpFamily::V4,
            route_protocol: DEFAULT_ROUTE_PROTOCOL,
        }
    }
}

impl Config {
    /// Creates an enabled config for the given node with default settings.
    #[must_use]
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            enabled: true,
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Sets whether WireGuard is enabled.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the listen port.
    #[must_use]
    pub fn with_listening_port(mut self, port: u16) -> Self {
        self.listening_port = port;
        self
    }

    /// Sets the firewall mark.
    #[must_use]
    pub fn with_firewall_mark(mut self, mark: u32) -> Self {
        self.firewall_mark = mark;
        self
    }

    /// Sets the rule priority.
    #[must_use]
    pub fn with_rule_priority(mut self, priority: u32) -> Self {
        self.routing_rule_priority = priority;
        self
    }

    /// Sets the routing table.
    #[must_use]
    pub fn with_table_index(mut self, table: u32) -> Self {
        self.routing_table_index = table;
        self
    }

    /// Sets the interface name.
    #[must_use]
    pub fn with_interface_name(mut self, name: impl Into<String>) -> Self {
        self.interface_name = name.into();
        self
    }

    /// Sets the MTU.
    #[must_use]
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Sets whether host-originated traffic is encrypted.
    #[must_use]
    pub fn with_encrypt_host_traffic(mut self, encrypt: bool) -> Self {
        self.encrypt_host_traffic = encrypt;
        self
    }

    /// Sets the IP family.
    #[must_use]
    pub fn with_family(mut self, family: IpFamily) -> Self {
        self.family = family;
        self
    }

    /// Sets the route ownership tag.
    #[must_use]
    pub fn with_route_protocol(mut self, protocol: u8) -> Self {
        self.route_protocol = protocol;
        self
    }

    /// Parses a config from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or the config is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| WireguardError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the config for values the kernel would reject.
    ///
    /// # Errors
    ///
    /// Returns [`WireguardError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(WireguardError::InvalidConfig(msg));

        if self.node_name.trim().is_empty() {
            return invalid("node name must not be empty".to_string());
        }
        if self.interface_name.is_empty() || self.interface_name.len() > MAX_INTERFACE_NAME_LEN {
            return invalid(format!(
                "interface name {:?} must be 1..={MAX_INTERFACE_NAME_LEN} bytes",
                self.interface_name
            ));
        }
        if self.interface_name.contains(['/', ' ']) {
            return invalid(format!("interface name {:?} contains '/' or space", self.interface_name));
        }
        if !self.enabled {
            return Ok(());
        }
        if self.listening_port == 0 {
            return invalid("listening port must be non-zero".to_string());
        }
        if self.firewall_mark == 0 {
            return invalid("firewall mark must be non-zero".to_string());
        }
        // unspec, default, main, local
        if matches!(self.routing_table_index, 0 | 253 | 254 | 255) {
            return invalid(format!("routing table {} is reserved", self.routing_table_index));
        }
        let min_mtu = match self.family {
            IpFamily::V4 => 68,
            IpFamily::V6 => 1280,
        };
        if self.mtu < min_mtu {
            return invalid(format!("mtu {} below {min_mtu} for {}", self.mtu, self.family));
        }
        Ok(())
    }
}
