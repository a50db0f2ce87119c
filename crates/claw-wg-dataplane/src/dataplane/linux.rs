//! Kernel WireGuard device control over netlink.
//!
//! Wraps `defguard_wireguard_rs` with the `Kernel` backend. The device
//! firewall mark is not exposed by that API and is set with `wg set`.

use std::collections::HashMap;
use std::process::Command;
use std::str::FromStr;

use defguard_wireguard_rs::host::Peer as DgPeer;
use defguard_wireguard_rs::key::Key;
use defguard_wireguard_rs::net::IpAddrMask;
use defguard_wireguard_rs::{InterfaceConfiguration, Kernel, WGApi, WireguardInterfaceApi};
use ipnet::IpNet;
use tracing::{debug, info};

use crate::dataplane::WireguardPort;
use crate::error::DataplaneError;
use crate::keys::PublicKey;
use crate::types::{DesiredPeer, DeviceConfig};

/// Kernel WireGuard devices managed by this process.
#[derive(Default)]
pub struct LinuxWireguard {
    apis: HashMap<String, WGApi<Kernel>>,
    applied: HashMap<String, DeviceConfig>,
}

impl std::fmt::Debug for LinuxWireguard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxWireguard").field("devices", &self.apis.keys().collect::<Vec<_>>()).finish()
    }
}

impl LinuxWireguard {
    /// Creates a controller with no devices attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn api(&mut self, name: &str) -> Result<&WGApi<Kernel>, DataplaneError> {
        if !self.apis.contains_key(name) {
            let api = WGApi::<Kernel>::new(name.to_string()).map_err(|e| kernel("WGApi::new", e))?;
            self.apis.insert(name.to_string(), api);
        }
        self.apis.get(name).ok_or_else(|| DataplaneError::NotFound(format!("link {name}")))
    }

    fn exists(&mut self, name: &str) -> Result<bool, DataplaneError> {
        Ok(self.api(name)?.read_interface_data().is_ok())
    }
}

fn kernel(call: &str, err: impl std::fmt::Display) -> DataplaneError {
    DataplaneError::Kernel(format!("{call}: {err}"))
}

fn to_key(key: &[u8; 32]) -> Result<Key, DataplaneError> {
    Key::try_from(key.as_slice()).map_err(|e| DataplaneError::Parse { what: "key", detail: e.to_string() })
}

fn to_ip_addr_mask(net: &IpNet) -> Result<IpAddrMask, DataplaneError> {
    IpAddrMask::from_str(&net.to_string()).map_err(|e| DataplaneError::Parse { what: "cidr", detail: format!("{net}: {e}") })
}

fn build_peer(peer: &DesiredPeer) -> Result<DgPeer, DataplaneError> {
    let mut dg_peer = DgPeer::new(to_key(peer.public_key.as_bytes())?);
    dg_peer.endpoint = Some(peer.endpoint);
    for cidr in &peer.allowed_cidrs {
        dg_peer.allowed_ips.push(to_ip_addr_mask(cidr)?);
    }
    Ok(dg_peer)
}

fn set_fwmark(name: &str, mark: u32) -> Result<(), DataplaneError> {
    let mark = format!("{mark:#x}");
    let output = Command::new("wg").args(["set", name, "fwmark", &mark]).output()?;
    if output.status.success() {
        return Ok(());
    }
    Err(DataplaneError::Command {
        command: format!("wg set {name} fwmark {mark}"),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

impl WireguardPort for LinuxWireguard {
    fn ensure_device(&mut self, config: &DeviceConfig) -> Result<bool, DataplaneError> {
        let name = config.spec.name.clone();
        let created = !self.exists(&name)?;
        if !created && self.applied.get(&name) == Some(config) {
            return Ok(false);
        }

        let api = self.api(&name)?;
        if created {
            info!(interface = %name, "creating WireGuard device");
            api.create_interface().map_err(|e| kernel("create_interface", e))?;
        }

        // Reconfiguring replaces the peer list, so carry the current one over.
        let peers: Vec<DgPeer> = if created {
            Vec::new()
        } else {
            api.read_interface_data()
                .map_err(|e| kernel("read_interface_data", e))?
                .peers
                .into_values()
                .collect()
        };
        let addresses = match config.spec.address {
            Some(addr) => {
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                let net = IpNet::new(addr, prefix)
                    .map_err(|e| DataplaneError::Parse { what: "address", detail: e.to_string() })?;
                vec![to_ip_addr_mask(&net)?]
            }
            None => Vec::new(),
        };

        let iface_config = InterfaceConfiguration {
            name: name.clone(),
            prvkey: config.private_key.to_base64(),
            addresses,
            port: config.spec.listen_port,
            peers,
            mtu: Some(config.spec.mtu),
        };
        api.configure_interface(&iface_config).map_err(|e| kernel("configure_interface", e))?;
        set_fwmark(&name, config.spec.firewall_mark)?;

        debug!(interface = %name, port = config.spec.listen_port, mtu = config.spec.mtu, "device configured");
        self.applied.insert(name, config.clone());
        Ok(created)
    }

    fn delete_device(&mut self, name: &str) -> Result<(), DataplaneError> {
        self.applied.remove(name);
        if !self.exists(name)? {
            self.apis.remove(name);
            return Ok(());
        }
        if let Some(api) = self.apis.remove(name) {
            info!(interface = %name, "removing WireGuard device");
            api.remove_interface().map_err(|e| kernel("remove_interface", e))?;
        }
        Ok(())
    }

    fn list_peers(&mut self, name: &str) -> Result<Vec<PublicKey>, DataplaneError> {
        let host = self.api(name)?.read_interface_data().map_err(|e| kernel("read_interface_data", e))?;
        Ok(host.peers.keys().map(|k| PublicKey::from_bytes(k.as_array())).collect())
    }

    fn set_peer(&mut self, name: &str, peer: &DesiredPeer) -> Result<(), DataplaneError> {
        let dg_peer = build_peer(peer)?;
        debug!(interface = %name, peer = %peer.public_key, "configuring peer");
        self.api(name)?.configure_peer(&dg_peer).map_err(|e| kernel("configure_peer", e))
    }

    fn remove_peer(&mut self, name: &str, public_key: &PublicKey) -> Result<(), DataplaneError> {
        let key = to_key(public_key.as_bytes())?;
        let api = self.api(name)?;
        let host = api.read_interface_data().map_err(|e| kernel("read_interface_data", e))?;
        if !host.peers.contains_key(&key) {
            return Err(DataplaneError::NotFound(format!("peer {public_key}")));
        }
        debug!(interface = %name, peer = %public_key, "removing peer");
        api.remove_peer(&key).map_err(|e| kernel("remove_peer", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{PrivateKey, KEY_SIZE};
    use crate::types::DeviceSpec;

    fn device(name: &str) -> DeviceConfig {
        DeviceConfig {
            spec: DeviceSpec {
                name: name.into(),
                listen_port: 51820,
                mtu: 1420,
                firewall_mark: 0x10_0000,
                address: Some("172.16.0.1".parse().expect("addr")),
            },
            private_key: PrivateKey::from_bytes([1u8; KEY_SIZE]),
        }
    }

    fn peer() -> DesiredPeer {
        DesiredPeer {
            public_key: PrivateKey::generate().public_key(),
            endpoint: "192.0.2.2:51820".parse().expect("endpoint"),
            allowed_cidrs: ["10.162.0.0/16".parse().expect("cidr")].into(),
        }
    }

    #[test]
    fn converts_peer_to_defguard() {
        let desired = peer();
        let dg = build_peer(&desired).expect("convert");
        assert_eq!(dg.endpoint, Some(desired.endpoint));
        assert_eq!(dg.allowed_ips.len(), 1);
        assert_eq!(dg.public_key.as_array(), *desired.public_key.as_bytes());
    }

    // Run with: sudo cargo test -p claw-wg-dataplane --features linux -- --ignored

    #[test]
    #[ignore = "requires root and WireGuard kernel module"]
    fn linux_device_lifecycle() {
        let mut wg = LinuxWireguard::new();
        assert!(wg.ensure_device(&device("clawwgtest0")).expect("create"));
        assert!(!wg.ensure_device(&device("clawwgtest0")).expect("unchanged"));

        let peer = peer();
        wg.set_peer("clawwgtest0", &peer).expect("set peer");
        assert_eq!(wg.list_peers("clawwgtest0").expect("list"), vec![peer.public_key]);

        wg.remove_peer("clawwgtest0", &peer.public_key).expect("remove peer");
        assert!(matches!(
            wg.remove_peer("clawwgtest0", &peer.public_key),
            Err(DataplaneError::NotFound(_))
        ));

        wg.delete_device("clawwgtest0").expect("delete");
        wg.delete_device("clawwgtest0").expect("delete absent");
    }
}
