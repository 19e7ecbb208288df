//! Declarative reconciliation of a blade's overlay networking: VXLAN
//! tunnels, the bridges mastering them, the head-end replication FDB
//! mesh, optional blade-local veth gateways and the libvirt networks
//! bound onto the bridges.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::cluster_config::VirtualNetwork;
use crate::errors::{BladeError, ConfigError, VtdsResult};
use crate::utils::process::{capture, run};

#[derive(Debug, Clone, Deserialize)]
struct LinkAddrInfo {
    #[serde(default)]
    local: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LinkDetail {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Link {
    ifname: String,

    #[serde(default)]
    addr_info: Vec<LinkAddrInfo>,

    #[serde(default)]
    linkinfo: Option<LinkDetail>,
}

#[derive(Debug, Clone, Deserialize)]
struct FdbEntry {
    ifname: String,

    #[serde(default)]
    dst: Option<String>,
}

/// Live kernel and libvirt networking state, reconciled network by
/// network against the plan.
pub struct NetworkInstaller {
    interfaces: BTreeMap<String, Link>,
    vxlans: BTreeSet<String>,
    bridges: BTreeSet<String>,
    fdb_dsts: BTreeMap<String, Vec<String>>,
    vnets: Vec<String>,
}

impl NetworkInstaller {
    /// Snapshot the blade's links, FDB entries and libvirt networks.
    pub fn discover() -> VtdsResult<Self> {
        let links: Vec<Link> = serde_json::from_str(&capture("ip", &["-d", "--json", "addr"])?)?;
        let fdb: Vec<FdbEntry> =
            serde_json::from_str(&capture("bridge", &["--json", "fdb"])?)?;
        let vnets = capture("virsh", &["net-list", "--name"])?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self::from_state(links, fdb, vnets))
    }

    fn from_state(links: Vec<Link>, fdb: Vec<FdbEntry>, vnets: Vec<String>) -> Self {
        let interfaces: BTreeMap<String, Link> = links
            .into_iter()
            .map(|link| (link.ifname.clone(), link))
            .collect();
        let of_kind = |kind: &str| {
            interfaces
                .iter()
                .filter(|(_, link)| {
                    link.linkinfo
                        .as_ref()
                        .and_then(|detail| detail.info_kind.as_deref())
                        == Some(kind)
                })
                .map(|(name, _)| name.clone())
                .collect::<BTreeSet<String>>()
        };
        let vxlans = of_kind("vxlan");
        let bridges = of_kind("bridge");
        let mut fdb_dsts: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in fdb {
            if let Some(dst) = entry.dst {
                fdb_dsts.entry(entry.ifname).or_default().push(dst);
            }
        }
        Self {
            interfaces,
            vxlans,
            bridges,
            fdb_dsts,
            vnets,
        }
    }

    /// Refuse to touch links that exist under a managed name but are not
    /// the kind of link we manage.
    fn check_conflict(&self, network_name: &str, tunnel_name: &str, bridge_name: &str) -> VtdsResult<()> {
        if self.interfaces.contains_key(tunnel_name) && !self.vxlans.contains(tunnel_name) {
            return Err(BladeError::LinkConflict {
                network: network_name.to_string(),
                link: tunnel_name.to_string(),
                kind: "vxlan".to_string(),
            }
            .into());
        }
        if self.interfaces.contains_key(bridge_name) && !self.bridges.contains(bridge_name) {
            return Err(BladeError::LinkConflict {
                network: network_name.to_string(),
                link: bridge_name.to_string(),
                kind: "bridge".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Every overlay terminates on a local underlay device; find the one
    /// whose address is in the network's endpoint set.
    fn find_underlay(&self, endpoint_ips: &[String]) -> VtdsResult<(String, String)> {
        for (ifname, link) in &self.interfaces {
            for info in &link.addr_info {
                if let Some(local) = &info.local {
                    if endpoint_ips.iter().any(|ip| ip == local) {
                        return Ok((ifname.clone(), local.clone()));
                    }
                }
            }
        }
        Err(BladeError::NoUnderlay {
            endpoint_ips: endpoint_ips.to_vec(),
        }
        .into())
    }

    fn remove_link(if_name: &str) -> VtdsResult<()> {
        run("ip", &["link", "del", if_name])
    }

    /// Create the VXLAN tunnel ingress and the bridge mastering it onto
    /// which addresses and guests can be bound.
    fn add_new_tunnel(
        tunnel_name: &str,
        bridge_name: &str,
        vxlan_id: u32,
        device: &str,
    ) -> VtdsResult<()> {
        let id = vxlan_id.to_string();
        run(
            "ip",
            &[
                "link", "add", tunnel_name, "type", "vxlan", "id", &id, "dev", device,
                "dstport", "4789",
            ],
        )?;
        run("ip", &["link", "add", bridge_name, "type", "bridge"])?;
        run("ip", &["link", "set", tunnel_name, "master", bridge_name])?;
        run("ip", &["link", "set", bridge_name, "up"])?;
        run("ip", &["link", "set", tunnel_name, "up"])?;
        Ok(())
    }

    /// Join the blade itself onto the overlay with a veth pair: the peer
    /// is enslaved under the bridge, the interface side carries the
    /// blade's address.
    fn add_blade_interface(
        peer_name: &str,
        if_name: &str,
        bridge_name: &str,
        blade_cidr: Option<&str>,
    ) -> VtdsResult<()> {
        run(
            "ip",
            &["link", "add", if_name, "type", "veth", "peer", "name", peer_name],
        )?;
        run("ip", &["link", "set", peer_name, "master", bridge_name])?;
        run("ip", &["link", "set", peer_name, "up"])?;
        run("ip", &["link", "set", if_name, "up"])?;
        if let Some(cidr) = blade_cidr {
            run("ip", &["addr", "add", cidr, "dev", if_name])?;
        }
        Ok(())
    }

    /// Build the static head-end replication mesh toward every other
    /// endpoint of the overlay.
    fn connect_endpoints(
        tunnel_name: &str,
        endpoint_ips: &[String],
        local_ip: &str,
    ) -> VtdsResult<()> {
        for ip_addr in fdb_targets(endpoint_ips, local_ip) {
            run(
                "bridge",
                &[
                    "fdb", "append", "to", "00:00:00:00:00:00", "dst", ip_addr, "dev",
                    tunnel_name,
                ],
            )?;
        }
        Ok(())
    }

    /// Remove a libvirt network if it is defined.
    pub fn remove_virtual_network(&mut self, network_name: &str) -> VtdsResult<()> {
        if !self.vnets.iter().any(|name| name == network_name) {
            return Ok(());
        }
        run("virsh", &["net-destroy", network_name])?;
        run("virsh", &["net-undefine", network_name])?;
        self.vnets.retain(|name| name != network_name);
        Ok(())
    }

    /// Define, start and autostart a libvirt network bound onto the
    /// bridge mastering the overlay.
    fn add_virtual_network(&mut self, network_name: &str, bridge_name: &str) -> VtdsResult<()> {
        let net_desc = format!(
            "<network>\n  <name>{}</name>\n  <forward mode=\"bridge\" />\n  <bridge name=\"{}\" />\n</network>\n",
            network_name, bridge_name
        );
        let mut tmpfile = NamedTempFile::new().map_err(crate::errors::VtdsError::Io)?;
        tmpfile
            .write_all(net_desc.as_bytes())
            .map_err(crate::errors::VtdsError::Io)?;
        tmpfile.flush().map_err(crate::errors::VtdsError::Io)?;
        let path = tmpfile.path().display().to_string();
        run("virsh", &["net-define", &path])?;
        run("virsh", &["net-start", network_name])?;
        run("virsh", &["net-autostart", network_name])?;
        self.vnets.push(network_name.to_string());
        Ok(())
    }

    /// Rebuild one overlay network from scratch: tear down anything
    /// pre-existing under the managed names, create the tunnel and
    /// bridge, populate the L2 mesh and replace the libvirt network.
    pub fn construct_virtual_network(
        &mut self,
        network: &VirtualNetwork,
        blade_cidr: Option<String>,
    ) -> VtdsResult<()> {
        let network_name = network.network_name.as_str();
        let tunnel_name = network.tunnel_name();
        let bridge_name = network.bridge_name();
        debug!(
            "constructing virtual network '{}' (tunnel '{}', bridge '{}')",
            network_name, tunnel_name, bridge_name
        );
        self.check_conflict(network_name, &tunnel_name, &bridge_name)?;
        if self.interfaces.contains_key(&tunnel_name) {
            if let Some(stale) = self.fdb_dsts.get(&tunnel_name) {
                warn!(
                    "replacing tunnel '{}' which already carries {} FDB mesh entries",
                    tunnel_name,
                    stale.len()
                );
            }
            Self::remove_link(&tunnel_name)?;
        }
        if self.interfaces.contains_key(&bridge_name) {
            Self::remove_link(&bridge_name)?;
        }
        if let Some(local) = network.local_devices() {
            if self.interfaces.contains_key(&local.peer) {
                Self::remove_link(&local.peer)?;
            }
        }
        let (device, local_ip) = self.find_underlay(&network.endpoint_ips)?;
        Self::add_new_tunnel(&tunnel_name, &bridge_name, network.tunnel_id, &device)?;
        Self::connect_endpoints(&tunnel_name, &network.endpoint_ips, &local_ip)?;
        if let Some(local) = network.local_devices() {
            Self::add_blade_interface(
                &local.peer,
                &local.interface,
                &bridge_name,
                blade_cidr.as_deref(),
            )?;
        }
        self.remove_virtual_network(network_name)?;
        self.add_virtual_network(network_name, &bridge_name)?;
        Ok(())
    }
}

/// The FDB mesh targets for a tunnel: every endpoint except the blade's
/// own.
pub fn fdb_targets<'a>(endpoint_ips: &'a [String], local_ip: &str) -> Vec<&'a str> {
    endpoint_ips
        .iter()
        .map(String::as_str)
        .filter(|ip_addr| *ip_addr != local_ip)
        .collect()
}

/// The address/CIDR this blade carries on the network's blade-side
/// interface, present only when this blade is the network's DHCP server
/// host.
pub fn find_blade_cidr(
    network: &VirtualNetwork,
    blade_class: &str,
    blade_instance: usize,
) -> VtdsResult<Option<String>> {
    let l3_config = network.ipv4()?;
    let Some(blade_host) = l3_config.dhcp.as_ref().and_then(|dhcp| dhcp.blade_host.as_ref())
    else {
        return Ok(None);
    };
    if blade_host.blade_class != blade_class || blade_host.blade_instance != blade_instance {
        return Ok(None);
    }
    let blade_ip = blade_host.blade_ip.as_ref().ok_or_else(|| {
        ConfigError::MissingRequired {
            scope: format!(
                "the host where DHCP is served for the Virtual Network named '{}'",
                network.network_name
            ),
            key: "blade_ip".to_string(),
        }
    })?;
    Ok(Some(format!("{}/{}", blade_ip, l3_config.net_length()?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fdb_targets_exclude_local_endpoint() {
        let endpoints = strings(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(fdb_targets(&endpoints, "10.0.0.2"), ["10.0.0.1", "10.0.0.3"]);
        assert_eq!(
            fdb_targets(&endpoints, "10.0.0.9"),
            ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }

    fn network_yaml(dhcp: &str) -> VirtualNetwork {
        serde_yaml::from_str(&format!(
            r#"
network_name: foo
tunnel_id: 7
l3_configs:
  ipv4:
    family: AF_INET
    cidr: 10.8.0.0/16
{}
"#,
            dhcp
        ))
        .unwrap()
    }

    #[test]
    fn test_find_blade_cidr_on_dhcp_host() {
        let network = network_yaml(
            r#"    dhcp:
      enabled: true
      blade_host:
        blade_class: cA
        blade_instance: 1
        blade_ip: 10.8.0.1
"#,
        );
        assert_eq!(
            find_blade_cidr(&network, "cA", 1).unwrap(),
            Some("10.8.0.1/16".to_string())
        );
        assert_eq!(find_blade_cidr(&network, "cA", 0).unwrap(), None);
        assert_eq!(find_blade_cidr(&network, "cB", 1).unwrap(), None);
    }

    #[test]
    fn test_find_blade_cidr_requires_blade_ip() {
        let network = network_yaml(
            r#"    dhcp:
      enabled: true
      blade_host:
        blade_class: cA
        blade_instance: 0
"#,
        );
        assert!(find_blade_cidr(&network, "cA", 0).is_err());
    }

    #[test]
    fn test_conflict_detection() {
        let links = vec![
            Link {
                ifname: "foo".to_string(),
                addr_info: vec![],
                linkinfo: Some(LinkDetail {
                    info_kind: Some("dummy".to_string()),
                }),
            },
            Link {
                ifname: "br-bar".to_string(),
                addr_info: vec![],
                linkinfo: Some(LinkDetail {
                    info_kind: Some("bridge".to_string()),
                }),
            },
        ];
        let installer = NetworkInstaller::from_state(links, vec![], vec![]);
        // A non-vxlan link squatting on the tunnel name is a conflict.
        assert!(installer.check_conflict("foo", "foo", "br-foo").is_err());
        // A bridge under the bridge name is ours to replace.
        assert!(installer.check_conflict("bar", "bar", "br-bar").is_ok());
    }

    #[test]
    fn test_find_underlay_matches_endpoint_ip() {
        let links = vec![Link {
            ifname: "ens4".to_string(),
            addr_info: vec![LinkAddrInfo {
                local: Some("10.100.0.2".to_string()),
            }],
            linkinfo: None,
        }];
        let installer = NetworkInstaller::from_state(links, vec![], vec![]);
        let endpoints = strings(&["10.100.0.1", "10.100.0.2"]);
        assert_eq!(
            installer.find_underlay(&endpoints).unwrap(),
            ("ens4".to_string(), "10.100.0.2".to_string())
        );
        assert!(installer.find_underlay(&strings(&["10.200.0.1"])).is_err());
    }
}
