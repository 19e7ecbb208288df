//! Cluster topology schema: the declarative input document and the fully
//! materialized per-blade plan derived from it.

use anyhow::Context;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{ClusterError, ConfigError, VtdsResult};

/// The declarative cluster configuration as loaded from disk.
///
/// Node classes are kept as raw YAML values here because they form an
/// inheritance tree: a pure base class may be an arbitrary fragment that
/// only becomes a complete class once merged into a descendant. The typed
/// [`NodeClass`] structures exist only on the planned side, after
/// expansion and delete-flag pruning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    #[serde(default)]
    pub node_classes: BTreeMap<String, serde_yaml::Value>,

    #[serde(default)]
    pub networks: BTreeMap<String, VirtualNetwork>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_blade_network: Option<VirtualNetwork>,
}

impl ClusterConfig {
    /// Load a cluster configuration document from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> VtdsResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|err| {
            ConfigError::InvalidFormat {
                reason: format!("{}: {}", path.display(), err),
            }
        })?;
        Ok(config)
    }
}

/// The fully materialized plan consumed by the blade agent: every node
/// class expanded and typed, MAC lists topped up, endpoint IPs and the
/// host-blade network wired in, and the domain XML template embedded.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterPlan {
    #[serde(default)]
    pub node_classes: BTreeMap<String, NodeClass>,

    #[serde(default)]
    pub networks: BTreeMap<String, VirtualNetwork>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_blade_network: Option<VirtualNetwork>,
}

impl ClusterPlan {
    /// Load a serialized plan from a YAML file (blade agent side).
    pub fn from_file<P: AsRef<Path>>(path: P) -> VtdsResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to load blade configuration file '{}'", path.display()))?;
        let plan: Self = serde_yaml::from_str(&content).map_err(|err| {
            ConfigError::InvalidFormat {
                reason: format!("{}: {}", path.display(), err),
            }
        })?;
        plan.validate()?;
        Ok(plan)
    }

    /// Serialize the plan as YAML with write-then-rename semantics; the
    /// plan file is the single source of truth for the blade agents.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> VtdsResult<()> {
        let content = serde_yaml::to_string(self)?;
        crate::utils::fs::write_file_atomic(path.as_ref(), &content)?;
        Ok(())
    }

    /// Total number of virtual nodes across all node classes.
    pub fn cluster_node_count(&self) -> usize {
        self.node_classes.values().map(|c| c.node_count).sum()
    }

    pub fn node_class(&self, name: &str) -> VtdsResult<&NodeClass> {
        self.node_classes
            .get(name)
            .ok_or_else(|| {
                ConfigError::ValidationFailed {
                    reason: format!("cannot find the virtual node class '{}'", name),
                }
                .into()
            })
    }

    pub fn network(&self, name: &str) -> VtdsResult<&VirtualNetwork> {
        self.networks
            .get(name)
            .ok_or_else(|| ConfigError::UnknownNetwork { name: name.to_string() }.into())
    }

    /// Single validation pass. Downstream planning and agent code relies
    /// on this so it never has to recheck presence of required fields.
    pub fn validate(&self) -> VtdsResult<()> {
        for network in self.networks.values().filter(|network| !network.delete) {
            network.ipv4()?.ipv4_net()?;
        }
        for (class_name, node_class) in &self.node_classes {
            let virtual_machine = &node_class.virtual_machine;
            virtual_machine.boot_disk.validate(class_name, "boot_disk")?;
            for (disk_name, disk) in &virtual_machine.additional_disks {
                disk.validate(class_name, disk_name)?;
            }
            for interface in node_class.network_interfaces.values() {
                if !self.networks.contains_key(&interface.cluster_network) {
                    return Err(ConfigError::UnknownNetwork {
                        name: interface.cluster_network.clone(),
                    }
                    .into());
                }
                interface.inet(&format!(
                    "interface for network '{}' in node class '{}'",
                    interface.cluster_network, class_name
                ))?;
            }
            // An interface per network at most, so lookups by network
            // name are unambiguous.
            let mut seen = std::collections::BTreeSet::new();
            for interface in node_class.network_interfaces.values() {
                if !seen.insert(interface.cluster_network.as_str()) {
                    return Err(ConfigError::DuplicateInterface {
                        class: class_name.clone(),
                        network: interface.cluster_network.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// A deployable node class: the template from which virtual node
/// instances of one kind are stamped out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeClass {
    pub node_naming: NodeNaming,

    #[serde(default)]
    pub node_count: usize,

    pub host_blade: HostBlade,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub network_interfaces: BTreeMap<String, NetworkInterface>,

    pub virtual_machine: VirtualMachine,

    /// Libvirt domain XML template text, embedded by the planner so the
    /// blade agent needs no template files of its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_xml_template: Option<String>,
}

impl NodeClass {
    /// Host name for one instance of this class: an explicit entry from
    /// `node_names` when present, otherwise `{base_name}-NNN`.
    pub fn node_hostname(&self, instance: usize) -> String {
        self.node_naming
            .node_names
            .get(instance)
            .cloned()
            .unwrap_or_else(|| format!("{}-{:03}", self.node_naming.base_name, instance + 1))
    }

    /// The range of instances of this class that belong on the given
    /// blade instance, spreading instances across blades by the per-blade
    /// instance capacity.
    pub fn instance_range(&self, blade_instance: usize) -> std::ops::Range<usize> {
        let capacity = self.host_blade.instance_capacity.max(1);
        let start = (blade_instance * capacity).min(self.node_count);
        let end = ((blade_instance + 1) * capacity).min(self.node_count);
        start..end
    }

    /// The blade class and blade instance hosting the given node
    /// instance of this class.
    pub fn host_blade_for(&self, class_name: &str, instance: usize) -> VtdsResult<(String, usize)> {
        if instance >= self.node_count {
            return Err(ClusterError::InstanceOutOfRange {
                class: class_name.to_string(),
                instance,
                count: self.node_count,
            }
            .into());
        }
        let capacity = self.host_blade.instance_capacity.max(1);
        Ok((self.host_blade.blade_class.clone(), instance / capacity))
    }

    /// Find the interface of this class connected to the named network,
    /// if any.
    pub fn interface_for_network(
        &self,
        class_name: &str,
        network_name: &str,
    ) -> VtdsResult<Option<&NetworkInterface>> {
        let mut found = None;
        for interface in self.network_interfaces.values() {
            if interface.cluster_network == network_name {
                if found.is_some() {
                    return Err(ConfigError::DuplicateInterface {
                        class: class_name.to_string(),
                        network: network_name.to_string(),
                    }
                    .into());
                }
                found = Some(interface);
            }
        }
        Ok(found)
    }

    /// Names of the networks this class connects to.
    pub fn connected_networks(&self) -> Vec<String> {
        self.network_interfaces
            .values()
            .map(|interface| interface.cluster_network.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeNaming {
    pub base_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostBlade {
    pub blade_class: String,

    /// Number of node instances of this class one blade can carry.
    #[serde(default = "default_instance_capacity")]
    pub instance_capacity: usize,
}

fn default_instance_capacity() -> usize {
    1
}

/// A node class interface onto one virtual network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,

    pub cluster_network: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub addr_info: BTreeMap<String, AddrInfo>,
}

impl NetworkInterface {
    /// The single AF_INET address block of this interface.
    pub fn inet(&self, scope: &str) -> VtdsResult<&InetAddrInfo> {
        let mut found = None;
        for info in self.addr_info.values() {
            if let AddrInfo::Inet(inet) = info {
                if found.is_some() {
                    return Err(ConfigError::DuplicateAddrFamily {
                        scope: scope.to_string(),
                        family: "AF_INET".to_string(),
                    }
                    .into());
                }
                found = Some(inet);
            }
        }
        found.ok_or_else(|| {
            ConfigError::MissingAddrFamily {
                scope: scope.to_string(),
                family: "AF_INET".to_string(),
            }
            .into()
        })
    }

    /// The MAC address list of this interface, empty when the planner has
    /// not assigned one yet.
    pub fn mac_addresses(&self) -> &[String] {
        for info in self.addr_info.values() {
            if let AddrInfo::Packet(packet) = info {
                return &packet.addresses;
            }
        }
        &[]
    }

    /// The IPv4 address list of this interface, empty when addressing is
    /// fully dynamic.
    pub fn ipv4_addresses(&self) -> &[String] {
        for info in self.addr_info.values() {
            if let AddrInfo::Inet(inet) = info {
                return &inet.addresses;
            }
        }
        &[]
    }
}

/// One address block on an interface, tagged by address family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family")]
pub enum AddrInfo {
    #[serde(rename = "AF_INET")]
    Inet(InetAddrInfo),

    #[serde(rename = "AF_PACKET")]
    Packet(PacketAddrInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InetAddrInfo {
    pub mode: AddrMode,

    /// One address per instance; instances past the end of the list fall
    /// back to DHCP.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname_suffix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PacketAddrInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrMode {
    Static,
    Dynamic,
    Reserved,
}

/// Virtual machine shape for a node class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub cpu_count: u32,

    pub memory_size_mib: u64,

    pub boot_disk: Disk,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_disks: BTreeMap<String, Disk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Disk {
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,

    pub target_device: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_mb: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partitions: BTreeMap<String, Partition>,
}

impl Disk {
    pub fn validate(&self, class: &str, disk: &str) -> VtdsResult<()> {
        if self.source_image.is_some() && !self.partitions.is_empty() {
            return Err(ConfigError::ConflictingDiskSpec {
                class: class.to_string(),
                disk: disk.to_string(),
            }
            .into());
        }
        if self.source_image.is_none() && self.partitions.is_empty() && self.disk_size_mb.is_none()
        {
            return Err(ConfigError::EmptyDiskSpec {
                class: class.to_string(),
                disk: disk.to_string(),
            }
            .into());
        }
        if let Some(image) = &self.source_image {
            url::Url::parse(image).map_err(|_| ConfigError::InvalidValue {
                key: format!("{}.{}.source_image", class, disk),
                value: image.clone(),
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Partition {
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<u64>,
}

/// One L2 overlay network spanning the blades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualNetwork {
    pub network_name: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,

    /// Underlay network carrying the VXLAN tunnels; no tunnels are built
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blade_interconnect: Option<String>,

    /// Blade classes participating in the overlay; all of them when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_blade_classes: Option<Vec<String>>,

    /// VXLAN network identifier.
    #[serde(default)]
    pub tunnel_id: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<NetworkDevices>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub l3_configs: BTreeMap<String, L3Config>,

    /// Underlay IPs of every blade participating in this overlay,
    /// computed by the planner.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoint_ips: Vec<String>,
}

impl VirtualNetwork {
    pub fn tunnel_name(&self) -> String {
        self.devices
            .as_ref()
            .and_then(|devices| devices.tunnel.clone())
            .unwrap_or_else(|| self.network_name.clone())
    }

    pub fn bridge_name(&self) -> String {
        self.devices
            .as_ref()
            .and_then(|devices| devices.bridge_name.clone())
            .unwrap_or_else(|| format!("br-{}", self.tunnel_name()))
    }

    pub fn local_devices(&self) -> Option<&LocalDevices> {
        self.devices.as_ref().and_then(|devices| devices.local.as_ref())
    }

    /// The single AF_INET L3 configuration of this network.
    pub fn ipv4(&self) -> VtdsResult<&InetL3Config> {
        let mut found = None;
        for l3_config in self.l3_configs.values() {
            let L3Config::Inet(inet) = l3_config;
            if found.is_some() {
                return Err(ConfigError::DuplicateAddrFamily {
                    scope: format!("the Virtual Network named '{}'", self.network_name),
                    family: "AF_INET".to_string(),
                }
                .into());
            }
            found = Some(inet);
        }
        found.ok_or_else(|| {
            ConfigError::MissingAddrFamily {
                scope: format!("the Virtual Network named '{}'", self.network_name),
                family: "AF_INET".to_string(),
            }
            .into()
        })
    }

    pub fn ipv4_opt(&self) -> Option<&InetL3Config> {
        self.l3_configs.values().next().map(|L3Config::Inet(inet)| inet)
    }

    pub fn ipv4_mut(&mut self) -> VtdsResult<&mut InetL3Config> {
        let scope = format!("the Virtual Network named '{}'", self.network_name);
        let mut found = None;
        for l3_config in self.l3_configs.values_mut() {
            let L3Config::Inet(inet) = l3_config;
            if found.is_some() {
                return Err(ConfigError::DuplicateAddrFamily {
                    scope: scope.clone(),
                    family: "AF_INET".to_string(),
                }
                .into());
            }
            found = Some(inet);
        }
        found.ok_or_else(|| {
            ConfigError::MissingAddrFamily {
                scope,
                family: "AF_INET".to_string(),
            }
            .into()
        })
    }

    /// Whether the given blade is the DHCP server host for this network.
    pub fn is_dhcp_host(&self, blade_class: &str, blade_instance: usize) -> bool {
        let Some(l3_config) = self.ipv4_opt() else {
            return false;
        };
        let Some(dhcp) = &l3_config.dhcp else {
            return false;
        };
        if !dhcp.enabled {
            return false;
        }
        dhcp.blade_host.as_ref().is_some_and(|host| {
            host.blade_class == blade_class && host.blade_instance == blade_instance
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkDevices {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalDevices>,
}

/// Blade-local veth pair joining the blade itself onto the overlay
/// bridge: `peer` is enslaved under the bridge, `interface` carries the
/// blade's address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDevices {
    pub peer: String,
    pub interface: String,
}

/// One L3 configuration on a network, tagged by address family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family")]
pub enum L3Config {
    #[serde(rename = "AF_INET")]
    Inet(InetL3Config),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InetL3Config {
    /// IPv4 prefix of the network, e.g. `10.255.0.0/24`.
    pub cidr: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name_servers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<DhcpConfig>,

    /// Blade-side addressing on this network, written by the planner for
    /// the host-blade network.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connected_blades: Vec<ConnectedBlade>,
}

impl InetL3Config {
    pub fn ipv4_net(&self) -> VtdsResult<Ipv4Net> {
        self.cidr.parse().map_err(|_| {
            ConfigError::InvalidValue {
                key: "cidr".to_string(),
                value: self.cidr.clone(),
            }
            .into()
        })
    }

    /// Prefix length taken from the CIDR.
    pub fn net_length(&self) -> VtdsResult<u8> {
        Ok(self.ipv4_net()?.prefix_len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DhcpConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blade_host: Option<DhcpBladeHost>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pools: Vec<AddressPool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpBladeHost {
    pub blade_class: String,

    pub blade_instance: usize,

    /// Server address on the subnet; defaults to the network's blade-side
    /// address when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blade_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressPool {
    pub start: String,
    pub end: String,
}

/// One blade's address on a network, flattened per blade instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectedBlade {
    pub blade_class: String,
    pub blade_instance: usize,
    pub blade_ip: String,
}

/// Helper function for serde skip_serializing_if
fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORK_YAML: &str = r#"
network_name: cluster-net
tunnel_id: 100
blade_interconnect: underlay
devices:
  local:
    peer: vn-peer
    interface: vn-if
l3_configs:
  ipv4:
    family: AF_INET
    cidr: 10.10.0.0/16
    gateway: 10.10.0.1
    dhcp:
      enabled: true
      blade_host:
        blade_class: cA
        blade_instance: 0
      pools:
        - start: 10.10.1.0
          end: 10.10.1.255
"#;

    #[test]
    fn test_network_parsing() {
        let network: VirtualNetwork = serde_yaml::from_str(NETWORK_YAML).unwrap();
        assert_eq!(network.network_name, "cluster-net");
        assert_eq!(network.tunnel_name(), "cluster-net");
        assert_eq!(network.bridge_name(), "br-cluster-net");
        assert_eq!(network.tunnel_id, 100);
        let l3_config = network.ipv4().unwrap();
        assert_eq!(l3_config.cidr, "10.10.0.0/16");
        assert_eq!(l3_config.net_length().unwrap(), 16);
        assert!(network.is_dhcp_host("cA", 0));
        assert!(!network.is_dhcp_host("cA", 1));
        assert!(!network.is_dhcp_host("cB", 0));
    }

    #[test]
    fn test_duplicate_inet_l3_config_rejected() {
        let yaml = r#"
network_name: dup-net
l3_configs:
  one:
    family: AF_INET
    cidr: 10.0.0.0/24
  two:
    family: AF_INET
    cidr: 10.1.0.0/24
"#;
        let network: VirtualNetwork = serde_yaml::from_str(yaml).unwrap();
        assert!(network.ipv4().is_err());
    }

    #[test]
    fn test_interface_addr_info_families() {
        let yaml = r#"
cluster_network: cluster-net
addr_info:
  ipv4:
    family: AF_INET
    mode: static
    addresses: ["10.10.0.5", "10.10.0.6"]
    hostname_suffix: -cluster
  layer_2:
    family: AF_PACKET
    addresses: ["52:54:00:00:00:01"]
"#;
        let interface: NetworkInterface = serde_yaml::from_str(yaml).unwrap();
        let inet = interface.inet("test interface").unwrap();
        assert_eq!(inet.mode, AddrMode::Static);
        assert_eq!(inet.addresses.len(), 2);
        assert_eq!(inet.hostname_suffix.as_deref(), Some("-cluster"));
        assert_eq!(interface.mac_addresses(), ["52:54:00:00:00:01"]);
    }

    #[test]
    fn test_disk_validation() {
        let mut disk = Disk {
            target_device: "vda".to_string(),
            disk_size_mb: Some(4096),
            ..Default::default()
        };
        assert!(disk.validate("servers", "scratch").is_ok());

        disk.disk_size_mb = None;
        assert!(matches!(
            disk.validate("servers", "scratch"),
            Err(crate::errors::VtdsError::Config(ConfigError::EmptyDiskSpec { .. }))
        ));

        disk.source_image = Some("https://images.example.com/base.qcow2".to_string());
        disk.partitions
            .insert("root".to_string(), Partition::default());
        assert!(matches!(
            disk.validate("servers", "scratch"),
            Err(crate::errors::VtdsError::Config(
                ConfigError::ConflictingDiskSpec { .. }
            ))
        ));
    }

    #[test]
    fn test_hostname_and_instance_range() {
        let node_class = NodeClass {
            node_naming: NodeNaming {
                base_name: "server".to_string(),
                node_names: vec!["first".to_string()],
            },
            node_count: 5,
            host_blade: HostBlade {
                blade_class: "cA".to_string(),
                instance_capacity: 2,
            },
            network_interfaces: BTreeMap::new(),
            virtual_machine: VirtualMachine {
                cpu_count: 2,
                memory_size_mib: 4096,
                boot_disk: Disk {
                    target_device: "vda".to_string(),
                    disk_size_mb: Some(8192),
                    ..Default::default()
                },
                additional_disks: BTreeMap::new(),
            },
            vm_xml_template: None,
        };
        assert_eq!(node_class.node_hostname(0), "first");
        assert_eq!(node_class.node_hostname(1), "server-002");
        assert_eq!(node_class.instance_range(0), 0..2);
        assert_eq!(node_class.instance_range(1), 2..4);
        assert_eq!(node_class.instance_range(2), 4..5);
        assert_eq!(node_class.instance_range(3), 5..5);
        assert_eq!(
            node_class.host_blade_for("servers", 3).unwrap(),
            ("cA".to_string(), 1)
        );
        assert!(node_class.host_blade_for("servers", 5).is_err());
    }
}
