//! Controller-side planning: turns the declarative cluster configuration
//! into the fully materialized plan the blade agents consume.
//!
//! Planning is a pure pass over the input document. It expands node class
//! inheritance, synthesizes the host-blade network, computes overlay
//! endpoint IP sets, tops up MAC address lists and embeds the domain XML
//! template. Serializing the result is a separate step so callers can
//! inspect the plan before it is written.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::cluster_config::{
    AddrInfo, AddrMode, ClusterConfig, ClusterPlan, ConnectedBlade, InetAddrInfo, NetworkInterface,
    NodeClass, PacketAddrInfo, VirtualNetwork,
};
use crate::core::inheritance::{expand_node_class, is_pure_base_class};
use crate::core::provider::BladeProvider;
use crate::errors::{ConfigError, VtdsError, VtdsResult};

/// MAC prefix reserved for KVM guests.
pub const KVM_MAC_PREFIX: &str = "52:54:00";

/// Key under which the planner stores generated MAC lists in an
/// interface's `addr_info` mapping.
const LAYER_2_KEY: &str = "layer_2";

/// Random MAC address generator. Seedable so planning can be made
/// reproducible.
pub struct MacGenerator {
    rng: StdRng,
}

impl MacGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generate a MAC address with the given colon-separated hex prefix.
    pub fn random_mac(&mut self, prefix: &str) -> VtdsResult<String> {
        let octets: Vec<u8> = prefix
            .split(':')
            .map(|octet| u8::from_str_radix(octet, 16))
            .collect::<Result<_, _>>()
            .map_err(|err| {
                VtdsError::Internal(format!("parsing MAC prefix '{}' failed - {}", prefix, err))
            })?;
        if octets.len() > 6 {
            return Err(VtdsError::Internal(format!(
                "MAC address prefix '{}' has too many octets",
                prefix
            )));
        }
        let mac: Vec<String> = octets
            .iter()
            .copied()
            .chain((octets.len()..6).map(|_| self.rng.gen_range(0x00..=0xff)))
            .map(|octet| format!("{:02x}", octet))
            .collect();
        Ok(mac.join(":"))
    }
}

impl Default for MacGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the materialized per-blade plan from a cluster configuration.
pub struct PlanBuilder<'a> {
    provider: &'a dyn BladeProvider,
    vm_xml_template: String,
    macs: MacGenerator,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(provider: &'a dyn BladeProvider, vm_xml_template: String) -> Self {
        Self::with_mac_generator(provider, vm_xml_template, MacGenerator::new())
    }

    pub fn with_mac_generator(
        provider: &'a dyn BladeProvider,
        vm_xml_template: String,
        macs: MacGenerator,
    ) -> Self {
        Self {
            provider,
            vm_xml_template,
            macs,
        }
    }

    /// Run the full planning pass.
    pub fn build(mut self, config: ClusterConfig) -> VtdsResult<ClusterPlan> {
        let mut node_classes = self.expand_node_classes(&config)?;

        let mut host_blade_network =
            config
                .host_blade_network
                .clone()
                .ok_or_else(|| ConfigError::MissingRequired {
                    scope: "the cluster configuration".to_string(),
                    key: "host_blade_network".to_string(),
                })?;
        self.add_host_blade_net(&mut node_classes, &mut host_blade_network)?;

        let mut networks: BTreeMap<String, VirtualNetwork> = config
            .networks
            .iter()
            .filter(|(_, network)| !network.delete)
            .map(|(name, network)| (name.clone(), network.clone()))
            .collect();
        for network in networks.values_mut() {
            self.add_endpoint_ips(network)?;
        }
        self.add_endpoint_ips(&mut host_blade_network)?;
        networks.insert(
            host_blade_network.network_name.clone(),
            host_blade_network.clone(),
        );

        for node_class in node_classes.values_mut() {
            self.add_mac_addresses(node_class)?;
            node_class.vm_xml_template = Some(self.vm_xml_template.clone());
        }

        let plan = ClusterPlan {
            node_classes,
            networks,
            host_blade_network: Some(host_blade_network),
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Expand inheritance for every deployable node class. Pure base
    /// classes contribute to the merge but never materialize.
    fn expand_node_classes(
        &self,
        config: &ClusterConfig,
    ) -> VtdsResult<BTreeMap<String, NodeClass>> {
        let mut node_classes = BTreeMap::new();
        for (name, raw_class) in &config.node_classes {
            if is_pure_base_class(raw_class) {
                continue;
            }
            let expanded = expand_node_class(&config.node_classes, name)?;
            let node_class: NodeClass =
                serde_yaml::from_value(expanded).map_err(|err| ConfigError::InvalidFormat {
                    reason: format!("node class '{}': {}", name, err),
                })?;
            node_classes.insert(name.clone(), node_class);
        }
        Ok(node_classes)
    }

    /// Wire every virtual node back to its hosting blade: allocate one
    /// shared blade-side address plus one address per node instance from
    /// the host-blade CIDR, and give every node class a static interface
    /// onto the synthesized network.
    fn add_host_blade_net(
        &self,
        node_classes: &mut BTreeMap<String, NodeClass>,
        host_blade_network: &mut VirtualNetwork,
    ) -> VtdsResult<()> {
        let netname = host_blade_network.network_name.clone();
        let cluster_node_count: usize = node_classes.values().map(|c| c.node_count).sum();
        let net = host_blade_network.ipv4()?.ipv4_net()?;
        let mut hosts: Vec<Ipv4Addr> = net.hosts().take(cluster_node_count + 1).collect();
        if hosts.len() < cluster_node_count + 1 {
            return Err(ConfigError::InvalidValue {
                key: format!("{}.cidr", netname),
                value: format!(
                    "{} (too small for {} nodes)",
                    net, cluster_node_count
                ),
            }
            .into());
        }

        // Every blade shares the first usable host address on this
        // network; node instances consume the allocation from the tail.
        let blade_ip = hosts.remove(0).to_string();
        let connected_blades: Vec<ConnectedBlade> = self
            .provider
            .blade_classes()
            .into_iter()
            .flat_map(|blade_class| {
                (0..self.provider.blade_count(&blade_class))
                    .map(move |blade_instance| (blade_class.clone(), blade_instance))
            })
            .map(|(blade_class, blade_instance)| ConnectedBlade {
                blade_class,
                blade_instance,
                blade_ip: blade_ip.clone(),
            })
            .collect();
        host_blade_network.ipv4_mut()?.connected_blades = connected_blades;

        for node_class in node_classes.values_mut() {
            let addresses: Vec<String> = (0..node_class.node_count)
                .map(|_| {
                    hosts.pop().map(|addr| addr.to_string()).ok_or_else(|| {
                        VtdsError::Internal(
                            "host-blade address allocation exhausted".to_string(),
                        )
                    })
                })
                .collect::<VtdsResult<_>>()?;
            let mut addr_info = BTreeMap::new();
            addr_info.insert(
                "ipv4".to_string(),
                AddrInfo::Inet(InetAddrInfo {
                    mode: AddrMode::Static,
                    addresses,
                    hostname_suffix: Some("-host-blade".to_string()),
                }),
            );
            node_class.network_interfaces.insert(
                netname.clone(),
                NetworkInterface {
                    delete: false,
                    cluster_network: netname.clone(),
                    addr_info,
                },
            );
        }
        Ok(())
    }

    /// Compose the list of underlay endpoint IPs for the overlay built
    /// for this network: every blade of every connected class, projected
    /// through the network's blade interconnect.
    fn add_endpoint_ips(&self, network: &mut VirtualNetwork) -> VtdsResult<()> {
        let Some(interconnect) = network.blade_interconnect.clone() else {
            network.endpoint_ips = Vec::new();
            return Ok(());
        };
        let blade_classes = network
            .connected_blade_classes
            .clone()
            .unwrap_or_else(|| self.provider.blade_classes());
        let mut endpoint_ips = Vec::new();
        for blade_class in &blade_classes {
            for instance in 0..self.provider.blade_count(blade_class) {
                endpoint_ips.push(self.provider.blade_ip(blade_class, instance, &interconnect)?);
            }
        }
        network.endpoint_ips = endpoint_ips;
        Ok(())
    }

    /// Make sure every interface carries at least `node_count` MAC
    /// addresses, preserving configured ones and topping up with random
    /// KVM-prefixed addresses.
    fn add_mac_addresses(&mut self, node_class: &mut NodeClass) -> VtdsResult<()> {
        let node_count = node_class.node_count;
        for interface in node_class.network_interfaces.values_mut() {
            let mut addresses: Vec<String> = interface
                .mac_addresses()
                .iter()
                .take(node_count)
                .cloned()
                .collect();
            while addresses.len() < node_count {
                addresses.push(self.macs.random_mac(KVM_MAC_PREFIX)?);
            }
            let packet = interface.addr_info.values_mut().find_map(|info| match info {
                AddrInfo::Packet(packet) => Some(packet),
                _ => None,
            });
            match packet {
                Some(packet) => packet.addresses = addresses,
                None => {
                    interface.addr_info.insert(
                        LAYER_2_KEY.to_string(),
                        AddrInfo::Packet(PacketAddrInfo { addresses }),
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_mac_generator_is_deterministic() {
        let mut first = MacGenerator::seeded(42);
        let mut second = MacGenerator::seeded(42);
        let a: Vec<String> = (0..8).map(|_| first.random_mac(KVM_MAC_PREFIX).unwrap()).collect();
        let b: Vec<String> = (0..8).map(|_| second.random_mac(KVM_MAC_PREFIX).unwrap()).collect();
        assert_eq!(a, b);
        for mac in &a {
            assert!(mac.starts_with("52:54:00:"));
            assert_eq!(mac.len(), 17);
        }
    }

    #[test]
    fn test_mac_prefix_too_long() {
        let mut generator = MacGenerator::seeded(0);
        let err = generator
            .random_mac("52:54:00:11:22:33:44")
            .unwrap_err();
        assert!(err.to_string().contains("too many octets"));
    }

    #[test]
    fn test_mac_prefix_unparsable() {
        let mut generator = MacGenerator::seeded(0);
        assert!(generator.random_mac("not-a-prefix").is_err());
    }

    #[test]
    fn test_full_prefix_is_returned_verbatim() {
        let mut generator = MacGenerator::seeded(0);
        let mac = generator.random_mac("52:54:00:aa:bb:cc").unwrap();
        assert_eq!(mac, "52:54:00:aa:bb:cc");
    }
}
