//! The blade agent: idempotent reconciliation of one blade against the
//! plan. Phases run in strict order - overlay networks first, then DHCP
//! service, then node replacement - so a node never comes up before its
//! network exists.

pub mod dhcp;
pub mod network;
pub mod node;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

use crate::config::cluster_config::{ClusterPlan, NetworkInterface, NodeClass, VirtualNetwork};
use crate::errors::VtdsResult;
use dhcp::KeaDhcp4;
use network::{find_blade_cidr, NetworkInstaller};
use node::VirtualNode;

/// Whether a network is connected to an interface of any of the given
/// node classes.
fn network_connected(network: &VirtualNetwork, node_classes: &[(&String, &NodeClass)]) -> bool {
    node_classes.iter().any(|(_, node_class)| {
        node_class
            .network_interfaces
            .values()
            .any(|interface| interface.cluster_network == network.network_name)
    })
}

/// The networks connected to one node class, indexed by network name.
fn node_connected_networks<'a>(
    node_class: &NodeClass,
    networks: &[&'a VirtualNetwork],
) -> BTreeMap<String, &'a VirtualNetwork> {
    let connected: BTreeSet<&str> = node_class
        .network_interfaces
        .values()
        .map(|interface| interface.cluster_network.as_str())
        .collect();
    networks
        .iter()
        .filter(|network| connected.contains(network.network_name.as_str()))
        .map(|network| (network.network_name.clone(), *network))
        .collect()
}

/// Reconcile this blade against the plan: rebuild the overlay networks
/// it participates in, stand up DHCP where it is the server, and replace
/// the virtual nodes that belong on it.
pub fn deploy_to_blade(
    blade_class: &str,
    blade_instance: usize,
    config_path: &Path,
    ssh_keys_dir: &Path,
) -> VtdsResult<()> {
    let plan = ClusterPlan::from_file(config_path)?;
    let mut installer = NetworkInstaller::discover()?;
    installer.remove_virtual_network("default")?;

    // Only node classes hosted on this blade class are in scope, and
    // only the networks they connect to.
    let node_classes: Vec<(&String, &NodeClass)> = plan
        .node_classes
        .iter()
        .filter(|(_, node_class)| node_class.host_blade.blade_class == blade_class)
        .collect();
    let networks: Vec<&VirtualNetwork> = plan
        .networks
        .values()
        .filter(|network| !network.delete && network_connected(network, &node_classes))
        .collect();

    let dhcp_networks: Vec<&VirtualNetwork> = networks
        .iter()
        .copied()
        .filter(|network| network.is_dhcp_host(blade_class, blade_instance))
        .collect();
    let dhcp_names: BTreeSet<&str> = dhcp_networks
        .iter()
        .map(|network| network.network_name.as_str())
        .collect();
    let dhcp_interfaces: Vec<&NetworkInterface> = node_classes
        .iter()
        .flat_map(|(_, node_class)| node_class.network_interfaces.values())
        .filter(|interface| dhcp_names.contains(interface.cluster_network.as_str()))
        .collect();

    info!(
        "reconciling {} virtual networks on blade {}/{}",
        networks.len(),
        blade_class,
        blade_instance
    );
    for network in &networks {
        let blade_cidr = find_blade_cidr(network, blade_class, blade_instance)?;
        installer.construct_virtual_network(network, blade_cidr)?;
    }

    info!(
        "serving DHCP for {} of {} networks",
        dhcp_networks.len(),
        networks.len()
    );
    let kea = KeaDhcp4::compose(&dhcp_networks, &dhcp_interfaces)?;
    kea.write_config(Path::new(dhcp::KEA_CONFIG_PATH))?;
    kea.restart_server()?;

    let nodes: Vec<VirtualNode> = node_classes
        .iter()
        .flat_map(|(class_name, node_class)| {
            let connected = node_connected_networks(node_class, &networks);
            node_class
                .instance_range(blade_instance)
                .map(move |instance| {
                    VirtualNode::new(class_name, node_class, connected.clone(), instance)
                })
        })
        .collect();
    info!("replacing {} virtual nodes", nodes.len());
    for node in &nodes {
        node.remove()?;
    }
    for node in &nodes {
        node.create(ssh_keys_dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_from_yaml() -> ClusterPlan {
        serde_yaml::from_str(
            r#"
node_classes:
  servers:
    node_naming:
      base_name: server
    node_count: 2
    host_blade:
      blade_class: cA
      instance_capacity: 1
    network_interfaces:
      data:
        cluster_network: net-x
        addr_info:
          ipv4:
            family: AF_INET
            mode: static
            addresses: ["10.5.0.10", "10.5.0.11"]
    virtual_machine:
      cpu_count: 2
      memory_size_mib: 2048
      boot_disk:
        target_device: vda
        disk_size_mb: 4096
networks:
  net-x:
    network_name: net-x
    l3_configs:
      ipv4:
        family: AF_INET
        cidr: 10.5.0.0/24
        dhcp:
          enabled: true
          blade_host:
            blade_class: cA
            blade_instance: 1
            blade_ip: 10.5.0.1
  net-y:
    network_name: net-y
    l3_configs:
      ipv4:
        family: AF_INET
        cidr: 10.6.0.0/24
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_network_scope_follows_node_classes() {
        let plan = plan_from_yaml();
        let node_classes: Vec<(&String, &NodeClass)> = plan.node_classes.iter().collect();
        let net_x = &plan.networks["net-x"];
        let net_y = &plan.networks["net-y"];
        assert!(network_connected(net_x, &node_classes));
        assert!(!network_connected(net_y, &node_classes));
    }

    #[test]
    fn test_dhcp_host_selection() {
        let plan = plan_from_yaml();
        let net_x = &plan.networks["net-x"];
        // Only the configured blade host instance serves the subnet.
        assert!(net_x.is_dhcp_host("cA", 1));
        assert!(!net_x.is_dhcp_host("cA", 0));
        let interfaces: Vec<&NetworkInterface> = plan.node_classes["servers"]
            .network_interfaces
            .values()
            .collect();

        let serving = KeaDhcp4::compose(&[net_x], &interfaces).unwrap();
        assert_eq!(serving.subnet_count(), 1);

        let idle = KeaDhcp4::compose(&[], &[]).unwrap();
        assert_eq!(idle.subnet_count(), 0);
    }
}
