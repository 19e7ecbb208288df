//! End-to-end planning tests: inheritance expansion, host-blade network
//! synthesis, endpoint IP computation, MAC assignment and plan
//! serialization, driven through a static provider definition.

use std::path::Path;

use vtds_cli::config::cluster_config::{ClusterConfig, ClusterPlan};
use vtds_cli::core::plan::{MacGenerator, PlanBuilder};
use vtds_cli::core::provider::{BladeProvider, StaticProvider, StaticProviderSpec};

const VM_XML: &str = "<domain type='kvm'><name>{{ hostname }}</name></domain>";

fn provider() -> StaticProvider {
    let spec: StaticProviderSpec = serde_yaml::from_str(
        r#"
blade_classes:
  cA:
    count: 3
    ssh_key_dir: /tmp/keys-cA
    interconnects:
      underlay: ["10.100.0.1", "10.100.0.2", "10.100.0.3"]
  cB:
    count: 1
    ssh_key_dir: /tmp/keys-cB
    interconnects:
      underlay: ["10.100.0.4"]
"#,
    )
    .unwrap();
    StaticProvider::new(spec, Path::new("target/test-build"))
}

fn cluster_config(extra_networks: &str, node_classes: &str) -> ClusterConfig {
    serde_yaml::from_str(&format!(
        r#"
node_classes:
{}
networks:
{}
host_blade_network:
  network_name: host-blade-net
  tunnel_id: 999
  blade_interconnect: underlay
  l3_configs:
    ipv4:
      family: AF_INET
      cidr: 10.255.0.0/24
"#,
        node_classes, extra_networks
    ))
    .unwrap()
}

const SERVER_CLASS: &str = r#"
  servers:
    node_naming:
      base_name: server
    node_count: 4
    host_blade:
      blade_class: cA
      instance_capacity: 2
    network_interfaces: {}
    virtual_machine:
      cpu_count: 2
      memory_size_mib: 4096
      boot_disk:
        target_device: vda
        disk_size_mb: 8192
"#;

fn build_plan(config: ClusterConfig) -> ClusterPlan {
    let provider = provider();
    let builder =
        PlanBuilder::with_mac_generator(&provider, VM_XML.to_string(), MacGenerator::seeded(7));
    builder.build(config).unwrap()
}

#[test]
fn test_host_blade_network_synthesis() {
    let plan = build_plan(cluster_config("  {}", SERVER_CLASS));

    // Every blade instance of every class shares the first usable host.
    let host_net = plan.host_blade_network.as_ref().unwrap();
    let connected = &host_net.ipv4().unwrap().connected_blades;
    assert_eq!(connected.len(), 4);
    assert!(connected.iter().all(|blade| blade.blade_ip == "10.255.0.1"));
    assert_eq!(connected[0].blade_class, "cA");
    assert_eq!(connected[3].blade_class, "cB");

    // The node class gains a static interface with tail-allocated
    // addresses and the host-blade hostname suffix.
    let interface = &plan.node_classes["servers"].network_interfaces["host-blade-net"];
    assert_eq!(interface.cluster_network, "host-blade-net");
    assert_eq!(
        interface.ipv4_addresses(),
        ["10.255.0.5", "10.255.0.4", "10.255.0.3", "10.255.0.2"]
    );
    let inet = interface.inet("test").unwrap();
    assert_eq!(inet.hostname_suffix.as_deref(), Some("-host-blade"));

    // The synthesized network is in the deployable network set too.
    assert!(plan.networks.contains_key("host-blade-net"));
}

#[test]
fn test_endpoint_ip_ordering() {
    let networks = r#"
  net-a:
    network_name: net-a
    tunnel_id: 100
    blade_interconnect: underlay
    connected_blade_classes: [cA, cB]
    l3_configs:
      ipv4:
        family: AF_INET
        cidr: 10.1.0.0/24
"#;
    let plan = build_plan(cluster_config(networks, SERVER_CLASS));
    assert_eq!(
        plan.networks["net-a"].endpoint_ips,
        ["10.100.0.1", "10.100.0.2", "10.100.0.3", "10.100.0.4"]
    );

    // Cardinality matches the total blade count of the connected
    // classes.
    let provider = provider();
    let expected: usize = ["cA", "cB"]
        .iter()
        .map(|class| provider.blade_count(class))
        .sum();
    assert_eq!(plan.networks["net-a"].endpoint_ips.len(), expected);
}

#[test]
fn test_endpoint_ips_empty_without_interconnect() {
    let networks = r#"
  net-b:
    network_name: net-b
    tunnel_id: 101
    l3_configs:
      ipv4:
        family: AF_INET
        cidr: 10.2.0.0/24
"#;
    let plan = build_plan(cluster_config(networks, SERVER_CLASS));
    assert!(plan.networks["net-b"].endpoint_ips.is_empty());
}

#[test]
fn test_mac_top_up_preserves_existing() {
    let node_classes = r#"
  servers:
    node_naming:
      base_name: server
    node_count: 3
    host_blade:
      blade_class: cA
    network_interfaces:
      data:
        cluster_network: net-a
        addr_info:
          ipv4:
            family: AF_INET
            mode: dynamic
          layer_2:
            family: AF_PACKET
            addresses: ["52:54:00:aa:bb:cc"]
    virtual_machine:
      cpu_count: 1
      memory_size_mib: 1024
      boot_disk:
        target_device: vda
        disk_size_mb: 4096
"#;
    let networks = r#"
  net-a:
    network_name: net-a
    tunnel_id: 100
    blade_interconnect: underlay
    l3_configs:
      ipv4:
        family: AF_INET
        cidr: 10.1.0.0/24
"#;
    let plan = build_plan(cluster_config(networks, node_classes));
    let macs = plan.node_classes["servers"].network_interfaces["data"].mac_addresses();
    assert_eq!(macs.len(), 3);
    assert_eq!(macs[0], "52:54:00:aa:bb:cc");
    for mac in macs {
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.split(':').count(), 6);
        assert!(mac
            .split(':')
            .all(|octet| octet.len() == 2 && u8::from_str_radix(octet, 16).is_ok()));
    }
}

#[test]
fn test_deterministic_mac_assignment_across_runs() {
    let first = build_plan(cluster_config("  {}", SERVER_CLASS));
    let second = build_plan(cluster_config("  {}", SERVER_CLASS));
    assert_eq!(
        serde_yaml::to_string(&first).unwrap(),
        serde_yaml::to_string(&second).unwrap()
    );
}

#[test]
fn test_pure_base_classes_and_deleted_entries_dropped() {
    let node_classes = r#"
  base:
    pure_base_class: true
    node_count: 0
    node_naming:
      base_name: base
    host_blade:
      blade_class: cA
    network_interfaces:
      spare:
        cluster_network: net-a
        addr_info:
          ipv4:
            family: AF_INET
            mode: dynamic
    virtual_machine:
      cpu_count: 1
      memory_size_mib: 1024
      boot_disk:
        target_device: vda
        disk_size_mb: 4096
  servers:
    parent: base
    node_naming:
      base_name: server
    node_count: 2
    network_interfaces:
      spare:
        delete: true
    virtual_machine:
      cpu_count: 4
"#;
    let networks = r#"
  net-a:
    network_name: net-a
    tunnel_id: 100
    blade_interconnect: underlay
    l3_configs:
      ipv4:
        family: AF_INET
        cidr: 10.1.0.0/24
"#;
    let plan = build_plan(cluster_config(networks, node_classes));

    // Pure base classes never reach the deployable set, even with a
    // node count.
    assert!(!plan.node_classes.contains_key("base"));
    let servers = &plan.node_classes["servers"];
    // Inherited values survive, deleted interfaces do not.
    assert_eq!(servers.virtual_machine.cpu_count, 4);
    assert_eq!(servers.virtual_machine.memory_size_mib, 1024);
    assert!(!servers.network_interfaces.contains_key("spare"));
    // Only the synthesized host-blade interface remains.
    assert_eq!(servers.network_interfaces.len(), 1);
}

#[test]
fn test_deleted_networks_dropped_from_plan() {
    let networks = r#"
  net-a:
    network_name: net-a
    tunnel_id: 100
    blade_interconnect: underlay
    l3_configs:
      ipv4:
        family: AF_INET
        cidr: 10.1.0.0/24
  net-gone:
    network_name: net-gone
    delete: true
    tunnel_id: 101
    l3_configs:
      ipv4:
        family: AF_INET
        cidr: 10.9.0.0/24
"#;
    let plan = build_plan(cluster_config(networks, SERVER_CLASS));
    assert!(plan.networks.contains_key("net-a"));
    assert!(!plan.networks.contains_key("net-gone"));
}

#[test]
fn test_vm_xml_template_embedded_per_class() {
    let plan = build_plan(cluster_config("  {}", SERVER_CLASS));
    assert_eq!(
        plan.node_classes["servers"].vm_xml_template.as_deref(),
        Some(VM_XML)
    );
}

#[test]
fn test_plan_yaml_round_trip() {
    let plan = build_plan(cluster_config("  {}", SERVER_CLASS));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blade_core_config.yaml");
    plan.to_file(&path).unwrap();
    let reloaded = ClusterPlan::from_file(&path).unwrap();
    assert_eq!(
        serde_yaml::to_string(&plan).unwrap(),
        serde_yaml::to_string(&reloaded).unwrap()
    );
}

#[test]
fn test_instance_ranges_partition_node_count() {
    let plan = build_plan(cluster_config("  {}", SERVER_CLASS));
    let servers = &plan.node_classes["servers"];
    // capacity 2, count 4, spread across the three cA blades
    let ranges: Vec<_> = (0..3).map(|blade| servers.instance_range(blade)).collect();
    assert_eq!(ranges[0], 0..2);
    assert_eq!(ranges[1], 2..4);
    assert_eq!(ranges[2], 4..4);
    let mut covered: Vec<usize> = ranges.into_iter().flatten().collect();
    covered.sort_unstable();
    covered.dedup();
    assert_eq!(covered, (0..servers.node_count).collect::<Vec<_>>());
}
