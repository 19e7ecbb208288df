//! CLI surface tests for the controller and the blade agent binaries.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

#[test]
fn test_version_command() {
    let mut cmd = Command::cargo_bin("vtds").unwrap();
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("vtds"));
}

#[test]
fn test_help_command() {
    let mut cmd = Command::cargo_bin("vtds").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("blades"));
}

#[test]
fn test_subcommand_help() {
    let mut cmd = Command::cargo_bin("vtds").unwrap();
    cmd.args(["prepare", "--help"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Cluster configuration file"));
}

#[test]
fn test_agent_usage_error_on_missing_arguments() {
    let mut cmd = Command::cargo_bin("deploy_to_blade").unwrap();
    cmd.args(["cA", "0"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_agent_help_names_arguments() {
    let mut cmd = Command::cargo_bin("deploy_to_blade").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("blade_class").or(predicate::str::contains("BLADE_CLASS")));
}

/// A full prepare run against fixture files in a scratch directory.
fn write_fixtures(dir: &Path) -> (String, String) {
    let build_dir = dir.join("build");
    let template_path = dir.join("vtds-vm.xml");
    fs::write(
        &template_path,
        "<domain type='kvm'><name>{{ hostname }}</name></domain>",
    )
    .unwrap();

    let provider_path = dir.join("provider.yaml");
    fs::write(
        &provider_path,
        r#"
blade_classes:
  cA:
    count: 2
    ssh_key_dir: /tmp/keys-cA
    interconnects:
      underlay: ["10.100.0.1", "10.100.0.2"]
"#,
    )
    .unwrap();

    let cluster_path = dir.join("cluster.yaml");
    fs::write(
        &cluster_path,
        r#"
node_classes:
  servers:
    node_naming:
      base_name: server
    node_count: 2
    host_blade:
      blade_class: cA
    network_interfaces: {}
    virtual_machine:
      cpu_count: 1
      memory_size_mib: 1024
      boot_disk:
        target_device: vda
        disk_size_mb: 4096
networks: {}
host_blade_network:
  network_name: host-blade-net
  tunnel_id: 999
  blade_interconnect: underlay
  l3_configs:
    ipv4:
      family: AF_INET
      cidr: 10.255.0.0/24
"#,
    )
    .unwrap();

    let config_path = dir.join("config.yaml");
    fs::write(
        &config_path,
        format!(
            r#"
cluster:
  build_dir: {}
  vm_xml_template: {}
  agent_path: /usr/local/bin/deploy_to_blade
  agent_name: deploy_to_blade
  provider_config: {}
logging:
  level: info
"#,
            build_dir.display(),
            template_path.display(),
            provider_path.display(),
        ),
    )
    .unwrap();

    (
        config_path.display().to_string(),
        cluster_path.display().to_string(),
    )
}

#[test]
fn test_prepare_writes_plan() {
    let dir = tempfile::tempdir().unwrap();
    let (config_path, cluster_path) = write_fixtures(dir.path());

    let mut cmd = Command::cargo_bin("vtds").unwrap();
    cmd.args(["--config", &config_path, "prepare", &cluster_path]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("plan written to"));

    let plan_path = dir.path().join("build").join("blade_core_config.yaml");
    assert!(plan_path.exists());
    let plan = fs::read_to_string(&plan_path).unwrap();
    assert!(plan.contains("host-blade-net"));
    assert!(plan.contains("10.255.0.1"));
}

#[test]
fn test_show_networks_lists_cidr() {
    let dir = tempfile::tempdir().unwrap();
    let (config_path, cluster_path) = write_fixtures(dir.path());

    let mut cmd = Command::cargo_bin("vtds").unwrap();
    cmd.args(["--config", &config_path, "show", "networks", &cluster_path]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("10.255.0.0/24"));
}

#[test]
fn test_show_nodes_lists_hostnames() {
    let dir = tempfile::tempdir().unwrap();
    let (config_path, cluster_path) = write_fixtures(dir.path());

    let mut cmd = Command::cargo_bin("vtds").unwrap();
    cmd.args(["--config", &config_path, "show", "nodes", &cluster_path]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("server-001"))
        .stdout(predicate::str::contains("server-002"));
}
