//! Kea DHCPv4 configuration for the networks this blade serves, plus
//! service restart and health check.

use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::config::cluster_config::{NetworkInterface, VirtualNetwork};
use crate::errors::{BladeError, VtdsResult};
use crate::utils::process::{capture_unchecked, run, run_unchecked};

/// Where the rendered configuration lands on the blade.
pub const KEA_CONFIG_PATH: &str = "/etc/kea/kea-dhcp4.conf";

const KEA_SERVICE: &str = "kea-dhcp4-server";
const KEA_LEASE_FILE: &str = "/var/lib/kea/kea-leases4.csv";
const ACTIVATION_TIMEOUT_SECS: u32 = 30;

#[derive(Debug, Serialize)]
pub struct KeaConfig {
    #[serde(rename = "Dhcp4")]
    pub dhcp4: Dhcp4,
}

#[derive(Debug, Serialize)]
pub struct Dhcp4 {
    #[serde(rename = "valid-lifetime")]
    valid_lifetime: u32,

    #[serde(rename = "renew-timer")]
    renew_timer: u32,

    #[serde(rename = "rebind-timer")]
    rebind_timer: u32,

    #[serde(rename = "interfaces-config")]
    interfaces_config: InterfacesConfig,

    #[serde(rename = "lease-database")]
    lease_database: LeaseDatabase,

    pub subnet4: Vec<Subnet4>,
}

#[derive(Debug, Serialize)]
struct InterfacesConfig {
    interfaces: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LeaseDatabase {
    #[serde(rename = "type")]
    kind: String,

    persist: bool,

    name: String,

    #[serde(rename = "lfc-interval")]
    lfc_interval: u32,
}

#[derive(Debug, Serialize)]
pub struct Subnet4 {
    pub pools: Vec<Pool>,

    pub subnet: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    pub reservations: Vec<Reservation>,

    #[serde(rename = "option-data")]
    pub option_data: Vec<OptionData>,
}

#[derive(Debug, Serialize)]
pub struct Pool {
    pub pool: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Reservation {
    #[serde(rename = "hw-address")]
    pub hw_address: String,

    #[serde(rename = "ip-address")]
    pub ip_address: String,
}

#[derive(Debug, Serialize)]
pub struct OptionData {
    pub name: String,
    pub data: String,
}

/// A composed Kea DHCPv4 server configuration.
pub struct KeaDhcp4 {
    config: KeaConfig,
}

impl KeaDhcp4 {
    /// Compose the configuration for the networks this blade serves.
    /// `interfaces` is the set of node class interfaces connected to
    /// those networks, from which host reservations are expanded.
    pub fn compose(
        networks: &[&VirtualNetwork],
        interfaces: &[&NetworkInterface],
    ) -> VtdsResult<Self> {
        let mut subnet4 = Vec::new();
        for network in networks {
            let connected: Vec<&&NetworkInterface> = interfaces
                .iter()
                .filter(|interface| interface.cluster_network == network.network_name)
                .collect();
            let l3_config = network.ipv4()?;
            let Some(dhcp) = &l3_config.dhcp else {
                continue;
            };
            let mut option_data = Vec::new();
            if let Some(gateway) = &l3_config.gateway {
                option_data.push(OptionData {
                    name: "routers".to_string(),
                    data: gateway.clone(),
                });
            }
            if !l3_config.name_servers.is_empty() {
                option_data.push(OptionData {
                    name: "domain-name-servers".to_string(),
                    data: l3_config.name_servers.join(","),
                });
            }
            subnet4.push(Subnet4 {
                pools: dhcp
                    .pools
                    .iter()
                    .map(|pool| Pool {
                        pool: format!("{} - {}", pool.start, pool.end),
                    })
                    .collect(),
                subnet: l3_config.cidr.clone(),
                interface: network
                    .local_devices()
                    .map(|local| local.interface.clone()),
                reservations: connected
                    .iter()
                    .flat_map(|interface| compose_reservations(interface))
                    .collect(),
                option_data,
            });
        }

        // Kea listens on the blade-side interfaces of the served
        // networks.
        let listen: Vec<String> = networks
            .iter()
            .filter_map(|network| network.local_devices().map(|local| local.interface.clone()))
            .collect();

        Ok(Self {
            config: KeaConfig {
                dhcp4: Dhcp4 {
                    valid_lifetime: 4000,
                    renew_timer: 1000,
                    rebind_timer: 2000,
                    interfaces_config: InterfacesConfig { interfaces: listen },
                    lease_database: LeaseDatabase {
                        kind: "memfile".to_string(),
                        persist: true,
                        name: KEA_LEASE_FILE.to_string(),
                        lfc_interval: 1800,
                    },
                    subnet4,
                },
            },
        })
    }

    pub fn subnet_count(&self) -> usize {
        self.config.dhcp4.subnet4.len()
    }

    pub fn to_json(&self) -> VtdsResult<String> {
        Ok(serde_json::to_string_pretty(&self.config)?)
    }

    pub fn write_config(&self, path: &Path) -> VtdsResult<()> {
        std::fs::write(path, self.to_json()?).map_err(crate::errors::VtdsError::Io)?;
        Ok(())
    }

    /// Restart the Kea DHCPv4 server and wait for it to report active,
    /// capturing its status output when it never does.
    pub fn restart_server(&self) -> VtdsResult<()> {
        run("systemctl", &["restart", KEA_SERVICE])?;
        for _ in 0..ACTIVATION_TIMEOUT_SECS {
            if run_unchecked("systemctl", &["--quiet", "is-active", KEA_SERVICE])? == 0 {
                info!("{} is active", KEA_SERVICE);
                return Ok(());
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        let status = capture_unchecked("systemctl", &["status", KEA_SERVICE])?;
        Err(BladeError::ServiceInactive {
            service: KEA_SERVICE.to_string(),
            status,
        }
        .into())
    }
}

/// One host reservation per instance, limited by the shorter of the MAC
/// and IP lists.
fn compose_reservations(interface: &NetworkInterface) -> Vec<Reservation> {
    let mac_addrs = interface.mac_addresses();
    let ip_addrs = interface.ipv4_addresses();
    mac_addrs
        .iter()
        .zip(ip_addrs.iter())
        .map(|(mac, ip)| Reservation {
            hw_address: mac.clone(),
            ip_address: ip.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dhcp_network() -> VirtualNetwork {
        serde_yaml::from_str(
            r#"
network_name: net-x
devices:
  local:
    peer: nx-peer
    interface: nx-if
l3_configs:
  ipv4:
    family: AF_INET
    cidr: 10.5.0.0/24
    gateway: 10.5.0.1
    name_servers: ["8.8.8.8", "1.1.1.1"]
    dhcp:
      enabled: true
      blade_host:
        blade_class: cA
        blade_instance: 1
        blade_ip: 10.5.0.1
      pools:
        - start: 10.5.0.100
          end: 10.5.0.200
"#,
        )
        .unwrap()
    }

    fn node_interface() -> NetworkInterface {
        serde_yaml::from_str(
            r#"
cluster_network: net-x
addr_info:
  ipv4:
    family: AF_INET
    mode: reserved
    addresses: ["10.5.0.10", "10.5.0.11"]
  layer_2:
    family: AF_PACKET
    addresses:
      - "52:54:00:00:00:01"
      - "52:54:00:00:00:02"
      - "52:54:00:00:00:03"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_compose_subnet_for_served_network() {
        let network = dhcp_network();
        let interface = node_interface();
        let kea = KeaDhcp4::compose(&[&network], &[&interface]).unwrap();
        assert_eq!(kea.subnet_count(), 1);
        let json: serde_json::Value = serde_json::from_str(&kea.to_json().unwrap()).unwrap();
        let subnet = &json["Dhcp4"]["subnet4"][0];
        assert_eq!(subnet["subnet"], "10.5.0.0/24");
        assert_eq!(subnet["interface"], "nx-if");
        assert_eq!(subnet["pools"][0]["pool"], "10.5.0.100 - 10.5.0.200");
        // Reservations stop at the shorter of the MAC and IP lists.
        assert_eq!(subnet["reservations"].as_array().unwrap().len(), 2);
        assert_eq!(subnet["reservations"][0]["hw-address"], "52:54:00:00:00:01");
        assert_eq!(subnet["reservations"][0]["ip-address"], "10.5.0.10");
        assert_eq!(subnet["option-data"][0]["name"], "routers");
        assert_eq!(subnet["option-data"][1]["data"], "8.8.8.8,1.1.1.1");
        assert_eq!(
            json["Dhcp4"]["interfaces-config"]["interfaces"][0],
            "nx-if"
        );
        assert_eq!(json["Dhcp4"]["valid-lifetime"], 4000);
        assert_eq!(
            json["Dhcp4"]["lease-database"]["name"],
            "/var/lib/kea/kea-leases4.csv"
        );
    }

    #[test]
    fn test_compose_empty_when_not_serving() {
        let kea = KeaDhcp4::compose(&[], &[]).unwrap();
        assert_eq!(kea.subnet_count(), 0);
        let json: serde_json::Value = serde_json::from_str(&kea.to_json().unwrap()).unwrap();
        assert_eq!(json["Dhcp4"]["subnet4"].as_array().unwrap().len(), 0);
    }
}
