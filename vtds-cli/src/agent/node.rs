//! Virtual node construction on a blade: boot and extra qcow2 disks,
//! netplan and credentials injected into the boot image, and the libvirt
//! domain rendered, defined and started.

use minijinja::Environment;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::cluster_config::{
    AddrMode, Disk, NetworkInterface, NodeClass, VirtualNetwork,
};
use crate::errors::{ConfigError, VtdsError, VtdsResult};
use crate::utils::fs::{ensure_dir_mode, write_file_mode};
use crate::utils::process::{run, run_unchecked};

/// Root of the per-class state kept on each blade.
pub const NODE_STATE_DIR: &str = "/var/local/vtds";

/// Where the composed netplan lands inside each guest.
const NETPLAN_GUEST_PATH: &str = "/etc/netplan/10-vtds-ethernets.yaml";

/// Template context for one disk of a domain.
#[derive(Debug, Clone, Serialize)]
pub struct DiskContext {
    pub file_name: String,
    pub target_device: String,
}

/// Template and netplan context for one guest interface.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceContext {
    pub ifname: String,
    pub netname: String,
    pub source_if: String,
    pub mac_addr: String,
    pub dhcp4: bool,
    pub ipv4_addr: Option<String>,
    pub ipv4_netlength: Option<u8>,
}

#[derive(Debug, Serialize)]
struct DomainContext {
    hostname: String,
    uuid: String,
    memsize_kib: u64,
    cpus: u32,
    boot_disk: DiskContext,
    extra_disks: Vec<DiskContext>,
    interfaces: Vec<InterfaceContext>,
}

/// Compose the per-interface context for one instance: which MAC the
/// interface matches on, and whether it boots static or DHCP. An
/// interface runs DHCP when its mode asks for it or when the instance
/// has no configured address.
pub fn interface_context(
    interface: &NetworkInterface,
    network: &VirtualNetwork,
    instance: usize,
) -> VtdsResult<InterfaceContext> {
    let netname = interface.cluster_network.clone();
    let inet = interface.inet(&format!("interface for network '{}'", netname))?;
    let mac_addr = interface
        .mac_addresses()
        .get(instance)
        .cloned()
        .ok_or_else(|| {
            VtdsError::Internal(format!(
                "no MAC address assigned for instance {} on network '{}'",
                instance, netname
            ))
        })?;
    let net_length = network.ipv4()?.net_length()?;
    let addresses = &inet.addresses;
    let dhcp4 =
        matches!(inet.mode, AddrMode::Dynamic | AddrMode::Reserved) || instance >= addresses.len();
    let (ipv4_addr, ipv4_netlength) = if instance < addresses.len() {
        (Some(addresses[instance].clone()), Some(net_length))
    } else {
        (None, None)
    };
    Ok(InterfaceContext {
        ifname: netname.clone(),
        netname,
        source_if: network.bridge_name(),
        mac_addr,
        dhcp4,
        ipv4_addr,
        ipv4_netlength,
    })
}

#[derive(Debug, Serialize)]
struct Netplan {
    network: NetplanNetwork,
}

#[derive(Debug, Serialize)]
struct NetplanNetwork {
    version: String,
    renderer: String,
    ethernets: BTreeMap<String, NetplanEthernet>,
}

#[derive(Debug, Serialize)]
struct NetplanEthernet {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<String>,
    dhcp4: bool,
    dhcp6: bool,
    #[serde(rename = "match")]
    match_: NetplanMatch,
}

#[derive(Debug, Serialize)]
struct NetplanMatch {
    macaddress: String,
}

/// Compose the netplan document bringing up all of an instance's
/// interfaces as configured.
pub fn netplan_yaml(interfaces: &[InterfaceContext]) -> VtdsResult<String> {
    let ethernets = interfaces
        .iter()
        .map(|interface| {
            let addresses = match (&interface.ipv4_addr, interface.ipv4_netlength) {
                (Some(addr), Some(len)) => vec![format!("{}/{}", addr, len)],
                _ => Vec::new(),
            };
            (
                interface.ifname.clone(),
                NetplanEthernet {
                    addresses,
                    dhcp4: interface.dhcp4,
                    dhcp6: false,
                    match_: NetplanMatch {
                        macaddress: interface.mac_addr.clone(),
                    },
                },
            )
        })
        .collect();
    let netplan = Netplan {
        network: NetplanNetwork {
            version: "2".to_string(),
            renderer: "networkd".to_string(),
            ethernets,
        },
    };
    Ok(serde_yaml::to_string(&netplan)?)
}

/// One virtual node to be replaced on this blade.
pub struct VirtualNode<'a> {
    class_name: String,
    node_class: &'a NodeClass,
    networks: BTreeMap<String, &'a VirtualNetwork>,
    instance: usize,
    hostname: String,
    class_dir: PathBuf,
    host_dir: PathBuf,
    boot_disk_path: PathBuf,
}

impl<'a> VirtualNode<'a> {
    pub fn new(
        class_name: &str,
        node_class: &'a NodeClass,
        networks: BTreeMap<String, &'a VirtualNetwork>,
        instance: usize,
    ) -> Self {
        let hostname = node_class.node_hostname(instance);
        let class_dir = Path::new(NODE_STATE_DIR).join(class_name);
        let host_dir = class_dir.join(&hostname);
        let boot_disk_path = host_dir.join("boot_disk.img");
        Self {
            class_name: class_name.to_string(),
            node_class,
            networks,
            instance,
            hostname,
            class_dir,
            host_dir,
            boot_disk_path,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Stop and undefine any prior incarnation of this node. Both are
    /// allowed to fail when there is nothing to replace.
    pub fn remove(&self) -> VtdsResult<()> {
        run_unchecked("virsh", &["destroy", &self.hostname])?;
        run_unchecked("virsh", &["undefine", &self.hostname])?;
        Ok(())
    }

    /// Build the node's disks, configure its boot image and define and
    /// start its libvirt domain.
    pub fn create(&self, ssh_keys_dir: &Path) -> VtdsResult<()> {
        info!("creating virtual node '{}'", self.hostname);
        ensure_dir_mode(&self.class_dir, 0o755)?;
        ensure_dir_mode(&self.host_dir, 0o755)?;

        let boot_disk = self.make_boot_disk()?;
        let extra_disks = self.make_extra_disks()?;
        let interfaces = self.interface_contexts()?;
        self.configure_netplan(&interfaces)?;
        self.reconfigure_ssh()?;
        self.configure_root_password()?;
        self.inject_ssh_key(ssh_keys_dir)?;

        let context = DomainContext {
            hostname: self.hostname.clone(),
            uuid: Uuid::new_v4().to_string(),
            memsize_kib: self.node_class.virtual_machine.memory_size_mib * 1024,
            cpus: self.node_class.virtual_machine.cpu_count,
            boot_disk,
            extra_disks,
            interfaces,
        };
        let template = self.node_class.vm_xml_template.as_deref().ok_or_else(|| {
            VtdsError::Internal(format!(
                "node class '{}' has no domain XML template embedded in it; \
                 the plan may come from a mismatched controller",
                self.class_name
            ))
        })?;
        let mut env = Environment::new();
        env.add_template("domain", template)?;
        let domain_xml = env.get_template("domain")?.render(&context)?;

        let mut tmpfile = NamedTempFile::new().map_err(VtdsError::Io)?;
        tmpfile.write_all(domain_xml.as_bytes()).map_err(VtdsError::Io)?;
        tmpfile.flush().map_err(VtdsError::Io)?;
        let path = tmpfile.path().display().to_string();
        run("virsh", &["define", &path])?;
        run("virsh", &["start", &self.hostname])?;
        Ok(())
    }

    fn make_boot_disk(&self) -> VtdsResult<DiskContext> {
        let disk = &self.node_class.virtual_machine.boot_disk;
        let source_image_path = self.class_dir.join("boot-img-source.qcow");
        self.make_disk(&self.boot_disk_path, disk, Some(source_image_path))
    }

    fn make_extra_disks(&self) -> VtdsResult<Vec<DiskContext>> {
        self.node_class
            .virtual_machine
            .additional_disks
            .iter()
            .map(|(disk_name, disk)| {
                let source_image_path = disk
                    .source_image
                    .as_ref()
                    .map(|_| self.class_dir.join(format!("{}.qcow", disk_name)));
                self.make_disk(
                    &self.host_dir.join(format!("{}.img", disk_name)),
                    disk,
                    source_image_path,
                )
            })
            .collect()
    }

    /// Create one qcow2 disk, downloading its backing image once per
    /// class when a source URL is configured.
    fn make_disk(
        &self,
        path: &Path,
        disk: &Disk,
        source_image_path: Option<PathBuf>,
    ) -> VtdsResult<DiskContext> {
        let source_image_path = match (&disk.source_image, source_image_path) {
            (Some(url), Some(source_path)) => {
                Self::retrieve_image(url, &source_path)?;
                Some(source_path)
            }
            (Some(_), None) => {
                return Err(VtdsError::Internal(
                    "no source image path supplied when making a disk with a source image URL"
                        .to_string(),
                ));
            }
            _ => None,
        };
        Self::make_disk_image(path, disk.disk_size_mb, source_image_path.as_deref())?;
        Ok(DiskContext {
            file_name: path.display().to_string(),
            target_device: disk.target_device.clone(),
        })
    }

    /// Fetch a disk image once per class. A failed download never leaves
    /// a partial file behind to be mistaken for a cached image.
    fn retrieve_image(url: &str, dest: &Path) -> VtdsResult<()> {
        if dest.exists() {
            debug!("reusing cached source image '{}'", dest.display());
            return Ok(());
        }
        let dest_str = dest.display().to_string();
        if let Err(err) = run("curl", &["-o", &dest_str, "-s", url]) {
            if dest.exists() {
                let _ = std::fs::remove_file(dest);
            }
            return Err(err);
        }
        Ok(())
    }

    fn make_disk_image(
        path: &Path,
        size_mb: Option<u64>,
        source_image: Option<&Path>,
    ) -> VtdsResult<()> {
        let path_str = path.display().to_string();
        let mut args: Vec<String> = vec!["create".to_string()];
        if let Some(source) = source_image {
            args.push("-b".to_string());
            args.push(source.display().to_string());
            args.push("-F".to_string());
            args.push("qcow2".to_string());
        }
        args.push("-f".to_string());
        args.push("qcow2".to_string());
        args.push(path_str.clone());
        if let Some(size) = size_mb {
            args.push(format!("{}M", size));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run("qemu-img", &arg_refs)?;
        run("chown", &["libvirt-qemu:kvm", &path_str])?;
        Ok(())
    }

    fn interface_contexts(&self) -> VtdsResult<Vec<InterfaceContext>> {
        self.node_class
            .network_interfaces
            .values()
            .map(|interface| {
                let network = self
                    .networks
                    .get(&interface.cluster_network)
                    .copied()
                    .ok_or_else(|| ConfigError::UnknownNetwork {
                        name: interface.cluster_network.clone(),
                    })?;
                interface_context(interface, network, self.instance)
            })
            .collect()
    }

    fn configure_netplan(&self, interfaces: &[InterfaceContext]) -> VtdsResult<()> {
        let netplan = netplan_yaml(interfaces)?;
        let mut tmpfile = NamedTempFile::new().map_err(VtdsError::Io)?;
        tmpfile.write_all(netplan.as_bytes()).map_err(VtdsError::Io)?;
        tmpfile.flush().map_err(VtdsError::Io)?;
        let upload = format!("{}:{}", tmpfile.path().display(), NETPLAN_GUEST_PATH);
        let boot_disk = self.boot_disk_path.display().to_string();
        run("virt-customize", &["-a", &boot_disk, "--upload", &upload])
    }

    /// Regenerate SSH host keys so every image gets unique ones.
    fn reconfigure_ssh(&self) -> VtdsResult<()> {
        let boot_disk = self.boot_disk_path.display().to_string();
        run(
            "virt-customize",
            &[
                "-a",
                &boot_disk,
                "--run-command",
                "dpkg-reconfigure openssh-server",
            ],
        )
    }

    /// Set a generated root password and keep it in a root-only file
    /// next to the invocation for later use.
    fn configure_root_password(&self) -> VtdsResult<()> {
        let root_passwd = Uuid::new_v4().to_string();
        let boot_disk = self.boot_disk_path.display().to_string();
        let password_arg = format!("password:{}", root_passwd);
        run(
            "virt-customize",
            &["-a", &boot_disk, "--root-password", &password_arg],
        )?;
        let filename = format!("{}-passwd.txt", self.hostname);
        write_file_mode(&filename, &format!("{}\n", root_passwd), 0o600)?;
        Ok(())
    }

    /// Authorize the blade's key for root logins so tunneled node SSH
    /// works with the blade credentials.
    fn inject_ssh_key(&self, ssh_keys_dir: &Path) -> VtdsResult<()> {
        let public_key = std::fs::read_dir(ssh_keys_dir)
            .ok()
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| entry.path())
            .find(|path| path.extension().is_some_and(|ext| ext == "pub"));
        let Some(public_key) = public_key else {
            warn!(
                "no public key found in '{}', skipping SSH key injection",
                ssh_keys_dir.display()
            );
            return Ok(());
        };
        let boot_disk = self.boot_disk_path.display().to_string();
        let inject = format!("root:file:{}", public_key.display());
        run(
            "virt-customize",
            &["-a", &boot_disk, "--ssh-inject", &inject],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_network() -> VirtualNetwork {
        serde_yaml::from_str(
            r#"
network_name: data-net
l3_configs:
  ipv4:
    family: AF_INET
    cidr: 10.0.0.0/24
"#,
        )
        .unwrap()
    }

    fn test_interface(mode: &str, addresses: &[&str]) -> NetworkInterface {
        let addresses = addresses
            .iter()
            .map(|addr| format!("\"{}\"", addr))
            .collect::<Vec<_>>()
            .join(", ");
        serde_yaml::from_str(&format!(
            r#"
cluster_network: data-net
addr_info:
  ipv4:
    family: AF_INET
    mode: {}
    addresses: [{}]
  layer_2:
    family: AF_PACKET
    addresses:
      - "52:54:00:00:00:01"
      - "52:54:00:00:00:02"
      - "52:54:00:00:00:03"
"#,
            mode, addresses
        ))
        .unwrap()
    }

    #[test]
    fn test_static_addressing_within_range() {
        let network = test_network();
        let interface = test_interface("static", &["10.0.0.5", "10.0.0.6"]);

        let context = interface_context(&interface, &network, 0).unwrap();
        assert!(!context.dhcp4);
        assert_eq!(context.ipv4_addr.as_deref(), Some("10.0.0.5"));
        assert_eq!(context.ipv4_netlength, Some(24));

        let context = interface_context(&interface, &network, 1).unwrap();
        assert!(!context.dhcp4);
        assert_eq!(context.ipv4_addr.as_deref(), Some("10.0.0.6"));
    }

    #[test]
    fn test_static_addressing_past_range_falls_back_to_dhcp() {
        let network = test_network();
        let interface = test_interface("static", &["10.0.0.5", "10.0.0.6"]);
        let context = interface_context(&interface, &network, 2).unwrap();
        assert!(context.dhcp4);
        assert_eq!(context.ipv4_addr, None);
        assert_eq!(context.ipv4_netlength, None);
    }

    #[test]
    fn test_dynamic_and_reserved_modes_use_dhcp() {
        let network = test_network();
        for mode in ["dynamic", "reserved"] {
            let interface = test_interface(mode, &[]);
            let context = interface_context(&interface, &network, 0).unwrap();
            assert!(context.dhcp4);
        }
    }

    #[test]
    fn test_netplan_document_shape() {
        let network = test_network();
        let interface = test_interface("static", &["10.0.0.5"]);
        let contexts = vec![interface_context(&interface, &network, 0).unwrap()];
        let yaml = netplan_yaml(&contexts).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let entry = &parsed["network"]["ethernets"]["data-net"];
        assert_eq!(entry["dhcp4"].as_bool(), Some(false));
        assert_eq!(entry["dhcp6"].as_bool(), Some(false));
        assert_eq!(entry["addresses"][0].as_str(), Some("10.0.0.5/24"));
        assert_eq!(
            entry["match"]["macaddress"].as_str(),
            Some("52:54:00:00:00:01")
        );
        assert_eq!(parsed["network"]["renderer"].as_str(), Some("networkd"));
    }

    #[test]
    fn test_hostname_layout() {
        let node_class: NodeClass = serde_yaml::from_str(
            r#"
node_naming:
  base_name: server
node_count: 2
host_blade:
  blade_class: cA
virtual_machine:
  cpu_count: 2
  memory_size_mib: 4096
  boot_disk:
    target_device: vda
    disk_size_mb: 8192
"#,
        )
        .unwrap();
        let node = VirtualNode::new("servers", &node_class, BTreeMap::new(), 0);
        assert_eq!(node.hostname(), "server-001");
        assert_eq!(
            node.host_dir,
            Path::new("/var/local/vtds/servers/server-001")
        );
        assert_eq!(
            node.boot_disk_path,
            Path::new("/var/local/vtds/servers/server-001/boot_disk.img")
        );
    }
}
