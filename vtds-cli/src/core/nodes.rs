//! Cluster layer API objects: queries over the materialized plan and
//! on-demand SSH tunnels to the virtual nodes, reached through the blade
//! that hosts them.

use minijinja::{context, Environment};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::info;

use crate::config::cluster_config::{ClusterPlan, NodeClass};
use crate::core::provider::{BladeConnection, BladeProvider};
use crate::errors::{ClusterError, ConfigError, VtdsResult};
use crate::utils::fs::{log_paths, LogPaths};
use crate::utils::net::free_local_port;
use crate::utils::process::{spawn_logged, wait_logged};

const TUNNEL_PROBE_RETRIES: u32 = 60;
const TUNNEL_PROBE_INTERVAL: Duration = Duration::from_secs(1);
const TUNNEL_RECONNECTS: u32 = 10;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

const SSH_OPTIONS: [&str; 6] = [
    "-o",
    "BatchMode=yes",
    "-o",
    "NoHostAuthenticationForLocalhost=yes",
    "-o",
    "StrictHostKeyChecking=no",
];

fn sanitize_logname(name: &str) -> String {
    name.replace('/', "-")
}

/// Shared query layer over the plan and the provider, used by all of the
/// API objects.
pub struct Common {
    plan: ClusterPlan,
    provider: Arc<dyn BladeProvider>,
    build_dir: PathBuf,
}

impl Common {
    pub fn new(plan: ClusterPlan, provider: Arc<dyn BladeProvider>, build_dir: &Path) -> Self {
        Self {
            plan,
            provider,
            build_dir: build_dir.to_path_buf(),
        }
    }

    pub fn plan(&self) -> &ClusterPlan {
        &self.plan
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    fn node_class(&self, name: &str) -> VtdsResult<&NodeClass> {
        self.plan.node_class(name)
    }

    fn check_instance(&self, node_class: &str, instance: usize) -> VtdsResult<&NodeClass> {
        let class = self.node_class(node_class)?;
        if instance >= class.node_count {
            return Err(ClusterError::InstanceOutOfRange {
                class: node_class.to_string(),
                instance,
                count: class.node_count,
            }
            .into());
        }
        Ok(class)
    }

    pub fn node_count(&self, node_class: &str) -> VtdsResult<usize> {
        Ok(self.node_class(node_class)?.node_count)
    }

    /// Names of the networks connected to nodes of the given class.
    pub fn node_networks(&self, node_class: &str) -> VtdsResult<Vec<String>> {
        Ok(self.node_class(node_class)?.connected_networks())
    }

    /// The hostname of one node instance, with the network's hostname
    /// suffix appended when a network is named.
    pub fn node_hostname(
        &self,
        node_class: &str,
        instance: usize,
        network_name: Option<&str>,
    ) -> VtdsResult<String> {
        let class = self.check_instance(node_class, instance)?;
        let suffix = match network_name {
            None => String::new(),
            Some(netname) => class
                .interface_for_network(node_class, netname)?
                .and_then(|interface| {
                    interface
                        .inet("interface")
                        .ok()
                        .and_then(|inet| inet.hostname_suffix.clone())
                })
                .unwrap_or_default(),
        };
        Ok(format!("{}{}", class.node_hostname(instance), suffix))
    }

    fn host_blade_class(&self, node_class: &str) -> VtdsResult<String> {
        Ok(self.node_class(node_class)?.host_blade.blade_class.clone())
    }

    /// Node SSH keys are the keys of the blade class hosting the node.
    pub fn node_ssh_key_secret(&self, node_class: &str) -> VtdsResult<String> {
        let blade_class = self.host_blade_class(node_class)?;
        self.provider.blade_ssh_key_secret(&blade_class)
    }

    pub fn ssh_key_paths(&self, node_class: &str) -> VtdsResult<(PathBuf, PathBuf)> {
        let blade_class = self.host_blade_class(node_class)?;
        self.provider.blade_ssh_key_paths(&blade_class)
    }

    /// The blade class and instance hosting a node instance.
    pub fn node_host_blade(&self, node_class: &str, instance: usize) -> VtdsResult<(String, usize)> {
        self.node_class(node_class)?.host_blade_for(node_class, instance)
    }

    /// The node's static address on the host-blade network, which is how
    /// the hosting blade reaches it.
    pub fn node_host_blade_ip(&self, node_class: &str, instance: usize) -> VtdsResult<String> {
        let class = self.check_instance(node_class, instance)?;
        let netname = self
            .plan
            .host_blade_network
            .as_ref()
            .map(|network| network.network_name.clone())
            .ok_or_else(|| ConfigError::MissingRequired {
                scope: "the cluster plan".to_string(),
                key: "host_blade_network".to_string(),
            })?;
        let interface = class
            .interface_for_network(node_class, &netname)?
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: format!(
                    "node class '{}' has no interface on the host blade network '{}'",
                    node_class, netname
                ),
            })?;
        interface
            .ipv4_addresses()
            .get(instance)
            .cloned()
            .ok_or_else(|| {
                ConfigError::ValidationFailed {
                    reason: format!(
                        "node class '{}' has no host blade address for instance {}",
                        node_class, instance
                    ),
                }
                .into()
            })
    }

    /// An SSH connection to the blade hosting a node instance.
    pub async fn host_blade_connection(
        &self,
        node_class: &str,
        instance: usize,
    ) -> VtdsResult<Box<dyn BladeConnection>> {
        let (blade_class, blade_instance) = self.node_host_blade(node_class, instance)?;
        self.provider
            .ssh_connect_blade(&blade_class, blade_instance)
            .await
    }
}

/// The Virtual Nodes of the cluster: naming, counting and connecting.
pub struct VirtualNodes {
    common: Arc<Common>,
}

impl VirtualNodes {
    pub fn new(common: Arc<Common>) -> Self {
        Self { common }
    }

    /// Names of all deployable node classes.
    pub fn node_classes(&self) -> Vec<String> {
        self.common.plan().node_classes.keys().cloned().collect()
    }

    pub fn node_count(&self, node_class: &str) -> VtdsResult<usize> {
        self.common.node_count(node_class)
    }

    pub fn network_names(&self, node_class: &str) -> VtdsResult<Vec<String>> {
        self.common.node_networks(node_class)
    }

    pub fn node_hostname(
        &self,
        node_class: &str,
        instance: usize,
        network_name: Option<&str>,
    ) -> VtdsResult<String> {
        self.common.node_hostname(node_class, instance, network_name)
    }

    pub fn node_ssh_key_secret(&self, node_class: &str) -> VtdsResult<String> {
        self.common.node_ssh_key_secret(node_class)
    }

    pub fn node_ssh_key_paths(&self, node_class: &str) -> VtdsResult<(PathBuf, PathBuf)> {
        self.common.ssh_key_paths(node_class)
    }

    /// Open a TCP tunnel to a port on one node.
    pub async fn connect_node(
        &self,
        node_class: &str,
        instance: usize,
        remote_port: u16,
    ) -> VtdsResult<NodeConnection> {
        NodeConnection::connect(&self.common, node_class, instance, remote_port).await
    }

    /// Open TCP tunnels to a port on every node of the given classes
    /// (all classes when None).
    pub async fn connect_nodes(
        &self,
        remote_port: u16,
        node_classes: Option<&[String]>,
    ) -> VtdsResult<NodeConnectionSet> {
        let classes = match node_classes {
            Some(classes) => classes.to_vec(),
            None => self.node_classes(),
        };
        let mut connections = Vec::new();
        for node_class in &classes {
            for instance in 0..self.common.node_count(node_class)? {
                connections
                    .push(NodeConnection::connect(&self.common, node_class, instance, remote_port).await?);
            }
        }
        Ok(NodeConnectionSet { connections })
    }

    /// Open an SSH-capable tunnel to one node.
    pub async fn ssh_connect_node(
        &self,
        node_class: &str,
        instance: usize,
        remote_port: u16,
    ) -> VtdsResult<NodeSSHConnection> {
        NodeSSHConnection::connect(&self.common, node_class, instance, remote_port).await
    }

    /// Open SSH-capable tunnels to every node of the given classes.
    pub async fn ssh_connect_nodes(
        &self,
        node_classes: Option<&[String]>,
        remote_port: u16,
    ) -> VtdsResult<NodeSSHConnectionSet> {
        let classes = match node_classes {
            Some(classes) => classes.to_vec(),
            None => self.node_classes(),
        };
        let mut connections = Vec::new();
        for node_class in &classes {
            for instance in 0..self.common.node_count(node_class)? {
                connections.push(
                    NodeSSHConnection::connect(&self.common, node_class, instance, remote_port)
                        .await?,
                );
            }
        }
        Ok(NodeSSHConnectionSet {
            connections,
            build_dir: self.common.build_dir().to_path_buf(),
        })
    }
}

/// The Virtual Networks of the cluster.
pub struct VirtualNetworks {
    common: Arc<Common>,
}

impl VirtualNetworks {
    pub fn new(common: Arc<Common>) -> Self {
        Self { common }
    }

    pub fn network_names(&self) -> Vec<String> {
        self.common
            .plan()
            .networks
            .values()
            .filter(|network| !network.delete)
            .map(|network| network.network_name.clone())
            .collect()
    }

    /// The IPv4 CIDR of the named network, or None when it has no
    /// AF_INET configuration.
    pub fn ipv4_cidr(&self, network_name: &str) -> VtdsResult<Option<String>> {
        let network = self.common.plan().network(network_name)?;
        Ok(network.ipv4_opt().map(|l3_config| l3_config.cidr.clone()))
    }
}

/// A TCP tunnel from the controller to one port on one virtual node,
/// forwarded through the node's hosting blade.
pub struct NodeConnection {
    node_class: String,
    instance: usize,
    hostname: String,
    remote_port: u16,
    local_ip: String,
    local_port: u16,
    child: Option<tokio::process::Child>,
    // Held so the blade tunnel outlives the node tunnel.
    blade: Option<Box<dyn BladeConnection>>,
    logs: LogPaths,
}

impl NodeConnection {
    async fn connect(
        common: &Common,
        node_class: &str,
        instance: usize,
        remote_port: u16,
    ) -> VtdsResult<Self> {
        let hostname = common.node_hostname(node_class, instance, None)?;
        let blade = common.host_blade_connection(node_class, instance).await?;
        let blade_hostname = blade.blade_hostname();
        let ssh_ip = blade.local_ip();
        let ssh_port = blade.local_port();
        let (_, private_key) = common.ssh_key_paths(node_class)?;
        let node_ip = common.node_host_blade_ip(node_class, instance)?;
        let logs = log_paths(
            common.build_dir(),
            &format!("node_connection-{}-port-{}", hostname, remote_port),
        )?;
        let local_ip = "127.0.0.1".to_string();

        let mut reconnects = TUNNEL_RECONNECTS;
        while reconnects > 0 {
            let local_port = free_local_port().map_err(crate::errors::VtdsError::Io)?;
            let mut args: Vec<String> = vec![
                "-L".to_string(),
                format!("{}:{}:{}:{}", local_ip, local_port, node_ip, remote_port),
                "-o".to_string(),
                "NoHostAuthenticationForLocalhost=yes".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-N".to_string(),
                "-p".to_string(),
                ssh_port.to_string(),
                "-i".to_string(),
                private_key.display().to_string(),
            ];
            args.push(format!("root@{}", ssh_ip));
            let mut child = spawn_logged("ssh", &args, &logs)?;

            let mut retries = TUNNEL_PROBE_RETRIES;
            while retries > 0 {
                // A dead forwarder will never accept the probe, so
                // restart the whole attempt instead.
                if let Some(status) = child.try_wait().map_err(crate::errors::VtdsError::Io)? {
                    info!(
                        "SSH port forwarding connection to '{}' on port {} terminated \
                         with exit status {} [{}]",
                        blade_hostname,
                        ssh_port,
                        status.code().unwrap_or(-1),
                        if reconnects > 1 { "retrying" } else { "failing" },
                    );
                    break;
                }
                match TcpStream::connect((local_ip.as_str(), local_port)).await {
                    Ok(_) => {
                        return Ok(Self {
                            node_class: node_class.to_string(),
                            instance,
                            hostname,
                            remote_port,
                            local_ip,
                            local_port,
                            child: Some(child),
                            blade: Some(blade),
                            logs,
                        });
                    }
                    Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                        sleep(TUNNEL_PROBE_INTERVAL).await;
                        retries -= 1;
                    }
                    Err(err) => {
                        let _ = child.start_kill();
                        return Err(anyhow::Error::from(err)
                            .context(format!(
                                "failed attempt to connect to service on SSH port forwarding \
                                 tunnel to node '{}' port {} (local port = {}) - details in '{}'",
                                hostname,
                                remote_port,
                                local_port,
                                logs.err.display(),
                            ))
                            .into());
                    }
                }
            }
            reconnects -= 1;
            let _ = child.start_kill();
            // A timed-out probe loop has already waited long enough to
            // reconnect immediately.
            if retries > 0 && reconnects > 0 {
                sleep(RECONNECT_BACKOFF).await;
            }
        }
        Err(ClusterError::TunnelTimeout {
            hostname,
            remote_port,
            err_log: logs.err.clone(),
        }
        .into())
    }

    pub fn node_class(&self) -> &str {
        &self.node_class
    }

    pub fn instance(&self) -> usize {
        self.instance
    }

    pub fn node_hostname(&self) -> &str {
        &self.hostname
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Kill the forwarding process and release the blade tunnel. Also
    /// runs on drop, so the tunnel never outlives its handle.
    pub fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        self.blade = None;
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// A launched non-blocking remote operation; await it to join.
pub struct RemoteOp {
    child: tokio::process::Child,
    description: String,
    logs: LogPaths,
}

impl RemoteOp {
    pub async fn wait(mut self, timeout: Option<Duration>) -> VtdsResult<()> {
        wait_logged(&mut self.child, &self.description, &self.logs, timeout).await
    }
}

/// A node tunnel that also knows how to run `ssh`/`scp` against the
/// node through the forwarded port.
pub struct NodeSSHConnection {
    connection: NodeConnection,
    private_key: PathBuf,
    build_dir: PathBuf,
}

impl NodeSSHConnection {
    async fn connect(
        common: &Common,
        node_class: &str,
        instance: usize,
        remote_port: u16,
    ) -> VtdsResult<Self> {
        let connection = NodeConnection::connect(common, node_class, instance, remote_port).await?;
        let (_, private_key) = common.ssh_key_paths(node_class)?;
        Ok(Self {
            connection,
            private_key,
            build_dir: common.build_dir().to_path_buf(),
        })
    }

    pub fn node_class(&self) -> &str {
        self.connection.node_class()
    }

    pub fn node_hostname(&self) -> &str {
        self.connection.node_hostname()
    }

    pub fn close(&mut self) {
        self.connection.close();
    }

    /// Render a templated command string with the connection's facts.
    fn render_command(&self, cmd: &str) -> VtdsResult<String> {
        let env = Environment::new();
        let rendered = env.render_str(
            cmd,
            context! {
                node_class => self.connection.node_class,
                instance => self.connection.instance,
                node_hostname => self.connection.hostname,
                remote_port => self.connection.remote_port,
                local_ip => self.connection.local_ip,
                local_port => self.connection.local_port,
            },
        )?;
        Ok(rendered)
    }

    /// Launch a copy to the node without waiting for it.
    pub fn start_copy_to(
        &self,
        source: &Path,
        destination: &str,
        recurse: bool,
        logname: Option<&str>,
    ) -> VtdsResult<RemoteOp> {
        let logname = logname
            .map(str::to_string)
            .unwrap_or_else(|| format!("copy-to-{}-{}", source.display(), destination));
        let logs = log_paths(
            &self.build_dir,
            &sanitize_logname(&format!("{}-{}", logname, self.node_hostname())),
        )?;
        let mut args: Vec<String> = vec![
            "-i".to_string(),
            self.private_key.display().to_string(),
            "-P".to_string(),
            self.connection.local_port.to_string(),
        ];
        if recurse {
            args.push("-r".to_string());
        }
        args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        args.push(source.display().to_string());
        args.push(format!(
            "root@{}:{}",
            self.connection.local_ip, destination
        ));
        let description = format!(
            "scp {} to root@{}:{}",
            source.display(),
            self.node_hostname(),
            destination
        );
        let child = spawn_logged("scp", &args, &logs)?;
        Ok(RemoteOp {
            child,
            description,
            logs,
        })
    }

    pub async fn copy_to(
        &self,
        source: &Path,
        destination: &str,
        recurse: bool,
        logname: Option<&str>,
    ) -> VtdsResult<()> {
        self.start_copy_to(source, destination, recurse, logname)?
            .wait(None)
            .await
    }

    /// Launch a copy from the node without waiting for it.
    pub fn start_copy_from(
        &self,
        source: &str,
        destination: &Path,
        recurse: bool,
        logname: Option<&str>,
    ) -> VtdsResult<RemoteOp> {
        let logname = logname
            .map(str::to_string)
            .unwrap_or_else(|| format!("copy-from-{}-{}", source, destination.display()));
        let logs = log_paths(
            &self.build_dir,
            &sanitize_logname(&format!("{}-{}", logname, self.node_hostname())),
        )?;
        let mut args: Vec<String> = vec![
            "-i".to_string(),
            self.private_key.display().to_string(),
            "-P".to_string(),
            self.connection.local_port.to_string(),
        ];
        if recurse {
            args.push("-r".to_string());
        }
        args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        args.push(format!("root@{}:{}", self.connection.local_ip, source));
        args.push(destination.display().to_string());
        let description = format!(
            "scp root@{}:{} to {}",
            self.node_hostname(),
            source,
            destination.display()
        );
        let child = spawn_logged("scp", &args, &logs)?;
        Ok(RemoteOp {
            child,
            description,
            logs,
        })
    }

    pub async fn copy_from(
        &self,
        source: &str,
        destination: &Path,
        recurse: bool,
        logname: Option<&str>,
    ) -> VtdsResult<()> {
        self.start_copy_from(source, destination, recurse, logname)?
            .wait(None)
            .await
    }

    /// Launch a command on the node without waiting for it. The command
    /// may use `{{ node_class }}`, `{{ instance }}`, `{{ node_hostname }}`,
    /// `{{ remote_port }}`, `{{ local_ip }}` and `{{ local_port }}`.
    pub fn start_run_command(&self, cmd: &str, logname: Option<&str>) -> VtdsResult<RemoteOp> {
        let rendered = self.render_command(cmd)?;
        let logname = logname.map(str::to_string).unwrap_or_else(|| {
            format!(
                "run-on-node-{}",
                rendered.split_whitespace().next().unwrap_or("command")
            )
        });
        let logs = log_paths(
            &self.build_dir,
            &sanitize_logname(&format!("{}-{}", logname, self.node_hostname())),
        )?;
        let mut args: Vec<String> = vec![
            "-i".to_string(),
            self.private_key.display().to_string(),
            "-p".to_string(),
            self.connection.local_port.to_string(),
        ];
        args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        args.push(format!("root@{}", self.connection.local_ip));
        args.push(rendered.clone());
        let description = format!("ssh '{}' on '{}'", rendered, self.node_hostname());
        let child = spawn_logged("ssh", &args, &logs)?;
        Ok(RemoteOp {
            child,
            description,
            logs,
        })
    }

    pub async fn run_command(&self, cmd: &str, logname: Option<&str>) -> VtdsResult<()> {
        self.start_run_command(cmd, logname)?.wait(None).await
    }
}

/// A set of plain node tunnels.
pub struct NodeConnectionSet {
    connections: Vec<NodeConnection>,
}

impl NodeConnectionSet {
    pub fn list_connections(&self, node_class: Option<&str>) -> Vec<&NodeConnection> {
        self.connections
            .iter()
            .filter(|connection| {
                node_class.is_none() || node_class == Some(connection.node_class())
            })
            .collect()
    }

    pub fn get_connection(&self, hostname: &str) -> Option<&NodeConnection> {
        self.connections
            .iter()
            .find(|connection| connection.node_hostname() == hostname)
    }
}

/// A set of SSH-capable node tunnels with parallel fan-out operations.
pub struct NodeSSHConnectionSet {
    connections: Vec<NodeSSHConnection>,
    build_dir: PathBuf,
}

impl NodeSSHConnectionSet {
    pub fn list_connections(&self, node_class: Option<&str>) -> Vec<&NodeSSHConnection> {
        self.connections
            .iter()
            .filter(|connection| {
                node_class.is_none() || node_class == Some(connection.node_class())
            })
            .collect()
    }

    pub fn get_connection(&self, hostname: &str) -> Option<&NodeSSHConnection> {
        self.connections
            .iter()
            .find(|connection| connection.node_hostname() == hostname)
    }

    /// Copy a file to every node (of one class when given): launch all
    /// copies, then join and aggregate failures.
    pub async fn copy_to(
        &self,
        source: &Path,
        destination: &str,
        recurse: bool,
        logname: Option<&str>,
        node_class: Option<&str>,
    ) -> VtdsResult<()> {
        let logname = logname.map(str::to_string).unwrap_or_else(|| {
            format!("parallel-copy-to-node-{}-{}", source.display(), destination)
        });
        let mut launched = Vec::new();
        let mut failures = Vec::new();
        let targets = self.list_connections(node_class);
        let total = targets.len();
        for connection in targets {
            match connection.start_copy_to(source, destination, recurse, Some(&logname)) {
                Ok(op) => launched.push((connection.node_hostname().to_string(), op)),
                Err(err) => failures.push(format!("{}: {}", connection.node_hostname(), err)),
            }
        }
        for (hostname, op) in launched {
            if let Err(err) = op.wait(None).await {
                failures.push(format!("{}: {}", hostname, err));
            }
        }
        if !failures.is_empty() {
            return Err(ClusterError::FanoutFailed {
                operation: format!("copy '{}' to '{}'", source.display(), destination),
                failed: failures.len(),
                total,
                failures,
            }
            .into());
        }
        Ok(())
    }

    /// Run a command on every node (of one class when given): launch all
    /// commands, then join and aggregate failures.
    pub async fn run_command(
        &self,
        cmd: &str,
        logname: Option<&str>,
        node_class: Option<&str>,
    ) -> VtdsResult<()> {
        let logname = logname.map(str::to_string).unwrap_or_else(|| {
            format!(
                "parallel-run-on-node-{}",
                cmd.split_whitespace().next().unwrap_or("command")
            )
        });
        let mut launched = Vec::new();
        let mut failures = Vec::new();
        let targets = self.list_connections(node_class);
        let total = targets.len();
        for connection in targets {
            match connection.start_run_command(cmd, Some(&logname)) {
                Ok(op) => launched.push((connection.node_hostname().to_string(), op)),
                Err(err) => failures.push(format!("{}: {}", connection.node_hostname(), err)),
            }
        }
        for (hostname, op) in launched {
            if let Err(err) = op.wait(None).await {
                failures.push(format!("{}: {}", hostname, err));
            }
        }
        if !failures.is_empty() {
            return Err(ClusterError::FanoutFailed {
                operation: format!("run '{}'", cmd),
                failed: failures.len(),
                total,
                failures,
            }
            .into());
        }
        Ok(())
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }
}
