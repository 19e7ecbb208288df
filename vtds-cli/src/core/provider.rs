//! Provider abstraction: the narrow API onto the layer that owns the
//! blades themselves. The cluster layer never talks to blades except
//! through these traits, so any provider that can describe its blades
//! and open SSH connections to them can host a cluster.

use async_trait::async_trait;
use minijinja::{context, Environment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{ConfigError, VtdsResult};
use crate::utils::fs::log_paths;
use crate::utils::process::{spawn_logged, wait_logged};

/// The provider layer seen from the cluster layer: blade inventory,
/// underlay addressing, SSH credentials and connections.
#[async_trait]
pub trait BladeProvider: Send + Sync {
    /// All blade classes the provider knows about.
    fn blade_classes(&self) -> Vec<String>;

    /// Number of blade instances of the given class.
    fn blade_count(&self, blade_class: &str) -> usize;

    /// The IP of one blade on the named blade interconnect.
    fn blade_ip(
        &self,
        blade_class: &str,
        instance: usize,
        interconnect: &str,
    ) -> VtdsResult<String>;

    /// Name of the secret holding the SSH key pair for a blade class.
    fn blade_ssh_key_secret(&self, blade_class: &str) -> VtdsResult<String>;

    /// Paths to the public and private SSH key files for a blade class,
    /// as `(public, private)`.
    fn blade_ssh_key_paths(&self, blade_class: &str) -> VtdsResult<(PathBuf, PathBuf)>;

    /// Interpreter used to launch the uploaded agent artifact on the
    /// blades, or None when the artifact is directly executable.
    fn blade_python_executable(&self) -> Option<String>;

    /// Open SSH connections to every blade.
    async fn ssh_connect_blades(&self) -> VtdsResult<BladeConnectionSet>;

    /// Open an SSH connection to one blade.
    async fn ssh_connect_blade(
        &self,
        blade_class: &str,
        instance: usize,
    ) -> VtdsResult<Box<dyn BladeConnection>>;
}

/// One SSH connection to one blade. Remote command strings may contain
/// `{{ blade_class }}` / `{{ instance }}` placeholders which are
/// substituted per connection at send time.
#[async_trait]
pub trait BladeConnection: Send + Sync {
    fn blade_class(&self) -> &str;

    fn blade_instance(&self) -> usize;

    fn blade_hostname(&self) -> String;

    /// Local endpoint that forwards to the blade's SSH port.
    fn local_ip(&self) -> String;

    fn local_port(&self) -> u16;

    /// Copy a file or directory tree to the blade.
    async fn copy_to(
        &self,
        source: &Path,
        destination: &str,
        recurse: bool,
        logname: &str,
    ) -> VtdsResult<()>;

    /// Run a shell command on the blade, logging to per-blade files named
    /// after the operation.
    async fn run_command(
        &self,
        cmd: &str,
        logname: &str,
        timeout: Option<Duration>,
    ) -> VtdsResult<()>;
}

/// The set of per-blade connections used for fan-out operations.
pub struct BladeConnectionSet {
    connections: Vec<Box<dyn BladeConnection>>,
}

impl BladeConnectionSet {
    pub fn new(connections: Vec<Box<dyn BladeConnection>>) -> Self {
        Self { connections }
    }

    pub fn list_connections(&self) -> &[Box<dyn BladeConnection>] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Declarative provider definition backing [`StaticProvider`]: the blade
/// inventory is written down rather than discovered, which is all the
/// cluster layer needs when blades were provisioned out of band.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StaticProviderSpec {
    #[serde(default)]
    pub blade_classes: BTreeMap<String, StaticBladeClass>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_executable: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StaticBladeClass {
    #[serde(default)]
    pub count: usize,

    /// Directory holding the class SSH key pair as `key` / `key.pub`.
    #[serde(default)]
    pub ssh_key_dir: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_secret: Option<String>,

    /// SSH endpoint per blade instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blades: Vec<StaticBladeEndpoint>,

    /// Interconnect name to per-instance blade IPs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub interconnects: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticBladeEndpoint {
    pub hostname: String,

    pub ssh_ip: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

/// Provider implementation driven by a [`StaticProviderSpec`] document.
pub struct StaticProvider {
    spec: StaticProviderSpec,
    build_dir: PathBuf,
}

impl StaticProvider {
    pub fn new(spec: StaticProviderSpec, build_dir: &Path) -> Self {
        Self {
            spec,
            build_dir: build_dir.to_path_buf(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P, build_dir: &Path) -> VtdsResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        let spec: StaticProviderSpec =
            serde_yaml::from_str(&content).map_err(|err| ConfigError::InvalidFormat {
                reason: format!("{}: {}", path.display(), err),
            })?;
        Ok(Self::new(spec, build_dir))
    }

    fn class(&self, blade_class: &str) -> VtdsResult<&StaticBladeClass> {
        self.spec
            .blade_classes
            .get(blade_class)
            .ok_or_else(|| {
                ConfigError::ValidationFailed {
                    reason: format!("provider knows no blade class named '{}'", blade_class),
                }
                .into()
            })
    }

    fn connection(
        &self,
        blade_class: &str,
        instance: usize,
    ) -> VtdsResult<StaticBladeConnection> {
        let class = self.class(blade_class)?;
        let endpoint = class.blades.get(instance).ok_or_else(|| {
            ConfigError::ValidationFailed {
                reason: format!(
                    "provider has no SSH endpoint for blade {} of class '{}'",
                    instance, blade_class
                ),
            }
        })?;
        let (_, private_key) = self.blade_ssh_key_paths(blade_class)?;
        Ok(StaticBladeConnection {
            blade_class: blade_class.to_string(),
            instance,
            hostname: endpoint.hostname.clone(),
            ssh_ip: endpoint.ssh_ip.clone(),
            ssh_port: endpoint.ssh_port,
            private_key,
            build_dir: self.build_dir.clone(),
        })
    }
}

#[async_trait]
impl BladeProvider for StaticProvider {
    fn blade_classes(&self) -> Vec<String> {
        self.spec.blade_classes.keys().cloned().collect()
    }

    fn blade_count(&self, blade_class: &str) -> usize {
        self.spec
            .blade_classes
            .get(blade_class)
            .map(|class| class.count)
            .unwrap_or(0)
    }

    fn blade_ip(
        &self,
        blade_class: &str,
        instance: usize,
        interconnect: &str,
    ) -> VtdsResult<String> {
        let class = self.class(blade_class)?;
        class
            .interconnects
            .get(interconnect)
            .and_then(|ips| ips.get(instance))
            .cloned()
            .ok_or_else(|| {
                ConfigError::ValidationFailed {
                    reason: format!(
                        "provider has no IP on interconnect '{}' for blade {} of class '{}'",
                        interconnect, instance, blade_class
                    ),
                }
                .into()
            })
    }

    fn blade_ssh_key_secret(&self, blade_class: &str) -> VtdsResult<String> {
        let class = self.class(blade_class)?;
        Ok(class
            .ssh_key_secret
            .clone()
            .unwrap_or_else(|| format!("{}-ssh-key", blade_class)))
    }

    fn blade_ssh_key_paths(&self, blade_class: &str) -> VtdsResult<(PathBuf, PathBuf)> {
        let class = self.class(blade_class)?;
        Ok((
            class.ssh_key_dir.join("key.pub"),
            class.ssh_key_dir.join("key"),
        ))
    }

    fn blade_python_executable(&self) -> Option<String> {
        self.spec.python_executable.clone()
    }

    async fn ssh_connect_blades(&self) -> VtdsResult<BladeConnectionSet> {
        let mut connections: Vec<Box<dyn BladeConnection>> = Vec::new();
        for blade_class in self.blade_classes() {
            for instance in 0..self.blade_count(&blade_class) {
                connections.push(Box::new(self.connection(&blade_class, instance)?));
            }
        }
        Ok(BladeConnectionSet::new(connections))
    }

    async fn ssh_connect_blade(
        &self,
        blade_class: &str,
        instance: usize,
    ) -> VtdsResult<Box<dyn BladeConnection>> {
        Ok(Box::new(self.connection(blade_class, instance)?))
    }
}

/// Direct SSH connection to a statically described blade endpoint.
pub struct StaticBladeConnection {
    blade_class: String,
    instance: usize,
    hostname: String,
    ssh_ip: String,
    ssh_port: u16,
    private_key: PathBuf,
    build_dir: PathBuf,
}

const SSH_OPTIONS: [&str; 6] = [
    "-o",
    "BatchMode=yes",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "NoHostAuthenticationForLocalhost=yes",
];

impl StaticBladeConnection {
    fn render_command(&self, cmd: &str) -> VtdsResult<String> {
        let env = Environment::new();
        let rendered = env.render_str(
            cmd,
            context! {
                blade_class => self.blade_class,
                instance => self.instance,
                blade_hostname => self.hostname,
                local_ip => self.ssh_ip,
                local_port => self.ssh_port,
            },
        )?;
        Ok(rendered)
    }
}

#[async_trait]
impl BladeConnection for StaticBladeConnection {
    fn blade_class(&self) -> &str {
        &self.blade_class
    }

    fn blade_instance(&self) -> usize {
        self.instance
    }

    fn blade_hostname(&self) -> String {
        self.hostname.clone()
    }

    fn local_ip(&self) -> String {
        self.ssh_ip.clone()
    }

    fn local_port(&self) -> u16 {
        self.ssh_port
    }

    async fn copy_to(
        &self,
        source: &Path,
        destination: &str,
        recurse: bool,
        logname: &str,
    ) -> VtdsResult<()> {
        let logs = log_paths(&self.build_dir, &format!("{}-{}", logname, self.hostname))?;
        let mut args: Vec<String> = vec![
            "-i".to_string(),
            self.private_key.display().to_string(),
            "-P".to_string(),
            self.ssh_port.to_string(),
        ];
        if recurse {
            args.push("-r".to_string());
        }
        args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        args.push(source.display().to_string());
        args.push(format!("root@{}:{}", self.ssh_ip, destination));
        let desc = format!("scp {} to root@{}:{}", source.display(), self.hostname, destination);
        let mut child = spawn_logged("scp", &args, &logs)?;
        wait_logged(&mut child, &desc, &logs, None).await
    }

    async fn run_command(
        &self,
        cmd: &str,
        logname: &str,
        timeout: Option<Duration>,
    ) -> VtdsResult<()> {
        let rendered = self.render_command(cmd)?;
        let logs = log_paths(&self.build_dir, &format!("{}-{}", logname, self.hostname))?;
        let mut args: Vec<String> = vec![
            "-i".to_string(),
            self.private_key.display().to_string(),
            "-p".to_string(),
            self.ssh_port.to_string(),
        ];
        args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        args.push(format!("root@{}", self.ssh_ip));
        args.push(rendered.clone());
        let desc = format!("ssh root@{} '{}'", self.hostname, rendered);
        let mut child = spawn_logged("ssh", &args, &logs)?;
        wait_logged(&mut child, &desc, &logs, timeout).await
    }
}
