use std::path::PathBuf;
use thiserror::Error;

/// Main error types for the vTDS cluster layer
#[derive(Error, Debug)]
pub enum VtdsError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cluster operation errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Blade-side reconciliation errors
    #[error("Blade error: {0}")]
    Blade(#[from] BladeError),

    /// I/O operation errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Template rendering errors
    #[error("Template error: {0}")]
    Template(String),

    /// Invariant violations that indicate a bug rather than bad input
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic operation errors
    #[error("Operation error: {0}")]
    Operation(String),

    /// Anyhow context errors
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Missing required configuration '{key}' in {scope}")]
    MissingRequired { scope: String, key: String },

    #[error("Invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("{scope} has more than one {family} block configured")]
    DuplicateAddrFamily { scope: String, family: String },

    #[error("{scope} has no {family} block configured")]
    MissingAddrFamily { scope: String, family: String },

    #[error(
        "disk '{disk}' in node class '{class}' declares both a 'source_image' \
         URL and a non-empty partition list, must choose one or the other"
    )]
    ConflictingDiskSpec { class: String, disk: String },

    #[error(
        "disk '{disk}' in node class '{class}' must declare at least one of \
         'disk_size_mb', 'source_image' or 'partitions'"
    )]
    EmptyDiskSpec { class: String, disk: String },

    #[error("node class '{class}' inherits from unknown parent '{parent}'")]
    UnknownParent { class: String, parent: String },

    #[error("node class inheritance cycle detected: {chain}")]
    InheritanceCycle { chain: String },

    #[error("the Virtual Network named '{name}' does not exist")]
    UnknownNetwork { name: String },

    #[error("node class '{class}' defines more than one interface connected to network '{network}'")]
    DuplicateInterface { class: String, network: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

/// Cluster (controller-side) operation errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("cannot {operation} an unprepared cluster, call prepare() first")]
    NotPrepared { operation: String },

    #[error("instance number {instance} out of range for node class '{class}' which has a count of {count}")]
    InstanceOutOfRange {
        class: String,
        instance: usize,
        count: usize,
    },

    #[error(
        "timeout waiting for SSH port forwarding connection to '{hostname}' port {remote_port} \
         to be ready - details in '{}'", err_log.display()
    )]
    TunnelTimeout {
        hostname: String,
        remote_port: u16,
        err_log: PathBuf,
    },

    #[error(
        "command '{command}' timed out and was killed after {seconds} seconds - logs: '{}', '{}'",
        out_log.display(), err_log.display()
    )]
    CommandTimeout {
        command: String,
        seconds: u64,
        out_log: PathBuf,
        err_log: PathBuf,
    },

    #[error(
        "command '{command}' terminated with a non-zero exit status {status} - logs: '{}', '{}'",
        out_log.display(), err_log.display()
    )]
    CommandFailed {
        command: String,
        status: i32,
        out_log: PathBuf,
        err_log: PathBuf,
    },

    #[error("errors reported while running '{operation}' on {failed} of {total} blades:\n    {}", failures.join("\n\n    "))]
    FanoutFailed {
        operation: String,
        failed: usize,
        total: usize,
        failures: Vec<String>,
    },
}

/// Blade-side reconciliation errors raised by the deploy agent
#[derive(Error, Debug)]
pub enum BladeError {
    #[error(
        "attempting to create virtual network '{network}' but conflicting \
         non-{kind} network interface '{link}' already exists on blade"
    )]
    LinkConflict {
        network: String,
        link: String,
        kind: String,
    },

    #[error("no network device was found with an IP address matching any of the endpoint IPs: {endpoint_ips:?}")]
    NoUnderlay { endpoint_ips: Vec<String> },

    #[error("command '{command}' failed{detail}")]
    CommandFailed { command: String, detail: String },

    #[error("command '{command}' timed out and did not terminate as expected after {seconds} seconds")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("service '{service}' timed out while waiting to become active. Reported status:\n{status}")]
    ServiceInactive { service: String, status: String },
}

/// Result type alias for vTDS operations
pub type VtdsResult<T> = Result<T, VtdsError>;

impl From<serde_json::Error> for VtdsError {
    fn from(err: serde_json::Error) -> Self {
        VtdsError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for VtdsError {
    fn from(err: serde_yaml::Error) -> Self {
        VtdsError::Serialization(err.to_string())
    }
}

impl From<minijinja::Error> for VtdsError {
    fn from(err: minijinja::Error) -> Self {
        VtdsError::Template(err.to_string())
    }
}
