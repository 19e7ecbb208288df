use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{ConfigError, VtdsResult};

// Re-export the cluster topology schema
pub mod cluster_config;
pub use cluster_config::{ClusterConfig, ClusterPlan};

/// Application settings for the vtds CLI. The cluster topology itself is
/// a separate document (see [`cluster_config`]); this covers the knobs of
/// the controller process.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Controller-side settings
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the configuration file (not serialized)
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClusterSettings {
    /// Scratch area for the serialized plan and per-operation logs
    pub build_dir: PathBuf,

    /// Libvirt domain XML template embedded into the plan
    pub vm_xml_template: PathBuf,

    /// Blade agent artifact uploaded to every blade
    pub agent_path: PathBuf,

    /// Name the agent artifact takes on the blades
    pub agent_name: String,

    /// Provider definition consumed by the built-in static provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<PathBuf>,

    /// Per-operation timeout for fan-out commands, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_timeout: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is not set
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterSettings::default(),
            logging: LoggingConfig::default(),
            config_file_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        // The agent binary is built alongside the controller, so the
        // default artifact is its sibling on disk.
        let agent_path = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("deploy_to_blade")))
            .unwrap_or_else(|| PathBuf::from("deploy_to_blade"));
        Self {
            build_dir: PathBuf::from("vtds_build"),
            vm_xml_template: PathBuf::from("templates/vtds-vm.xml"),
            agent_path,
            agent_name: "deploy_to_blade".to_string(),
            provider_config: None,
            deploy_timeout: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to
    /// built-in defaults when no file exists.
    pub fn load() -> VtdsResult<Self> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }
        debug!("no configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from an explicit file path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> VtdsResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        let mut config: Self =
            serde_yaml::from_str(&content).map_err(|err| ConfigError::InvalidFormat {
                reason: format!("{}: {}", path.display(), err),
            })?;
        config.config_file_path = Some(path.to_path_buf());
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vtds").join("config.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.cluster.agent_name, "deploy_to_blade");
        assert_eq!(config.cluster.build_dir, PathBuf::from("vtds_build"));
    }

    #[test]
    fn test_config_yaml_round_trip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.cluster.agent_name, config.cluster.agent_name);
    }
}
