//! Parallel distribution of the plan and the deploy agent to every
//! blade. Each fan-out step launches all of its remote operations before
//! awaiting any of them; the join barrier then collects per-blade
//! failures into a single aggregated error naming the blades and their
//! log files.

use futures::future::{join_all, BoxFuture};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::provider::{BladeConnection, BladeConnectionSet, BladeProvider};
use crate::errors::{ClusterError, VtdsResult};

/// Where the plan lands on each blade.
pub const BLADE_CONFIG_PATH: &str = "/root/blade_cluster_config.yaml";

/// Where blade SSH keys land on each blade.
pub const BLADE_SSH_KEYS_DIR: &str = "/root/ssh_keys";

pub struct BladeFanout<'a> {
    provider: &'a dyn BladeProvider,
    timeout: Option<Duration>,
}

impl<'a> BladeFanout<'a> {
    pub fn new(provider: &'a dyn BladeProvider, timeout: Option<Duration>) -> Self {
        Self { provider, timeout }
    }

    /// Push the plan and the agent to every blade and run the agent
    /// everywhere.
    pub async fn deploy(
        &self,
        plan_path: &Path,
        agent_path: &Path,
        agent_name: &str,
    ) -> VtdsResult<()> {
        let connections = self.provider.ssh_connect_blades().await?;

        // Each blade class may have its own SSH key pair, so the key
        // directory is chosen per connection.
        info!("copying SSH keys to the blades");
        self.fan_out(&connections, "copy SSH keys to blades", |connection| {
            let key_paths = self.provider.blade_ssh_key_paths(connection.blade_class());
            Box::pin(async move {
                let (_, private_key) = key_paths?;
                let key_dir = private_key
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                connection
                    .copy_to(&key_dir, BLADE_SSH_KEYS_DIR, true, "copy-ssh-keys-to")
                    .await
            })
        })
        .await?;

        info!(
            "copying '{}' to all Virtual Blades at '{}'",
            plan_path.display(),
            BLADE_CONFIG_PATH
        );
        self.fan_out(&connections, "upload cluster config", |connection| {
            let plan_path = plan_path.to_path_buf();
            Box::pin(async move {
                connection
                    .copy_to(&plan_path, BLADE_CONFIG_PATH, false, "upload-cluster-config-to")
                    .await
            })
        })
        .await?;

        let agent_destination = format!("/root/{}", agent_name);
        info!(
            "copying '{}' to all Virtual Blades at '{}'",
            agent_path.display(),
            agent_destination
        );
        self.fan_out(&connections, "upload deploy agent", |connection| {
            let agent_path = agent_path.to_path_buf();
            let destination = agent_destination.clone();
            Box::pin(async move {
                connection
                    .copy_to(&agent_path, &destination, false, "upload-cluster-deploy-agent-to")
                    .await
            })
        })
        .await?;

        let command = self.agent_command(agent_name);
        info!("running '{}' on all Virtual Blades", command);
        self.fan_out(&connections, "run deploy agent", |connection| {
            let command = command.clone();
            let timeout = self.timeout;
            Box::pin(async move {
                connection
                    .run_command(&command, "run-cluster-deploy-agent-on", timeout)
                    .await
            })
        })
        .await
    }

    /// The agent launch command. The blade class and instance
    /// placeholders are substituted per connection at send time.
    fn agent_command(&self, agent_name: &str) -> String {
        let launcher = self
            .provider
            .blade_python_executable()
            .map(|python| format!("{} ", python))
            .unwrap_or_default();
        format!(
            "chmod 755 ./{agent}; {launcher}./{agent} \
             {{{{ blade_class }}}} {{{{ instance }}}} \
             blade_cluster_config.yaml {keys}",
            agent = agent_name,
            launcher = launcher,
            keys = BLADE_SSH_KEYS_DIR,
        )
    }

    /// Launch one remote operation per blade, then join. Failures are
    /// collected rather than short-circuiting so every blade gets its
    /// chance and the aggregated error names all of them.
    async fn fan_out<'b>(
        &self,
        connections: &'b BladeConnectionSet,
        operation: &str,
        op: impl Fn(&'b dyn BladeConnection) -> BoxFuture<'b, VtdsResult<()>>,
    ) -> VtdsResult<()> {
        let launches: Vec<_> = connections
            .list_connections()
            .iter()
            .map(|connection| {
                let hostname = connection.blade_hostname();
                let operation = op(connection.as_ref());
                async move { (hostname, operation.await) }
            })
            .collect();
        let results = join_all(launches).await;
        let total = results.len();
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(hostname, result)| {
                result.err().map(|err| format!("{}: {}", hostname, err))
            })
            .collect();
        if !failures.is_empty() {
            return Err(ClusterError::FanoutFailed {
                operation: operation.to_string(),
                failed: failures.len(),
                total,
                failures,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::{StaticProvider, StaticProviderSpec};

    #[test]
    fn test_agent_command_with_interpreter() {
        let spec: StaticProviderSpec = serde_yaml::from_str(
            r#"
blade_classes: {}
python_executable: /usr/bin/python3
"#,
        )
        .unwrap();
        let provider = StaticProvider::new(spec, Path::new("build"));
        let fanout = BladeFanout::new(&provider, None);
        let command = fanout.agent_command("deploy_to_blade");
        assert!(command.starts_with("chmod 755 ./deploy_to_blade; /usr/bin/python3 ./deploy_to_blade"));
        assert!(command.contains("{{ blade_class }} {{ instance }}"));
        assert!(command.ends_with("blade_cluster_config.yaml /root/ssh_keys"));
    }

    #[test]
    fn test_agent_command_native() {
        let provider = StaticProvider::new(StaticProviderSpec::default(), Path::new("build"));
        let fanout = BladeFanout::new(&provider, None);
        let command = fanout.agent_command("deploy_to_blade");
        assert!(command.contains("; ./deploy_to_blade {{ blade_class }}"));
    }
}
