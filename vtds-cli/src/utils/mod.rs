use anyhow::Result;
use std::path::Path;
use tracing::debug;

/// Utility functions for file and directory operations
pub mod fs {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Ensure a directory exists, creating it if necessary
    pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)?;
            debug!("Created directory: {}", path.display());
        }
        Ok(())
    }

    /// Ensure a directory exists with the given mode bits
    pub fn ensure_dir_mode<P: AsRef<Path>>(path: P, mode: u32) -> Result<()> {
        let path = path.as_ref();
        ensure_dir(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Safe file writing with write-then-rename semantics
    pub fn write_file_atomic<P: AsRef<Path>>(path: P, content: &str) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, path)?;

        debug!("Wrote file atomically: {}", path.display());
        Ok(())
    }

    /// Write a file and restrict its mode bits, for secrets such as
    /// generated root passwords
    pub fn write_file_mode<P: AsRef<Path>>(path: P, content: &str, mode: u32) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, content)?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Per-operation stdout/stderr log file paths under the build
    /// directory. Fan-out operations log here so concurrent remote
    /// commands never interleave output.
    #[derive(Debug, Clone)]
    pub struct LogPaths {
        pub out: PathBuf,
        pub err: PathBuf,
    }

    pub fn log_paths(build_dir: &Path, name: &str) -> Result<LogPaths> {
        let log_dir = build_dir.join("logs");
        ensure_dir(&log_dir)?;
        Ok(LogPaths {
            out: log_dir.join(format!("{}-out.txt", name)),
            err: log_dir.join(format!("{}-err.txt", name)),
        })
    }
}

/// Utility functions for process and command execution
pub mod process {
    use super::*;
    use crate::errors::{BladeError, ClusterError, VtdsError, VtdsResult};
    use crate::utils::fs::LogPaths;
    use anyhow::Context;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};
    use tokio::process::Command as AsyncCommand;

    /// Quantum used when polling a subprocess so timeout accounting is
    /// possible; also the grace period between SIGTERM and SIGKILL.
    pub const WAIT_QUANTUM: Duration = Duration::from_secs(5);

    const POLL_INTERVAL: Duration = Duration::from_millis(500);

    fn command_line(cmd: &str, args: &[&str]) -> String {
        let mut line = cmd.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Run a command with output inherited on stdout/stderr, failing on a
    /// non-zero exit status.
    pub fn run(cmd: &str, args: &[&str]) -> VtdsResult<()> {
        match run_with_timeout(cmd, args, None) {
            Ok(0) => Ok(()),
            Ok(_) => Err(BladeError::CommandFailed {
                command: command_line(cmd, args),
                detail: String::new(),
            }
            .into()),
            Err(err) => Err(err),
        }
    }

    /// Run a command, returning its exit code rather than failing on a
    /// non-zero status. Used for teardown operations that are allowed to
    /// fail when there is nothing to tear down.
    pub fn run_unchecked(cmd: &str, args: &[&str]) -> VtdsResult<i32> {
        run_with_timeout(cmd, args, None)
    }

    /// Run a command with an optional timeout. The child is polled; when
    /// the timeout is breached it is sent SIGTERM, and if it has still not
    /// exited after a further grace period it is killed.
    pub fn run_with_timeout(
        cmd: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> VtdsResult<i32> {
        tracing::debug!("running: {}", command_line(cmd, args));
        let mut child = Command::new(cmd)
            .args(args)
            .spawn()
            .with_context(|| format!("executing '{}' failed", command_line(cmd, args)))?;
        let started = Instant::now();
        let mut term_sent_at: Option<Instant> = None;
        loop {
            if let Some(status) = child.try_wait().map_err(VtdsError::Io)? {
                return Ok(status.code().unwrap_or(-1));
            }
            if let Some(limit) = timeout {
                if started.elapsed() > limit {
                    match term_sent_at {
                        None => {
                            // SAFETY: plain signal delivery to our own child
                            unsafe {
                                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
                            }
                            term_sent_at = Some(Instant::now());
                        }
                        Some(at) if at.elapsed() > WAIT_QUANTUM => {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(BladeError::CommandTimeout {
                                command: command_line(cmd, args),
                                seconds: started.elapsed().as_secs(),
                            }
                            .into());
                        }
                        Some(_) => {}
                    }
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Run a command capturing stdout, failing on a non-zero exit status.
    pub fn capture(cmd: &str, args: &[&str]) -> VtdsResult<String> {
        let output = Command::new(cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("executing '{}' failed", command_line(cmd, args)))?;
        if !output.status.success() {
            return Err(BladeError::CommandFailed {
                command: command_line(cmd, args),
                detail: format!(": {}", String::from_utf8_lossy(&output.stderr).trim()),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command capturing stdout regardless of its exit status.
    pub fn capture_unchecked(cmd: &str, args: &[&str]) -> VtdsResult<String> {
        let output = Command::new(cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("executing '{}' failed", command_line(cmd, args)))?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Spawn an async child process with stdout/stderr redirected to the
    /// given log files.
    pub fn spawn_logged(
        program: &str,
        args: &[String],
        logs: &LogPaths,
    ) -> VtdsResult<tokio::process::Child> {
        let out = std::fs::File::create(&logs.out).map_err(VtdsError::Io)?;
        let err = std::fs::File::create(&logs.err).map_err(VtdsError::Io)?;
        let child = AsyncCommand::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", program))?;
        Ok(child)
    }

    /// Await an async child in 5-second quanta, escalating SIGTERM then
    /// SIGKILL when the optional timeout is breached, and failing on a
    /// non-zero exit status with the log paths in the error.
    pub async fn wait_logged(
        child: &mut tokio::process::Child,
        command: &str,
        logs: &LogPaths,
        timeout: Option<Duration>,
    ) -> VtdsResult<()> {
        let mut waited = Duration::ZERO;
        let mut signaled = false;
        let status = loop {
            match tokio::time::timeout(WAIT_QUANTUM, child.wait()).await {
                Ok(result) => {
                    break result
                        .with_context(|| format!("waiting for '{}' failed", command))?;
                }
                Err(_) => {
                    waited += WAIT_QUANTUM;
                    if let Some(limit) = timeout {
                        if waited >= limit {
                            if !signaled {
                                if let Some(pid) = child.id() {
                                    // SAFETY: plain signal delivery to our own child
                                    unsafe {
                                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                                    }
                                }
                                signaled = true;
                                continue;
                            }
                            let _ = child.kill().await;
                            return Err(ClusterError::CommandTimeout {
                                command: command.to_string(),
                                seconds: waited.as_secs(),
                                out_log: logs.out.clone(),
                                err_log: logs.err.clone(),
                            }
                            .into());
                        }
                    }
                }
            }
        };
        if !status.success() {
            return Err(ClusterError::CommandFailed {
                command: command.to_string(),
                status: status.code().unwrap_or(-1),
                out_log: logs.out.clone(),
                err_log: logs.err.clone(),
            }
            .into());
        }
        Ok(())
    }
}

/// Network helpers for local tunnel endpoints
pub mod net {
    use std::io;
    use std::net::TcpListener;

    /// Acquire a fresh free local port by binding a loopback listener and
    /// immediately dropping it.
    pub fn free_local_port() -> io::Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }
}
