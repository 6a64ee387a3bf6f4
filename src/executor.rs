//! Runs shell-style commands for a microservice inside its working directory.
//!
//! Every command gets its own process group so termination reaches the whole
//! tree a start script may fork (npm, node, watchers...).

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Executes commands in a fixed directory with a fixed environment
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    workdir: PathBuf,
    env: HashMap<String, String>,
    label: String,
}

impl ProcessExecutor {
    /// `label` identifies the owning microservice in logs
    pub fn new(workdir: &Path, env: HashMap<String, String>, label: &str) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            env,
            label: label.to_string(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn command(&self, command_line: &str) -> Result<Command> {
        let words = shell_words::split(command_line)
            .map_err(|e| Error::config(format!("Invalid command '{}': {}", command_line, e)))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| Error::config("Command must not be empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(&self.workdir);
        cmd.envs(&self.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        Ok(cmd)
    }

    fn spawn_child(&self, command_line: &str) -> Result<Child> {
        let mut child = self.command(command_line)?.spawn().map_err(|e| {
            Error::activation(&self.label, format!("failed to spawn '{}': {}", command_line, e))
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, self.label.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, self.label.clone(), "stderr");
        }

        Ok(child)
    }

    /// Run a command to completion. A non-zero exit status is an error.
    pub async fn run(&self, command_line: &str) -> Result<()> {
        info!(service = %self.label, command = %command_line, "Running command");
        let mut child = self.spawn_child(command_line)?;
        let status = child.wait().await?;

        if !status.success() {
            return Err(Error::activation(
                &self.label,
                format!("'{}' exited with {}", command_line, status),
            ));
        }

        debug!(service = %self.label, command = %command_line, "Command finished");
        Ok(())
    }

    /// Start a long-running command and hand back its handle
    pub fn spawn(&self, command_line: &str) -> Result<RunningProcess> {
        info!(service = %self.label, command = %command_line, "Starting process");
        let child = self.spawn_child(command_line)?;
        let pid = child.id();
        info!(service = %self.label, pid = pid.unwrap_or(0), "Process spawned");

        Ok(RunningProcess {
            child,
            pid,
            label: self.label.clone(),
        })
    }
}

/// A spawned process group
#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    pid: Option<u32>,
    label: String,
}

impl RunningProcess {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already exited
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Stop the process group: SIGTERM, then SIGKILL once `grace_period` runs
    /// out. Returns after the process has been reaped.
    pub async fn terminate(mut self, grace_period: Duration) -> Result<()> {
        if let Some(status) = self.try_exited() {
            debug!(service = %self.label, ?status, "Process already exited");
            self.kill_group();
            return Ok(());
        }

        info!(service = %self.label, pid = self.pid.unwrap_or(0), "Sending SIGTERM to process group");
        self.signal_group();

        match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(service = %self.label, ?status, "Process exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(service = %self.label, error = %e, "Error waiting for process to exit");
            }
            Err(_) => {
                warn!(
                    service = %self.label,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                self.kill_group();
                self.child.kill().await?;
            }
        }

        // Reap anything the leader left behind in its group
        self.kill_group();
        Ok(())
    }

    #[cfg(unix)]
    fn signal_group(&mut self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self) {
        let _ = self.child.start_kill();
    }

    #[cfg(unix)]
    fn kill_group(&mut self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) {
        let _ = self.child.start_kill();
    }
}

fn forward_output<R>(stream: R, label: String, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(service = %label, stream = name, "{}", line);
        }
    });
}
