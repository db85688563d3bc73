//! Component B: remote-exec & file transport.
//!
//! Every hypervisor/VM operation that isn't a libvirt call goes through an
//! [`Executor`]: run a shell command on a host, or move a file to/from it.
//! The real implementation shells out to the invoking user's own `ssh`/`scp`
//! binaries so their `~/.ssh/config` (including agent forwarding, needed
//! for hv-to-hv commands per spec §4.B) is honoured without this crate
//! having to reimplement SSH config parsing.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::{IgvmError, Result};

/// Options controlling a single [`Executor::run`] call (spec §4.B).
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    /// Suppress echoing the command/output to the log at info level.
    pub silent: bool,
    /// Don't fail on non-zero exit; caller inspects the returned status.
    pub warn_only: bool,
    /// Prefix the command with `sudo -n`.
    pub sudo: bool,
    /// Run through an explicit shell instead of the SSH server's default.
    pub shell: Option<String>,
}

impl RunOpts {
    pub fn silent() -> Self {
        Self { silent: true, ..Default::default() }
    }

    pub fn warn_only() -> Self {
        Self { warn_only: true, ..Default::default() }
    }

    pub fn sudo() -> Self {
        Self { sudo: true, ..Default::default() }
    }
}

/// Outcome of a `warn_only` run: the caller gets both the output and
/// whether the remote command succeeded, instead of an error.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Abstract remote-exec/transport collaborator. One real implementation
/// shells a local `ssh`/`scp` process; [`MockExecutor`] records
/// invocations in memory for pipeline unit tests.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `command` on `host`, shell-escaped, returning trimmed stdout.
    /// Fails with [`IgvmError::RemoteCommand`] on non-zero exit unless
    /// `opts.warn_only` is set, in which case the exit status is folded
    /// into the returned [`RunOutput`] instead.
    async fn run(&self, host: &str, command: &str, opts: RunOpts) -> Result<RunOutput>;

    /// Upload a local file to `remotepath` on `host`, setting `mode` if
    /// given (octal string, e.g. `"0640"`).
    async fn put(&self, host: &str, local: &Path, remotepath: &str, mode: Option<&str>) -> Result<()>;

    /// Upload in-memory bytes to `remotepath` on `host` without a local
    /// scratch file (used for rendered config like `.res`/`/etc/hosts`).
    async fn put_bytes(&self, host: &str, data: &[u8], remotepath: &str, mode: Option<&str>) -> Result<()>;

    /// Download `remotepath` from `host`.
    async fn get(&self, host: &str, remotepath: &str) -> Result<Vec<u8>>;
}

/// Single-quote shell-escape, equivalent to Python's `pipes.quote`/`shlex.quote`.
pub fn shell_escape(arg: &str) -> String {
    if !arg.is_empty() && arg.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':' | b'=' | b'@')
    }) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// SSH-backed [`Executor`]. Honours the invoking user's `~/.ssh/config` by
/// simply shelling to the system `ssh`/`scp` binaries rather than
/// reimplementing config parsing (spec §4.B).
pub struct SshExecutor {
    ssh_user: Option<String>,
}

impl SshExecutor {
    pub fn new(ssh_user: Option<String>) -> Self {
        Self { ssh_user }
    }

    fn target(&self, host: &str) -> String {
        match &self.ssh_user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    fn base_ssh_command(&self, host: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-A") // agent forwarding, required for hv->hv commands
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(self.target(host));
        cmd
    }
}

#[async_trait]
impl Executor for SshExecutor {
    #[instrument(skip(self, command), fields(host = %host))]
    async fn run(&self, host: &str, command: &str, opts: RunOpts) -> Result<RunOutput> {
        let mut full_command = command.to_string();
        if opts.sudo {
            full_command = format!("sudo -n {full_command}");
        }
        if let Some(shell) = &opts.shell {
            full_command = format!("{shell} -c {}", shell_escape(&full_command));
        }

        if !opts.silent {
            debug!(command = %full_command, "running remote command");
        }

        let output = self
            .base_ssh_command(host)
            .arg(full_command)
            .output()
            .await
            .map_err(|e| IgvmError::RemoteCommand(format!("failed to spawn ssh to {host}: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let success = output.status.success();

        if !success && !opts.warn_only {
            return Err(IgvmError::RemoteCommand(format!(
                "command on {host} exited with {}: {stderr}",
                output.status
            )));
        }
        if !success {
            warn!(host, stderr = %stderr, "remote command failed (warn_only)");
        }

        Ok(RunOutput { stdout, stderr, success })
    }

    async fn put(&self, host: &str, local: &Path, remotepath: &str, mode: Option<&str>) -> Result<()> {
        let status = Command::new("scp")
            .arg("-p")
            .arg(local)
            .arg(format!("{}:{}", self.target(host), remotepath))
            .status()
            .await
            .map_err(|e| IgvmError::RemoteCommand(format!("scp to {host} failed to spawn: {e}")))?;
        if !status.success() {
            return Err(IgvmError::RemoteCommand(format!("scp to {host}:{remotepath} failed")));
        }
        if let Some(mode) = mode {
            self.run(host, &format!("chmod {mode} {}", shell_escape(remotepath)), RunOpts::default())
                .await?;
        }
        Ok(())
    }

    async fn put_bytes(&self, host: &str, data: &[u8], remotepath: &str, mode: Option<&str>) -> Result<()> {
        let mut child = self
            .base_ssh_command(host)
            .arg(format!("cat > {}", shell_escape(remotepath)))
            .stdin(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| IgvmError::RemoteCommand(format!("failed to spawn ssh to {host}: {e}")))?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(data)
            .await
            .map_err(|e| IgvmError::RemoteCommand(format!("writing to {host}:{remotepath} failed: {e}")))?;
        let status = child
            .wait()
            .await
            .map_err(|e| IgvmError::RemoteCommand(format!("ssh to {host} failed: {e}")))?;
        if !status.success() {
            return Err(IgvmError::RemoteCommand(format!("writing {remotepath} on {host} failed")));
        }
        if let Some(mode) = mode {
            self.run(host, &format!("chmod {mode} {}", shell_escape(remotepath)), RunOpts::default())
                .await?;
        }
        Ok(())
    }

    async fn get(&self, host: &str, remotepath: &str) -> Result<Vec<u8>> {
        let output = self
            .base_ssh_command(host)
            .arg(format!("cat {}", shell_escape(remotepath)))
            .output()
            .await
            .map_err(|e| IgvmError::RemoteCommand(format!("failed to spawn ssh to {host}: {e}")))?;
        if !output.status.success() {
            return Err(IgvmError::RemoteCommand(format!(
                "reading {remotepath} from {host} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output.stdout)
    }
}

/// In-memory [`Executor`] for pipeline unit tests. Records every `run` and
/// file transfer call, and answers `run` from a table of canned responses
/// keyed by the exact command string (falling back to an empty success).
///
/// Each command keeps a queue of stubbed responses rather than a single
/// one: [`MockExecutor::stub`] pushes onto it, and `run` pops off the front
/// as long as more than one is queued, otherwise repeats the last one. A
/// single `stub` call per command behaves exactly as before; a test that
/// pushes two (e.g. an `lvs` listing before and after an `lvcreate`) gets
/// to simulate remote state changing out from under a multi-step pipeline.
#[derive(Default)]
pub struct MockExecutor {
    pub responses: std::sync::Mutex<std::collections::HashMap<String, std::collections::VecDeque<RunOutput>>>,
    pub calls: std::sync::Mutex<Vec<String>>,
    pub files: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stub(&self, command: impl Into<String>, stdout: impl Into<String>) {
        self.responses.lock().unwrap().entry(command.into()).or_default().push_back(RunOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        });
    }

    /// Queue a non-zero-exit response, for `warn_only` checks that branch
    /// on failure (e.g. a `pgrep` expected to find nothing running).
    pub fn stub_failure(&self, command: impl Into<String>, stderr: impl Into<String>) {
        self.responses.lock().unwrap().entry(command.into()).or_default().push_back(RunOutput {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        });
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn run(&self, host: &str, command: &str, opts: RunOpts) -> Result<RunOutput> {
        self.calls.lock().unwrap().push(format!("{host}: {command}"));
        let out = {
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(command) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap_or(RunOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    success: true,
                }),
                None => RunOutput { stdout: String::new(), stderr: String::new(), success: true },
            }
        };
        if !out.success && !opts.warn_only {
            return Err(IgvmError::RemoteCommand(format!("mock command failed: {command}")));
        }
        Ok(out)
    }

    async fn put(&self, host: &str, local: &Path, remotepath: &str, _mode: Option<&str>) -> Result<()> {
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| IgvmError::RemoteCommand(e.to_string()))?;
        self.files.lock().unwrap().insert(format!("{host}:{remotepath}"), data);
        Ok(())
    }

    async fn put_bytes(&self, host: &str, data: &[u8], remotepath: &str, _mode: Option<&str>) -> Result<()> {
        self.files.lock().unwrap().insert(format!("{host}:{remotepath}"), data.to_vec());
        Ok(())
    }

    async fn get(&self, host: &str, remotepath: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&format!("{host}:{remotepath}"))
            .cloned()
            .ok_or_else(|| IgvmError::RemoteCommand(format!("no such mock file {remotepath} on {host}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escape_leaves_safe_tokens_alone() {
        assert_eq!(shell_escape("/dev/vg0/vm1"), "/dev/vg0/vm1");
        assert_eq!(shell_escape("hostname.example.com"), "hostname.example.com");
    }

    #[test]
    fn shell_escape_quotes_dangerous_tokens() {
        assert_eq!(shell_escape("a b"), "'a b'");
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[tokio::test]
    async fn mock_executor_returns_stubbed_output() {
        let exec = MockExecutor::new();
        exec.stub("echo hi", "hi");
        let out = exec.run("hv1", "echo hi", RunOpts::default()).await.unwrap();
        assert_eq!(out.stdout, "hi");
        assert_eq!(exec.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mock_executor_roundtrips_put_bytes_and_get() {
        let exec = MockExecutor::new();
        exec.put_bytes("hv1", b"hello", "/etc/hostname", None).await.unwrap();
        let data = exec.get("hv1", "/etc/hostname").await.unwrap();
        assert_eq!(data, b"hello");
    }
}
