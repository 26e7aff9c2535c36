//! Remote sessions over the system `ssh`/`sftp` clients.
//!
//! Every operation spawns its own client process, so no connection state
//! survives between commands. Guests are throwaway, so host keys are neither
//! checked nor recorded.

use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use ssh_key::{HashAlg, PrivateKey};
use tokio::process::Command;

use crate::error::ExecutorError;

/// ssh's own exit status for connection and protocol errors.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Top-level directory created on the guest; everything else lives under it.
pub const RUNNER_DIR: &str = "runner";
const RUNNER_SUBDIRS: [&str; 3] = ["build", "cache", "scripts"];

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait RemoteShell {
    /// Whether a no-op command succeeds within `timeout`. Never retries.
    async fn test_connect(&self, timeout: Duration) -> bool;
    /// Create `runner/{build,cache,scripts}` in the remote home directory.
    async fn setup_environment(&self) -> Result<(), ExecutorError>;
    async fn copy_file(&self, local: &Path, remote: &str) -> Result<(), ExecutorError>;
    /// Run `command`; a non-zero exit is `ExecutorError::RemoteCommand`, a
    /// failed session is `ExecutorError::Remote`.
    async fn run_command(&self, command: &str) -> Result<(), ExecutorError>;
}

/// Opens sessions to a guest address.
pub trait Connector {
    type Shell: RemoteShell;
    fn connect(&self, host: Ipv4Addr) -> Self::Shell;
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub identity: PathBuf,
    pub user: String,
    pub ssh_program: String,
    pub sftp_program: String,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SshConnector {
    settings: SshSettings,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    /// Fail fast if the identity key cannot be used without a prompt.
    pub fn check_identity(&self) -> Result<(), ExecutorError> {
        let path = &self.settings.identity;
        let key = PrivateKey::read_openssh_file(path).map_err(|e| ExecutorError::Remote {
            message: format!("cannot read SSH identity {}: {e}", path.display()),
            hint: "set ssh.identity to an unencrypted OpenSSH private key".into(),
        })?;
        if key.is_encrypted() {
            return Err(ExecutorError::Remote {
                message: format!("SSH identity {} is passphrase-protected", path.display()),
                hint: "the executor runs non-interactively; use a key without a passphrase".into(),
            });
        }
        tracing::debug!(
            identity = %path.display(),
            fingerprint = %key.fingerprint(HashAlg::Sha256),
            "loaded SSH identity"
        );
        Ok(())
    }
}

impl Connector for SshConnector {
    type Shell = SshSession;

    fn connect(&self, host: Ipv4Addr) -> SshSession {
        SshSession {
            settings: self.settings.clone(),
            host,
        }
    }
}

pub struct SshSession {
    settings: SshSettings,
    host: Ipv4Addr,
}

impl SshSession {
    fn destination(&self) -> String {
        format!("{}@{}", self.settings.user, self.host)
    }

    fn common_args(&self, connect_timeout: Duration) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-i".into(), self.settings.identity.clone().into()];
        for opt in [
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "BatchMode=yes".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        ] {
            args.push("-o".into());
            args.push(opt.into());
        }
        args
    }

    fn ssh(&self, connect_timeout: Duration, command: &str) -> Command {
        let mut cmd = Command::new(&self.settings.ssh_program);
        cmd.args(self.common_args(connect_timeout))
            .arg(self.destination())
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn run_sftp_batch(&self, batch: &str) -> Result<(), ExecutorError> {
        let file = tempfile::NamedTempFile::new().map_err(|e| ExecutorError::Io {
            context: "creating sftp batch file".into(),
            source: e,
        })?;
        tokio::fs::write(file.path(), batch)
            .await
            .map_err(|e| ExecutorError::Io {
                context: format!("writing sftp batch file {}", file.path().display()),
                source: e,
            })?;

        let output = Command::new(&self.settings.sftp_program)
            .args(self.common_args(self.settings.connect_timeout))
            .arg("-b")
            .arg(file.path())
            .arg(self.destination())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_fault(&self.settings.sftp_program, e))?;

        if !output.status.success() {
            return Err(ExecutorError::Remote {
                message: format!(
                    "sftp to {} failed ({}): {}",
                    self.host,
                    describe(output.status),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                hint: "check that the guest's SSH server allows the sftp subsystem".into(),
            });
        }
        Ok(())
    }
}

fn spawn_fault(program: &str, e: std::io::Error) -> ExecutorError {
    ExecutorError::Remote {
        message: format!("failed to run {program}: {e}"),
        hint: "install the OpenSSH client or set ssh.ssh_program/ssh.sftp_program".into(),
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".into(),
    }
}

/// Quote `s` as one word for the remote POSIX shell.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Quote an sftp batch argument.
fn sftp_quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Batch creating the runner layout. `-` lets a rerun pass over existing dirs.
pub fn setup_batch() -> String {
    let mut batch = format!("-mkdir {RUNNER_DIR}\ncd {RUNNER_DIR}\n");
    for dir in RUNNER_SUBDIRS {
        batch.push_str(&format!("-mkdir {dir}\n"));
    }
    batch
}

pub fn upload_batch(local: &Path, remote: &str) -> String {
    format!(
        "put -p {} {}\n",
        sftp_quote(&local.to_string_lossy()),
        sftp_quote(remote)
    )
}

impl RemoteShell for SshSession {
    async fn test_connect(&self, timeout: Duration) -> bool {
        let result = self
            .ssh(timeout, "exit")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        match result {
            Ok(out) if out.status.success() => true,
            Ok(out) => {
                tracing::debug!(
                    host = %self.host,
                    status = %describe(out.status),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "SSH not ready"
                );
                false
            }
            Err(e) => {
                tracing::warn!(program = %self.settings.ssh_program, error = %e, "could not spawn ssh");
                false
            }
        }
    }

    async fn setup_environment(&self) -> Result<(), ExecutorError> {
        self.run_sftp_batch(&setup_batch()).await?;
        tracing::info!(host = %self.host, "created runner directories");
        Ok(())
    }

    async fn copy_file(&self, local: &Path, remote: &str) -> Result<(), ExecutorError> {
        self.run_sftp_batch(&upload_batch(local, remote)).await?;
        tracing::debug!(host = %self.host, local = %local.display(), remote, "uploaded file");
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<(), ExecutorError> {
        // Job output goes straight to the runner.
        let status = self
            .ssh(self.settings.connect_timeout, command)
            .status()
            .await
            .map_err(|e| spawn_fault(&self.settings.ssh_program, e))?;

        match status.code() {
            Some(0) => Ok(()),
            Some(SSH_TRANSPORT_FAILURE) => Err(ExecutorError::Remote {
                message: format!(
                    "ssh to {} failed before `{command}` completed (exit status 255)",
                    self.host
                ),
                hint: "the connection dropped or was refused; ssh's message is in the job output above"
                    .into(),
            }),
            Some(exit_code) => Err(ExecutorError::RemoteCommand {
                command: command.into(),
                exit_code,
            }),
            None => Err(ExecutorError::Remote {
                message: format!("`{command}` on {}: {}", self.host, describe(status)),
                hint: "the ssh client was killed".into(),
            }),
        }
    }
}
