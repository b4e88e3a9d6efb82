//! Password-based transport.
//!
//! OpenSSH refuses to read passwords from anything but a terminal, so every command is its own
//! `sshpass -e ssh ...` process with the password passed through the `SSHPASS` variable.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::{
    classify_ssh_stderr, pump_lines, shell_quote, Connector, OutputStream, Transport,
    KEEPALIVE_INTERVAL,
};
use crate::auth::{Credentials, HostKeyPolicy};
use crate::error::{Fault, FaultKind};

/// sshpass exit status for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;
/// sshpass exit status for an unknown host key.
const SSHPASS_UNKNOWN_HOST_KEY: i32 = 6;
/// ssh exit status for connection-level failures.
const SSH_CONNECTION_FAILURE: i32 = 255;
/// Program run for every command unless overridden.
pub const DEFAULT_PROGRAM: &str = "sshpass";

pub struct SshpassConnector {
    credentials: Credentials,
    host_key: HostKeyPolicy,
    connect_timeout: Option<Duration>,
    program: PathBuf,
}

impl SshpassConnector {
    pub fn new(
        credentials: Credentials,
        host_key: HostKeyPolicy,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            credentials,
            host_key,
            connect_timeout,
            program: PathBuf::from(DEFAULT_PROGRAM),
        }
    }

    /// Runs `program` instead of the `sshpass` found on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl Connector for SshpassConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn Transport>, Fault> {
        let password = self.credentials.password().ok_or_else(|| {
            Fault::new(
                FaultKind::Authentication,
                "sshpass transport requires a password",
            )
        })?;
        let mut options = vec![
            "-o".to_owned(),
            self.host_key.ssh_option().to_owned(),
            "-o".to_owned(),
            format!("ServerAliveInterval={}", KEEPALIVE_INTERVAL.as_secs()),
            "-o".to_owned(),
            "NumberOfPasswordPrompts=1".to_owned(),
            "-l".to_owned(),
            self.credentials.username.clone(),
        ];
        if let Some(timeout) = self.connect_timeout {
            options.push("-o".to_owned());
            options.push(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }
        let transport = SshpassTransport {
            host: host.to_owned(),
            program: self.program.clone(),
            password: password.to_owned(),
            options,
            closed: AtomicBool::new(false),
        };

        // Nothing persists between commands, so authenticate once up front.
        let output = transport
            .command("true")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Fault::connection(format!("Failed to run sshpass: {}", e)))?;
        if !output.status.success() {
            return Err(fault_from_status(
                output.status,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        tracing::debug!(host, "Connected to host.");
        Ok(Box::new(transport))
    }
}

pub struct SshpassTransport {
    host: String,
    program: PathBuf,
    password: String,
    options: Vec<String>,
    closed: AtomicBool,
}

impl SshpassTransport {
    fn command(&self, remote_command: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-e")
            .arg("ssh")
            .args(&self.options)
            .arg(&self.host)
            .arg("--")
            .arg(remote_command)
            .env("SSHPASS", &self.password)
            .kill_on_drop(true);
        command
    }

    fn ensure_open(&self) -> Result<(), Fault> {
        if self.closed.load(Ordering::Acquire) {
            Err(Fault::connection(format!(
                "Connection to {} is closed",
                self.host
            )))
        } else {
            Ok(())
        }
    }

    async fn run_quiet(&self, remote_command: &str) -> Result<(), Fault> {
        self.ensure_open()?;
        let output = self
            .command(remote_command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Fault::connection(e.to_string()))?;
        check_transfer(output.status, &String::from_utf8_lossy(&output.stderr))
    }
}

#[async_trait]
impl Transport for SshpassTransport {
    fn host(&self) -> &str {
        &self.host
    }

    async fn spawn(&self, command: &str) -> Result<OutputStream, Fault> {
        self.ensure_open()?;
        let mut child = self
            .command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Fault::connection(format!("Failed to run sshpass: {}", e)))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, stream) = OutputStream::channel();
        let producer = tokio::spawn(async move {
            let sender = &tx;
            let pumps = join(
                async move {
                    match stdout {
                        Some(out) => pump_lines(out, sender).await,
                        None => Ok(()),
                    }
                },
                async move {
                    match stderr {
                        Some(err) => pump_lines(err, sender).await,
                        None => Ok(()),
                    }
                },
            );
            if let (Err(e), _) | (_, Err(e)) = pumps.await {
                tx.fault(Fault::connection(e.to_string()));
                return;
            }
            match child.wait().await {
                Ok(status) => match command_fault(status) {
                    Some(fault) => tx.fault(fault),
                    None => tx.exit(status.code()),
                },
                Err(e) => tx.fault(Fault::connection(e.to_string())),
            }
        });
        Ok(stream.attach(producer))
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), Fault> {
        self.ensure_open()?;
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| Fault::io(format!("{}: {}", local.display(), e)))?;
        let mut child = self
            .command(&format!("cat > {}", shell_quote(remote)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Fault::connection(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            tokio::io::copy(&mut file, &mut stdin)
                .await
                .map_err(|e| Fault::io(e.to_string()))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| Fault::io(e.to_string()))?;
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| Fault::connection(e.to_string()))?;
        check_transfer(status, &stderr)
    }

    async fn make_dir(&self, remote: &str) -> Result<(), Fault> {
        self.run_quiet(&format!("mkdir -p {}", shell_quote(remote)))
            .await
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), Fault> {
        self.ensure_open()?;
        let output = self
            .command(&format!("cat {}", shell_quote(remote)))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Fault::connection(e.to_string()))?;
        check_transfer(output.status, &String::from_utf8_lossy(&output.stderr))?;
        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| Fault::io(format!("{}: {}", local.display(), e)))?;
        file.write_all(&output.stdout)
            .await
            .map_err(|e| Fault::io(e.to_string()))?;
        file.flush().await.map_err(|e| Fault::io(e.to_string()))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(host = %self.host, "Terminating connection.");
        }
    }
}

fn fault_from_status(status: ExitStatus, stderr: &str) -> Fault {
    let message = format!("{} ({})", stderr.trim(), status);
    let kind = match status.code() {
        Some(SSHPASS_BAD_PASSWORD) => FaultKind::Authentication,
        Some(SSHPASS_UNKNOWN_HOST_KEY) => FaultKind::UnknownHostKey,
        _ => classify_ssh_stderr(stderr),
    };
    Fault::new(kind, message)
}

/// The fault behind a finished command's status, if sshpass or ssh rather than the remote
/// command produced it.
///
/// 5, 6 and 255 are reserved by sshpass and ssh. A remote command exiting with one of them
/// itself is indistinguishable and reads as a transport failure. The remote stderr already went
/// through the stream, so only the kind is decided here.
fn command_fault(status: ExitStatus) -> Option<Fault> {
    let (kind, reason) = match status.code()? {
        SSHPASS_BAD_PASSWORD => (FaultKind::Authentication, "password rejected"),
        SSHPASS_UNKNOWN_HOST_KEY => (FaultKind::UnknownHostKey, "host key not trusted"),
        SSH_CONNECTION_FAILURE => (FaultKind::Connection, "ssh connection failed"),
        _ => return None,
    };
    Some(Fault::new(kind, format!("{} ({})", reason, status)))
}

fn check_transfer(status: ExitStatus, stderr: &str) -> Result<(), Fault> {
    match status.code() {
        Some(0) => Ok(()),
        Some(SSHPASS_BAD_PASSWORD | SSHPASS_UNKNOWN_HOST_KEY | SSH_CONNECTION_FAILURE) => {
            Err(fault_from_status(status, stderr))
        }
        _ => Err(Fault::io(format!("{} ({})", stderr.trim(), status))),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn bad_password_is_authentication() {
        let status = ExitStatus::from_raw(SSHPASS_BAD_PASSWORD << 8);
        let fault = fault_from_status(status, "");
        assert_eq!(fault.kind, FaultKind::Authentication);
    }

    #[test]
    fn unreachable_is_connection() {
        let status = ExitStatus::from_raw(SSH_CONNECTION_FAILURE << 8);
        let fault = fault_from_status(status, "ssh: connect to host h1 port 22: No route to host");
        assert_eq!(fault.kind, FaultKind::Connection);
    }

    #[test]
    fn reserved_exit_codes_are_transport_faults() {
        let kind = |code: i32| command_fault(ExitStatus::from_raw(code << 8)).map(|f| f.kind);
        assert_eq!(kind(SSHPASS_BAD_PASSWORD), Some(FaultKind::Authentication));
        assert_eq!(kind(SSHPASS_UNKNOWN_HOST_KEY), Some(FaultKind::UnknownHostKey));
        assert_eq!(kind(SSH_CONNECTION_FAILURE), Some(FaultKind::Connection));
        assert_eq!(kind(0), None);
        assert_eq!(kind(1), None);
    }

    #[test]
    fn killed_command_is_not_a_fault() {
        // Terminated by SIGKILL, no exit code.
        assert!(command_fault(ExitStatus::from_raw(9)).is_none());
    }

    #[test]
    fn failed_copy_is_io() {
        let status = ExitStatus::from_raw(1 << 8);
        let fault = check_transfer(status, "cat: /nope: No such file or directory").unwrap_err();
        assert_eq!(fault.kind, FaultKind::Io);
    }
}
