//! Key-based transport over a multiplexed OpenSSH master connection.

use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join;
use openssh::{KnownHosts, Session as SshSession, SessionBuilder, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};

use super::{
    classify_ssh_stderr, pump_lines, shell_quote, Connector, OutputStream, Transport,
    KEEPALIVE_INTERVAL,
};
use crate::auth::{Credentials, HostKeyPolicy};
use crate::error::{Fault, FaultKind};

pub struct OpensshConnector {
    credentials: Credentials,
    host_key: HostKeyPolicy,
    connect_timeout: Option<Duration>,
}

impl OpensshConnector {
    pub fn new(
        credentials: Credentials,
        host_key: HostKeyPolicy,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            credentials,
            host_key,
            connect_timeout,
        }
    }

    fn builder(&self) -> Result<SessionBuilder, Fault> {
        let key = self.credentials.key_path().ok_or_else(|| {
            Fault::new(
                FaultKind::Authentication,
                "OpenSSH transport requires a private key",
            )
        })?;
        let mut builder = SessionBuilder::default();
        builder
            .user(self.credentials.username.clone())
            .keyfile(key)
            .server_alive_interval(KEEPALIVE_INTERVAL)
            .known_hosts_check(match self.host_key {
                HostKeyPolicy::Off => KnownHosts::Accept,
                HostKeyPolicy::Strict => KnownHosts::Strict,
            });
        if let Some(timeout) = self.connect_timeout {
            builder.connect_timeout(timeout);
        }
        Ok(builder)
    }
}

#[async_trait]
impl Connector for OpensshConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn Transport>, Fault> {
        let session = self
            .builder()?
            .connect_mux(host)
            .await
            .map_err(fault_from)?;
        tracing::debug!(host, "Connected to host.");
        Ok(Box::new(OpensshTransport {
            host: host.to_owned(),
            session: Mutex::new(Some(Arc::new(session))),
        }))
    }
}

pub struct OpensshTransport {
    host: String,
    session: Mutex<Option<Arc<SshSession>>>,
}

impl OpensshTransport {
    async fn session(&self) -> Result<Arc<SshSession>, Fault> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| Fault::connection(format!("Connection to {} is closed", self.host)))
    }

    /// Runs `command` to completion, discarding stdout. Returns the exit status and stderr.
    async fn run_quiet(&self, command: String) -> Result<(ExitStatus, String), Fault> {
        let session = self.session().await?;
        let mut child = session
            .raw_command(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(fault_from)?;
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr().take() {
            pipe.read_to_string(&mut stderr)
                .await
                .map_err(|e| Fault::io(e.to_string()))?;
        }
        let status = child.wait().await.map_err(fault_from)?;
        Ok((status, stderr))
    }
}

#[async_trait]
impl Transport for OpensshTransport {
    fn host(&self) -> &str {
        &self.host
    }

    async fn spawn(&self, command: &str) -> Result<OutputStream, Fault> {
        let session = self.session().await?;
        let command = command.to_owned();
        let (tx, stream) = OutputStream::channel();
        let (started_tx, started_rx) = oneshot::channel();

        // The remote child borrows the session, so both live inside the producer task.
        let producer = tokio::spawn(async move {
            let spawned = session
                .raw_command(&command)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .await;
            let mut child = match spawned {
                Ok(child) => {
                    let _ = started_tx.send(Ok(()));
                    child
                }
                Err(e) => {
                    let _ = started_tx.send(Err(fault_from(e)));
                    return;
                }
            };
            let stdout = child.stdout().take();
            let stderr = child.stderr().take();

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
                Ok(status) => tx.exit(status.code()),
                Err(e) => tx.fault(fault_from(e)),
            }
        });
        let stream = stream.attach(producer);

        match started_rx.await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(fault)) => Err(fault),
            Err(_) => Err(Fault::connection(format!(
                "Command task on {} ended before the command started",
                self.host
            ))),
        }
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), Fault> {
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| Fault::io(format!("{}: {}", local.display(), e)))?;
        let session = self.session().await?;
        let mut child = session
            .raw_command(format!("cat > {}", shell_quote(remote)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(fault_from)?;
        if let Some(mut stdin) = child.stdin().take() {
            tokio::io::copy(&mut file, &mut stdin)
                .await
                .map_err(|e| Fault::io(e.to_string()))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| Fault::io(e.to_string()))?;
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr().take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        let status = child.wait().await.map_err(fault_from)?;
        check_status(status, &stderr, remote)
    }

    async fn make_dir(&self, remote: &str) -> Result<(), Fault> {
        let (status, stderr) = self
            .run_quiet(format!("mkdir -p {}", shell_quote(remote)))
            .await?;
        check_status(status, &stderr, remote)
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), Fault> {
        let session = self.session().await?;
        let mut child = session
            .raw_command(format!("cat {}", shell_quote(remote)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(fault_from)?;
        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| Fault::io(format!("{}: {}", local.display(), e)))?;
        if let Some(mut stdout) = child.stdout().take() {
            tokio::io::copy(&mut stdout, &mut file)
                .await
                .map_err(|e| Fault::io(e.to_string()))?;
        }
        file.flush().await.map_err(|e| Fault::io(e.to_string()))?;
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr().take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        let status = child.wait().await.map_err(fault_from)?;
        check_status(status, &stderr, remote)
    }

    async fn close(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        tracing::debug!(host = %self.host, "Terminating connection.");
        // Children still holding the session keep it alive; the master exits when they drop.
        match Arc::try_unwrap(session) {
            Ok(session) => {
                if let Err(e) = session.close().await {
                    tracing::warn!(host = %self.host, "Error while terminating: {}", e);
                }
            }
            Err(session) => tracing::debug!(
                host = %self.host,
                holders = Arc::strong_count(&session),
                "Session still in use, leaving the master to exit on drop."
            ),
        }
    }
}

fn check_status(status: ExitStatus, stderr: &str, remote: &str) -> Result<(), Fault> {
    if status.success() {
        Ok(())
    } else {
        Err(Fault::io(format!("{}: {} ({})", remote, stderr.trim(), status)))
    }
}

/// Maps an `openssh` error to the fault kinds the executor understands.
fn fault_from(err: openssh::Error) -> Fault {
    let message = err.to_string();
    let kind = match &err {
        openssh::Error::Disconnected | openssh::Error::Remote(_) => FaultKind::Connection,
        openssh::Error::Connect(_) | openssh::Error::Master(_) => classify_ssh_stderr(&message),
        _ => FaultKind::Protocol,
    };
    Fault::new(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(host: &str) -> OpensshTransport {
        OpensshTransport {
            host: host.to_owned(),
            session: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn commands_on_closed_transport_fail_as_connection() {
        let transport = closed("n1");
        let fault = match transport.spawn("hostname").await {
            Ok(_) => panic!("spawn should fail"),
            Err(fault) => fault,
        };
        assert_eq!(fault.kind, FaultKind::Connection);
        assert!(fault.message.contains("n1"));

        let fault = transport
            .get_file("/etc/hostname", Path::new("/nonexistent/out"))
            .await
            .unwrap_err();
        assert_eq!(fault.kind, FaultKind::Connection);
        assert_eq!(transport.make_dir("/tmp/x").await.unwrap_err().kind, FaultKind::Connection);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = closed("n1");
        transport.close().await;
        transport.close().await;
    }

    #[tokio::test]
    async fn password_credentials_are_refused() {
        let connector = OpensshConnector::new(
            Credentials::with_password("root", "hunter2"),
            HostKeyPolicy::Off,
            None,
        );
        let fault = match connector.connect("n1").await {
            Ok(_) => panic!("connect should fail"),
            Err(fault) => fault,
        };
        assert_eq!(fault.kind, FaultKind::Authentication);
    }

    #[test]
    fn lost_master_is_a_connection_fault() {
        assert_eq!(fault_from(openssh::Error::Disconnected).kind, FaultKind::Connection);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(fault_from(openssh::Error::ChildIo(io)).kind, FaultKind::Protocol);
    }
}
