//! Per-host transports.
//!
//! A `Connector` opens one `Transport` per host. A transport runs commands and moves files; it
//! never decides whether its host is dead. Every failure comes back as a `Fault` value so the
//! executor can fold it into that host's record.

pub mod openssh;
pub mod sshpass;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::auth::{Credentials, HostKeyPolicy, Secret};
use crate::error::Fault;

/// Keepalive cadence requested from every transport.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// One event from a running remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A stdout or stderr line, without its terminator.
    Line(String),
    /// The remote command finished. `None` when the exit code is unknown (killed by a signal).
    Exit(Option<i32>),
    /// The transport failed while the command was running.
    Fault(Fault),
}

/// Sending half handed to whatever produces the remote output.
#[derive(Debug, Clone)]
pub struct StreamSender(flume::Sender<StreamEvent>);

impl StreamSender {
    /// Returns false once the receiving side is gone.
    pub fn line(&self, line: impl Into<String>) -> bool {
        self.0.send(StreamEvent::Line(line.into())).is_ok()
    }

    pub async fn line_async(&self, line: String) -> bool {
        self.0.send_async(StreamEvent::Line(line)).await.is_ok()
    }

    pub fn exit(self, code: Option<i32>) {
        let _ = self.0.send(StreamEvent::Exit(code));
    }

    pub fn fault(self, fault: Fault) {
        let _ = self.0.send(StreamEvent::Fault(fault));
    }
}

/// Merged stdout/stderr of one remote command, in arrival order.
///
/// Dropping the stream abandons the command and aborts its producer task, if one is attached.
#[derive(Debug)]
pub struct OutputStream {
    rx: flume::Receiver<StreamEvent>,
    producer: Option<JoinHandle<()>>,
}

impl OutputStream {
    pub fn channel() -> (StreamSender, OutputStream) {
        let (tx, rx) = flume::unbounded();
        (
            StreamSender(tx),
            OutputStream { rx, producer: None },
        )
    }

    /// Ties the lifetime of the task feeding this stream to the stream itself.
    pub fn attach(mut self, producer: JoinHandle<()>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Next event, or `None` when every sender has been dropped.
    pub async fn next(&self) -> Option<StreamEvent> {
        self.rx.recv_async().await.ok()
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn host(&self) -> &str;

    /// Starts `command` through the remote login shell.
    async fn spawn(&self, command: &str) -> Result<OutputStream, Fault>;

    /// Streams one local file to `remote`.
    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), Fault>;

    /// Creates `remote` and its parents.
    async fn make_dir(&self, remote: &str) -> Result<(), Fault>;

    /// Copies one remote file to `local`.
    async fn get_file(&self, remote: &str, local: &Path) -> Result<(), Fault>;

    /// Tears the transport down. Calling it twice is harmless.
    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens an authenticated transport to `host`.
    async fn connect(&self, host: &str) -> Result<Box<dyn Transport>, Fault>;
}

/// Picks the transport matching the credential bundle: OpenSSH multiplexing for keys,
/// `sshpass` for passwords.
pub fn connector_for(
    credentials: Credentials,
    host_key: HostKeyPolicy,
    connect_timeout: Option<Duration>,
) -> Arc<dyn Connector> {
    match credentials.secret {
        Secret::PrivateKey(_) => Arc::new(openssh::OpensshConnector::new(
            credentials,
            host_key,
            connect_timeout,
        )),
        Secret::Password(_) => Arc::new(sshpass::SshpassConnector::new(
            credentials,
            host_key,
            connect_timeout,
        )),
    }
}

/// Stand-in for a host whose transport could not be established.
/// Every operation reports the fault recorded at connect time.
#[derive(Debug)]
pub struct BrokenTransport {
    host: String,
    fault: Fault,
}

impl BrokenTransport {
    pub fn new(host: impl Into<String>, fault: Fault) -> Self {
        Self {
            host: host.into(),
            fault,
        }
    }
}

#[async_trait]
impl Transport for BrokenTransport {
    fn host(&self) -> &str {
        &self.host
    }

    async fn spawn(&self, _command: &str) -> Result<OutputStream, Fault> {
        Err(self.fault.clone())
    }

    async fn put_file(&self, _local: &Path, _remote: &str) -> Result<(), Fault> {
        Err(self.fault.clone())
    }

    async fn make_dir(&self, _remote: &str) -> Result<(), Fault> {
        Err(self.fault.clone())
    }

    async fn get_file(&self, _remote: &str, _local: &Path) -> Result<(), Fault> {
        Err(self.fault.clone())
    }

    async fn close(&self) {}
}

/// Forwards every line of `stream` to `tx` until EOF or until the receiver goes away.
pub(crate) async fn pump_lines<B: AsyncRead + Unpin>(
    stream: B,
    tx: &StreamSender,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(reader.buffer().len());
    loop {
        buf.clear();
        if !read_line(&mut reader, &mut buf).await? {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        if !tx.line_async(line).await {
            return Ok(());
        }
    }
}

/// Reads one `\n`-terminated line into `buf`, dropping the terminator and a trailing `\r`.
/// Returns false at EOF with nothing read.
async fn read_line<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    buf: &mut Vec<u8>,
) -> std::io::Result<bool> {
    let mut read_any = false;
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr(b'\n', available) {
                buf.extend_from_slice(&available[..i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        read_any |= used > 0;
        if done || used == 0 {
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            return Ok(read_any);
        }
    }
}

/// Single-quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Maps the stderr of a failed ssh invocation to a fault kind.
pub(crate) fn classify_ssh_stderr(stderr: &str) -> crate::error::FaultKind {
    use crate::error::FaultKind;

    if stderr.contains("Permission denied") || stderr.contains("Authentication failed") {
        FaultKind::Authentication
    } else if stderr.contains("Host key verification failed")
        || stderr.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
    {
        FaultKind::UnknownHostKey
    } else if stderr.contains("protocol") || stderr.contains("Bad packet") {
        FaultKind::Protocol
    } else {
        FaultKind::Connection
    }
}
