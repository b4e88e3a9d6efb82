//! Fan-out execution.
//!
//! One tokio task per host, joined at the end of the round. Each task drains its host's merged
//! output until the command finishes or the read deadline expires, and produces a `HostRecord`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use crate::error::{Fault, FaultKind};
use crate::pool::SessionPool;
use crate::transport::{OutputStream, StreamEvent, Transport};

/// Prefix of the line appended when a host's read deadline expires.
pub const TIMEOUT_SENTINEL: &str = "ABORT: Timeout Error in Host: ";
/// Suffix appended to the output of every host evicted in a round.
pub const UNREACHABLE_SENTINEL: &str = "\nABORT: Host Unreachable Error";

/// host -> combined output.
pub type RoundOutput = HashMap<String, String>;

/// Everything one host produced in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub host: String,
    /// stdout and stderr lines in arrival order.
    pub lines: Vec<String>,
    /// Exit code of the remote command when it ran to completion.
    pub exit_code: Option<i32>,
    pub fault: Option<Fault>,
}

impl HostRecord {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            lines: vec![],
            exit_code: None,
            fault: None,
        }
    }

    pub fn faulted(host: impl Into<String>, fault: Fault) -> Self {
        Self {
            fault: Some(fault),
            ..Self::new(host)
        }
    }

    pub fn fault_kind(&self) -> Option<FaultKind> {
        self.fault.as_ref().map(|f| f.kind)
    }

    /// Whether this host should be handed to the reachability arbiter.
    pub fn is_probe_candidate(&self) -> bool {
        self.fault_kind()
            .map_or(false, FaultKind::is_reachability_signal)
    }

    /// The combined output string callers grep.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&expand_tabs(line));
            out.push('\n');
        }
        if let Some(fault) = &self.fault {
            out.push_str(&expand_tabs(&fault.render()));
            out.push('\n');
            if fault.kind == FaultKind::Timeout {
                out.push_str(TIMEOUT_SENTINEL);
                out.push_str(&self.host);
                out.push('\n');
            }
        }
        out
    }
}

/// Replaces every tab with three spaces.
pub fn expand_tabs(s: &str) -> String {
    s.replace('\t', "   ")
}

/// Runs `commands[i]` on the i-th transport of `pool`, all hosts concurrently.
///
/// Records come back in pool order. `commands` must be as long as the pool; extra entries on
/// either side are ignored.
pub async fn fan_out(
    pool: &SessionPool,
    commands: &[String],
    deadline: Option<Duration>,
) -> Vec<HostRecord> {
    let tasks: Vec<_> = pool
        .transports()
        .iter()
        .zip(commands)
        .map(|(transport, command)| {
            let transport = Arc::clone(transport);
            let command = command.clone();
            let host = transport.host().to_owned();
            (
                host,
                tokio::spawn(async move { run_on_host(transport, command, deadline).await }),
            )
        })
        .collect();

    let (hosts, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
    join_all(handles)
        .await
        .into_iter()
        .zip(hosts)
        .map(|(joined, host)| match joined {
            Ok(record) => record,
            Err(e) => HostRecord::faulted(
                host,
                Fault::new(FaultKind::Protocol, format!("Host task failed: {}", e)),
            ),
        })
        .collect()
}

/// Runs one command on one host and drains its output.
pub async fn run_on_host(
    transport: Arc<dyn Transport>,
    command: String,
    deadline: Option<Duration>,
) -> HostRecord {
    let host = transport.host().to_owned();
    if deadline == Some(Duration::ZERO) {
        return HostRecord::faulted(host, timeout_fault(Duration::ZERO));
    }
    let started = Instant::now();
    tracing::debug!(host = %host, command = %command, "Dispatching command.");
    let stream = match transport.spawn(&command).await {
        Ok(stream) => stream,
        Err(fault) => return HostRecord::faulted(host, fault),
    };
    drain(host, stream, deadline.map(|d| (started + d, d))).await
}

/// Collects events until the command ends or `deadline` passes. Lines read before the deadline
/// are kept either way.
async fn drain(
    host: String,
    stream: OutputStream,
    deadline: Option<(Instant, Duration)>,
) -> HostRecord {
    let mut record = HostRecord::new(host);
    loop {
        let event = match deadline {
            Some((at, length)) => match tokio::time::timeout_at(at, stream.next()).await {
                Ok(event) => event,
                Err(_) => {
                    record.fault = Some(timeout_fault(length));
                    break;
                }
            },
            None => stream.next().await,
        };
        match event {
            Some(StreamEvent::Line(line)) => record.lines.push(line),
            Some(StreamEvent::Exit(code)) => {
                record.exit_code = code;
                break;
            }
            Some(StreamEvent::Fault(fault)) => {
                record.fault = Some(fault);
                break;
            }
            None => {
                record.fault = Some(Fault::connection("Output stream closed unexpectedly"));
                break;
            }
        }
    }
    if let Some(fault) = &record.fault {
        tracing::warn!(host = %record.host, "{}", fault);
    }
    record
}

fn timeout_fault(deadline: Duration) -> Fault {
    Fault::timeout(format!("Command timed out after {:?}", deadline))
}
