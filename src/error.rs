use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// What went wrong on a single host within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The transport could not be established or was torn down mid-session.
    Connection,
    /// The per-host read deadline expired.
    Timeout,
    /// Credentials were rejected.
    Authentication,
    /// SSH-layer misbehavior.
    Protocol,
    /// The host key is untrusted under a strict host-key policy.
    UnknownHostKey,
    /// Local or remote file I/O failed during a transfer.
    Io,
}

impl FaultKind {
    /// Only these kinds make a host a candidate for reachability probing.
    pub fn is_reachability_signal(self) -> bool {
        matches!(self, FaultKind::Connection | FaultKind::Timeout)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            FaultKind::Connection => "ConnectionError",
            FaultKind::Timeout => "Timeout",
            FaultKind::Authentication => "AuthenticationError",
            FaultKind::Protocol => "ProtocolError",
            FaultKind::UnknownHostKey => "UnknownHostKey",
            FaultKind::Io => "IOError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Io, message)
    }

    /// The text copied into a host's combined output.
    /// Falls back to the kind's name when the message is empty.
    pub fn render(&self) -> String {
        if self.message.is_empty() {
            format!("{}()", self.kind)
        } else {
            self.message.clone()
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.render())
    }
}

impl std::error::Error for Fault {}

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("{kind} on host {host}: {message}")]
    Host {
        host: String,
        kind: FaultKind,
        message: String,
    },
    #[error("Command list has {got} entries but the live set has {expected} hosts")]
    LengthMismatch { expected: usize, got: usize },
    #[error("File transfer to/from host {host} failed: {fault}")]
    Transfer { host: String, fault: Fault },
    #[error("Relay copy from {source_host} to {destination} failed: {reason}")]
    Relay {
        source_host: String,
        destination: String,
        reason: String,
    },
    #[error("Invalid cluster file {path}: {reason}")]
    ClusterFile { path: PathBuf, reason: String },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to render template: {0}")]
    Template(String),
    #[error("Session has been destroyed")]
    Destroyed,
    #[error("Local I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl FabricError {
    pub fn host(host: &str, fault: Fault) -> Self {
        FabricError::Host {
            host: host.to_owned(),
            kind: fault.kind,
            message: fault.render(),
        }
    }

    /// The fault kind behind a host-level failure, if any.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            FabricError::Host { kind, .. } => Some(*kind),
            FabricError::Transfer { fault, .. } => Some(fault.kind),
            _ => None,
        }
    }
}
