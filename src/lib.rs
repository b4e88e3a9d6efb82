//! Clusterval: parallel SSH command fabric for cluster validation.

// Serde helper module.
mod serde;
// Reachability arbitration for tolerant rounds.
pub mod arbiter;
// Credentials and host-key policy.
pub mod auth;
// Command line arguments and the cluster file.
pub mod config;
// Error handling.
pub mod error;
// Fan-out execution and output rendering.
pub mod executor;
// Named text generators.
pub mod generator;
// How to parse and represent hosts.
pub mod host;
// Transports to the live set.
pub mod pool;
// Per-check error accumulation.
pub mod report;
// The fabric session.
pub mod session;
// File upload, download and host-to-host relay.
pub mod transfer;
// SSH transports.
pub mod transport;

pub use arbiter::{Arbiter, ProbeArbiter};
pub use auth::{Credentials, HostKeyPolicy, Secret};
pub use config::{ClusterConfig, Config};
pub use error::{FabricError, Fault, FaultKind};
pub use executor::{HostRecord, RoundOutput};
pub use generator::{Generator, Registry};
pub use host::{expand_hosts, Host};
pub use report::{scan_round, CheckFailure, ErrorLog};
pub use session::{Mode, Session, SessionBuilder};
pub use transfer::Relay;
pub use transport::{Connector, OutputStream, StreamEvent, Transport};
