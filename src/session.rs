//! The fabric session: a live set of hosts, the pool serving it, and the rounds run over it.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::Instrument;

use crate::arbiter::{Arbiter, ProbeArbiter};
use crate::auth::{Credentials, HostKeyPolicy};
use crate::error::FabricError;
use crate::executor::{fan_out, HostRecord, RoundOutput, UNREACHABLE_SENTINEL};
use crate::pool::SessionPool;
use crate::transfer;
use crate::transport::{connector_for, Connector};

/// Force-reboot command issued by `Session::reboot`.
pub const REBOOT_COMMAND: &str = "sudo reboot -f";
/// How long `Session::reboot` waits on each host before letting go of the channel.
pub const REBOOT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Any host fault fails the whole round.
    Strict,
    /// Faults stay in per-host output; unreachable hosts are pruned.
    Tolerant,
}

impl Mode {
    pub fn from_stop_on_errors(stop_on_errors: bool) -> Self {
        if stop_on_errors {
            Mode::Strict
        } else {
            Mode::Tolerant
        }
    }
}

/// Inputs for `Session::connect`.
pub struct SessionBuilder {
    hosts: Vec<String>,
    credentials: Credentials,
    host_key: HostKeyPolicy,
    mode: Mode,
    connect_timeout: Option<Duration>,
    connector: Option<Arc<dyn Connector>>,
    arbiter: Option<Box<dyn Arbiter>>,
    span: Option<tracing::Span>,
}

impl SessionBuilder {
    pub fn new(hosts: Vec<String>, credentials: Credentials) -> Self {
        Self {
            hosts,
            credentials,
            host_key: HostKeyPolicy::Off,
            mode: Mode::Strict,
            connect_timeout: None,
            connector: None,
            arbiter: None,
            span: None,
        }
    }

    pub fn host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }

    pub fn stop_on_errors(mut self, stop_on_errors: bool) -> Self {
        self.mode = Mode::from_stop_on_errors(stop_on_errors);
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the transport chosen from the credentials.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Overrides the probe-based arbiter.
    pub fn arbiter(mut self, arbiter: Box<dyn Arbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Span every round of the session is recorded under.
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    pub async fn connect(self) -> Session {
        let connector = self.connector.unwrap_or_else(|| {
            connector_for(
                self.credentials.clone(),
                self.host_key,
                self.connect_timeout,
            )
        });
        let arbiter = self
            .arbiter
            .unwrap_or_else(|| Box::new(ProbeArbiter::new(Arc::clone(&connector))));
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("fabric", hosts = self.hosts.len()));

        let pool = SessionPool::connect(Arc::clone(&connector), &self.hosts)
            .instrument(span.clone())
            .await;
        Session {
            live: self.hosts,
            dead: BTreeSet::new(),
            pool,
            credentials: self.credentials,
            mode: self.mode,
            arbiter,
            span,
            rebuilds: 0,
            destroyed: false,
        }
    }
}

/// Runs rounds of commands over the live set.
///
/// Rounds take `&mut self`, so at most one runs at a time.
pub struct Session {
    live: Vec<String>,
    dead: BTreeSet<String>,
    pool: SessionPool,
    credentials: Credentials,
    mode: Mode,
    arbiter: Box<dyn Arbiter>,
    span: tracing::Span,
    rebuilds: usize,
    destroyed: bool,
}

impl Session {
    pub fn builder(hosts: Vec<String>, credentials: Credentials) -> SessionBuilder {
        SessionBuilder::new(hosts, credentials)
    }

    /// Hosts commands are currently dispatched to, in configured order.
    pub fn live_hosts(&self) -> &[String] {
        &self.live
    }

    /// Hosts evicted so far. They never come back.
    pub fn dead_hosts(&self) -> &BTreeSet<String> {
        &self.dead
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// How many times the pool has been rebuilt after an eviction.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    /// Runs `command` on every live host.
    pub async fn exec(
        &mut self,
        command: &str,
        deadline: Option<Duration>,
    ) -> Result<RoundOutput, FabricError> {
        let commands = vec![command.to_owned(); self.live.len()];
        self.round(commands, deadline).await
    }

    /// Runs `commands[i]` on the i-th live host.
    pub async fn exec_cmd_list(
        &mut self,
        commands: Vec<String>,
        deadline: Option<Duration>,
    ) -> Result<RoundOutput, FabricError> {
        self.ensure_open()?;
        if commands.len() != self.live.len() {
            return Err(FabricError::LengthMismatch {
                expected: self.live.len(),
                got: commands.len(),
            });
        }
        self.round(commands, deadline).await
    }

    async fn round(
        &mut self,
        commands: Vec<String>,
        deadline: Option<Duration>,
    ) -> Result<RoundOutput, FabricError> {
        self.ensure_open()?;
        let span = self.span.clone();
        async move {
            tracing::debug!(hosts = self.live.len(), ?deadline, "Starting round.");
            let records = fan_out(&self.pool, &commands, deadline).await;
            let output = match self.mode {
                Mode::Strict => strict_output(records)?,
                Mode::Tolerant => self.prune(records).await,
            };
            tracing::debug!(hosts = output.len(), "Round finished.");
            Ok(output)
        }
        .instrument(span)
        .await
    }

    /// Probes the connection-class failures of a round, evicts the confirmed-dead hosts and
    /// renders the round output.
    async fn prune(&mut self, records: Vec<HostRecord>) -> RoundOutput {
        let suspects: Vec<String> = records
            .iter()
            .filter(|record| record.is_probe_candidate())
            .map(|record| record.host.clone())
            .collect();
        let dead = if suspects.is_empty() {
            BTreeSet::new()
        } else {
            // Only suspects may be evicted, whatever the arbiter says.
            let mut confirmed = self.arbiter.confirm_dead(&suspects).await;
            confirmed.retain(|host| suspects.contains(host));
            confirmed
        };

        let output = records
            .into_iter()
            .map(|record| {
                let mut rendered = record.render();
                if dead.contains(&record.host) {
                    rendered.push_str(UNREACHABLE_SENTINEL);
                }
                (record.host, rendered)
            })
            .collect();

        if !dead.is_empty() {
            self.evict(dead).await;
        }
        output
    }

    /// Moves `dead` from the live set to the dead set and rebuilds the pool once.
    async fn evict(&mut self, dead: BTreeSet<String>) {
        for host in &dead {
            tracing::warn!(host = %host, "Evicting unreachable host.");
        }
        self.live.retain(|host| !dead.contains(host));
        self.dead.extend(dead);
        self.pool.rebuild(&self.live).await;
        self.rebuilds += 1;
    }

    /// Uploads `local` to `remote` on every live host. Returns the first failure in live-set
    /// order; transfer failures never trigger eviction.
    pub async fn upload(
        &self,
        local: &Path,
        remote: &str,
        recursive: bool,
    ) -> Result<(), FabricError> {
        self.ensure_open()?;
        transfer::upload(&self.pool, local, remote, recursive)
            .instrument(self.span.clone())
            .await
    }

    /// Copies `remote` from every live host to `<local_prefix>_<host>`.
    pub async fn download(&self, remote: &str, local_prefix: &Path) -> Result<(), FabricError> {
        self.ensure_open()?;
        transfer::download(&self.pool, remote, local_prefix)
            .instrument(self.span.clone())
            .await
    }

    /// Force-reboots every live host.
    ///
    /// Always strict: the first dispatch failure is returned and nothing is pruned. Each host's
    /// output is drained for at most `REBOOT_GRACE`, since the connection goes down with it.
    pub async fn reboot(&self) -> Result<(), FabricError> {
        self.ensure_open()?;
        let span = self.span.clone();
        async move {
            let dispatched = join_all(self.pool.transports().iter().map(|transport| async move {
                transport
                    .spawn(REBOOT_COMMAND)
                    .await
                    .map_err(|fault| (transport.host().to_owned(), fault))
            }))
            .await;
            let mut streams = Vec::with_capacity(dispatched.len());
            for result in dispatched {
                match result {
                    Ok(stream) => streams.push(stream),
                    Err((host, fault)) => return Err(FabricError::host(&host, fault)),
                }
            }
            // Give the command a moment to take hold before the channels are dropped.
            join_all(streams.into_iter().map(|stream| async move {
                let _ = tokio::time::timeout(REBOOT_GRACE, async {
                    while stream.next().await.is_some() {}
                })
                .await;
            }))
            .await;
            tracing::info!(hosts = self.live.len(), "Reboot issued.");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Tears down every transport. Safe to call repeatedly; every later operation fails with
    /// `FabricError::Destroyed`.
    pub async fn destroy(&mut self) {
        self.destroyed = true;
        self.pool.destroy().instrument(self.span.clone()).await;
    }
}

impl Session {
    fn ensure_open(&self) -> Result<(), FabricError> {
        if self.destroyed {
            Err(FabricError::Destroyed)
        } else {
            Ok(())
        }
    }
}

/// In strict mode the first faulted host, in live-set order, fails the round.
fn strict_output(records: Vec<HostRecord>) -> Result<RoundOutput, FabricError> {
    let first_fault = records
        .iter()
        .find_map(|record| record.fault.as_ref().map(|fault| (&record.host, fault)));
    if let Some((host, fault)) = first_fault {
        return Err(FabricError::host(host, fault.clone()));
    }
    Ok(records
        .into_iter()
        .map(|record| {
            let rendered = record.render();
            (record.host, rendered)
        })
        .collect())
}
