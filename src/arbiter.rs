//! Reachability arbitration.
//!
//! After a tolerant round, hosts that failed with a connection error or a timeout are probed
//! once more over a throwaway pool. Only those that fail the probe as well are reported dead.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::executor::fan_out;
use crate::pool::SessionPool;
use crate::transport::Connector;

/// Read deadline of the liveness probe.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(2);
/// Command used as the liveness probe.
pub const PROBE_COMMAND: &str = "echo 1";

#[async_trait]
pub trait Arbiter: Send + Sync {
    /// Returns the subset of `suspects` confirmed unreachable. Never mutates session state.
    async fn confirm_dead(&self, suspects: &[String]) -> BTreeSet<String>;
}

/// Probes suspects with a short `echo 1` over fresh transports.
pub struct ProbeArbiter {
    connector: Arc<dyn Connector>,
    deadline: Duration,
}

impl ProbeArbiter {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            deadline: PROBE_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

#[async_trait]
impl Arbiter for ProbeArbiter {
    async fn confirm_dead(&self, suspects: &[String]) -> BTreeSet<String> {
        if suspects.is_empty() {
            return BTreeSet::new();
        }
        tracing::debug!(?suspects, "Probing suspect hosts.");

        // A single attempt: connecting counts against the same deadline as the probe itself.
        let mut pool = SessionPool::connect_bounded(
            Arc::clone(&self.connector),
            suspects,
            Some(self.deadline),
        )
        .await;
        let commands = vec![PROBE_COMMAND.to_owned(); pool.len()];
        let records = fan_out(&pool, &commands, Some(self.deadline)).await;
        pool.destroy().await;

        records
            .into_iter()
            .filter(|record| record.fault.is_some())
            .map(|record| record.host)
            .collect()
    }
}
