//! Transports to every host of the live set.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::error::Fault;
use crate::transport::{BrokenTransport, Connector, Transport};

pub struct SessionPool {
    connector: Arc<dyn Connector>,
    /// Upper bound on a single connect, on top of whatever the connector enforces.
    connect_bound: Option<Duration>,
    /// One transport per host, in live-set order.
    transports: Vec<Arc<dyn Transport>>,
}

impl SessionPool {
    /// Connects to every host concurrently.
    ///
    /// A host that cannot be reached or authenticated still gets an entry; its transport replays
    /// the connect fault on every later operation.
    pub async fn connect(connector: Arc<dyn Connector>, hosts: &[String]) -> Self {
        Self::connect_bounded(connector, hosts, None).await
    }

    pub async fn connect_bounded(
        connector: Arc<dyn Connector>,
        hosts: &[String],
        connect_bound: Option<Duration>,
    ) -> Self {
        let transports = open_all(&connector, hosts, connect_bound).await;
        Self {
            connector,
            connect_bound,
            transports,
        }
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.transports.iter().map(|t| t.host())
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// Tears down every transport, then connects afresh to `hosts`.
    ///
    /// The pool is only reachable through `&mut self`, so no caller ever sees it half built.
    pub async fn rebuild(&mut self, hosts: &[String]) {
        tracing::info!(hosts = hosts.len(), "Rebuilding session pool.");
        self.destroy().await;
        self.transports = open_all(&self.connector, hosts, self.connect_bound).await;
    }

    /// Closes every transport. Calling it again is a no-op.
    pub async fn destroy(&mut self) {
        let transports = std::mem::take(&mut self.transports);
        join_all(transports.iter().map(|t| t.close())).await;
    }
}

async fn open_all(
    connector: &Arc<dyn Connector>,
    hosts: &[String],
    bound: Option<Duration>,
) -> Vec<Arc<dyn Transport>> {
    join_all(hosts.iter().map(|host| open_one(connector.as_ref(), host, bound))).await
}

async fn open_one(
    connector: &dyn Connector,
    host: &str,
    bound: Option<Duration>,
) -> Arc<dyn Transport> {
    let connected = match bound {
        Some(bound) => match tokio::time::timeout(bound, connector.connect(host)).await {
            Ok(connected) => connected,
            Err(_) => Err(Fault::connection(format!(
                "Connect to {} timed out after {:?}",
                host, bound
            ))),
        },
        None => connector.connect(host).await,
    };
    match connected {
        Ok(transport) => Arc::from(transport),
        Err(fault) => {
            tracing::warn!(host, "Failed to connect to host: {}", fault);
            Arc::new(BrokenTransport::new(host, fault))
        }
    }
}
