use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::archive::Archive;
use crate::config::{DistributorConfig, Role, Topology};
use crate::error::{DistributorError, Result};
use crate::payload::PayloadRegistry;
use crate::queen::JobQueen;
use crate::scheduler::{Master, RunSummary};
use crate::transport::{LocalNetwork, MessageLog, NodeRank, Transport};
use crate::worker::Worker;

/// One process of the group: picks its role from its rank and runs it.
pub struct Node<T: Transport> {
    transport: T,
    queen: Box<dyn JobQueen>,
    config: Arc<DistributorConfig>,
}

impl<T: Transport> Node<T> {
    pub fn new(transport: T, queen: Box<dyn JobQueen>, config: Arc<DistributorConfig>) -> Self {
        Self {
            transport,
            queen,
            config,
        }
    }

    pub fn role(&self) -> Role {
        Topology::new(&self.config, self.transport.size()).role_of(self.transport.rank())
    }

    /// Run this node's role to completion.
    ///
    /// Only the master produces a [`RunSummary`]; archives and workers return
    /// `None` once they have been spun down.
    ///
    /// # Errors
    ///
    /// Any condition that ends the run on this node. The master's error is
    /// the one that describes the run; other nodes' errors have usually
    /// already been reported to it.
    pub async fn run(self) -> Result<Option<RunSummary>> {
        let role = self.role();
        let mut registry = PayloadRegistry::new();
        self.queen.register_payloads(&mut registry);
        let registry = Arc::new(registry);

        match role {
            Role::Master => Master::new(self.transport, self.queen, registry, &self.config)
                .run()
                .await
                .map(Some),
            Role::Archive => Archive::new(self.transport, self.queen, registry, &self.config)
                .run()
                .await
                .map(|()| None),
            Role::Worker => Worker::new(self.transport, self.queen, registry, &self.config)
                .run()
                .await
                .map(|()| None),
        }
    }
}

/// Runs a whole process group inside one tokio runtime, one task per rank.
///
/// Each rank gets its own queen from `make_queen`, the same way each process
/// of a distributed run would construct its own.
pub struct LocalCluster {
    nprocs: usize,
    config: Arc<DistributorConfig>,
    log: Option<MessageLog>,
    shutdown: CancellationToken,
}

impl LocalCluster {
    pub fn new(nprocs: usize, config: DistributorConfig) -> Self {
        Self {
            nprocs,
            config: Arc::new(config),
            log: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Record every message sent during the run.
    pub fn with_message_log(mut self, log: MessageLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Abort the run when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Run the group and return the master's summary.
    ///
    /// The first node to fail ends the run: every other task is aborted and
    /// that node's error is returned.
    pub async fn run<Q, F>(self, mut make_queen: F) -> Result<RunSummary>
    where
        Q: JobQueen,
        F: FnMut(NodeRank) -> Q,
    {
        self.config.validate(self.nprocs)?;
        let endpoints = LocalNetwork::new(self.nprocs)
            .with_log(self.log.clone())
            .endpoints();

        let mut tasks = JoinSet::new();
        for endpoint in endpoints {
            let rank = endpoint.rank();
            let node = Node::new(endpoint, Box::new(make_queen(rank)), self.config.clone());
            tasks.spawn(async move { (rank, node.run().await) });
        }

        let mut summary = None;
        loop {
            let joined = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::warn!("Shutdown requested, aborting run");
                    tasks.abort_all();
                    return Err(DistributorError::Interrupted);
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((_, Ok(Some(done)))) => summary = Some(done),
                Ok((_, Ok(None))) => {}
                Ok((rank, Err(e))) => {
                    tracing::error!(rank, error = %e, "Node failed, aborting run");
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(DistributorError::Task(e.to_string()));
                }
            }
        }

        summary.ok_or_else(|| DistributorError::Internal("master finished without a summary".to_string()))
    }
}
