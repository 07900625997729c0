//! Archive role: holds completed job results for the rest of the group.
//!
//! An archive never starts work on its own. It answers retrieval, discard,
//! output and checkpoint requests in the order they arrive until the master
//! tells it to spin down.
//!
//! Failures that are local to one request (a missing result, an unwritable
//! checkpoint) are reported to the master, which decides whether the run
//! can go on. Only transport failures end the archive's loop early.

pub mod store;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, file_for_node};
use crate::config::{DistributorConfig, Topology};
use crate::error::{DistributorError, Result};
use crate::output::OutputDuty;
use crate::payload::PayloadRegistry;
use crate::protocol::{Message, ResultCodec};
use crate::queen::JobQueen;
use crate::scheduler::job::{JobResultId, OutputSpecification};
use crate::transport::{Envelope, NodeRank, Transport, TransportError, MASTER_RANK};

pub use store::{ResultStore, StorageMode, StoreError, StoreSnapshot};

type SendResult = std::result::Result<(), TransportError>;

/// One archive's part of a checkpoint generation.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveCheckpoint {
    pub rank: NodeRank,
    pub store: StoreSnapshot,
}

pub struct Archive<T: Transport> {
    transport: T,
    queen: Box<dyn JobQueen>,
    registry: Arc<PayloadRegistry>,
    store: ResultStore,
    duty: OutputDuty,
}

impl<T: Transport> Archive<T> {
    pub fn new(
        transport: T,
        queen: Box<dyn JobQueen>,
        registry: Arc<PayloadRegistry>,
        config: &DistributorConfig,
    ) -> Self {
        let topology = Topology::new(config, transport.size());
        let duty = OutputDuty::new(
            transport.rank(),
            &topology,
            ResultCodec::new(config.compress_results),
        );
        let mode = StorageMode::from_directory(config.archive.directory.as_deref());
        Self {
            transport,
            queen,
            registry,
            store: ResultStore::new(mode),
            duty,
        }
    }

    fn rank(&self) -> NodeRank {
        self.transport.rank()
    }

    pub async fn run(mut self) -> Result<()> {
        self.store.prepare()?;
        tracing::info!(rank = self.rank(), on_disk = self.store.is_on_disk(), "Archive started");

        loop {
            let Envelope { source, message } = self.transport.recv_any().await?;
            match message {
                Message::SpinDown => break,
                Message::RetrieveJobResult { result_id } => self.serve(source, result_id, false)?,
                Message::RetrieveAndDiscardJobResult { result_id } => {
                    self.serve(source, result_id, true)?
                }
                Message::DiscardJobResult { result_id } => self.discard(result_id),
                Message::ArchiveJobResult {
                    result_id,
                    job_and_result,
                } => self.archive(source, result_id, job_and_result)?,
                Message::OutputJobResultAlreadyAvailable { spec } => self.output_held(spec)?,
                Message::AcceptAndOutputJobResult {
                    spec,
                    job_and_result,
                } => {
                    let outcome = self.duty.write(
                        self.queen.as_mut(),
                        &self.registry,
                        spec,
                        &job_and_result,
                    );
                    self.duty.report(&self.transport, outcome)?;
                }
                Message::OutputJobResultOnArchive { archive, spec } => {
                    self.output_from_peer(archive, spec).await?
                }
                Message::BeginCheckpointing { prefix } => self.checkpoint(&prefix)?,
                Message::RestoreFromCheckpoint { prefix, keep } => self.restore(&prefix, &keep)?,
                other => {
                    let opcode = other.opcode();
                    let message = format!(
                        "Archival node {} received an illegal message {opcode} from node {source}",
                        self.rank()
                    );
                    tracing::error!("{message}");
                    self.transport.send(MASTER_RANK, Message::Error { message })?;
                    return Err(DistributorError::Protocol {
                        rank: self.rank(),
                        from: source,
                        opcode,
                        context: " in the archive message loop".to_string(),
                    });
                }
            }
        }

        tracing::info!(rank = self.rank(), held = self.store.len(), "Archive spinning down");
        Ok(())
    }

    fn serve(&mut self, requester: NodeRank, result_id: JobResultId, discard: bool) -> SendResult {
        let fetched = if discard {
            self.store.take(result_id)
        } else {
            self.store.get(result_id)
        };
        match fetched {
            Ok(job_and_result) => {
                tracing::debug!(%result_id, requester, discard, "Serving job result");
                self.transport.send(
                    requester,
                    Message::JobResultRetrieved {
                        result_id,
                        job_and_result,
                    },
                )
            }
            Err(e) => {
                tracing::error!(%result_id, requester, error = %e, "Unable to serve job result");
                let failure = Message::FailedToRetrieveJobResult {
                    result_id,
                    requesting_node: requester,
                };
                self.transport.send(requester, failure.clone())?;
                if requester != MASTER_RANK {
                    self.transport.send(MASTER_RANK, failure)?;
                }
                if !matches!(e, StoreError::NotHeld(_)) {
                    self.transport.send(
                        MASTER_RANK,
                        Message::Error {
                            message: format!("Archival node {}: {e}", self.rank()),
                        },
                    )?;
                }
                Ok(())
            }
        }
    }

    fn discard(&mut self, result_id: JobResultId) {
        if self.store.discard(result_id) {
            tracing::debug!(%result_id, "Discarded job result");
        } else {
            tracing::warn!(%result_id, "Asked to discard a job result that is not held");
        }
    }

    fn archive(&mut self, worker: NodeRank, result_id: JobResultId, bytes: Vec<u8>) -> SendResult {
        match self.store.save(result_id, bytes) {
            Ok(()) => {
                tracing::debug!(%result_id, worker, "Archived job result");
                self.transport
                    .send(worker, Message::ArchivalCompleted { result_id })
            }
            Err(e) => {
                tracing::error!(%result_id, error = %e, "Failed to archive job result");
                self.transport.send(
                    worker,
                    Message::Error {
                        message: format!("Archival node {} failed to store result: {e}", self.rank()),
                    },
                )
            }
        }
    }

    fn output_held(&mut self, spec: OutputSpecification) -> SendResult {
        let outcome = match self.store.take(spec.result_id) {
            Ok(bytes) => self
                .duty
                .write(self.queen.as_mut(), &self.registry, spec, &bytes),
            Err(e) => Err(e.into()),
        };
        self.duty.report(&self.transport, outcome)
    }

    async fn output_from_peer(&mut self, peer: NodeRank, spec: OutputSpecification) -> SendResult {
        let outcome = self
            .duty
            .fetch_and_write(
                &mut self.transport,
                self.queen.as_mut(),
                &self.registry,
                peer,
                spec,
            )
            .await;
        match outcome {
            Ok(true) => self.duty.report(&self.transport, Ok(())),
            Ok(false) => Ok(()),
            Err(e) => self.duty.report(&self.transport, Err(e)),
        }
    }

    fn checkpoint(&mut self, prefix: &str) -> SendResult {
        let path = file_for_node(prefix, self.rank());
        let written = self
            .store
            .snapshot()
            .map_err(DistributorError::from)
            .and_then(|store| {
                let snapshot = ArchiveCheckpoint {
                    rank: self.rank(),
                    store,
                };
                checkpoint::write_atomically(&path, &snapshot).map_err(DistributorError::from)
            });
        match written {
            Ok(()) => {
                tracing::info!(rank = self.rank(), path = %path.display(), held = self.store.len(), "Wrote archive checkpoint");
                self.transport
                    .send(MASTER_RANK, Message::CheckpointingComplete)
            }
            Err(e) => self.report_checkpoint_failure("write", &path, e),
        }
    }

    fn restore(&mut self, prefix: &str, keep: &[JobResultId]) -> SendResult {
        let rank = self.rank();
        let path = file_for_node(prefix, rank);
        let restored = match checkpoint::read_file::<ArchiveCheckpoint>(&path) {
            Ok(saved) => {
                if saved.store.archived_on_disk != self.store.is_on_disk() {
                    tracing::warn!(
                        rank,
                        on_disk = self.store.is_on_disk(),
                        "Storage mode differs from the checkpointed run; rewriting every kept result"
                    );
                }
                self.store
                    .restore_selected(saved.store, keep)
                    .map_err(DistributorError::from)
            }
            Err(e) => Err(e.into()),
        };
        match restored {
            Ok(()) => {
                tracing::info!(rank = self.rank(), kept = keep.len(), "Restored archive from checkpoint");
                Ok(())
            }
            Err(e) => self.report_checkpoint_failure("restore from", &path, e),
        }
    }

    fn report_checkpoint_failure(
        &self,
        action: &str,
        path: &Path,
        error: DistributorError,
    ) -> SendResult {
        let message = format!(
            "Archival node {} failed to {action} checkpoint file {}: {error}",
            self.rank(),
            path.display()
        );
        tracing::error!("{message}");
        self.transport.send(MASTER_RANK, Message::Error { message })
    }
}
