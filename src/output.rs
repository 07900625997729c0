//! Output writing shared by archives and outputter workers.

use crate::config::Topology;
use crate::error::{DistributorError, Result};
use crate::payload::PayloadRegistry;
use crate::protocol::{Message, ResultCodec};
use crate::queen::JobQueen;
use crate::scheduler::job::OutputSpecification;
use crate::transport::{NodeRank, Transport, TransportError, MASTER_RANK};

/// How a node that has been handed an output task carries it out.
#[derive(Debug, Clone, Copy)]
pub struct OutputDuty {
    rank: NodeRank,
    stamp_suffix: bool,
    codec: ResultCodec,
}

impl OutputDuty {
    pub fn new(rank: NodeRank, topology: &Topology, codec: ResultCodec) -> Self {
        Self {
            rank,
            stamp_suffix: topology.multiple_outputters(),
            codec,
        }
    }

    /// Decode a serialized job and result and hand it to the queen's outputter.
    pub fn write(
        &self,
        queen: &mut dyn JobQueen,
        registry: &PayloadRegistry,
        mut spec: OutputSpecification,
        job_and_result: &[u8],
    ) -> Result<()> {
        let (job, result) = self.codec.decode(registry, job_and_result).map_err(|e| {
            DistributorError::serialization(
                format!(
                    "Failed to deserialize job result {} on node {} for output",
                    spec.result_id, self.rank
                ),
                e,
            )
        })?;
        if self.stamp_suffix {
            spec.output_suffix = Some(format!("_{}", self.rank));
        }
        let mut outputter = queen.result_outputter(&spec)?;
        outputter.write_output(&spec, &job, result.as_ref())?;
        tracing::info!(
            result_id = %spec.result_id,
            outputter = %spec.outputter,
            node = self.rank,
            "Wrote job result"
        );
        Ok(())
    }

    /// Fetch a result from `archive`, which drops its copy, and write it.
    ///
    /// Returns `Ok(false)` if the archive did not have the result. The miss is
    /// reported to the master before returning, so a master waiting on this
    /// node alone still hears about it.
    pub async fn fetch_and_write<T: Transport>(
        &self,
        transport: &mut T,
        queen: &mut dyn JobQueen,
        registry: &PayloadRegistry,
        archive: NodeRank,
        spec: OutputSpecification,
    ) -> Result<bool> {
        let result_id = spec.result_id;
        transport.send(archive, Message::RetrieveAndDiscardJobResult { result_id })?;
        match transport.recv_from(archive).await? {
            Message::JobResultRetrieved {
                job_and_result, ..
            } => {
                self.write(queen, registry, spec, &job_and_result)?;
                Ok(true)
            }
            Message::FailedToRetrieveJobResult { .. } => {
                tracing::warn!(%result_id, archive, "Archive could not supply result for output");
                transport.send(
                    MASTER_RANK,
                    Message::FailedToRetrieveJobResult {
                        result_id,
                        requesting_node: self.rank,
                    },
                )?;
                Ok(false)
            }
            other => Err(DistributorError::Protocol {
                rank: self.rank,
                from: archive,
                opcode: other.opcode(),
                context: format!(" while waiting for job result {result_id} to output"),
            }),
        }
    }

    /// Tell the master how the output went.
    pub fn report<T: Transport>(
        &self,
        transport: &T,
        outcome: Result<()>,
    ) -> std::result::Result<(), TransportError> {
        match outcome {
            Ok(()) => transport.send(MASTER_RANK, Message::OutputCompleted),
            Err(e) => {
                tracing::error!(node = self.rank, error = %e, "Output failed");
                transport.send(
                    MASTER_RANK,
                    Message::Error {
                        message: e.to_string(),
                    },
                )
            }
        }
    }
}
