//! Worker role: runs one job at a time on the master's say-so.
//!
//! # Request cycle
//!
//! 1. Send a job request to the master.
//! 2. Apply any deallocation messages that arrive first.
//! 3. Act on the reply: run a job, write an output, or spin down.
//!
//! # Completing a job
//!
//! A successful job is reported in two phases. The worker first tells the
//! master how many results it has and receives one archive per result. It
//! then ships each result to its archive and waits for that archive's
//! acknowledgement before sending the next. Only when every result is
//! stored does it send the job's status and summaries, which is the point
//! at which the queen learns that the job finished.

pub mod executor;

use std::sync::Arc;

use crate::config::{DistributorConfig, Topology};
use crate::error::{DistributorError, Result};
use crate::output::OutputDuty;
use crate::payload::{Payload, PayloadRegistry};
use crate::protocol::codec::{decode_larval_job, decode_payloads, encode_payloads};
use crate::protocol::{Message, ResultCodec};
use crate::queen::{CompletedJobOutput, JobQueen};
use crate::scheduler::job::{JobResultId, LarvalJob};
use crate::transport::{NodeRank, Transport, MASTER_RANK};

pub use executor::{JobExecutor, JobOutcome};

pub struct Worker<T: Transport> {
    transport: T,
    queen: Box<dyn JobQueen>,
    registry: Arc<PayloadRegistry>,
    codec: ResultCodec,
    executor: JobExecutor,
    duty: OutputDuty,
}

impl<T: Transport> Worker<T> {
    pub fn new(
        transport: T,
        queen: Box<dyn JobQueen>,
        registry: Arc<PayloadRegistry>,
        config: &DistributorConfig,
    ) -> Self {
        let topology = Topology::new(config, transport.size());
        let codec = ResultCodec::new(config.compress_results);
        Self {
            duty: OutputDuty::new(transport.rank(), &topology, codec),
            transport,
            queen,
            registry,
            codec,
            executor: JobExecutor::new(config.default_retry_limit),
        }
    }

    fn rank(&self) -> NodeRank {
        self.transport.rank()
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(rank = self.rank(), "Worker started");
        let mut jobs_run = 0usize;

        loop {
            self.transport.send(MASTER_RANK, Message::NewJobRequest)?;
            let mut reply = self.transport.recv_from(MASTER_RANK).await?;
            while let Message::DeallocationMessage { messages } = reply {
                self.process_deallocations(&messages)?;
                reply = self.transport.recv_from(MASTER_RANK).await?;
            }

            match reply {
                Message::NewJobAvailable {
                    job_id,
                    larval_job,
                    input_locations,
                } => {
                    self.process_job(job_id, &larval_job, &input_locations)
                        .await?;
                    jobs_run += 1;
                }
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
                    let outcome = self
                        .duty
                        .fetch_and_write(
                            &mut self.transport,
                            self.queen.as_mut(),
                            &self.registry,
                            archive,
                            spec,
                        )
                        .await;
                    match outcome {
                        Ok(true) => self.duty.report(&self.transport, Ok(()))?,
                        Ok(false) => {}
                        Err(e) => self.duty.report(&self.transport, Err(e))?,
                    }
                }
                Message::SpinDown => break,
                other => {
                    return Err(self.escalate(DistributorError::Protocol {
                        rank: self.rank(),
                        from: MASTER_RANK,
                        opcode: other.opcode(),
                        context: " while waiting for work".to_string(),
                    }))
                }
            }
        }

        tracing::info!(rank = self.rank(), jobs_run, "Worker spinning down");
        Ok(())
    }

    /// Tell the master about a fatal local error before giving up.
    fn escalate(&self, error: DistributorError) -> DistributorError {
        tracing::error!(rank = self.rank(), error = %error, "Worker failed");
        if let Err(e) = self.transport.send(
            MASTER_RANK,
            Message::Error {
                message: error.to_string(),
            },
        ) {
            tracing::warn!(error = %e, "Could not report failure to master");
        }
        error
    }

    fn process_deallocations(&mut self, bytes: &[u8]) -> Result<()> {
        let messages = decode_payloads(&self.registry, bytes).map_err(|e| {
            self.escalate(DistributorError::serialization(
                format!("Failed to deserialize deallocation messages on node {}", self.rank()),
                e,
            ))
        })?;
        tracing::debug!(count = messages.len(), "Applying deallocation messages");
        for message in messages {
            self.queen.process_deallocation_message(message);
        }
        Ok(())
    }

    async fn process_job(
        &mut self,
        job_id: u64,
        larval_bytes: &[u8],
        input_locations: &[NodeRank],
    ) -> Result<()> {
        let larval = decode_larval_job(larval_bytes).map_err(|e| {
            self.escalate(DistributorError::serialization(
                format!("Failed to deserialize larval job {job_id}"),
                e,
            ))
        })?;
        tracing::debug!(job_id, inputs = larval.inputs.len(), "Received job");

        let Some(inputs) = self.hydrate(&larval, input_locations).await? else {
            // The archive that failed has told the master, which ends the run.
            return Ok(());
        };

        let outcome = self
            .executor
            .run(self.queen.as_mut(), &larval, &inputs);
        let report = match outcome {
            JobOutcome::Completed(output) => return self.report_success(&larval, output).await,
            JobOutcome::DoNotRetry => Message::JobFailedDoNotRetry { job_id },
            JobOutcome::BadInput(reason) => {
                tracing::warn!(job_id, %reason, "Job failed on bad input");
                Message::JobFailedBadInput { job_id }
            }
            JobOutcome::RetryLimitExceeded => Message::JobFailedRetryLimitExceeded { job_id },
            JobOutcome::Failed(message) => {
                tracing::warn!(job_id, %message, "Job failed");
                Message::JobFailedWithMessage { job_id, message }
            }
        };
        tracing::warn!(job_id, outcome = %report.opcode(), "Reporting job failure");
        self.transport.send(MASTER_RANK, report)?;
        Ok(())
    }

    /// Fetch every input of `larval` from the node holding it.
    async fn hydrate(
        &mut self,
        larval: &LarvalJob,
        locations: &[NodeRank],
    ) -> Result<Option<Vec<Arc<dyn Payload>>>> {
        if larval.inputs.len() != locations.len() {
            return Err(self.escalate(DistributorError::Internal(format!(
                "job {} has {} inputs but {} input locations",
                larval.job_index,
                larval.inputs.len(),
                locations.len()
            ))));
        }

        let mut inputs: Vec<Arc<dyn Payload>> = Vec::with_capacity(locations.len());
        for (&result_id, &holder) in larval.inputs.iter().zip(locations) {
            self.transport
                .send(holder, Message::RetrieveJobResult { result_id })?;
            match self.transport.recv_from(holder).await? {
                Message::JobResultRetrieved {
                    job_and_result, ..
                } => {
                    let (_, payload) = self
                        .codec
                        .decode(&self.registry, &job_and_result)
                        .map_err(|e| {
                            self.escalate(DistributorError::serialization(
                                format!(
                                    "Failed to deserialize job result {result_id}, an input to job {}",
                                    larval.job_index
                                ),
                                e,
                            ))
                        })?;
                    inputs.push(Arc::from(payload));
                }
                Message::FailedToRetrieveJobResult { .. } => {
                    tracing::warn!(%result_id, holder, job_id = larval.job_index, "Input could not be retrieved");
                    return Ok(None);
                }
                other => {
                    return Err(self.escalate(DistributorError::Protocol {
                        rank: self.rank(),
                        from: holder,
                        opcode: other.opcode(),
                        context: format!(" while retrieving input {result_id}"),
                    }))
                }
            }
        }
        Ok(Some(inputs))
    }

    async fn report_success(&mut self, larval: &LarvalJob, output: CompletedJobOutput) -> Result<()> {
        let job_id = larval.job_index;
        let mut blobs = Vec::with_capacity(output.results.len());
        for (index, pair) in output.results.iter().enumerate() {
            let blob = self.codec.encode(larval, pair.result.as_ref()).map_err(|e| {
                self.escalate(DistributorError::serialization(
                    format!("Failed to serialize result {} of job {job_id}", index + 1),
                    e,
                ))
            })?;
            blobs.push(blob);
        }
        let summary_refs: Vec<&dyn Payload> = output
            .results
            .iter()
            .map(|pair| pair.summary.as_ref())
            .collect();
        let summaries = encode_payloads(&summary_refs).map_err(|e| {
            self.escalate(DistributorError::serialization(
                format!("Failed to serialize the summaries of job {job_id}"),
                e,
            ))
        })?;

        self.transport.send(
            MASTER_RANK,
            Message::JobSuccess {
                job_id,
                n_results: blobs.len(),
            },
        )?;
        let nodes = match self.transport.recv_from(MASTER_RANK).await? {
            Message::ArchivalAssignment { nodes, .. } if nodes.len() == blobs.len() => nodes,
            Message::ArchivalAssignment { nodes, .. } => {
                return Err(self.escalate(DistributorError::Internal(format!(
                    "job {job_id} produced {} results but was given {} archive assignments",
                    blobs.len(),
                    nodes.len()
                ))))
            }
            other => {
                return Err(self.escalate(DistributorError::Protocol {
                    rank: self.rank(),
                    from: MASTER_RANK,
                    opcode: other.opcode(),
                    context: format!(" while waiting for archive assignments for job {job_id}"),
                }))
            }
        };

        for (index, (blob, node)) in blobs.into_iter().zip(nodes).enumerate() {
            let result_id = JobResultId::new(job_id, index as u64 + 1);
            self.transport.send(
                node,
                Message::ArchiveJobResult {
                    result_id,
                    job_and_result: blob,
                },
            )?;
            match self.transport.recv_from(node).await? {
                Message::ArchivalCompleted { result_id: acked } if acked == result_id => {
                    tracing::debug!(%result_id, archive = node, "Result archived");
                }
                Message::Error { message } => {
                    return Err(self.escalate(DistributorError::Remote { node, message }))
                }
                other => {
                    return Err(self.escalate(DistributorError::Protocol {
                        rank: self.rank(),
                        from: node,
                        opcode: other.opcode(),
                        context: format!(" while waiting for archival of {result_id}"),
                    }))
                }
            }
        }

        self.transport.send(
            MASTER_RANK,
            Message::JobSuccessAndArchivalComplete {
                job_id,
                status: output.status,
                summaries,
            },
        )?;
        tracing::info!(job_id, results = output.results.len(), "Job completed");
        Ok(())
    }
}
