//! Master role: the single coordinator of a run.
//!
//! The master owns every piece of scheduling state: the job extractor, the
//! map from job results to the node holding them, the two load-balancing
//! heaps and the output queues. Other nodes only ever see the instructions
//! it sends.
//!
//! # Placement and output
//!
//! Each new result goes to the node holding the fewest results
//! (`results_held`). Results chosen for output are written by the archive
//! holding them when it is free, and queued otherwise. An outputter that
//! asks for work takes from the longest queue (`output_backlog`, which
//! stores negated queue lengths so the min-heap head is the longest queue).
//!
//! An archive is only ever told to fetch a result from another archive once
//! every job has finished and been archived. Before that point a fetch could
//! wait on an archive that is itself waiting, and the group would hang.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::store::{ResultStore, StorageMode, StoreSnapshot};
use crate::checkpoint::{self, file_for_node, CheckpointError, Checkpointer};
use crate::config::{DistributorConfig, Topology};
use crate::error::{DistributorError, Result};
use crate::payload::{Payload, PayloadRegistry};
use crate::protocol::codec::{decode_payloads, encode_larval_job, encode_payloads};
use crate::protocol::Message;
use crate::queen::JobQueen;
use crate::scheduler::heap::IndexedHeap;
use crate::scheduler::job::{JobResultId, JobStatus, LarvalJob, OutputSpecification};
use crate::scheduler::queue::JobExtractor;
use crate::transport::{Envelope, NodeRank, Transport, MASTER_RANK};

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_previously_executed: u64,
    pub results_output: u64,
    pub results_discarded: u64,
    pub checkpoints_written: u64,
    pub restored_from: Option<u64>,
    /// Results still recorded per holding node when the run ended.
    pub remaining_results: BTreeMap<NodeRank, usize>,
    /// Load counts per holding node when the run ended.
    pub results_held: BTreeMap<NodeRank, i64>,
}

/// The master's part of a checkpoint generation.
///
/// Which worker runs which job, the spun-down set and undelivered
/// deallocation messages are left out: none of them survive a restart.
#[derive(Debug, Serialize, Deserialize)]
struct MasterCheckpoint {
    created_at: DateTime<Utc>,
    generation: u64,
    n_archives: usize,
    queen_state: Vec<u8>,
    extractor: JobExtractor,
    store: StoreSnapshot,
    locations: BTreeMap<JobResultId, NodeRank>,
    results_held: IndexedHeap,
    output_backlog: IndexedHeap,
    archive_output_queues: BTreeMap<NodeRank, VecDeque<OutputSpecification>>,
    master_output_queue: VecDeque<OutputSpecification>,
    in_flight: BTreeMap<u64, LarvalJob>,
    summary: RunSummary,
}

/// Deallocation messages not yet delivered to every worker.
#[derive(Debug, Default)]
struct DeallocationLedger {
    pending: Vec<(Vec<u8>, BTreeSet<NodeRank>)>,
}

impl DeallocationLedger {
    fn add(&mut self, messages: Vec<u8>, recipients: BTreeSet<NodeRank>) {
        if !recipients.is_empty() {
            self.pending.push((messages, recipients));
        }
    }

    /// Everything `worker` has not seen yet, oldest first.
    fn take_for(&mut self, worker: NodeRank) -> Vec<Vec<u8>> {
        let due = self
            .pending
            .iter_mut()
            .filter_map(|(messages, recipients)| {
                recipients.remove(&worker).then(|| messages.clone())
            })
            .collect();
        self.pending.retain(|(_, recipients)| !recipients.is_empty());
        due
    }

    fn forget(&mut self, worker: NodeRank) {
        for (_, recipients) in &mut self.pending {
            recipients.remove(&worker);
        }
        self.pending.retain(|(_, recipients)| !recipients.is_empty());
    }
}

enum Assignment {
    Assigned,
    NothingYet,
    NoMoreWork,
}

pub struct Master<T: Transport> {
    transport: T,
    queen: Box<dyn JobQueen>,
    registry: Arc<PayloadRegistry>,
    topology: Topology,
    extractor: JobExtractor,
    store: ResultStore,
    checkpointer: Checkpointer,

    locations: BTreeMap<JobResultId, NodeRank>,
    results_held: IndexedHeap,
    output_backlog: IndexedHeap,
    archive_output_queues: BTreeMap<NodeRank, VecDeque<OutputSpecification>>,
    master_output_queue: VecDeque<OutputSpecification>,
    outputting_archives: BTreeSet<NodeRank>,
    /// Node writing an output, mapped to the node whose result it is.
    outputting_for: BTreeMap<NodeRank, NodeRank>,

    in_flight: BTreeMap<u64, LarvalJob>,
    worker_for_job: BTreeMap<u64, NodeRank>,
    idle_workers: VecDeque<NodeRank>,
    spun_down: BTreeSet<NodeRank>,
    deallocations: DeallocationLedger,
    summary: RunSummary,
}

impl<T: Transport> Master<T> {
    pub fn new(
        transport: T,
        queen: Box<dyn JobQueen>,
        registry: Arc<PayloadRegistry>,
        config: &DistributorConfig,
    ) -> Self {
        let topology = Topology::new(config, transport.size());

        let mut results_held = IndexedHeap::with_keys(topology.archive_ranks());
        let store = if topology.store_on_master() {
            results_held.insert(MASTER_RANK, 0);
            ResultStore::new(StorageMode::from_directory(
                config.archive.directory.as_deref(),
            ))
        } else {
            ResultStore::in_memory()
        };

        Self {
            transport,
            queen,
            registry,
            extractor: JobExtractor::new(config.job_batch_size),
            store,
            checkpointer: Checkpointer::new(&config.checkpoint, topology.n_archives()),
            locations: BTreeMap::new(),
            results_held,
            output_backlog: IndexedHeap::with_keys(topology.archive_ranks()),
            archive_output_queues: topology
                .archive_ranks()
                .map(|archive| (archive, VecDeque::new()))
                .collect(),
            master_output_queue: VecDeque::new(),
            outputting_archives: BTreeSet::new(),
            outputting_for: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            worker_for_job: BTreeMap::new(),
            idle_workers: VecDeque::new(),
            spun_down: BTreeSet::new(),
            deallocations: DeallocationLedger::default(),
            summary: RunSummary::default(),
            topology,
        }
    }

    /// Run until every job has finished and every output has been written.
    ///
    /// The queen is flushed whether or not the run succeeds.
    pub async fn run(mut self) -> Result<RunSummary> {
        tracing::info!(
            nprocs = self.topology.nprocs(),
            archives = self.topology.n_archives(),
            store_on_master = self.topology.store_on_master(),
            outputters = self.topology.max_outputters(),
            "Master started"
        );

        if let Err(e) = self.go().await {
            tracing::error!(error = %e, "Run failed");
            self.queen.flush();
            return Err(e);
        }

        self.queen.flush();
        let last_written = self.checkpointer.generation().saturating_sub(1);
        if self.checkpointer.enabled() {
            self.checkpointer.delete_generation(last_written);
        }

        for &node in self.locations.values() {
            *self.summary.remaining_results.entry(node).or_default() += 1;
        }
        self.summary.results_held = self.results_held.iter().collect();
        tracing::info!(
            jobs_completed = self.summary.jobs_completed,
            jobs_failed = self.summary.jobs_failed,
            results_output = self.summary.results_output,
            checkpoints = self.summary.checkpoints_written,
            "Master spinning down"
        );
        Ok(self.summary)
    }

    async fn go(&mut self) -> Result<()> {
        if self.topology.store_on_master() {
            self.store.prepare()?;
        }
        match self.checkpointer.find_restore_generation()? {
            Some(generation) => self.restore(generation)?,
            None => self.extractor.initialize(self.queen.as_mut()),
        }

        while self.not_done()? {
            if self.checkpointer.due() {
                self.checkpoint().await?;
                // The checkpoint may have taken the last outstanding message.
                if !self.not_done()? {
                    break;
                }
            }
            let Envelope { source, message } = self.transport.recv_any().await?;
            self.handle_message(source, message)?;
        }

        self.spin_down_all().await
    }

    fn not_done(&mut self) -> Result<bool> {
        let jobs_remaining = self.extractor.not_done(self.queen.as_mut());
        self.note_completed_dag_nodes()?;
        self.assign_jobs_to_idling_nodes()?;
        self.start_idle_archives()?;
        Ok(jobs_remaining || self.outputs_queued() || !self.outputting_for.is_empty())
    }

    fn handle_message(&mut self, source: NodeRank, message: Message) -> Result<()> {
        match message {
            Message::NewJobRequest => self.process_job_request(source),
            Message::JobSuccess { job_id, n_results } => {
                self.process_job_succeeded(source, job_id, n_results)
            }
            Message::JobSuccessAndArchivalComplete {
                job_id,
                status,
                summaries,
            } => self.process_archival_complete(source, job_id, status, &summaries),
            Message::JobFailedDoNotRetry { job_id } => {
                self.process_failed_job(source, job_id, JobStatus::FailedDoNotRetry, None)
            }
            Message::JobFailedBadInput { job_id } => {
                self.process_failed_job(source, job_id, JobStatus::FailedBadInput, None)
            }
            Message::JobFailedRetryLimitExceeded { job_id } => self.process_failed_job(
                source,
                job_id,
                JobStatus::FailedRetryLimitExceeded,
                None,
            ),
            Message::JobFailedWithMessage { job_id, message } => self.process_failed_job(
                source,
                job_id,
                JobStatus::FailedWithException,
                Some(message),
            ),
            Message::ArchiveJobResult {
                result_id,
                job_and_result,
            } => {
                self.store.save(result_id, job_and_result)?;
                tracing::debug!(%result_id, worker = source, "Stored job result on master");
                self.transport
                    .send(source, Message::ArchivalCompleted { result_id })?;
                Ok(())
            }
            Message::RetrieveJobResult { result_id } => self.serve_result(source, result_id),
            Message::OutputCompleted => self.process_output_complete(source),
            Message::FailedToRetrieveJobResult {
                result_id,
                requesting_node,
            } => Err(self.failed_retrieval(source, result_id, requesting_node)),
            Message::Error { message } => Err(DistributorError::Remote {
                node: source,
                message,
            }),
            other => Err(self.protocol_violation(source, &other, "")),
        }
    }

    fn protocol_violation(&self, source: NodeRank, message: &Message, context: &str) -> DistributorError {
        DistributorError::Protocol {
            rank: MASTER_RANK,
            from: source,
            opcode: message.opcode(),
            context: context.to_string(),
        }
    }

    // ---------------------------------------------------------------------
    // Job dispatch
    // ---------------------------------------------------------------------

    fn process_job_request(&mut self, worker: NodeRank) -> Result<()> {
        match self.try_assign(worker)? {
            Assignment::Assigned => {}
            Assignment::NothingYet => {
                tracing::debug!(worker, "No job ready; worker waits");
                self.idle_workers.push_back(worker);
            }
            Assignment::NoMoreWork => self.spin_down_worker(worker)?,
        }
        Ok(())
    }

    fn try_assign(&mut self, worker: NodeRank) -> Result<Assignment> {
        if self.topology.is_outputter(worker) && self.send_output_instruction(worker)? {
            return Ok(Assignment::Assigned);
        }
        if self.send_next_job(worker)? {
            return Ok(Assignment::Assigned);
        }
        if self.extractor.complete() {
            Ok(Assignment::NoMoreWork)
        } else {
            Ok(Assignment::NothingYet)
        }
    }

    fn assign_jobs_to_idling_nodes(&mut self) -> Result<()> {
        let mut still_idle = VecDeque::new();
        while let Some(worker) = self.idle_workers.pop_front() {
            match self.try_assign(worker)? {
                Assignment::Assigned => {}
                Assignment::NothingYet => still_idle.push_back(worker),
                Assignment::NoMoreWork => self.spin_down_worker(worker)?,
            }
        }
        self.idle_workers = still_idle;
        Ok(())
    }

    fn spin_down_worker(&mut self, worker: NodeRank) -> Result<()> {
        self.transport.send(worker, Message::SpinDown)?;
        self.spun_down.insert(worker);
        self.deallocations.forget(worker);
        tracing::debug!(worker, "Spun down worker");
        Ok(())
    }

    /// Hand the next runnable job to `worker`. Returns false if none is ready.
    fn send_next_job(&mut self, worker: NodeRank) -> Result<bool> {
        while let Some(job) = self.extractor.pop_job(self.queen.as_mut()) {
            let job_id = job.job_index;
            if self.queen.has_job_previously_been_output(&job) {
                tracing::debug!(job_id, "Skipping job output by an earlier run");
                self.queen
                    .note_job_completed(&job, JobStatus::PreviouslyExecuted, 0);
                self.summary.jobs_previously_executed += 1;
                self.extractor
                    .note_job_no_longer_running(job_id, self.queen.as_mut());
                continue;
            }
            if let Some(&running_on) = self.worker_for_job.get(&job_id) {
                return Err(DistributorError::Internal(format!(
                    "job {job_id} was about to be sent to node {worker} while it is still running on node {running_on}"
                )));
            }

            let input_locations = job
                .inputs
                .iter()
                .map(|&result_id| {
                    self.locations.get(&result_id).copied().ok_or_else(|| {
                        DistributorError::UnknownResult {
                            result_id,
                            action: format!("use as an input to job {job_id}"),
                        }
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let larval_job = encode_larval_job(&job).map_err(|e| {
                DistributorError::serialization(format!("Failed to serialize larval job {job_id}"), e)
            })?;

            // A node may have completed while skipping jobs above.
            self.note_completed_dag_nodes()?;
            for messages in self.deallocations.take_for(worker) {
                self.transport
                    .send(worker, Message::DeallocationMessage { messages })?;
            }
            self.transport.send(
                worker,
                Message::NewJobAvailable {
                    job_id,
                    larval_job,
                    input_locations,
                },
            )?;
            tracing::info!(job_id, worker, inputs = job.inputs.len(), "Dispatched job");
            self.in_flight.insert(job_id, job);
            self.worker_for_job.insert(job_id, worker);
            return Ok(true);
        }
        Ok(false)
    }

    fn note_completed_dag_nodes(&mut self) -> Result<()> {
        if !self.extractor.take_node_recently_completed() {
            return Ok(());
        }
        let messages = self.queen.deallocation_messages();
        if messages.is_empty() {
            return Ok(());
        }
        let refs: Vec<&dyn Payload> = messages.iter().map(|message| message.as_ref()).collect();
        let bytes = encode_payloads(&refs).map_err(|e| {
            DistributorError::serialization("Failed to serialize deallocation messages", e)
        })?;
        let recipients: BTreeSet<NodeRank> = self
            .topology
            .worker_ranks()
            .filter(|worker| !self.spun_down.contains(worker))
            .collect();
        tracing::debug!(count = messages.len(), workers = recipients.len(), "Queued deallocation messages");
        self.deallocations.add(bytes, recipients);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Completion
    // ---------------------------------------------------------------------

    /// First phase of completion: choose where each result will live.
    fn process_job_succeeded(&mut self, worker: NodeRank, job_id: u64, n_results: usize) -> Result<()> {
        if !self.in_flight.contains_key(&job_id) {
            return Err(DistributorError::Internal(format!(
                "node {worker} reported success of job {job_id}, which is not running"
            )));
        }
        let mut nodes = Vec::with_capacity(n_results);
        for index in 1..=n_results as u64 {
            let node = self.results_held.head().ok_or_else(|| {
                DistributorError::Internal("no node is available to hold job results".to_string())
            })?;
            self.results_held.adjust(node, 1);
            let result_id = JobResultId::new(job_id, index);
            if let Some(previous) = self.locations.insert(result_id, node) {
                return Err(DistributorError::Internal(format!(
                    "job result {result_id} was already recorded on node {previous}"
                )));
            }
            nodes.push(node);
        }
        tracing::debug!(job_id, ?nodes, "Assigned archives for job results");
        self.transport
            .send(worker, Message::ArchivalAssignment { job_id, nodes })?;
        Ok(())
    }

    /// Second phase: every result is stored, so the queen may hear about it.
    fn process_archival_complete(
        &mut self,
        worker: NodeRank,
        job_id: u64,
        status: JobStatus,
        summaries: &[u8],
    ) -> Result<()> {
        let job = self.take_in_flight(worker, job_id)?;
        let summaries = decode_payloads(&self.registry, summaries).map_err(|e| {
            DistributorError::serialization(
                format!("Failed to deserialize the summaries of job {job_id}"),
                e,
            )
        })?;

        self.queen.note_job_completed(&job, status, summaries.len());
        for (index, summary) in summaries.into_iter().enumerate() {
            self.queen
                .completed_job_summary(&job, index as u64 + 1, summary);
        }
        self.summary.jobs_completed += 1;
        tracing::info!(job_id, worker, %status, "Job completed");

        self.extractor
            .note_job_no_longer_running(job_id, self.queen.as_mut());
        self.potentially_output()?;
        self.potentially_discard()
    }

    fn process_failed_job(
        &mut self,
        worker: NodeRank,
        job_id: u64,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<()> {
        let job = self.take_in_flight(worker, job_id)?;
        tracing::warn!(job_id, worker, %status, message = message.as_deref().unwrap_or(""), "Job failed");
        self.queen.note_job_completed(&job, status, 0);
        self.summary.jobs_failed += 1;
        self.extractor
            .note_job_no_longer_running(job_id, self.queen.as_mut());
        self.potentially_output()?;
        self.potentially_discard()
    }

    fn take_in_flight(&mut self, worker: NodeRank, job_id: u64) -> Result<LarvalJob> {
        self.worker_for_job.remove(&job_id);
        self.in_flight.remove(&job_id).ok_or_else(|| {
            DistributorError::Internal(format!(
                "node {worker} reported completion of job {job_id}, which is not running"
            ))
        })
    }

    // ---------------------------------------------------------------------
    // Results held on the master
    // ---------------------------------------------------------------------

    fn serve_result(&mut self, requester: NodeRank, result_id: JobResultId) -> Result<()> {
        match self.store.get(result_id) {
            Ok(job_and_result) => {
                self.transport.send(
                    requester,
                    Message::JobResultRetrieved {
                        result_id,
                        job_and_result,
                    },
                )?;
                Ok(())
            }
            Err(_) => {
                self.transport.send(
                    requester,
                    Message::FailedToRetrieveJobResult {
                        result_id,
                        requesting_node: requester,
                    },
                )?;
                Err(self.missing_result(result_id, MASTER_RANK, requester))
            }
        }
    }

    /// A failed retrieval is reported by the holder, or by an outputter whose
    /// fetch came back empty. In the second case the holder is the node the
    /// output was assigned from.
    fn failed_retrieval(&self, source: NodeRank, result_id: JobResultId, requester: NodeRank) -> DistributorError {
        let holder = if source == requester {
            self.outputting_for.get(&source).copied().unwrap_or(source)
        } else {
            source
        };
        self.missing_result(result_id, holder, requester)
    }

    fn missing_result(&self, result_id: JobResultId, holder: NodeRank, requester: NodeRank) -> DistributorError {
        let diagnosis = if let Some(&worker) = self.worker_for_job.get(&result_id.job_id) {
            format!("Master thinks that this job is still running on node {worker}")
        } else if let Some(&node) = self.locations.get(&result_id) {
            format!("Master thinks the result should have been on node {node}")
        } else {
            "Master has no record of this result; it perhaps has been output or discarded already"
                .to_string()
        };
        DistributorError::MissingResult {
            result_id,
            archive: holder,
            requester,
            diagnosis,
        }
    }

    // ---------------------------------------------------------------------
    // Output and discard
    // ---------------------------------------------------------------------

    fn outputs_queued(&self) -> bool {
        !self.master_output_queue.is_empty()
            || self.archive_output_queues.values().any(|queue| !queue.is_empty())
    }

    fn cross_archive_output_allowed(&self) -> bool {
        self.extractor.complete() && self.in_flight.is_empty()
    }

    fn sync_backlog(&mut self, archive: NodeRank) {
        let queued = self
            .archive_output_queues
            .get(&archive)
            .map_or(0, VecDeque::len);
        self.output_backlog.update(archive, -(queued as i64));
    }

    fn begin_output(&mut self, node: NodeRank, source: NodeRank) {
        self.outputting_for.insert(node, source);
        if self.topology.is_archive(node) {
            self.outputting_archives.insert(node);
        }
    }

    fn finish_output(&mut self, node: NodeRank) -> Result<()> {
        let source = self.outputting_for.remove(&node).ok_or_else(|| {
            self.protocol_violation(node, &Message::OutputCompleted, " (no output was assigned to it)")
        })?;
        self.outputting_archives.remove(&node);
        self.results_held.adjust(source, -1);
        self.summary.results_output += 1;
        Ok(())
    }

    fn process_output_complete(&mut self, node: NodeRank) -> Result<()> {
        self.finish_output(node)?;
        tracing::debug!(node, "Output completed");
        if self.topology.is_archive(node) {
            self.continue_output(node)?;
        }
        Ok(())
    }

    /// Give an idle archive its next output task, if any.
    fn continue_output(&mut self, archive: NodeRank) -> Result<()> {
        if self.outputting_archives.contains(&archive) {
            return Ok(());
        }
        let next = self
            .archive_output_queues
            .get_mut(&archive)
            .and_then(VecDeque::pop_front);
        match next {
            Some(spec) => {
                self.sync_backlog(archive);
                tracing::debug!(result_id = %spec.result_id, archive, "Archive outputs held result");
                self.transport
                    .send(archive, Message::OutputJobResultAlreadyAvailable { spec })?;
                self.begin_output(archive, archive);
            }
            None => {
                self.send_output_instruction(archive)?;
            }
        }
        Ok(())
    }

    fn start_idle_archives(&mut self) -> Result<()> {
        if !self.outputs_queued() {
            return Ok(());
        }
        let archives: Vec<NodeRank> = self.topology.archive_ranks().collect();
        for archive in archives {
            self.continue_output(archive)?;
        }
        Ok(())
    }

    /// Give `node` an output task held elsewhere. Returns false if none can be
    /// given right now.
    fn send_output_instruction(&mut self, node: NodeRank) -> Result<bool> {
        if let Some(spec) = self.master_output_queue.pop_front() {
            let job_and_result = self.store.take(spec.result_id)?;
            tracing::debug!(result_id = %spec.result_id, node, "Sending master-held result for output");
            self.transport.send(
                node,
                Message::AcceptAndOutputJobResult {
                    spec,
                    job_and_result,
                },
            )?;
            self.begin_output(node, MASTER_RANK);
            return Ok(true);
        }

        if self.topology.is_archive(node) && !self.cross_archive_output_allowed() {
            return Ok(false);
        }
        let Some(archive) = self.output_backlog.head() else {
            return Ok(false);
        };
        if self.output_backlog.priority(archive).unwrap_or(0) >= 0 {
            return Ok(false);
        }
        let Some(spec) = self
            .archive_output_queues
            .get_mut(&archive)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(false);
        };
        self.sync_backlog(archive);
        tracing::debug!(result_id = %spec.result_id, node, archive, "Sending output task for result on archive");
        self.transport
            .send(node, Message::OutputJobResultOnArchive { archive, spec })?;
        self.begin_output(node, archive);
        Ok(true)
    }

    fn first_idle_archive(&self) -> Option<NodeRank> {
        self.topology
            .archive_ranks()
            .find(|archive| !self.outputting_archives.contains(archive))
    }

    fn potentially_output(&mut self) -> Result<()> {
        for spec in self.queen.jobs_that_should_be_output() {
            let result_id = spec.result_id;
            let location =
                self.locations
                    .remove(&result_id)
                    .ok_or_else(|| DistributorError::UnknownResult {
                        result_id,
                        action: "output".to_string(),
                    })?;

            if location == MASTER_RANK {
                match self.first_idle_archive() {
                    Some(archive) => {
                        let job_and_result = self.store.take(result_id)?;
                        self.transport.send(
                            archive,
                            Message::AcceptAndOutputJobResult {
                                spec,
                                job_and_result,
                            },
                        )?;
                        self.begin_output(archive, MASTER_RANK);
                    }
                    None => self.master_output_queue.push_back(spec),
                }
            } else if !self.outputting_archives.contains(&location) {
                self.transport
                    .send(location, Message::OutputJobResultAlreadyAvailable { spec })?;
                self.begin_output(location, location);
            } else {
                self.archive_output_queues
                    .entry(location)
                    .or_default()
                    .push_back(spec);
                self.sync_backlog(location);
            }
            tracing::info!(%result_id, holder = location, "Scheduled job result for output");
        }

        // Outputter workers waiting for work can take the new tasks.
        let idle: Vec<NodeRank> = self.idle_workers.iter().copied().collect();
        for worker in idle {
            if !self.outputs_queued() {
                break;
            }
            if self.topology.is_outputter(worker) && self.send_output_instruction(worker)? {
                self.idle_workers.retain(|&w| w != worker);
            }
        }
        Ok(())
    }

    fn potentially_discard(&mut self) -> Result<()> {
        for result_id in self.queen.job_results_that_should_be_discarded() {
            let location =
                self.locations
                    .remove(&result_id)
                    .ok_or_else(|| DistributorError::UnknownResult {
                        result_id,
                        action: "discard".to_string(),
                    })?;
            if location == MASTER_RANK {
                self.store.discard(result_id);
            } else {
                self.transport
                    .send(location, Message::DiscardJobResult { result_id })?;
            }
            self.results_held.adjust(location, -1);
            self.summary.results_discarded += 1;
            tracing::debug!(%result_id, holder = location, "Discarded job result");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Checkpoint and restore
    // ---------------------------------------------------------------------

    async fn checkpoint(&mut self) -> Result<()> {
        let generation = self.checkpointer.generation();
        self.checkpointer.ensure_directory()?;
        if generation == 1 {
            self.checkpointer.write_sanity_file()?;
        } else if let Err(e) = self.checkpointer.sanity_check() {
            tracing::warn!(generation, error = %e, "Skipping checkpoint");
            self.checkpointer.reset_timer();
            return Ok(());
        }

        let prefix = self.checkpointer.prefix();
        let archives: Vec<NodeRank> = self.topology.archive_ranks().collect();
        let mut paused = Vec::new();
        for &archive in &archives {
            if self.outputting_archives.contains(&archive) {
                self.await_output_completion(archive).await?;
                paused.push(archive);
            }
            self.transport.send(
                archive,
                Message::BeginCheckpointing {
                    prefix: prefix.clone(),
                },
            )?;
        }

        let snapshot = self.snapshot(generation)?;
        checkpoint::write_atomically(&file_for_node(&prefix, MASTER_RANK), &snapshot)?;

        for &archive in &archives {
            match self.transport.recv_from(archive).await? {
                Message::CheckpointingComplete => {}
                Message::Error { message } => {
                    return Err(DistributorError::Remote {
                        node: archive,
                        message,
                    })
                }
                other => {
                    return Err(self.protocol_violation(
                        archive,
                        &other,
                        " while waiting for the archive to checkpoint",
                    ))
                }
            }
        }

        self.checkpointer.delete_generation(generation.saturating_sub(1));
        self.checkpointer.advance();
        self.summary.checkpoints_written += 1;
        tracing::info!(generation, prefix = %prefix, "Checkpoint written");

        for archive in paused {
            self.continue_output(archive)?;
        }
        Ok(())
    }

    async fn await_output_completion(&mut self, archive: NodeRank) -> Result<()> {
        match self.transport.recv_from(archive).await? {
            Message::OutputCompleted => self.finish_output(archive),
            Message::Error { message } => Err(DistributorError::Remote {
                node: archive,
                message,
            }),
            Message::FailedToRetrieveJobResult {
                result_id,
                requesting_node,
            } => Err(self.failed_retrieval(archive, result_id, requesting_node)),
            other => Err(self.protocol_violation(
                archive,
                &other,
                " while waiting for output to finish before a checkpoint",
            )),
        }
    }

    fn snapshot(&self, generation: u64) -> Result<MasterCheckpoint> {
        let queen_state = self.queen.save_state().map_err(|e| {
            DistributorError::serialization("Failed to save the job queen's state for a checkpoint", e)
        })?;
        // Outputs still being written by workers are not re-issued after a
        // restore, so their results no longer count as held.
        let mut results_held = self.results_held.clone();
        for &source in self.outputting_for.values() {
            results_held.adjust(source, -1);
        }
        Ok(MasterCheckpoint {
            created_at: Utc::now(),
            generation,
            n_archives: self.topology.n_archives(),
            queen_state,
            extractor: self.extractor.clone(),
            store: self.store.snapshot()?,
            locations: self.locations.clone(),
            results_held,
            output_backlog: self.output_backlog.clone(),
            archive_output_queues: self.archive_output_queues.clone(),
            master_output_queue: self.master_output_queue.clone(),
            in_flight: self.in_flight.clone(),
            summary: self.summary.clone(),
        })
    }

    /// Results node `node` must keep: everything located there plus anything
    /// queued to be output from it.
    fn keep_list(&self, node: NodeRank) -> Vec<JobResultId> {
        let queued = if node == MASTER_RANK {
            Some(&self.master_output_queue)
        } else {
            self.archive_output_queues.get(&node)
        };
        let keep: BTreeSet<JobResultId> = self
            .locations
            .iter()
            .filter(|(_, &holder)| holder == node)
            .map(|(&result_id, _)| result_id)
            .chain(queued.into_iter().flatten().map(|spec| spec.result_id))
            .collect();
        keep.into_iter().collect()
    }

    fn restore(&mut self, generation: u64) -> Result<()> {
        let prefix = self.checkpointer.prefix_for(generation);
        let saved: MasterCheckpoint = checkpoint::read_file(&file_for_node(&prefix, MASTER_RANK))?;
        if saved.n_archives != self.topology.n_archives() {
            return Err(CheckpointError::Restore(format!(
                "checkpoint {generation} was written with {} archive node(s) but this run has {}",
                saved.n_archives,
                self.topology.n_archives()
            ))
            .into());
        }
        self.queen.restore_state(&saved.queen_state).map_err(|e| {
            DistributorError::serialization(
                format!("Failed to restore the job queen's state from checkpoint {generation}"),
                e,
            )
        })?;

        self.extractor = saved.extractor;
        self.locations = saved.locations;
        self.results_held = saved.results_held;
        self.output_backlog = saved.output_backlog;
        self.archive_output_queues = saved.archive_output_queues;
        self.master_output_queue = saved.master_output_queue;
        self.summary = saved.summary;

        // Jobs that were running may not have finished archiving; run them again.
        let requeued: BTreeSet<u64> = saved.in_flight.keys().copied().collect();
        for (_, job) in saved.in_flight.into_iter().rev() {
            self.extractor.requeue_front(job);
        }
        let results_held = &mut self.results_held;
        self.locations.retain(|result_id, &mut holder| {
            if requeued.contains(&result_id.job_id) {
                results_held.adjust(holder, -1);
                false
            } else {
                true
            }
        });

        if self.topology.store_on_master() {
            let keep = self.keep_list(MASTER_RANK);
            self.store.restore_selected(saved.store, &keep)?;
        }
        let archives: Vec<NodeRank> = self.topology.archive_ranks().collect();
        for &archive in &archives {
            let keep = self.keep_list(archive);
            self.transport.send(
                archive,
                Message::RestoreFromCheckpoint {
                    prefix: prefix.clone(),
                    keep,
                },
            )?;
        }

        self.checkpointer.set_generation(generation + 1);
        self.checkpointer.reset_timer();
        self.summary.restored_from = Some(generation);
        tracing::info!(
            generation,
            created_at = %saved.created_at,
            requeued = requeued.len(),
            results = self.locations.len(),
            "Restored from checkpoint"
        );

        for archive in archives {
            self.continue_output(archive)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    async fn spin_down_all(&mut self) -> Result<()> {
        while let Some(worker) = self.idle_workers.pop_front() {
            self.spin_down_worker(worker)?;
        }

        let workers: Vec<NodeRank> = self.topology.worker_ranks().collect();
        while workers.iter().any(|worker| !self.spun_down.contains(worker)) {
            let Envelope { source, message } = self.transport.recv_any().await?;
            match message {
                Message::NewJobRequest => self.spin_down_worker(source)?,
                Message::Error { message } => {
                    return Err(DistributorError::Remote {
                        node: source,
                        message,
                    })
                }
                other => {
                    return Err(self.protocol_violation(
                        source,
                        &other,
                        " in the worker/outputter spin-down loop",
                    ))
                }
            }
        }

        for archive in self.topology.archive_ranks() {
            self.transport.send(archive, Message::SpinDown)?;
        }
        tracing::debug!("Spun down every node");
        Ok(())
    }
}
