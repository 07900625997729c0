//! Monte-Carlo estimate of pi, used by the binary to drive a full run.
//!
//! The DAG has two nodes. Node 1 holds one sampling job per batch; node 2
//! holds a single reduce job that takes every batch as an input. Once the
//! reduce job has finished, the batches are discarded and the estimate is
//! written out as JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::payload::{Payload, PayloadError, PayloadRegistry};
use crate::queen::{CompletedJobOutput, Job, JobError, JobQueen, OutputError, ResultOutputter};
use crate::scheduler::dag::{DagNodeId, JobDigraph};
use crate::scheduler::job::{JobResultId, JobStatus, LarvalJob, OutputSpecification};

const SAMPLING_NODE: DagNodeId = 1;
const REDUCE_NODE: DagNodeId = 2;
const JSON_OUTPUTTER: &str = "pi-json";

#[derive(Debug, Clone)]
pub struct PiDemo {
    pub batches: u64,
    pub samples_per_batch: u64,
    pub seed: u64,
    pub output_dir: PathBuf,
}

impl Default for PiDemo {
    fn default() -> Self {
        Self {
            batches: 16,
            samples_per_batch: 100_000,
            seed: 42,
            output_dir: PathBuf::from("."),
        }
    }
}

impl PiDemo {
    fn reduce_job_index(&self) -> u64 {
        self.batches + 1
    }

    pub fn output_path(&self, suffix: Option<&str>) -> PathBuf {
        self.output_dir
            .join(format!("pi_estimate{}.json", suffix.unwrap_or("")))
    }
}

/// Points of one batch that fell inside the unit quarter circle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub inside: u64,
    pub samples: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PiEstimate {
    pub estimate: f64,
    pub samples: u64,
    pub batches: u64,
}

/// Sent to every worker once sampling is over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingFinished {
    pub batches: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BatchSpec {
    seed: u64,
    samples: u64,
}

/// What the master-side queen has learned so far. Saved into checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DemoState {
    next_batch: u64,
    reduce_emitted: bool,
    statuses: BTreeMap<u64, JobStatus>,
    batch_results: BTreeSet<u64>,
    estimate: Option<PiEstimate>,
    pending_output: Vec<OutputSpecification>,
    pending_discard: Vec<JobResultId>,
    sampling_announced: bool,
}

pub struct PiQueen {
    demo: Arc<PiDemo>,
    state: DemoState,
}

impl PiQueen {
    pub fn new(demo: Arc<PiDemo>) -> Self {
        Self {
            demo,
            state: DemoState {
                next_batch: 1,
                ..DemoState::default()
            },
        }
    }

    pub fn estimate(&self) -> Option<PiEstimate> {
        self.state.estimate
    }

    fn sampling_finished(&self) -> bool {
        (1..=self.demo.batches).all(|batch| self.state.statuses.contains_key(&batch))
    }
}

struct SamplingJob {
    spec: BatchSpec,
}

impl Job for SamplingJob {
    fn run(&mut self) -> Result<CompletedJobOutput, JobError> {
        let mut rng = StdRng::seed_from_u64(self.spec.seed);
        let inside = (0..self.spec.samples)
            .filter(|_| {
                let x: f64 = rng.gen();
                let y: f64 = rng.gen();
                x * x + y * y <= 1.0
            })
            .count() as u64;
        let batch = SampleBatch {
            inside,
            samples: self.spec.samples,
        };
        Ok(CompletedJobOutput::new(JobStatus::Success).with_result(batch, batch))
    }
}

struct ReduceJob {
    batches: Vec<SampleBatch>,
}

impl Job for ReduceJob {
    fn run(&mut self) -> Result<CompletedJobOutput, JobError> {
        let samples: u64 = self.batches.iter().map(|batch| batch.samples).sum();
        if samples == 0 {
            return Err(JobError::BadInput("no samples to reduce".to_string()));
        }
        let inside: u64 = self.batches.iter().map(|batch| batch.inside).sum();
        let estimate = PiEstimate {
            estimate: 4.0 * inside as f64 / samples as f64,
            samples,
            batches: self.batches.len() as u64,
        };
        Ok(CompletedJobOutput::new(JobStatus::Success).with_result(estimate, estimate))
    }
}

struct JsonOutputter {
    demo: Arc<PiDemo>,
}

impl ResultOutputter for JsonOutputter {
    fn write_output(
        &mut self,
        spec: &OutputSpecification,
        _job: &LarvalJob,
        result: &dyn Payload,
    ) -> Result<(), OutputError> {
        let estimate = result
            .downcast_ref::<PiEstimate>()
            .ok_or_else(|| OutputError::Rejected {
                result_id: spec.result_id,
                message: "expected a pi estimate".to_string(),
            })?;
        let path = self.demo.output_path(spec.output_suffix.as_deref());
        let text = serde_json::to_string_pretty(estimate).map_err(|e| OutputError::Rejected {
            result_id: spec.result_id,
            message: e.to_string(),
        })?;
        fs::write(&path, text).map_err(|source| OutputError::Io { path, source })
    }
}

impl JobQueen for PiQueen {
    fn register_payloads(&self, registry: &mut PayloadRegistry) {
        registry.register::<SampleBatch>();
        registry.register::<PiEstimate>();
        registry.register::<SamplingFinished>();
    }

    fn initial_job_dag(&mut self) -> JobDigraph {
        let mut dag = JobDigraph::with_nodes(2);
        if let Err(e) = dag.add_edge(SAMPLING_NODE, REDUCE_NODE) {
            tracing::error!(error = %e, "Failed to build the demo DAG");
        }
        dag
    }

    fn determine_job_list(&mut self, node: DagNodeId, max_jobs: usize) -> Vec<LarvalJob> {
        match node {
            SAMPLING_NODE => {
                let mut jobs = Vec::new();
                while jobs.len() < max_jobs && self.state.next_batch <= self.demo.batches {
                    let batch = self.state.next_batch;
                    let spec = BatchSpec {
                        seed: self.demo.seed.wrapping_add(batch),
                        samples: self.demo.samples_per_batch,
                    };
                    match LarvalJob::new(batch, batch, self.demo.batches).with_inner(&spec) {
                        Ok(job) => jobs.push(job),
                        Err(e) => tracing::error!(batch, error = %e, "Failed to describe sampling job"),
                    }
                    self.state.next_batch += 1;
                }
                jobs
            }
            REDUCE_NODE if !self.state.reduce_emitted => {
                self.state.reduce_emitted = true;
                let job = self
                    .state
                    .batch_results
                    .iter()
                    .fold(LarvalJob::new(self.demo.reduce_job_index(), 1, 1), |job, &batch| {
                        job.with_input(JobResultId::new(batch, 1))
                    });
                vec![job]
            }
            _ => Vec::new(),
        }
    }

    fn mature_larval_job(
        &mut self,
        job: &LarvalJob,
        inputs: &[Arc<dyn Payload>],
    ) -> Result<Box<dyn Job>, JobError> {
        if job.job_index == self.demo.reduce_job_index() {
            let batches = inputs
                .iter()
                .map(|input| {
                    input
                        .downcast_ref::<SampleBatch>()
                        .copied()
                        .ok_or_else(|| JobError::BadInput("reduce input is not a sample batch".to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Box::new(ReduceJob { batches }));
        }
        let spec: BatchSpec = job
            .inner_as()
            .map_err(|e| JobError::BadInput(format!("unreadable batch description: {e}")))?;
        Ok(Box::new(SamplingJob { spec }))
    }

    fn note_job_completed(&mut self, job: &LarvalJob, status: JobStatus, n_results: usize) {
        self.state.statuses.insert(job.job_index, status);
        if job.job_index == self.demo.reduce_job_index() {
            if status == JobStatus::Success && n_results > 0 {
                self.state.pending_output.push(
                    OutputSpecification::new(JobResultId::new(job.job_index, 1), JSON_OUTPUTTER)
                        .with_output_index(1, 1),
                );
            }
            self.state.pending_discard.extend(
                self.state
                    .batch_results
                    .iter()
                    .map(|&batch| JobResultId::new(batch, 1)),
            );
            self.state.batch_results.clear();
        } else if status == JobStatus::Success && n_results > 0 {
            self.state.batch_results.insert(job.job_index);
        }
    }

    fn completed_job_summary(&mut self, job: &LarvalJob, _result_index: u64, summary: Box<dyn Payload>) {
        if let Some(estimate) = summary.downcast_ref::<PiEstimate>() {
            tracing::info!(job_id = job.job_index, estimate = estimate.estimate, "Pi estimate ready");
            self.state.estimate = Some(*estimate);
        }
    }

    fn jobs_that_should_be_output(&mut self) -> Vec<OutputSpecification> {
        std::mem::take(&mut self.state.pending_output)
    }

    fn job_results_that_should_be_discarded(&mut self) -> Vec<JobResultId> {
        std::mem::take(&mut self.state.pending_discard)
    }

    fn result_outputter(
        &mut self,
        spec: &OutputSpecification,
    ) -> Result<Box<dyn ResultOutputter>, OutputError> {
        match spec.outputter.as_str() {
            JSON_OUTPUTTER => Ok(Box::new(JsonOutputter {
                demo: self.demo.clone(),
            })),
            other => Err(OutputError::UnknownOutputter(other.to_string())),
        }
    }

    fn deallocation_messages(&mut self) -> Vec<Box<dyn Payload>> {
        if self.state.sampling_announced || !self.sampling_finished() {
            return Vec::new();
        }
        self.state.sampling_announced = true;
        vec![Box::new(SamplingFinished {
            batches: self.demo.batches,
        })]
    }

    fn process_deallocation_message(&mut self, message: Box<dyn Payload>) {
        if let Some(finished) = message.downcast_ref::<SamplingFinished>() {
            tracing::debug!(batches = finished.batches, "Sampling stage finished");
        }
    }

    fn save_state(&self) -> Result<Vec<u8>, PayloadError> {
        bincode::serialize(&self.state).map_err(PayloadError::Encode)
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), PayloadError> {
        self.state = bincode::deserialize(state).map_err(|source| PayloadError::Decode {
            what: "pi demo state".to_string(),
            source,
        })?;
        Ok(())
    }

    fn flush(&mut self) {
        let failed = self
            .state
            .statuses
            .values()
            .filter(|status| status.is_failure())
            .count();
        tracing::info!(jobs = self.state.statuses.len(), failed, "Pi demo finished");
    }
}
