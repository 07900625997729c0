//! Interfaces the distributor needs from the application.
//!
//! The [`JobQueen`] decides what work exists, turns larval jobs into runnable
//! [`Job`]s, and decides which results get output or discarded. Every process
//! constructs its own queen; only the master's instance sees completions and
//! summaries.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::payload::{Payload, PayloadError, PayloadRegistry};
use crate::scheduler::dag::{DagNodeId, JobDagUpdater, JobDigraph};
use crate::scheduler::job::{JobResultId, JobStatus, LarvalJob, OutputSpecification};

/// Errors raised while maturing or running a job.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("no outputter named {0:?}")]
    UnknownOutputter(String),

    #[error("failed to write output to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output of job result {result_id} failed: {message}")]
    Rejected {
        result_id: JobResultId,
        message: String,
    },
}

/// One result of a finished job plus its summary.
#[derive(Debug)]
pub struct SummaryAndResult {
    pub summary: Box<dyn Payload>,
    pub result: Box<dyn Payload>,
}

#[derive(Debug)]
pub struct CompletedJobOutput {
    pub status: JobStatus,
    pub results: Vec<SummaryAndResult>,
}

impl CompletedJobOutput {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            results: Vec::new(),
        }
    }

    pub fn with_result(mut self, summary: impl Payload, result: impl Payload) -> Self {
        self.results.push(SummaryAndResult {
            summary: Box::new(summary),
            result: Box::new(result),
        });
        self
    }
}

pub trait Job: Send {
    fn run(&mut self) -> Result<CompletedJobOutput, JobError>;
}

/// Writes finished results somewhere durable.
pub trait ResultOutputter: Send {
    fn write_output(
        &mut self,
        spec: &OutputSpecification,
        job: &LarvalJob,
        result: &dyn Payload,
    ) -> Result<(), OutputError>;
}

pub trait JobQueen: Send + 'static {
    /// Register every payload type this queen's jobs produce or consume.
    fn register_payloads(&self, registry: &mut PayloadRegistry);

    fn initial_job_dag(&mut self) -> JobDigraph;

    /// Called each time a DAG node completes. May add nodes and edges.
    fn update_job_dag(&mut self, _updater: &mut JobDagUpdater<'_>) {}

    /// Up to `max_jobs` further jobs for `node`. An empty list means the node
    /// has no more jobs to hand out.
    fn determine_job_list(&mut self, node: DagNodeId, max_jobs: usize) -> Vec<LarvalJob>;

    fn has_job_previously_been_output(&mut self, _job: &LarvalJob) -> bool {
        false
    }

    fn mature_larval_job(
        &mut self,
        job: &LarvalJob,
        inputs: &[Arc<dyn Payload>],
    ) -> Result<Box<dyn Job>, JobError>;

    fn note_job_completed(&mut self, job: &LarvalJob, status: JobStatus, n_results: usize);

    fn completed_job_summary(
        &mut self,
        job: &LarvalJob,
        result_index: u64,
        summary: Box<dyn Payload>,
    );

    fn jobs_that_should_be_output(&mut self) -> Vec<OutputSpecification>;

    fn job_results_that_should_be_discarded(&mut self) -> Vec<JobResultId>;

    fn result_outputter(
        &mut self,
        spec: &OutputSpecification,
    ) -> Result<Box<dyn ResultOutputter>, OutputError>;

    /// Messages every worker must see before its next job.
    fn deallocation_messages(&mut self) -> Vec<Box<dyn Payload>> {
        Vec::new()
    }

    fn process_deallocation_message(&mut self, _message: Box<dyn Payload>) {}

    /// State written into master checkpoints. Stateless queens keep the default.
    fn save_state(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(Vec::new())
    }

    fn restore_state(&mut self, _state: &[u8]) -> Result<(), PayloadError> {
        Ok(())
    }

    fn flush(&mut self) {}
}
