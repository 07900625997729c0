use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identifies one of the results produced by a job. Result indices start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobResultId {
    pub job_id: u64,
    pub result_index: u64,
}

impl JobResultId {
    pub fn new(job_id: u64, result_index: u64) -> Self {
        Self {
            job_id,
            result_index,
        }
    }
}

impl fmt::Display for JobResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.job_id, self.result_index)
    }
}

/// Final outcome of a job as reported to the job queen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Success,
    /// Only ever seen inside a worker's retry loop.
    FailedRetry,
    FailedDoNotRetry,
    FailedBadInput,
    FailedRetryLimitExceeded,
    FailedWithException,
    PreviouslyExecuted,
}

impl JobStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, JobStatus::Success | JobStatus::PreviouslyExecuted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Success => write!(f, "success"),
            JobStatus::FailedRetry => write!(f, "failed-retry"),
            JobStatus::FailedDoNotRetry => write!(f, "failed-do-not-retry"),
            JobStatus::FailedBadInput => write!(f, "failed-bad-input"),
            JobStatus::FailedRetryLimitExceeded => write!(f, "failed-retry-limit-exceeded"),
            JobStatus::FailedWithException => write!(f, "failed-with-exception"),
            JobStatus::PreviouslyExecuted => write!(f, "previously-executed"),
        }
    }
}

/// Lightweight description of a job, created by the job queen and matured
/// into something runnable on a worker.
///
/// `inner` carries whatever the queen needs to rebuild the job; the
/// distributor only reads the index and the input list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LarvalJob {
    pub job_index: u64,
    pub nstruct_index: u64,
    pub nstruct_max: u64,
    pub inputs: Vec<JobResultId>,
    pub retry_limit: Option<u32>,
    pub inner: Vec<u8>,
}

impl LarvalJob {
    pub fn new(job_index: u64, nstruct_index: u64, nstruct_max: u64) -> Self {
        Self {
            job_index,
            nstruct_index,
            nstruct_max,
            inputs: Vec::new(),
            retry_limit: None,
            inner: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: JobResultId) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    /// Attach queen-specific data to the job.
    pub fn with_inner<T: Serialize>(mut self, inner: &T) -> Result<Self, bincode::Error> {
        self.inner = bincode::serialize(inner)?;
        Ok(self)
    }

    pub fn inner_as<T: DeserializeOwned>(&self) -> Result<T, bincode::Error> {
        bincode::deserialize(&self.inner)
    }
}

/// Output slot for a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputIndex {
    pub primary: u64,
    pub secondary: u64,
}

/// Tells an outputting node which result to write and through which outputter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpecification {
    pub result_id: JobResultId,
    pub output_index: OutputIndex,
    pub outputter: String,
    /// Set by the outputting node when several nodes write output concurrently.
    pub output_suffix: Option<String>,
    pub details: Vec<u8>,
}

impl OutputSpecification {
    pub fn new(result_id: JobResultId, outputter: impl Into<String>) -> Self {
        Self {
            result_id,
            output_index: OutputIndex::default(),
            outputter: outputter.into(),
            output_suffix: None,
            details: Vec::new(),
        }
    }

    pub fn with_output_index(mut self, primary: u64, secondary: u64) -> Self {
        self.output_index = OutputIndex { primary, secondary };
        self
    }

    pub fn with_details(mut self, details: Vec<u8>) -> Self {
        self.details = details;
        self
    }
}
