use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::payload::Payload;
use crate::queen::{CompletedJobOutput, JobError, JobQueen};
use crate::scheduler::job::{JobStatus, LarvalJob};

/// How a job ended after the worker's retry loop.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(CompletedJobOutput),
    DoNotRetry,
    BadInput(String),
    RetryLimitExceeded,
    Failed(String),
}

/// Matures and runs jobs, retrying the ones that ask for it.
///
/// Panics raised by the queen or the job are caught and turned into a
/// failure carrying the panic message, so one broken job cannot take the
/// worker down with it.
#[derive(Debug, Clone, Copy)]
pub struct JobExecutor {
    default_retry_limit: u32,
}

impl JobExecutor {
    pub fn new(default_retry_limit: u32) -> Self {
        Self {
            default_retry_limit: default_retry_limit.max(1),
        }
    }

    pub fn run(
        &self,
        queen: &mut dyn JobQueen,
        larval: &LarvalJob,
        inputs: &[Arc<dyn Payload>],
    ) -> JobOutcome {
        let job_id = larval.job_index;
        let limit = larval.retry_limit.unwrap_or(self.default_retry_limit).max(1);

        for attempt in 1..=limit {
            let attempted = catch_unwind(AssertUnwindSafe(|| {
                let mut job = queen.mature_larval_job(larval, inputs)?;
                job.run()
            }));
            let output = match attempted {
                Ok(Ok(output)) => output,
                Ok(Err(JobError::BadInput(message))) => return JobOutcome::BadInput(message),
                Ok(Err(e)) => return JobOutcome::Failed(e.to_string()),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::warn!(job_id, attempt, %message, "Job panicked");
                    return JobOutcome::Failed(format!("job {job_id} panicked: {message}"));
                }
            };
            match output.status {
                JobStatus::FailedRetry => {
                    tracing::warn!(job_id, attempt, limit, "Job asked to be retried");
                }
                JobStatus::FailedDoNotRetry => return JobOutcome::DoNotRetry,
                JobStatus::FailedBadInput => {
                    return JobOutcome::BadInput(format!("job {job_id} rejected its input"))
                }
                JobStatus::FailedRetryLimitExceeded => return JobOutcome::RetryLimitExceeded,
                JobStatus::FailedWithException => {
                    return JobOutcome::Failed(format!("job {job_id} reported an exception"))
                }
                JobStatus::Success | JobStatus::PreviouslyExecuted => {
                    return JobOutcome::Completed(output)
                }
            }
        }
        JobOutcome::RetryLimitExceeded
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PayloadRegistry;
    use crate::queen::{Job, OutputError, ResultOutputter};
    use crate::scheduler::dag::{DagNodeId, JobDigraph};
    use crate::scheduler::job::{JobResultId, OutputSpecification};

    /// Reports `statuses` in turn, one per maturation.
    struct ScriptedQueen {
        statuses: Vec<Option<JobStatus>>,
        matured: usize,
    }

    struct ScriptedJob {
        status: Option<JobStatus>,
    }

    impl Job for ScriptedJob {
        fn run(&mut self) -> Result<CompletedJobOutput, JobError> {
            match self.status {
                Some(JobStatus::Success) => {
                    Ok(CompletedJobOutput::new(JobStatus::Success).with_result(1.0f64, 2u32))
                }
                Some(status) => Ok(CompletedJobOutput::new(status)),
                None => panic!("scripted panic"),
            }
        }
    }

    impl JobQueen for ScriptedQueen {
        fn register_payloads(&self, _registry: &mut PayloadRegistry) {}

        fn initial_job_dag(&mut self) -> JobDigraph {
            JobDigraph::with_nodes(1)
        }

        fn determine_job_list(&mut self, _node: DagNodeId, _max: usize) -> Vec<LarvalJob> {
            Vec::new()
        }

        fn mature_larval_job(
            &mut self,
            _job: &LarvalJob,
            _inputs: &[Arc<dyn Payload>],
        ) -> Result<Box<dyn Job>, JobError> {
            let status = self.statuses[self.matured.min(self.statuses.len() - 1)];
            self.matured += 1;
            Ok(Box::new(ScriptedJob { status }))
        }

        fn note_job_completed(&mut self, _job: &LarvalJob, _status: JobStatus, _n: usize) {}

        fn completed_job_summary(&mut self, _job: &LarvalJob, _index: u64, _s: Box<dyn Payload>) {}

        fn jobs_that_should_be_output(&mut self) -> Vec<OutputSpecification> {
            Vec::new()
        }

        fn job_results_that_should_be_discarded(&mut self) -> Vec<JobResultId> {
            Vec::new()
        }

        fn result_outputter(
            &mut self,
            spec: &OutputSpecification,
        ) -> Result<Box<dyn ResultOutputter>, OutputError> {
            Err(OutputError::UnknownOutputter(spec.outputter.clone()))
        }
    }

    fn queen(statuses: Vec<Option<JobStatus>>) -> ScriptedQueen {
        ScriptedQueen {
            statuses,
            matured: 0,
        }
    }

    #[test]
    fn test_retry_then_success() {
        let mut queen = queen(vec![Some(JobStatus::FailedRetry), Some(JobStatus::Success)]);
        let job = LarvalJob::new(1, 1, 1).with_retry_limit(3);
        match JobExecutor::new(1).run(&mut queen, &job, &[]) {
            JobOutcome::Completed(output) => assert_eq!(output.results.len(), 1),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(queen.matured, 2);
    }

    #[test]
    fn test_retry_limit_is_its_own_outcome() {
        let mut queen = queen(vec![Some(JobStatus::FailedRetry)]);
        let outcome = JobExecutor::new(2).run(&mut queen, &LarvalJob::new(1, 1, 1), &[]);
        assert!(matches!(outcome, JobOutcome::RetryLimitExceeded));
        assert_eq!(queen.matured, 2);
    }

    #[test]
    fn test_panic_becomes_failure_with_message() {
        let mut queen = queen(vec![None]);
        let outcome = JobExecutor::new(3).run(&mut queen, &LarvalJob::new(8, 1, 1), &[]);
        match outcome {
            JobOutcome::Failed(message) => assert!(message.contains("scripted panic")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(queen.matured, 1);
    }

    #[test]
    fn test_do_not_retry_stops_immediately() {
        let mut queen = queen(vec![Some(JobStatus::FailedDoNotRetry)]);
        let job = LarvalJob::new(1, 1, 1).with_retry_limit(5);
        let outcome = JobExecutor::new(1).run(&mut queen, &job, &[]);
        assert!(matches!(outcome, JobOutcome::DoNotRetry));
        assert_eq!(queen.matured, 1);
    }
}
