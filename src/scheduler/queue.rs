use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::queen::JobQueen;
use crate::scheduler::dag::{DagNodeId, JobDagUpdater, JobDigraph};
use crate::scheduler::job::LarvalJob;

const DEFAULT_BATCH_SIZE: usize = 1000;

/// Pulls jobs out of the queen one DAG node at a time.
///
/// A node's jobs are only requested once all of its predecessors have
/// completed. A node completes when the queen returns no further jobs for it
/// and every job it handed out has been reported as no longer running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExtractor {
    dag: JobDigraph,
    queue: VecDeque<LarvalJob>,
    node_for_job: BTreeMap<u64, DagNodeId>,
    batch_size: usize,
    node_recently_completed: bool,
}

impl Default for JobExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl JobExtractor {
    pub fn new(batch_size: usize) -> Self {
        Self {
            dag: JobDigraph::new(),
            queue: VecDeque::new(),
            node_for_job: BTreeMap::new(),
            batch_size: batch_size.max(1),
            node_recently_completed: false,
        }
    }

    /// Ask the queen for the initial DAG and queue up the first jobs.
    pub fn initialize(&mut self, queen: &mut dyn JobQueen) {
        self.dag = queen.initial_job_dag();
        self.dag.activate_ready_nodes();
        self.refill(queen);
    }

    pub fn dag(&self) -> &JobDigraph {
        &self.dag
    }

    pub fn job_queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queued_jobs(&self) -> usize {
        self.queue.len()
    }

    /// Take the next job. The job counts as outstanding for its DAG node until
    /// [`note_job_no_longer_running`](Self::note_job_no_longer_running).
    pub fn pop_job(&mut self, queen: &mut dyn JobQueen) -> Option<LarvalJob> {
        let job = self.queue.pop_front();
        if self.queue.is_empty() {
            self.refill(queen);
        }
        job
    }

    /// Put a previously popped job back at the head of the queue.
    pub fn requeue_front(&mut self, job: LarvalJob) {
        self.queue.push_front(job);
    }

    pub fn note_job_no_longer_running(&mut self, job_id: u64, queen: &mut dyn JobQueen) {
        let Some(node) = self.node_for_job.remove(&job_id) else {
            tracing::warn!(job_id, "Job finished but was never handed out by the extractor");
            return;
        };
        self.dag.finish_job(node);
        self.try_complete(node, queen);
        self.refill(queen);
    }

    /// Returns true once after any DAG node completes.
    pub fn take_node_recently_completed(&mut self) -> bool {
        std::mem::take(&mut self.node_recently_completed)
    }

    /// Refill the queue if needed; true while any job remains to be run or finished.
    pub fn not_done(&mut self, queen: &mut dyn JobQueen) -> bool {
        self.refill(queen);
        !self.complete()
    }

    pub fn complete(&self) -> bool {
        self.queue.is_empty() && self.node_for_job.is_empty() && self.dag.all_complete()
    }

    fn refill(&mut self, queen: &mut dyn JobQueen) {
        while self.queue.is_empty() {
            let Some(node) = self.dag.next_unexhausted() else {
                break;
            };
            let jobs = queen.determine_job_list(node, self.batch_size);
            if jobs.is_empty() {
                tracing::debug!(node, "DAG node has no more jobs");
                self.dag.mark_exhausted(node);
                self.try_complete(node, queen);
                continue;
            }
            tracing::debug!(node, count = jobs.len(), "Queued jobs for DAG node");
            self.dag.add_outstanding(node, jobs.len());
            for job in jobs {
                self.node_for_job.insert(job.job_index, node);
                self.queue.push_back(job);
            }
        }
    }

    fn try_complete(&mut self, node: DagNodeId, queen: &mut dyn JobQueen) {
        if !self.dag.try_complete(node) {
            return;
        }
        tracing::info!(node, "DAG node complete");
        self.node_recently_completed = true;
        queen.update_job_dag(&mut JobDagUpdater::new(&mut self.dag));
        self.dag.activate_ready_nodes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::payload::{Payload, PayloadRegistry};
    use crate::queen::{Job, JobError, OutputError, ResultOutputter};
    use crate::scheduler::job::{JobResultId, JobStatus, OutputSpecification};

    /// Two-node chain; node 1 has `first` jobs, node 2 has `second`.
    struct ChainQueen {
        first: u64,
        second: u64,
        handed_out: BTreeMap<DagNodeId, bool>,
        extend_once: bool,
    }

    impl ChainQueen {
        fn new(first: u64, second: u64) -> Self {
            Self {
                first,
                second,
                handed_out: BTreeMap::new(),
                extend_once: false,
            }
        }
    }

    impl JobQueen for ChainQueen {
        fn register_payloads(&self, _registry: &mut PayloadRegistry) {}

        fn initial_job_dag(&mut self) -> JobDigraph {
            let mut dag = JobDigraph::with_nodes(2);
            dag.add_edge(1, 2).unwrap();
            dag
        }

        fn update_job_dag(&mut self, updater: &mut JobDagUpdater<'_>) {
            if self.extend_once && updater.num_nodes() == 2 {
                let extra = updater.add_node();
                updater.add_edge(2, extra).unwrap();
            }
        }

        fn determine_job_list(&mut self, node: DagNodeId, _max_jobs: usize) -> Vec<LarvalJob> {
            if self.handed_out.insert(node, true).is_some() {
                return Vec::new();
            }
            let range = match node {
                1 => 1..=self.first,
                2 => self.first + 1..=self.first + self.second,
                _ => 100..=100,
            };
            range.map(|index| LarvalJob::new(index, 1, 1)).collect()
        }

        fn mature_larval_job(
            &mut self,
            _job: &LarvalJob,
            _inputs: &[Arc<dyn Payload>],
        ) -> Result<Box<dyn Job>, JobError> {
            Err(JobError::Failed("not runnable".into()))
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

    #[test]
    fn test_second_node_waits_for_first_to_finish() {
        let mut queen = ChainQueen::new(2, 1);
        let mut extractor = JobExtractor::new(10);
        extractor.initialize(&mut queen);

        let first = extractor.pop_job(&mut queen).unwrap();
        let second = extractor.pop_job(&mut queen).unwrap();
        assert_eq!((first.job_index, second.job_index), (1, 2));
        // Node 2 cannot start while jobs 1 and 2 are outstanding.
        assert!(extractor.job_queue_empty());
        assert!(extractor.not_done(&mut queen));

        extractor.note_job_no_longer_running(1, &mut queen);
        assert!(extractor.job_queue_empty());
        assert!(!extractor.take_node_recently_completed());

        extractor.note_job_no_longer_running(2, &mut queen);
        assert!(extractor.take_node_recently_completed());
        assert!(!extractor.take_node_recently_completed());
        assert_eq!(extractor.pop_job(&mut queen).unwrap().job_index, 3);

        extractor.note_job_no_longer_running(3, &mut queen);
        assert!(!extractor.not_done(&mut queen));
        assert!(extractor.complete());
    }

    #[test]
    fn test_empty_node_completes_without_jobs() {
        let mut queen = ChainQueen::new(0, 1);
        let mut extractor = JobExtractor::new(10);
        extractor.initialize(&mut queen);

        assert!(extractor.take_node_recently_completed());
        assert_eq!(extractor.pop_job(&mut queen).unwrap().job_index, 1);
    }

    #[test]
    fn test_requeued_job_is_handed_out_again_first() {
        let mut queen = ChainQueen::new(3, 0);
        let mut extractor = JobExtractor::new(10);
        extractor.initialize(&mut queen);

        let job = extractor.pop_job(&mut queen).unwrap();
        extractor.requeue_front(job.clone());
        assert_eq!(extractor.pop_job(&mut queen), Some(job));
        assert_eq!(extractor.queued_jobs(), 2);
    }

    #[test]
    fn test_queen_can_extend_dag_on_completion() {
        let mut queen = ChainQueen::new(1, 1);
        queen.extend_once = true;
        let mut extractor = JobExtractor::new(10);
        extractor.initialize(&mut queen);

        for expected in [1, 2, 100] {
            let job = extractor.pop_job(&mut queen).unwrap();
            assert_eq!(job.job_index, expected);
            extractor.note_job_no_longer_running(job.job_index, &mut queen);
        }
        assert_eq!(extractor.dag().num_nodes(), 3);
        assert!(!extractor.not_done(&mut queen));
    }

    #[test]
    fn test_extractor_state_survives_serialization() {
        let mut queen = ChainQueen::new(3, 0);
        let mut extractor = JobExtractor::new(10);
        extractor.initialize(&mut queen);
        extractor.pop_job(&mut queen);

        let bytes = bincode::serialize(&extractor).unwrap();
        let restored: JobExtractor = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.queued_jobs(), 2);
        assert!(!restored.complete());
    }
}
