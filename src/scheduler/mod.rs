pub mod dag;
pub mod heap;
pub mod job;
pub mod master;
pub mod queue;

pub use dag::{DagError, DagNodeId, JobDagUpdater, JobDigraph, NodeState};
pub use heap::IndexedHeap;
pub use job::{JobResultId, JobStatus, LarvalJob, OutputIndex, OutputSpecification};
pub use master::{Master, RunSummary};
pub use queue::JobExtractor;
