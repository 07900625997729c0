use thiserror::Error;

use crate::archive::store::StoreError;
use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::payload::PayloadError;
use crate::protocol::Opcode;
use crate::queen::OutputError;
use crate::scheduler::dag::DagError;
use crate::scheduler::job::JobResultId;
use crate::transport::{NodeRank, TransportError};

/// Conditions that end a run.
///
/// Job-level failures never show up here; workers report them to the master
/// as a job status instead.
#[derive(Error, Debug)]
pub enum DistributorError {
    #[error("Received error from node {node}: {message}")]
    Remote { node: NodeRank, message: String },

    #[error("Node {rank} received unexpected message {opcode} from node {from}{context}")]
    Protocol {
        rank: NodeRank,
        from: NodeRank,
        opcode: Opcode,
        context: String,
    },

    #[error(
        "Failed to retrieve job result {result_id} which was requested from node {archive} by node {requester} but was not present there.\n{diagnosis}"
    )]
    MissingResult {
        result_id: JobResultId,
        archive: NodeRank,
        requester: NodeRank,
        diagnosis: String,
    },

    #[error("Unable to find a location for job result {result_id} to {action}. Has this job already been output or discarded?")]
    UnknownResult {
        result_id: JobResultId,
        action: String,
    },

    #[error("{context}\nError message from the serialization library:\n{source}")]
    Serialization {
        context: String,
        #[source]
        source: PayloadError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Result store error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Job DAG error: {0}")]
    Dag(#[from] DagError),

    #[error("Node task failed: {0}")]
    Task(String),

    #[error("Run interrupted before completion")]
    Interrupted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DistributorError {
    pub fn serialization(context: impl Into<String>, source: PayloadError) -> Self {
        DistributorError::Serialization {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DistributorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_result_names_everything_involved() {
        let err = DistributorError::MissingResult {
            result_id: JobResultId::new(12, 2),
            archive: 1,
            requester: 4,
            diagnosis: "Master thinks the result should have been on node 2".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("(12, 2)"));
        assert!(text.contains("from node 1 by node 4"));
        assert!(text.ends_with("on node 2"));
    }

    #[test]
    fn test_serialization_error_embeds_library_text() {
        let source = PayloadError::Unregistered("demo::Pose".to_string());
        let err = DistributorError::serialization("Failed to deserialize summaries of job 3", source);
        let text = err.to_string();
        assert!(text.starts_with("Failed to deserialize summaries of job 3\n"));
        assert!(text.contains("demo::Pose"));
    }
}
