use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scheduler::job::{JobResultId, JobStatus, OutputSpecification};
use crate::transport::NodeRank;

/// One protocol message. The variant is the opcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // Worker -> Master
    NewJobRequest,
    JobSuccess {
        job_id: u64,
        n_results: usize,
    },
    JobSuccessAndArchivalComplete {
        job_id: u64,
        status: JobStatus,
        summaries: Vec<u8>,
    },
    JobFailedDoNotRetry {
        job_id: u64,
    },
    JobFailedBadInput {
        job_id: u64,
    },
    JobFailedRetryLimitExceeded {
        job_id: u64,
    },
    JobFailedWithMessage {
        job_id: u64,
        message: String,
    },

    // Master -> Worker
    NewJobAvailable {
        job_id: u64,
        larval_job: Vec<u8>,
        input_locations: Vec<NodeRank>,
    },
    DeallocationMessage {
        messages: Vec<u8>,
    },
    ArchivalAssignment {
        job_id: u64,
        nodes: Vec<NodeRank>,
    },

    // Any node -> node holding results
    RetrieveJobResult {
        result_id: JobResultId,
    },
    RetrieveAndDiscardJobResult {
        result_id: JobResultId,
    },
    DiscardJobResult {
        result_id: JobResultId,
    },
    JobResultRetrieved {
        result_id: JobResultId,
        job_and_result: Vec<u8>,
    },
    /// Sent to the requester and, separately, to the master.
    FailedToRetrieveJobResult {
        result_id: JobResultId,
        requesting_node: NodeRank,
    },
    ArchiveJobResult {
        result_id: JobResultId,
        job_and_result: Vec<u8>,
    },
    ArchivalCompleted {
        result_id: JobResultId,
    },

    // Output
    OutputJobResultAlreadyAvailable {
        spec: OutputSpecification,
    },
    AcceptAndOutputJobResult {
        spec: OutputSpecification,
        job_and_result: Vec<u8>,
    },
    OutputJobResultOnArchive {
        archive: NodeRank,
        spec: OutputSpecification,
    },
    OutputCompleted,

    // Checkpointing
    BeginCheckpointing {
        prefix: String,
    },
    CheckpointingComplete,
    RestoreFromCheckpoint {
        prefix: String,
        keep: Vec<JobResultId>,
    },

    SpinDown,
    Error {
        message: String,
    },
}

/// Payload-free tag of a [`Message`], used in logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    NewJobRequest,
    JobSuccess,
    JobSuccessAndArchivalComplete,
    JobFailedDoNotRetry,
    JobFailedBadInput,
    JobFailedRetryLimitExceeded,
    JobFailedWithMessage,
    NewJobAvailable,
    DeallocationMessage,
    ArchivalAssignment,
    RetrieveJobResult,
    RetrieveAndDiscardJobResult,
    DiscardJobResult,
    JobResultRetrieved,
    FailedToRetrieveJobResult,
    ArchiveJobResult,
    ArchivalCompleted,
    OutputJobResultAlreadyAvailable,
    AcceptAndOutputJobResult,
    OutputJobResultOnArchive,
    OutputCompleted,
    BeginCheckpointing,
    CheckpointingComplete,
    RestoreFromCheckpoint,
    SpinDown,
    Error,
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::NewJobRequest => Opcode::NewJobRequest,
            Message::JobSuccess { .. } => Opcode::JobSuccess,
            Message::JobSuccessAndArchivalComplete { .. } => Opcode::JobSuccessAndArchivalComplete,
            Message::JobFailedDoNotRetry { .. } => Opcode::JobFailedDoNotRetry,
            Message::JobFailedBadInput { .. } => Opcode::JobFailedBadInput,
            Message::JobFailedRetryLimitExceeded { .. } => Opcode::JobFailedRetryLimitExceeded,
            Message::JobFailedWithMessage { .. } => Opcode::JobFailedWithMessage,
            Message::NewJobAvailable { .. } => Opcode::NewJobAvailable,
            Message::DeallocationMessage { .. } => Opcode::DeallocationMessage,
            Message::ArchivalAssignment { .. } => Opcode::ArchivalAssignment,
            Message::RetrieveJobResult { .. } => Opcode::RetrieveJobResult,
            Message::RetrieveAndDiscardJobResult { .. } => Opcode::RetrieveAndDiscardJobResult,
            Message::DiscardJobResult { .. } => Opcode::DiscardJobResult,
            Message::JobResultRetrieved { .. } => Opcode::JobResultRetrieved,
            Message::FailedToRetrieveJobResult { .. } => Opcode::FailedToRetrieveJobResult,
            Message::ArchiveJobResult { .. } => Opcode::ArchiveJobResult,
            Message::ArchivalCompleted { .. } => Opcode::ArchivalCompleted,
            Message::OutputJobResultAlreadyAvailable { .. } => {
                Opcode::OutputJobResultAlreadyAvailable
            }
            Message::AcceptAndOutputJobResult { .. } => Opcode::AcceptAndOutputJobResult,
            Message::OutputJobResultOnArchive { .. } => Opcode::OutputJobResultOnArchive,
            Message::OutputCompleted => Opcode::OutputCompleted,
            Message::BeginCheckpointing { .. } => Opcode::BeginCheckpointing,
            Message::CheckpointingComplete => Opcode::CheckpointingComplete,
            Message::RestoreFromCheckpoint { .. } => Opcode::RestoreFromCheckpoint,
            Message::SpinDown => Opcode::SpinDown,
            Message::Error { .. } => Opcode::Error,
        }
    }

    /// The job a message is about, when it carries one.
    pub fn job_id(&self) -> Option<u64> {
        match self {
            Message::JobSuccess { job_id, .. }
            | Message::JobSuccessAndArchivalComplete { job_id, .. }
            | Message::JobFailedDoNotRetry { job_id }
            | Message::JobFailedBadInput { job_id }
            | Message::JobFailedRetryLimitExceeded { job_id }
            | Message::JobFailedWithMessage { job_id, .. }
            | Message::NewJobAvailable { job_id, .. }
            | Message::ArchivalAssignment { job_id, .. } => Some(*job_id),
            Message::RetrieveJobResult { result_id }
            | Message::RetrieveAndDiscardJobResult { result_id }
            | Message::DiscardJobResult { result_id }
            | Message::JobResultRetrieved { result_id, .. }
            | Message::FailedToRetrieveJobResult { result_id, .. }
            | Message::ArchiveJobResult { result_id, .. }
            | Message::ArchivalCompleted { result_id } => Some(result_id.job_id),
            Message::OutputJobResultAlreadyAvailable { spec }
            | Message::AcceptAndOutputJobResult { spec, .. }
            | Message::OutputJobResultOnArchive { spec, .. } => Some(spec.result_id.job_id),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::NewJobRequest => "new-job-request",
            Opcode::JobSuccess => "job-success",
            Opcode::JobSuccessAndArchivalComplete => "job-success-and-archival-complete",
            Opcode::JobFailedDoNotRetry => "job-failed-do-not-retry",
            Opcode::JobFailedBadInput => "job-failed-bad-input",
            Opcode::JobFailedRetryLimitExceeded => "job-failed-retry-limit-exceeded",
            Opcode::JobFailedWithMessage => "job-failed-with-message",
            Opcode::NewJobAvailable => "new-job-available",
            Opcode::DeallocationMessage => "deallocation-message",
            Opcode::ArchivalAssignment => "archival-assignment",
            Opcode::RetrieveJobResult => "retrieve-job-result",
            Opcode::RetrieveAndDiscardJobResult => "retrieve-and-discard-job-result",
            Opcode::DiscardJobResult => "discard-job-result",
            Opcode::JobResultRetrieved => "job-result-retrieved",
            Opcode::FailedToRetrieveJobResult => "failed-to-retrieve-job-result",
            Opcode::ArchiveJobResult => "archive-job-result",
            Opcode::ArchivalCompleted => "archival-completed",
            Opcode::OutputJobResultAlreadyAvailable => "output-job-result-already-available",
            Opcode::AcceptAndOutputJobResult => "accept-and-output-job-result",
            Opcode::OutputJobResultOnArchive => "output-job-result-on-archive",
            Opcode::OutputCompleted => "output-completed",
            Opcode::BeginCheckpointing => "begin-checkpointing",
            Opcode::CheckpointingComplete => "checkpointing-complete",
            Opcode::RestoreFromCheckpoint => "restore-from-checkpoint",
            Opcode::SpinDown => "spin-down",
            Opcode::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_and_job_id_extraction() {
        let message = Message::ArchiveJobResult {
            result_id: JobResultId::new(9, 2),
            job_and_result: vec![0; 4],
        };
        assert_eq!(message.opcode(), Opcode::ArchiveJobResult);
        assert_eq!(message.job_id(), Some(9));

        assert_eq!(Message::SpinDown.job_id(), None);
        assert_eq!(Message::OutputCompleted.opcode().to_string(), "output-completed");
    }

    #[test]
    fn test_message_survives_bincode() {
        let message = Message::RestoreFromCheckpoint {
            prefix: "/tmp/chkpt_3".to_string(),
            keep: vec![JobResultId::new(1, 1), JobResultId::new(4, 2)],
        };
        let bytes = bincode::serialize(&message).unwrap();
        let decoded: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, message);
    }
}
