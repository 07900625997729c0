use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{NodeRank, MASTER_RANK};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{n_archives} archive node(s) need a process group of at least {needed} nodes, got {nprocs}")]
    TooFewProcesses {
        n_archives: usize,
        nprocs: usize,
        needed: usize,
    },

    #[error("outputter fraction must be within [0, 1], got {0}")]
    OutputterFraction(f64),

    #[error("checkpoint period must be positive when checkpointing is enabled")]
    CheckpointPeriod,

    #[error("default retry limit must be at least 1")]
    RetryLimit,

    #[error("job batch size must be at least 1")]
    JobBatchSize,
}

/// Where completed results are kept.
#[derive(Debug, Clone, Default)]
pub struct ArchiveConfig {
    /// Number of dedicated archive nodes. With 0 the master holds every result.
    pub n_archives: usize,
    /// Let the master hold results alongside the dedicated archives.
    pub archive_on_master: bool,
    /// Keep held results on disk under this directory instead of in memory.
    pub directory: Option<PathBuf>,
}

/// Which checkpoint generations survive once a newer one exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointRetention {
    /// Delete the previous generation after each successful checkpoint and the
    /// last one after a successful run.
    #[default]
    Prune,
    KeepAll,
    /// Never delete this generation; prune the others.
    Keep(u64),
}

impl CheckpointRetention {
    pub fn may_delete(&self, generation: u64) -> bool {
        match self {
            CheckpointRetention::Prune => true,
            CheckpointRetention::KeepAll => false,
            CheckpointRetention::Keep(kept) => *kept != generation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Time between checkpoints, measured on the master.
    pub period: Duration,
    pub directory: PathBuf,
    /// Try to resume from the newest complete checkpoint at startup.
    pub restore: bool,
    /// Start fresh instead of failing when no usable checkpoint is found.
    pub continue_past_failed_restore: bool,
    pub retention: CheckpointRetention,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period: Duration::from_secs(1800),
            directory: PathBuf::from("checkpoints"),
            restore: false,
            continue_past_failed_restore: false,
            retention: CheckpointRetention::default(),
        }
    }
}

/// Settings shared by every node of a run.
///
/// Every node must be built from the same configuration: the master derives
/// the role layout from it, and results are encoded according to
/// `compress_results` on one node and decoded on another.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub archive: ArchiveConfig,
    pub checkpoint: CheckpointConfig,
    /// Share of the process group allowed to write output.
    pub outputter_fraction: f64,
    pub compress_results: bool,
    /// Attempts per job when the job does not set its own limit.
    pub default_retry_limit: u32,
    /// Jobs requested from the queen per DAG node refill.
    pub job_batch_size: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            archive: ArchiveConfig::default(),
            checkpoint: CheckpointConfig::default(),
            outputter_fraction: 0.01,
            compress_results: false,
            default_retry_limit: 1,
            job_batch_size: 1000,
        }
    }
}

impl DistributorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archives(mut self, n_archives: usize) -> Self {
        self.archive.n_archives = n_archives;
        self
    }

    pub fn with_archive_on_master(mut self, archive_on_master: bool) -> Self {
        self.archive.archive_on_master = archive_on_master;
        self
    }

    pub fn with_archive_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.archive.directory = Some(directory.into());
        self
    }

    pub fn with_checkpointing(mut self, directory: impl Into<PathBuf>, period: Duration) -> Self {
        self.checkpoint.enabled = true;
        self.checkpoint.directory = directory.into();
        self.checkpoint.period = period;
        self
    }

    pub fn with_restore(mut self, continue_past_failed_restore: bool) -> Self {
        self.checkpoint.restore = true;
        self.checkpoint.continue_past_failed_restore = continue_past_failed_restore;
        self
    }

    pub fn with_retention(mut self, retention: CheckpointRetention) -> Self {
        self.checkpoint.retention = retention;
        self
    }

    pub fn with_outputter_fraction(mut self, fraction: f64) -> Self {
        self.outputter_fraction = fraction;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_results = compress;
        self
    }

    pub fn with_default_retry_limit(mut self, limit: u32) -> Self {
        self.default_retry_limit = limit;
        self
    }

    pub fn with_job_batch_size(mut self, size: usize) -> Self {
        self.job_batch_size = size;
        self
    }

    /// Check the settings against a process group of `nprocs` nodes.
    pub fn validate(&self, nprocs: usize) -> Result<(), ConfigError> {
        // Master, the archives, and at least one worker.
        let needed = self.archive.n_archives + 2;
        if nprocs < needed {
            return Err(ConfigError::TooFewProcesses {
                n_archives: self.archive.n_archives,
                nprocs,
                needed,
            });
        }
        if !(0.0..=1.0).contains(&self.outputter_fraction) {
            return Err(ConfigError::OutputterFraction(self.outputter_fraction));
        }
        if self.checkpoint.enabled && self.checkpoint.period.is_zero() {
            return Err(ConfigError::CheckpointPeriod);
        }
        if self.default_retry_limit == 0 {
            return Err(ConfigError::RetryLimit);
        }
        if self.job_batch_size == 0 {
            return Err(ConfigError::JobBatchSize);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Archive,
    Worker,
}

/// Role layout of a process group.
///
/// Rank 0 is the master, ranks `1..=n_archives` are archives and the rest are
/// workers. Ranks `1..=max_outputters` may also be asked to write output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    nprocs: usize,
    n_archives: usize,
    store_on_master: bool,
    max_outputters: usize,
}

impl Topology {
    pub fn new(config: &DistributorConfig, nprocs: usize) -> Self {
        let n_archives = config.archive.n_archives;
        let by_fraction = (nprocs as f64 * config.outputter_fraction).ceil() as usize;
        Self {
            nprocs,
            n_archives,
            store_on_master: n_archives == 0 || config.archive.archive_on_master,
            max_outputters: by_fraction.max(n_archives).max(1),
        }
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    pub fn n_archives(&self) -> usize {
        self.n_archives
    }

    pub fn role_of(&self, rank: NodeRank) -> Role {
        if rank == MASTER_RANK {
            Role::Master
        } else if self.is_archive(rank) {
            Role::Archive
        } else {
            Role::Worker
        }
    }

    pub fn is_archive(&self, rank: NodeRank) -> bool {
        rank >= 1 && rank <= self.n_archives
    }

    pub fn is_outputter(&self, rank: NodeRank) -> bool {
        rank >= 1 && rank <= self.max_outputters
    }

    pub fn archive_ranks(&self) -> impl Iterator<Item = NodeRank> {
        1..=self.n_archives
    }

    pub fn worker_ranks(&self) -> impl Iterator<Item = NodeRank> {
        self.n_archives + 1..self.nprocs
    }

    /// Whether the master keeps results itself, as location 0.
    pub fn store_on_master(&self) -> bool {
        self.store_on_master
    }

    pub fn max_outputters(&self) -> usize {
        self.max_outputters
    }

    /// Whether outputs must be stamped with the outputting rank.
    pub fn multiple_outputters(&self) -> bool {
        self.max_outputters > 1
    }
}
