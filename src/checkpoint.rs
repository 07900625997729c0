//! Checkpoint files and generations.
//!
//! Generation `G` of a run consists of one file per participating node,
//! `{dir}/chkpt_{G}_{rank}.bin`, for the master (rank 0) and every archive.
//! A generation is only usable when all of its files exist. `sanity.txt` in
//! the same directory records the archive count of the run that wrote it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::config::{CheckpointConfig, CheckpointRetention};
use crate::transport::NodeRank;

const SANITY_FILE: &str = "sanity.txt";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("failed to create checkpoint directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on checkpoint file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize checkpoint {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error("failed to deserialize checkpoint {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error("checkpoint sanity check failed for {path}: {message}")]
    Sanity { path: PathBuf, message: String },

    #[error("unable to restore from checkpoint: {0}")]
    Restore(String),
}

/// File holding `rank`'s part of the generation named by `prefix`.
pub fn file_for_node(prefix: &str, rank: NodeRank) -> PathBuf {
    PathBuf::from(format!("{prefix}_{rank}.bin"))
}

/// Serialize `value` next to `path` and rename it into place.
pub fn write_atomically<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let bytes = bincode::serialize(value).map_err(|source| CheckpointError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|source| CheckpointError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let bytes = fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    bincode::deserialize(&bytes).map_err(|source| CheckpointError::Deserialize {
        path: path.to_path_buf(),
        source,
    })
}

/// Generations with a master file in `dir`, oldest first.
pub fn list_generations(dir: &Path) -> Result<Vec<u64>, CheckpointError> {
    let entries = fs::read_dir(dir).map_err(|source| CheckpointError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut generations: Vec<u64> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            name.strip_prefix("chkpt_")?
                .strip_suffix("_0.bin")?
                .parse()
                .ok()
        })
        .collect();
    generations.sort_unstable();
    Ok(generations)
}

/// Archive count recorded in `dir/sanity.txt`, if the file exists.
pub fn read_sanity_file(dir: &Path) -> Result<Option<usize>, CheckpointError> {
    let path = dir.join(SANITY_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(CheckpointError::Io { path, source }),
    };
    let count = text
        .trim()
        .strip_prefix("n_archives=")
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| CheckpointError::Sanity {
            path: path.clone(),
            message: format!("unrecognised contents {:?}", text.trim()),
        })?;
    Ok(Some(count))
}

/// Master-side bookkeeping for periodic checkpoints.
#[derive(Debug)]
pub struct Checkpointer {
    config: CheckpointConfig,
    n_archives: usize,
    generation: u64,
    last_checkpoint: Instant,
}

impl Checkpointer {
    pub fn new(config: &CheckpointConfig, n_archives: usize) -> Self {
        Self {
            config: config.clone(),
            n_archives,
            generation: 1,
            last_checkpoint: Instant::now(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn period(&self) -> Duration {
        self.config.period
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Generation the next checkpoint will be written as.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn due(&self) -> bool {
        self.config.enabled && self.last_checkpoint.elapsed() >= self.config.period
    }

    pub fn prefix(&self) -> String {
        self.prefix_for(self.generation)
    }

    pub fn prefix_for(&self, generation: u64) -> String {
        self.config
            .directory
            .join(format!("chkpt_{generation}"))
            .to_string_lossy()
            .into_owned()
    }

    pub fn ensure_directory(&self) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.config.directory).map_err(|source| CheckpointError::Directory {
            path: self.config.directory.clone(),
            source,
        })
    }

    pub fn write_sanity_file(&self) -> Result<(), CheckpointError> {
        let path = self.config.directory.join(SANITY_FILE);
        fs::write(&path, format!("n_archives= {}\n", self.n_archives))
            .map_err(|source| CheckpointError::Io { path, source })
    }

    pub fn sanity_check(&self) -> Result<(), CheckpointError> {
        let path = self.config.directory.join(SANITY_FILE);
        match read_sanity_file(&self.config.directory)? {
            Some(count) if count == self.n_archives => Ok(()),
            Some(count) => Err(CheckpointError::Sanity {
                path,
                message: format!(
                    "checkpoint was written with {count} archive node(s) but this run has {}",
                    self.n_archives
                ),
            }),
            None => Err(CheckpointError::Sanity {
                path,
                message: "file is missing".to_string(),
            }),
        }
    }

    /// Remove every file of `generation` unless retention keeps it.
    pub fn delete_generation(&self, generation: u64) {
        if generation == 0 || !self.config.retention.may_delete(generation) {
            return;
        }
        let prefix = self.prefix_for(generation);
        for rank in 0..=self.n_archives {
            let path = file_for_node(&prefix, rank);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete old checkpoint file");
                }
            }
        }
        tracing::debug!(generation, "Deleted checkpoint generation");
    }

    pub fn retention(&self) -> CheckpointRetention {
        self.config.retention
    }

    /// Newest generation that has a file for the master and every archive.
    ///
    /// Returns `None` when restoring is off, or when nothing usable exists and
    /// the run is allowed to start fresh.
    pub fn find_restore_generation(&self) -> Result<Option<u64>, CheckpointError> {
        if !self.config.restore {
            return Ok(None);
        }
        let dir = &self.config.directory;
        if !dir.is_dir() {
            return self.fail_or_continue(format!(
                "checkpoint directory {} does not exist",
                dir.display()
            ));
        }
        if let Err(e) = self.sanity_check() {
            return self.fail_or_continue(e.to_string());
        }
        let complete = list_generations(dir)?
            .into_iter()
            .rev()
            .find(|&generation| {
                let prefix = self.prefix_for(generation);
                (0..=self.n_archives).all(|rank| file_for_node(&prefix, rank).is_file())
            });
        match complete {
            Some(generation) => Ok(Some(generation)),
            None => self.fail_or_continue(format!(
                "no complete checkpoint generation in {}",
                dir.display()
            )),
        }
    }

    fn fail_or_continue(&self, message: String) -> Result<Option<u64>, CheckpointError> {
        if self.config.continue_past_failed_restore {
            tracing::warn!(reason = %message, "Not restoring from checkpoint; starting from scratch");
            Ok(None)
        } else {
            Err(CheckpointError::Restore(message))
        }
    }

    /// Move on to the next generation and restart the timer.
    pub fn advance(&mut self) {
        self.generation += 1;
        self.reset_timer();
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn reset_timer(&mut self) {
        self.last_checkpoint = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> CheckpointConfig {
        CheckpointConfig {
            enabled: true,
            period: Duration::from_millis(1),
            directory: dir.to_path_buf(),
            restore: true,
            ..Default::default()
        }
    }

    fn touch_generation(checkpointer: &Checkpointer, generation: u64, ranks: &[NodeRank]) {
        let prefix = checkpointer.prefix_for(generation);
        for &rank in ranks {
            write_atomically(&file_for_node(&prefix, rank), &generation).unwrap();
        }
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chkpt_1_0.bin");
        write_atomically(&path, &vec![1u32, 2, 3]).unwrap();

        let value: Vec<u32> = read_file(&path).unwrap();
        assert_eq!(value, vec![1, 2, 3]);
        assert!(!dir.path().join("chkpt_1_0.bin.tmp").exists());
    }

    #[test]
    fn test_sanity_file_round_trip_and_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(&config(dir.path()), 2);
        checkpointer.write_sanity_file().unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("sanity.txt")).unwrap(),
            "n_archives= 2\n"
        );
        checkpointer.sanity_check().unwrap();

        let other = Checkpointer::new(&config(dir.path()), 3);
        assert!(matches!(
            other.sanity_check(),
            Err(CheckpointError::Sanity { .. })
        ));
    }

    #[test]
    fn test_restore_picks_newest_complete_generation() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(&config(dir.path()), 1);
        checkpointer.write_sanity_file().unwrap();
        touch_generation(&checkpointer, 1, &[0, 1]);
        touch_generation(&checkpointer, 2, &[0, 1]);
        // Generation 3 is missing the archive's file.
        touch_generation(&checkpointer, 3, &[0]);

        assert_eq!(list_generations(dir.path()).unwrap(), vec![1, 2, 3]);
        assert_eq!(checkpointer.find_restore_generation().unwrap(), Some(2));
    }

    #[test]
    fn test_failed_restore_is_fatal_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nowhere");
        let strict = Checkpointer::new(&config(&missing), 0);
        assert!(matches!(
            strict.find_restore_generation(),
            Err(CheckpointError::Restore(_))
        ));

        let mut lenient_config = config(&missing);
        lenient_config.continue_past_failed_restore = true;
        let lenient = Checkpointer::new(&lenient_config, 0);
        assert_eq!(lenient.find_restore_generation().unwrap(), None);
    }

    #[test]
    fn test_delete_generation_honours_retention() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.retention = CheckpointRetention::Keep(1);
        let checkpointer = Checkpointer::new(&cfg, 1);
        touch_generation(&checkpointer, 1, &[0, 1]);
        touch_generation(&checkpointer, 2, &[0, 1]);

        checkpointer.delete_generation(1);
        checkpointer.delete_generation(2);
        checkpointer.delete_generation(7);
        assert_eq!(list_generations(dir.path()).unwrap(), vec![1]);
    }

    #[test]
    fn test_timer_and_generation_advance() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpointer = Checkpointer::new(&config(dir.path()), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(checkpointer.due());
        assert!(checkpointer.prefix().ends_with("chkpt_1"));

        checkpointer.advance();
        assert_eq!(checkpointer.generation(), 2);
        assert!(checkpointer.prefix().ends_with("chkpt_2"));
    }
}
