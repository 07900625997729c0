use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::job::JobResultId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job result {0} is not held here")]
    NotHeld(JobResultId),

    #[error("failed to write job result {result_id} to {path}: {source}")]
    Write {
        result_id: JobResultId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read job result {result_id} from {path}: {source}")]
    Read {
        result_id: JobResultId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create archive directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job result {0} should be kept but is missing from the checkpoint")]
    MissingFromSnapshot(JobResultId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMode {
    InMemory,
    /// One file per result under this directory.
    OnDisk(PathBuf),
}

impl StorageMode {
    pub fn from_directory(directory: Option<&Path>) -> Self {
        match directory {
            Some(dir) => StorageMode::OnDisk(dir.to_path_buf()),
            None => StorageMode::InMemory,
        }
    }
}

/// Self-contained copy of a store, as written into a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Storage mode of the run that took the snapshot.
    pub archived_on_disk: bool,
    pub results: BTreeMap<JobResultId, Vec<u8>>,
}

/// Serialized job results held by one node.
///
/// In memory the blob is kept in the map. On disk the map only records that
/// the result is present and the blob lives in `archive.{job}.{index}`.
#[derive(Debug)]
pub struct ResultStore {
    mode: StorageMode,
    results: BTreeMap<JobResultId, Option<Vec<u8>>>,
}

impl ResultStore {
    pub fn new(mode: StorageMode) -> Self {
        Self {
            mode,
            results: BTreeMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StorageMode::InMemory)
    }

    pub fn mode(&self) -> &StorageMode {
        &self.mode
    }

    pub fn is_on_disk(&self) -> bool {
        matches!(self.mode, StorageMode::OnDisk(_))
    }

    /// Create the archive directory when results go to disk.
    pub fn prepare(&self) -> Result<(), StoreError> {
        if let StorageMode::OnDisk(dir) = &self.mode {
            fs::create_dir_all(dir).map_err(|source| StoreError::Directory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn save(&mut self, result_id: JobResultId, bytes: Vec<u8>) -> Result<(), StoreError> {
        match &self.mode {
            StorageMode::InMemory => {
                self.results.insert(result_id, Some(bytes));
            }
            StorageMode::OnDisk(dir) => {
                let path = Self::path_for(dir, result_id);
                fs::write(&path, &bytes).map_err(|source| StoreError::Write {
                    result_id,
                    path,
                    source,
                })?;
                self.results.insert(result_id, None);
            }
        }
        Ok(())
    }

    pub fn contains(&self, result_id: JobResultId) -> bool {
        self.results.contains_key(&result_id)
    }

    pub fn get(&self, result_id: JobResultId) -> Result<Vec<u8>, StoreError> {
        match self.results.get(&result_id) {
            None => Err(StoreError::NotHeld(result_id)),
            Some(Some(bytes)) => Ok(bytes.clone()),
            Some(None) => self.read_from_disk(result_id),
        }
    }

    /// Fetch a result and forget it.
    pub fn take(&mut self, result_id: JobResultId) -> Result<Vec<u8>, StoreError> {
        let bytes = self.get(result_id)?;
        self.discard(result_id);
        Ok(bytes)
    }

    /// Returns false if the result was not held.
    pub fn discard(&mut self, result_id: JobResultId) -> bool {
        let Some(entry) = self.results.remove(&result_id) else {
            return false;
        };
        if entry.is_none() {
            if let StorageMode::OnDisk(dir) = &self.mode {
                let path = Self::path_for(dir, result_id);
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(%result_id, path = %path.display(), error = %e, "Failed to remove archived result file");
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn ids(&self) -> Vec<JobResultId> {
        self.results.keys().copied().collect()
    }

    /// Copy every held blob, reading disk-backed ones back in.
    pub fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let results = self
            .results
            .keys()
            .map(|&id| self.get(id).map(|bytes| (id, bytes)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(StoreSnapshot {
            archived_on_disk: self.is_on_disk(),
            results,
        })
    }

    /// Replace the contents with the `keep` entries of `snapshot`, stored
    /// according to the current mode.
    pub fn restore_selected(
        &mut self,
        mut snapshot: StoreSnapshot,
        keep: &[JobResultId],
    ) -> Result<(), StoreError> {
        for id in self.ids() {
            self.discard(id);
        }
        for &id in keep {
            let bytes = snapshot
                .results
                .remove(&id)
                .ok_or(StoreError::MissingFromSnapshot(id))?;
            self.save(id, bytes)?;
        }
        if !snapshot.results.is_empty() {
            tracing::debug!(
                dropped = snapshot.results.len(),
                "Dropped checkpointed results that are no longer needed"
            );
        }
        Ok(())
    }

    fn read_from_disk(&self, result_id: JobResultId) -> Result<Vec<u8>, StoreError> {
        let StorageMode::OnDisk(dir) = &self.mode else {
            return Err(StoreError::NotHeld(result_id));
        };
        let path = Self::path_for(dir, result_id);
        fs::read(&path).map_err(|source| StoreError::Read {
            result_id,
            path,
            source,
        })
    }

    fn path_for(dir: &Path, result_id: JobResultId) -> PathBuf {
        dir.join(format!(
            "archive.{}.{}",
            result_id.job_id, result_id.result_index
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(job: u64, index: u64) -> JobResultId {
        JobResultId::new(job, index)
    }

    #[test]
    fn test_in_memory_save_take_discard() {
        let mut store = ResultStore::in_memory();
        store.save(id(1, 1), vec![1, 2, 3]).unwrap();
        store.save(id(2, 1), vec![4]).unwrap();

        assert_eq!(store.get(id(1, 1)).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.take(id(1, 1)).unwrap(), vec![1, 2, 3]);
        assert!(matches!(store.get(id(1, 1)), Err(StoreError::NotHeld(_))));
        assert!(store.discard(id(2, 1)));
        assert!(!store.discard(id(2, 1)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_on_disk_store_writes_one_file_per_result() {
        let dir = tempfile::tempdir().unwrap();
        let archive_dir = dir.path().join("archive");
        let mut store = ResultStore::new(StorageMode::OnDisk(archive_dir.clone()));
        store.prepare().unwrap();

        store.save(id(7, 2), b"pose".to_vec()).unwrap();
        let path = archive_dir.join("archive.7.2");
        assert_eq!(fs::read(&path).unwrap(), b"pose");
        assert_eq!(store.get(id(7, 2)).unwrap(), b"pose");

        assert!(store.discard(id(7, 2)));
        assert!(!path.exists());
    }

    #[test]
    fn test_snapshot_reads_disk_blobs_back_in() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ResultStore::new(StorageMode::OnDisk(dir.path().to_path_buf()));
        store.save(id(3, 1), vec![9, 9]).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.archived_on_disk);
        assert_eq!(snapshot.results.get(&id(3, 1)), Some(&vec![9, 9]));
    }

    #[test]
    fn test_restore_keeps_only_listed_results() {
        let mut source = ResultStore::in_memory();
        for job in 1..=3 {
            source.save(id(job, 1), vec![job as u8]).unwrap();
        }
        let snapshot = source.snapshot().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut restored = ResultStore::new(StorageMode::OnDisk(dir.path().to_path_buf()));
        restored
            .restore_selected(snapshot, &[id(1, 1), id(3, 1)])
            .unwrap();
        assert_eq!(restored.ids(), vec![id(1, 1), id(3, 1)]);
        assert_eq!(restored.get(id(3, 1)).unwrap(), vec![3]);
    }

    #[test]
    fn test_restore_fails_when_keep_list_names_unknown_result() {
        let mut store = ResultStore::in_memory();
        let err = store
            .restore_selected(StoreSnapshot::default(), &[id(5, 1)])
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingFromSnapshot(missing) if missing == id(5, 1)));
    }
}
