//! Stable checkpoint persistence.
//!
//! Keeps the most recent stable checkpoints on disk so a restarted node
//! (or a newcomer handed the file) can verify and resume from them without
//! replaying the full log. Writes go through a temp file and an atomic
//! rename.

use agora_types::{AgentId, ContentHash};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// The persisted form of a stable checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCheckpoint {
    pub epoch: u64,
    pub merkle_root: ContentHash,
    pub attestors: Vec<AgentId>,
    pub upto_records: u64,
}

pub struct CheckpointStore {
    path: PathBuf,
    /// How many checkpoints to retain, newest first.
    retain: usize,
    entries: BTreeMap<u64, PersistedCheckpoint>,
}

impl CheckpointStore {
    pub fn open(path: &Path, retain: usize) -> Result<Self> {
        let entries = if path.exists() {
            let bytes = fs::read(path)?;
            let list: Vec<PersistedCheckpoint> = bincode::deserialize(&bytes)?;
            list.into_iter().map(|c| (c.epoch, c)).collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            retain: retain.max(1),
            entries,
        })
    }

    /// Records a newly stable checkpoint and persists the retained window.
    pub fn record(&mut self, checkpoint: PersistedCheckpoint) -> Result<()> {
        self.entries.insert(checkpoint.epoch, checkpoint);
        while self.entries.len() > self.retain {
            let oldest = self.entries.keys().next().copied();
            if let Some(epoch) = oldest {
                self.entries.remove(&epoch);
            }
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let list: Vec<&PersistedCheckpoint> = self.entries.values().collect();
        let bytes = bincode::serialize(&list)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        // Rename durability rides on the directory entry; sync it where
        // the platform allows.
        if let Some(dir) = self.path.parent() {
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }

    pub fn latest(&self) -> Option<&PersistedCheckpoint> {
        self.entries.values().next_back()
    }

    pub fn at_epoch(&self, epoch: u64) -> Option<&PersistedCheckpoint> {
        self.entries.get(&epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn checkpoint(epoch: u64) -> PersistedCheckpoint {
        PersistedCheckpoint {
            epoch,
            merkle_root: ContentHash([epoch as u8; 32]),
            attestors: vec![AgentId([1; 32]), AgentId([2; 32])],
            upto_records: epoch * 100,
        }
    }

    #[test]
    fn record_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints");
        {
            let mut store = CheckpointStore::open(&path, 4).unwrap();
            store.record(checkpoint(1)).unwrap();
            store.record(checkpoint(2)).unwrap();
        }
        let store = CheckpointStore::open(&path, 4).unwrap();
        assert_eq!(store.latest().unwrap().epoch, 2);
        assert_eq!(store.at_epoch(1).unwrap().upto_records, 100);
    }

    #[test]
    fn retention_window_drops_the_oldest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints");
        let mut store = CheckpointStore::open(&path, 2).unwrap();
        for e in 1..=4 {
            store.record(checkpoint(e)).unwrap();
        }
        assert!(store.at_epoch(1).is_none());
        assert!(store.at_epoch(2).is_none());
        assert_eq!(store.latest().unwrap().epoch, 4);
    }
}
