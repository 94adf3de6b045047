//! Crash-safe ledger snapshots.
//!
//! The ledger replica is small (account and escrow rows), so persistence
//! is a whole-snapshot write through a temp file and an atomic rename.

use agora_ledger::Ledger;
use anyhow::Result;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Persists the full ledger snapshot.
    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        let bytes = bincode::serialize(ledger)?;
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
        if let Some(dir) = self.path.parent() {
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }

    /// Loads the last persisted snapshot, if one exists.
    pub fn load(&self) -> Result<Option<Ledger>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        Ok(Some(bincode::deserialize(&bytes)?))
    }
}
