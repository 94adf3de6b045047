//! Batched lamport clock persistence.
//!
//! Syncing the clock on every tick would put an fsync on the hot path, so
//! writes are batched: at most one sync per N ticks or T milliseconds.
//! Recovery compensates by bumping the reloaded value by a safety margin
//! at least as large as the batch, so a restarted node can never reuse a
//! lamport value it may have stamped before the crash.

use anyhow::{anyhow, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

struct Inner {
    file: File,
    last_persisted: u64,
    last_sync: Instant,
}

pub struct LamportClockStore {
    inner: Mutex<Inner>,
    /// Sync at most every this many ticks...
    batch_ticks: u64,
    /// ...or this many milliseconds, whichever comes first.
    batch_ms: u64,
}

impl LamportClockStore {
    pub fn open(path: &Path, batch_ticks: u64, batch_ms: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 8];
        let persisted = match file.read_exact(&mut buf) {
            Ok(()) => u64::from_be_bytes(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                last_persisted: persisted,
                last_sync: Instant::now(),
            }),
            batch_ticks: batch_ticks.max(1),
            batch_ms,
        })
    }

    fn read_persisted(&self) -> Result<u64> {
        let mut inner = self.inner.lock().map_err(|_| anyhow!("clock lock poisoned"))?;
        inner.file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 8];
        match inner.file.read_exact(&mut buf) {
            Ok(()) => Ok(u64::from_be_bytes(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Records the current clock value, syncing only when the batch
    /// threshold is due. Returns whether a sync happened.
    pub fn record(&self, lamport: u64) -> Result<bool> {
        let mut inner = self.inner.lock().map_err(|_| anyhow!("clock lock poisoned"))?;
        let ticks_due = lamport.saturating_sub(inner.last_persisted) >= self.batch_ticks;
        let time_due = inner.last_sync.elapsed().as_millis() as u64 >= self.batch_ms;
        if !ticks_due && !time_due {
            return Ok(false);
        }
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&lamport.to_be_bytes())?;
        inner.file.sync_data()?;
        inner.last_persisted = lamport;
        inner.last_sync = Instant::now();
        debug!(target: "storage", lamport, "lamport clock persisted");
        Ok(true)
    }

    /// Forces a sync regardless of batching (shutdown path).
    pub fn flush(&self, lamport: u64) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| anyhow!("clock lock poisoned"))?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&lamport.to_be_bytes())?;
        inner.file.sync_data()?;
        inner.last_persisted = lamport;
        Ok(())
    }

    /// The value a restarted node must resume from: last persisted plus
    /// the batch as a safety margin for unsynced in-flight ticks.
    pub fn recover(&self) -> Result<u64> {
        let persisted = self.read_persisted()?;
        Ok(persisted.saturating_add(self.batch_ticks))
    }
}
