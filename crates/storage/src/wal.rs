//! Write-ahead log for accepted plan facts.
//!
//! Appends return once the record is on disk, so an accepted fact survives
//! a crash before its effects do. Compaction after a stable checkpoint
//! rewrites the file through a temp + atomic rename.

use agora_types::FactRecord;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Header for a WAL entry.
#[derive(Serialize, Deserialize, Debug)]
pub struct WalEntryHeader {
    /// Absolute sequence of this record in the log.
    pub seq: u64,
    pub data_len: u64,
    /// First four bytes of the payload digest; torn-tail detector.
    pub checksum: u32,
}

fn payload_checksum(data: &[u8]) -> Result<u32> {
    let digest = agora_crypto::sha256(data).map_err(|e| anyhow!("checksum hash: {}", e))?;
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(digest.get(..4).unwrap_or(&[0; 4]));
    Ok(u32::from_be_bytes(prefix))
}

pub struct FactWal {
    path: PathBuf, // kept to allow compaction
    file: Mutex<BufWriter<File>>,
}

impl FactWal {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Appends one record and syncs it to disk.
    pub fn append(&self, seq: u64, record: &FactRecord) -> Result<()> {
        let data = bincode::serialize(record)?;
        let header = WalEntryHeader {
            seq,
            data_len: data.len() as u64,
            checksum: payload_checksum(&data)?,
        };

        let mut writer = self.file.lock().map_err(|_| anyhow!("WAL lock poisoned"))?;
        bincode::serialize_into(&mut *writer, &header)?;
        writer.write_all(&data)?;

        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Compacts the WAL, dropping entries below `min_seq` (the last stable
    /// checkpoint bound). Stop-the-world relative to the writer.
    pub fn compact(&self, min_seq: u64) -> Result<()> {
        let mut guard = self.file.lock().map_err(|_| anyhow!("WAL lock poisoned"))?;
        guard.flush()?;

        let mut reader = BufReader::new(File::open(&self.path)?);
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut tmp_file = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?,
        );

        let mut kept = 0usize;
        loop {
            if reader.fill_buf()?.is_empty() {
                break;
            }
            let header: WalEntryHeader = bincode::deserialize_from(&mut reader)?;
            let mut data = vec![0u8; header.data_len as usize];
            reader.read_exact(&mut data)?;

            if header.seq >= min_seq {
                bincode::serialize_into(&mut tmp_file, &header)?;
                tmp_file.write_all(&data)?;
                kept += 1;
            }
        }

        tmp_file.flush()?;
        tmp_file.get_ref().sync_data()?;
        fs::rename(&tmp_path, &self.path)?;

        let new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .write(true)
            .open(&self.path)?;
        *guard = BufWriter::new(new_file);

        tracing::info!(target: "storage", kept, min_seq, "WAL compaction complete");
        Ok(())
    }
}

/// Streaming reader used at recovery. A torn or corrupt tail ends the
/// iteration with an error; everything before it is intact.
pub struct WalIterator {
    reader: BufReader<File>,
}

impl WalIterator {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
        })
    }
}

impl Iterator for WalIterator {
    type Item = Result<(u64, FactRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.fill_buf().ok()?.is_empty() {
            return None;
        }
        let header: WalEntryHeader = match bincode::deserialize_from(&mut self.reader) {
            Ok(h) => h,
            Err(e) => return Some(Err(anyhow!("Failed to read WAL header: {}", e))),
        };
        let mut data = vec![0u8; header.data_len as usize];
        if let Err(e) = self.reader.read_exact(&mut data) {
            return Some(Err(anyhow!("Failed to read WAL body: {}", e)));
        }
        match payload_checksum(&data) {
            Ok(sum) if sum == header.checksum => {}
            Ok(_) => return Some(Err(anyhow!("WAL record {} checksum mismatch", header.seq))),
            Err(e) => return Some(Err(e)),
        }
        let record: FactRecord = match bincode::deserialize(&data) {
            Ok(r) => r,
            Err(e) => return Some(Err(anyhow!("Failed to deserialize fact record: {}", e))),
        };
        Some(Ok((header.seq, record)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::{AgentId, ContentHash, Fact, TaskId};
    use tempfile::tempdir;

    fn record(env: u8, lamport: u64) -> FactRecord {
        FactRecord {
            envelope_id: ContentHash([env; 32]),
            lamport,
            actor: AgentId([1; 32]),
            fact: Fact::Finalize {
                task: TaskId([9; 32]),
            },
        }
    }

    #[test]
    fn write_then_recover() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("facts.wal");
        let wal = FactWal::open(&path).unwrap();

        wal.append(0, &record(1, 10)).unwrap();
        wal.append(1, &record(2, 11)).unwrap();

        let entries: Vec<(u64, FactRecord)> = WalIterator::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 0);
        assert_eq!(entries[1].1.lamport, 11);
    }

    #[test]
    fn compaction_drops_pre_checkpoint_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("compact.wal");
        let wal = FactWal::open(&path).unwrap();
        for seq in 0..4 {
            wal.append(seq, &record(seq as u8 + 1, seq + 10)).unwrap();
        }

        wal.compact(2).unwrap();

        let entries: Vec<(u64, FactRecord)> = WalIterator::open(&path)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![2, 3]);

        // Writable after compaction.
        wal.append(4, &record(5, 14)).unwrap();
        assert_eq!(WalIterator::open(&path).unwrap().count(), 3);
    }

    #[test]
    fn corrupt_tail_is_surfaced_not_replayed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.wal");
        let wal = FactWal::open(&path).unwrap();
        wal.append(0, &record(1, 10)).unwrap();
        wal.append(1, &record(2, 11)).unwrap();
        drop(wal);

        // Truncate mid-record to simulate a torn write.
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 5).unwrap();

        let mut iter = WalIterator::open(&path).unwrap();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_err());
    }
}
