//! Segmented write-ahead log.
//!
//! Every applied mutation batch is made durable here before it touches any
//! store, and every structural change (flush, compaction) is acknowledged
//! here before the registry swap. Bootstrap replays the records in order and
//! arrives at exactly the pre-restart state.
//!
//! Records are framed `[len: u32 LE][crc32: u32 LE][body]` where the body is
//! the JSON encoding of [`WalRecord`] and the CRC covers the body. A torn
//! frame at the tail of the *last* segment is truncated on open; a bad frame
//! anywhere else is corruption and fatal.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{EngineResult, TracedEngineError};
use crate::tablet::RowOperation;
use crate::types::Timestamp;

const FRAME_HEADER_SIZE: usize = 8;

/// One durable log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    /// A mutation batch sharing one commit timestamp. Ops are logged in their
    /// pre-routing form; replay re-resolves them through the same
    /// deterministic apply path.
    Batch {
        seq: u64,
        commit_ts: Timestamp,
        ops: Vec<RowOperation>,
    },
    /// The MemRowSet up to this point now lives in `rowset_id`.
    MemFlush { rowset_id: u32 },
    /// The DeltaMemStore of `rowset_id` now lives in redo file `delta_id`.
    DeltaFlush { rowset_id: u32, delta_id: u64 },
    /// All flushed redo files of `rowset_id` were merged into `delta_id`.
    MinorCompaction { rowset_id: u32, delta_id: u64 },
    /// `input` was rewritten (redo folds applied) as `output`.
    MajorCompaction { input: u32, output: u32 },
    /// `inputs` were merge-sorted into `output` (`None` when every surviving
    /// row was elided).
    MergeCompaction { inputs: Vec<u32>, output: Option<u32> },
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("wal-{:08}.log", seq))
}

fn parse_segment_seq(name: &str) -> Option<u64> {
    name.strip_prefix("wal-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

/// Numerically ordered list of `(seq, path)` for every segment in `dir`.
async fn list_segments(dir: &Path) -> EngineResult<Vec<(u64, PathBuf)>> {
    let mut segments = vec![];
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(seq) = entry.file_name().to_str().and_then(parse_segment_seq) {
            segments.push((seq, entry.path()));
        }
    }
    segments.sort_unstable_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// The append side of the log. Created after replay; always starts a fresh
/// segment so appends never race a truncated tail.
pub struct Wal {
    dir: PathBuf,
    enable_fsync: bool,
    segment_size: usize,
    active_seq: u64,
    active: tokio::fs::File,
    written: usize,
}

impl Wal {
    pub async fn create(
        dir: impl AsRef<Path>,
        next_segment: u64,
        segment_size: usize,
        enable_fsync: bool,
    ) -> EngineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let active = Self::new_segment(&dir, next_segment).await?;
        Ok(Self {
            dir,
            enable_fsync,
            segment_size,
            active_seq: next_segment,
            active,
            written: 0,
        })
    }

    async fn new_segment(dir: &Path, seq: u64) -> EngineResult<tokio::fs::File> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(segment_path(dir, seq))
            .await?;
        // The directory entry must survive a crash too.
        std::fs::File::open(dir)?.sync_all()?;
        Ok(file)
    }

    /// Frame, write, and (when fsync is enabled) sync one record. Returns
    /// only after the record is durable; commit-before-visible hinges on
    /// callers appending before they touch any store.
    pub async fn append(&mut self, record: &WalRecord) -> EngineResult<()> {
        if self.written >= self.segment_size {
            self.roll().await?;
        }
        let body = serde_json::to_vec(record)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.put_u32_le(body.len() as u32);
        frame.put_u32_le(crc32fast::hash(&body));
        frame.put_slice(&body);
        self.active.write_all(&frame).await?;
        if self.enable_fsync {
            self.active.sync_data().await?;
        }
        self.written += frame.len();
        Ok(())
    }

    pub(crate) async fn roll(&mut self) -> EngineResult<()> {
        self.active.sync_data().await?;
        self.active_seq += 1;
        self.active = Self::new_segment(&self.dir, self.active_seq).await?;
        self.written = 0;
        info!(segment = self.active_seq, "rolled WAL segment");
        Ok(())
    }

    pub fn active_segment(&self) -> u64 {
        self.active_seq
    }

    /// Delete segments below `first_live` (their effects are captured by
    /// flushed state acknowledged in a checkpoint).
    pub async fn gc_segments(&self, first_live: u64) -> EngineResult<()> {
        for (seq, path) in list_segments(&self.dir).await? {
            if seq < first_live {
                info!(segment = seq, "deleting checkpointed WAL segment");
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }
}

/// Replay every record from `first_segment` on, in order. Returns the
/// records and the segment number a fresh writer should start at.
pub async fn replay(
    dir: impl AsRef<Path>,
    first_segment: u64,
) -> EngineResult<(Vec<WalRecord>, u64)> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir).await?;
    let segments: Vec<_> = list_segments(dir)
        .await?
        .into_iter()
        .filter(|(seq, _)| *seq >= first_segment)
        .collect();

    // Segment numbers must be contiguous: a hole means lost records.
    for pair in segments.windows(2) {
        if pair[1].0 != pair[0].0 + 1 {
            return Err(TracedEngineError::corruption(format!(
                "missing WAL segment between {} and {}",
                pair[0].0, pair[1].0
            )));
        }
    }

    let next_segment = segments.last().map(|(seq, _)| seq + 1).unwrap_or(first_segment);
    let mut records = vec![];
    let last_idx = segments.len().checked_sub(1);
    for (idx, (seq, path)) in segments.iter().enumerate() {
        let is_last = Some(idx) == last_idx;
        replay_segment(path, *seq, is_last, &mut records).await?;
    }
    Ok((records, next_segment))
}

async fn replay_segment(
    path: &Path,
    seq: u64,
    is_last: bool,
    records: &mut Vec<WalRecord>,
) -> EngineResult<()> {
    let data = tokio::fs::read(path).await?;
    let mut buf = &data[..];
    let mut good_offset = 0usize;

    loop {
        if buf.remaining() == 0 {
            return Ok(());
        }
        let torn = |what: &str| -> EngineResult<()> {
            if is_last {
                warn!(segment = seq, offset = good_offset, "truncating torn WAL tail ({})", what);
                Ok(())
            } else {
                Err(TracedEngineError::corruption(format!(
                    "WAL segment {}: {} at offset {}",
                    seq, what, good_offset
                )))
            }
        };
        if buf.remaining() < FRAME_HEADER_SIZE {
            torn("short frame header")?;
            return truncate_to(path, good_offset).await;
        }
        let len = buf.get_u32_le() as usize;
        let crc = buf.get_u32_le();
        if buf.remaining() < len {
            torn("short frame body")?;
            return truncate_to(path, good_offset).await;
        }
        let body = &buf[..len];
        if crc32fast::hash(body) != crc {
            torn("frame checksum mismatch")?;
            return truncate_to(path, good_offset).await;
        }
        let record = serde_json::from_slice(body).map_err(|e| {
            TracedEngineError::corruption(format!(
                "WAL segment {}: undecodable record at offset {}: {}",
                seq, good_offset, e
            ))
        })?;
        records.push(record);
        buf.advance(len);
        good_offset += FRAME_HEADER_SIZE + len;
    }
}

async fn truncate_to(path: &Path, len: usize) -> EngineResult<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len as u64).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn batch(seq: u64, ts: Timestamp) -> WalRecord {
        WalRecord::Batch {
            seq,
            commit_ts: ts,
            ops: vec![],
        }
    }

    fn assert_batch(record: &WalRecord, seq: u64) {
        match record {
            WalRecord::Batch { seq: s, .. } => assert_eq!(*s, seq),
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_append_replay() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::create(dir.path(), 0, 1 << 20, true).await.unwrap();
        wal.append(&batch(1, 10)).await.unwrap();
        wal.append(&WalRecord::MemFlush { rowset_id: 3 }).await.unwrap();
        wal.append(&batch(2, 11)).await.unwrap();

        let (records, next) = replay(dir.path(), 0).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_batch(&records[0], 1);
        assert!(matches!(records[1], WalRecord::MemFlush { rowset_id: 3 }));
        assert_eq!(next, 1);
    }

    #[tokio::test]
    async fn test_segment_roll_and_replay() {
        let dir = tempdir().unwrap();
        // Tiny segments: every record rolls.
        let mut wal = Wal::create(dir.path(), 0, 8, true).await.unwrap();
        for seq in 0..5 {
            wal.append(&batch(seq, seq)).await.unwrap();
        }
        assert!(wal.active_segment() >= 3);
        let (records, next) = replay(dir.path(), 0).await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(next, wal.active_segment() + 1);
    }

    #[tokio::test]
    async fn test_torn_tail_truncated() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::create(dir.path(), 0, 1 << 20, true).await.unwrap();
        wal.append(&batch(1, 10)).await.unwrap();
        wal.append(&batch(2, 11)).await.unwrap();
        drop(wal);

        // Chop the last frame in half.
        let path = segment_path(dir.path(), 0);
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 5]).unwrap();

        let (records, _) = replay(dir.path(), 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_batch(&records[0], 1);

        // The torn bytes are gone; a second replay is clean.
        let (records, _) = replay(dir.path(), 0).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_intermediate_record_fatal() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::create(dir.path(), 0, 1 << 20, true).await.unwrap();
        wal.append(&batch(1, 10)).await.unwrap();
        wal.append(&batch(2, 11)).await.unwrap();
        // A second segment makes the first one "intermediate".
        wal.roll().await.unwrap();
        wal.append(&batch(3, 12)).await.unwrap();
        drop(wal);

        let path = segment_path(dir.path(), 0);
        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        data[len - 3] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        assert!(replay(dir.path(), 0).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_segment_fatal() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::create(dir.path(), 0, 8, true).await.unwrap();
        for seq in 0..4 {
            wal.append(&batch(seq, seq)).await.unwrap();
        }
        drop(wal);
        std::fs::remove_file(segment_path(dir.path(), 1)).unwrap();
        assert!(replay(dir.path(), 0).await.is_err());
    }

    #[tokio::test]
    async fn test_gc_segments() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::create(dir.path(), 0, 8, true).await.unwrap();
        for seq in 0..4 {
            wal.append(&batch(seq, seq)).await.unwrap();
        }
        let keep_from = wal.active_segment();
        wal.gc_segments(keep_from).await.unwrap();
        let (records, _) = replay(dir.path(), keep_from).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
