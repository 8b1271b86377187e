use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use tokio::io::AsyncWriteExt;

use super::{DeltaChange, DeltaEntry, DeltaKey};
use crate::error::{EngineResult, TracedEngineError};
use crate::types::Datum;

const DELTA_FILE_MAGIC: u32 = 0xD1F7_A5E7;
const FOOTER_SIZE: usize = 4 + 8 + 8;

const CHANGE_UPDATE: u8 = 0;
const CHANGE_DELETE: u8 = 1;
const CHANGE_REINSERT: u8 = 2;

const DATUM_NULL: u8 = 0;
const DATUM_I8: u8 = 1;
const DATUM_I16: u8 = 2;
const DATUM_I32: u8 = 3;
const DATUM_I64: u8 = 4;
const DATUM_BYTES: u8 = 5;

/// Which direction a delta stream runs in, and therefore which ordering the
/// file must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOrdering {
    /// `(ordinal asc, ts asc, seq asc)`, strict.
    Redo,
    /// `(ordinal asc, ts desc, seq desc)`, strict within each ordinal.
    Undo,
}

/// An immutable on-disk delta stream, fully resident once opened.
///
/// The layout is a flat run of records followed by a footer:
///
/// ```plain
/// | record | record | ... | magic (4B) | count (8B) | crc32 of records (8B) |
/// ```
pub struct DeltaFile {
    id: u64,
    ordering: DeltaOrdering,
    entries: Arc<Vec<DeltaEntry>>,
}

impl DeltaFile {
    /// Serialize `entries`, fsync, and return the in-memory handle. The
    /// entries must already satisfy the stream ordering; a violation here is
    /// a logic error upstream, not corruption.
    pub async fn create(
        path: impl AsRef<Path>,
        id: u64,
        ordering: DeltaOrdering,
        entries: Vec<DeltaEntry>,
    ) -> EngineResult<Self> {
        validate_ordering(&entries, ordering)?;

        let mut body = Vec::new();
        for entry in &entries {
            encode_entry(&mut body, entry);
        }
        let crc = crc32fast::hash(&body);
        body.put_u32(DELTA_FILE_MAGIC);
        body.put_u64(entries.len() as u64);
        body.put_u64(crc as u64);

        let mut file = tokio::fs::File::create(path.as_ref()).await?;
        file.write_all(&body).await?;
        file.sync_data().await?;

        Ok(Self {
            id,
            ordering,
            entries: Arc::new(entries),
        })
    }

    pub async fn open(
        path: impl AsRef<Path>,
        id: u64,
        ordering: DeltaOrdering,
    ) -> EngineResult<Self> {
        let data = tokio::fs::read(path.as_ref()).await?;
        if data.len() < FOOTER_SIZE {
            return Err(TracedEngineError::corruption(format!(
                "delta file {} too short: {} bytes",
                id,
                data.len()
            )));
        }
        let (body, mut footer) = data.split_at(data.len() - FOOTER_SIZE);
        if footer.get_u32() != DELTA_FILE_MAGIC {
            return Err(TracedEngineError::corruption(format!(
                "delta file {}: bad magic",
                id
            )));
        }
        let count = footer.get_u64() as usize;
        let expected_crc = footer.get_u64();
        let actual_crc = crc32fast::hash(body) as u64;
        if actual_crc != expected_crc {
            return Err(TracedEngineError::corruption(format!(
                "delta file {}: checksum mismatch (found {:#x}, expected {:#x})",
                id, actual_crc, expected_crc
            )));
        }

        let mut buf = body;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(decode_entry(&mut buf, id)?);
        }
        if !buf.is_empty() {
            return Err(TracedEngineError::corruption(format!(
                "delta file {}: {} trailing bytes after {} records",
                id,
                buf.len(),
                count
            )));
        }
        validate_ordering(&entries, ordering)?;

        Ok(Self {
            id,
            ordering,
            entries: Arc::new(entries),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ordering(&self) -> DeltaOrdering {
        self.ordering
    }

    pub fn entries(&self) -> &[DeltaEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The contiguous run of records addressing `ordinal`.
    pub fn entries_for(&self, ordinal: u32) -> &[DeltaEntry] {
        let start = self
            .entries
            .partition_point(|e| e.key.ordinal < ordinal);
        let end = self
            .entries
            .partition_point(|e| e.key.ordinal <= ordinal);
        &self.entries[start..end]
    }
}

fn validate_ordering(entries: &[DeltaEntry], ordering: DeltaOrdering) -> EngineResult<()> {
    for pair in entries.windows(2) {
        let (a, b) = (&pair[0].key, &pair[1].key);
        let ok = match ordering {
            DeltaOrdering::Redo => (a.ordinal, a.ts, a.seq) < (b.ordinal, b.ts, b.seq),
            DeltaOrdering::Undo => {
                a.ordinal < b.ordinal
                    || (a.ordinal == b.ordinal && (a.ts, a.seq) > (b.ts, b.seq))
            }
        };
        if !ok {
            return Err(TracedEngineError::corruption(format!(
                "delta ordering violation: {:?} then {:?} in {:?} stream",
                a, b, ordering
            )));
        }
    }
    Ok(())
}

fn encode_entry(buf: &mut Vec<u8>, entry: &DeltaEntry) {
    buf.put_u32(entry.key.ordinal);
    buf.put_u64(entry.key.ts);
    buf.put_u32(entry.key.seq);
    match &entry.change {
        DeltaChange::Update(cols) => {
            buf.put_u8(CHANGE_UPDATE);
            buf.put_u16(cols.len() as u16);
            for (idx, datum) in cols {
                buf.put_u32(*idx);
                encode_datum(buf, datum);
            }
        }
        DeltaChange::Delete => buf.put_u8(CHANGE_DELETE),
        DeltaChange::Reinsert(image) => {
            buf.put_u8(CHANGE_REINSERT);
            buf.put_u16(image.len() as u16);
            for datum in image {
                encode_datum(buf, datum);
            }
        }
    }
}

fn decode_entry(buf: &mut &[u8], file_id: u64) -> EngineResult<DeltaEntry> {
    let short = || {
        TracedEngineError::corruption(format!("delta file {}: truncated record", file_id))
    };
    if buf.remaining() < 4 + 8 + 4 + 1 {
        return Err(short());
    }
    let ordinal = buf.get_u32();
    let ts = buf.get_u64();
    let seq = buf.get_u32();
    let change = match buf.get_u8() {
        CHANGE_UPDATE => {
            if buf.remaining() < 2 {
                return Err(short());
            }
            let n = buf.get_u16() as usize;
            let mut cols = Vec::with_capacity(n);
            for _ in 0..n {
                if buf.remaining() < 4 {
                    return Err(short());
                }
                let idx = buf.get_u32();
                cols.push((idx, decode_datum(buf, file_id)?));
            }
            DeltaChange::Update(cols)
        }
        CHANGE_DELETE => DeltaChange::Delete,
        CHANGE_REINSERT => {
            if buf.remaining() < 2 {
                return Err(short());
            }
            let n = buf.get_u16() as usize;
            let mut image = Vec::with_capacity(n);
            for _ in 0..n {
                image.push(decode_datum(buf, file_id)?);
            }
            DeltaChange::Reinsert(image)
        }
        tag => {
            return Err(TracedEngineError::corruption(format!(
                "delta file {}: unknown change tag {}",
                file_id, tag
            )))
        }
    };
    Ok(DeltaEntry::new(DeltaKey::new(ordinal, ts, seq), change))
}

pub(crate) fn encode_datum(buf: &mut Vec<u8>, datum: &Datum) {
    match datum {
        Datum::Null => buf.put_u8(DATUM_NULL),
        Datum::I8(v) => {
            buf.put_u8(DATUM_I8);
            buf.put_i8(*v);
        }
        Datum::I16(v) => {
            buf.put_u8(DATUM_I16);
            buf.put_i16(*v);
        }
        Datum::I32(v) => {
            buf.put_u8(DATUM_I32);
            buf.put_i32(*v);
        }
        Datum::I64(v) => {
            buf.put_u8(DATUM_I64);
            buf.put_i64(*v);
        }
        Datum::Bytes(b) => {
            buf.put_u8(DATUM_BYTES);
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
    }
}

pub(crate) fn decode_datum(buf: &mut &[u8], file_id: u64) -> EngineResult<Datum> {
    let short = || {
        TracedEngineError::corruption(format!("delta file {}: truncated datum", file_id))
    };
    if buf.remaining() < 1 {
        return Err(short());
    }
    let datum = match buf.get_u8() {
        DATUM_NULL => Datum::Null,
        DATUM_I8 if buf.remaining() >= 1 => Datum::I8(buf.get_i8()),
        DATUM_I16 if buf.remaining() >= 2 => Datum::I16(buf.get_i16()),
        DATUM_I32 if buf.remaining() >= 4 => Datum::I32(buf.get_i32()),
        DATUM_I64 if buf.remaining() >= 8 => Datum::I64(buf.get_i64()),
        DATUM_BYTES if buf.remaining() >= 4 => {
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(short());
            }
            let mut bytes = vec![0u8; len];
            buf.copy_to_slice(&mut bytes);
            Datum::Bytes(bytes)
        }
        _ => return Err(short()),
    };
    Ok(datum)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn redo_entries() -> Vec<DeltaEntry> {
        vec![
            DeltaEntry::new(
                DeltaKey::new(0, 3, 0),
                DeltaChange::Update(vec![(0, Datum::I32(7)), (1, Datum::Null)]),
            ),
            DeltaEntry::new(DeltaKey::new(0, 5, 1), DeltaChange::Delete),
            DeltaEntry::new(
                DeltaKey::new(2, 4, 0),
                DeltaChange::Reinsert(vec![Datum::Bytes(vec![1, 2, 3])]),
            ),
        ]
    }

    #[tokio::test]
    async fn test_create_open_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo-0.delta");
        let entries = redo_entries();
        DeltaFile::create(&path, 0, DeltaOrdering::Redo, entries.clone())
            .await
            .unwrap();
        let opened = DeltaFile::open(&path, 0, DeltaOrdering::Redo).await.unwrap();
        assert_eq!(opened.entries(), entries.as_slice());
    }

    #[tokio::test]
    async fn test_entries_for_ordinal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo-0.delta");
        let file = DeltaFile::create(&path, 0, DeltaOrdering::Redo, redo_entries())
            .await
            .unwrap();
        assert_eq!(file.entries_for(0).len(), 2);
        assert_eq!(file.entries_for(1).len(), 0);
        assert_eq!(file.entries_for(2).len(), 1);
    }

    #[tokio::test]
    async fn test_redo_ordering_enforced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo-0.delta");
        let out_of_order = vec![
            DeltaEntry::new(DeltaKey::new(1, 5, 0), DeltaChange::Delete),
            DeltaEntry::new(DeltaKey::new(1, 3, 0), DeltaChange::Delete),
        ];
        assert!(
            DeltaFile::create(&path, 0, DeltaOrdering::Redo, out_of_order.clone())
                .await
                .is_err()
        );
        // The same stream is a valid undo ordering.
        DeltaFile::create(&path, 0, DeltaOrdering::Undo, out_of_order)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_body_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("redo-0.delta");
        DeltaFile::create(&path, 0, DeltaOrdering::Redo, redo_entries())
            .await
            .unwrap();
        let mut data = std::fs::read(&path).unwrap();
        data[3] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();
        let err = DeltaFile::open(&path, 0, DeltaOrdering::Redo)
            .await
            .unwrap_err();
        assert!(format!("{}", err).contains("checksum"));
    }
}
