use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::schema::Schema;

pub const METADATA_FILE_NAME: &str = "metadata.json";

/// One live row set at checkpoint time: its id and the redo files attached to
/// it, in creation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowSetMeta {
    pub rowset_id: u32,
    pub redo_ids: Vec<u64>,
}

/// The tablet's durable root: schema, id watermarks, the row sets alive at
/// the last checkpoint, and where WAL replay starts. Everything after the
/// checkpoint is recovered from the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletMetadata {
    pub schema: Schema,
    pub next_rowset_id: u32,
    pub next_delta_id: u64,
    pub next_batch_seq: u64,
    pub first_live_segment: u64,
    pub rowsets: Vec<RowSetMeta>,
}

impl TabletMetadata {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            next_rowset_id: 0,
            next_delta_id: 1,
            next_batch_seq: 1,
            first_live_segment: 0,
            rowsets: vec![],
        }
    }

    pub async fn load(dir: impl AsRef<Path>) -> EngineResult<Option<Self>> {
        let path = dir.as_ref().join(METADATA_FILE_NAME);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a new version and atomically rename it over the old one, then
    /// sync the directory so the rename survives a crash.
    pub async fn store(&self, dir: impl AsRef<Path>) -> EngineResult<()> {
        let dir = dir.as_ref();
        let tmp = dir.join(format!("{}.tmp", METADATA_FILE_NAME));
        let data = serde_json::to_vec_pretty(self)?;
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            use tokio::io::AsyncWriteExt;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, dir.join(METADATA_FILE_NAME)).await?;
        std::fs::File::open(dir)?.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::schema::ColumnDesc;
    use crate::types::DataType;

    #[tokio::test]
    async fn test_store_load_round_trip() {
        let dir = tempdir().unwrap();
        let schema = Schema::new(
            vec![
                ColumnDesc::new("key", DataType::I64, false),
                ColumnDesc::new("val", DataType::Bytes, true),
            ],
            1,
        )
        .unwrap();
        assert!(TabletMetadata::load(dir.path()).await.unwrap().is_none());

        let mut meta = TabletMetadata::new(schema.clone());
        meta.next_rowset_id = 5;
        meta.rowsets.push(RowSetMeta {
            rowset_id: 2,
            redo_ids: vec![0, 4],
        });
        meta.store(dir.path()).await.unwrap();

        let loaded = TabletMetadata::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.schema, schema);
        assert_eq!(loaded.next_rowset_id, 5);
        assert_eq!(loaded.rowsets[0].redo_ids, vec![0, 4]);

        // Overwrite keeps a single consistent file.
        meta.next_rowset_id = 9;
        meta.store(dir.path()).await.unwrap();
        let loaded = TabletMetadata::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.next_rowset_id, 9);
    }
}
