use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use moka::future::Cache;

use super::block::{decode_block, Block, BlockCacheKey};
use super::block_index::ColumnIndex;
use crate::error::{EngineResult, TracedEngineError};
use crate::types::{DataType, Datum};

/// One base-data column of a row set: a block index (fully resident) over a
/// data file read block-at-a-time through the shared block cache.
#[derive(Clone)]
pub struct Column {
    index: ColumnIndex,
    file: Arc<Mutex<std::fs::File>>,
    cache: Cache<BlockCacheKey, Block>,
    cache_key: BlockCacheKey,
    data_type: DataType,
    nullable: bool,
}

impl Column {
    pub async fn open(
        dir: impl AsRef<Path>,
        column_idx: usize,
        data_type: DataType,
        nullable: bool,
        cache: Cache<BlockCacheKey, Block>,
        cache_key: BlockCacheKey,
    ) -> EngineResult<Self> {
        let index_content =
            tokio::fs::read(super::path_of_index_column(dir.as_ref(), column_idx)).await?;
        let index = ColumnIndex::from_bytes(&index_content)?;
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .open(super::path_of_data_column(dir.as_ref(), column_idx))
            .await?;
        Ok(Self {
            index,
            file: Arc::new(Mutex::new(file.into_std().await)),
            cache,
            cache_key,
            data_type,
            nullable,
        })
    }

    pub fn row_count(&self) -> u32 {
        self.index.row_count()
    }

    async fn get_block(&self, block_id: u32) -> EngineResult<Block> {
        let key = self.cache_key.clone().block(block_id);
        let entry = self.index.index(block_id);
        let (offset, length) = (entry.offset, entry.length as usize);
        let file = self.file.clone();
        self.cache
            .try_get_with(key, async move {
                // Block reads are idempotent, so transient I/O errors get a
                // bounded retry before surfacing.
                let mut attempt = 0;
                loop {
                    let result = (|| {
                        let mut file = file.lock().unwrap();
                        file.seek(SeekFrom::Start(offset))?;
                        let mut data = vec![0u8; length];
                        file.read_exact(&mut data)?;
                        Ok::<Block, std::io::Error>(Bytes::from(data))
                    })();
                    match result {
                        Ok(block) => return Ok::<Block, TracedEngineError>(block),
                        Err(e) if attempt < 2 => {
                            attempt += 1;
                            tokio::time::sleep(std::time::Duration::from_millis(
                                10 << attempt,
                            ))
                            .await;
                            tracing::warn!(attempt, "retrying block read after I/O error: {}", e);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            })
            .await
            .map_err(TracedEngineError::from)
    }

    /// Read `count` datums starting at `start` (ordinal space).
    pub async fn read_range(&self, start: u32, count: u32) -> EngineResult<Vec<Datum>> {
        let mut out = Vec::with_capacity(count as usize);
        if count == 0 {
            return Ok(out);
        }
        let mut ordinal = start;
        let end = start + count;
        while ordinal < end {
            let block_id = self.index.block_of_ordinal(ordinal);
            let entry = *self.index.index(block_id);
            let block = self.get_block(block_id).await?;
            let datums = decode_block(&block, self.data_type, self.nullable)?;
            let offset_in_block = (ordinal - entry.first_ordinal) as usize;
            let take = ((end - ordinal) as usize).min(datums.len() - offset_in_block);
            out.extend_from_slice(&datums[offset_in_block..offset_in_block + take]);
            ordinal += take as u32;
        }
        Ok(out)
    }

    pub async fn read_one(&self, ordinal: u32) -> EngineResult<Datum> {
        Ok(self.read_range(ordinal, 1).await?.pop().unwrap())
    }
}
