use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use super::block::BlockBuilder;
use super::block_index::{BlockIndexEntry, IndexBuilder};
use super::pk_index::PkIndex;
use crate::delta::{DeltaFile, DeltaOrdering};
use crate::error::EngineResult;
use crate::history::{self, SplitHistory};
use crate::schema::Schema;
use crate::types::Datum;

/// Writes a complete row set directory from key-sorted split histories: the
/// per-column base files, the primary-key index, the undo stream, and the
/// initial redo stream.
pub struct RowSetBuilder {
    schema: Arc<Schema>,
    block_size: usize,
    bloom_fpp: f64,
}

impl RowSetBuilder {
    pub fn new(schema: Arc<Schema>, block_size: usize, bloom_fpp: f64) -> Self {
        Self {
            schema,
            block_size,
            bloom_fpp,
        }
    }

    /// Build the row set at `dir`. `rows` must be sorted by encoded key; the
    /// position of each row becomes its ordinal.
    pub async fn build(&self, dir: impl AsRef<Path>, rows: &[SplitHistory]) -> EngineResult<()> {
        let dir = dir.as_ref();
        debug_assert!(!rows.is_empty(), "refusing to build an empty row set");
        debug_assert!(rows.windows(2).all(|w| w[0].key < w[1].key));
        tokio::fs::create_dir_all(dir).await?;

        let pk_len = self.schema.pk_len();
        for (idx, column) in self.schema.columns().iter().enumerate() {
            let mut writer = ColumnWriter::new(
                column.data_type(),
                column.nullable(),
                self.block_size,
            );
            for row in rows {
                let datum = if idx < pk_len {
                    &row.key_datums[idx]
                } else {
                    &row.base_image[idx - pk_len]
                };
                writer.append(datum);
            }
            let (data, index) = writer.finish();
            write_file(super::path_of_data_column(dir, idx), &data).await?;
            write_file(super::path_of_index_column(dir, idx), &index).await?;
        }

        let pk = PkIndex::build(rows.iter().map(|r| r.key.clone()).collect(), self.bloom_fpp);
        write_file(super::path_of_pk_meta(dir), &pk.encode()).await?;

        let mut undo_entries = Vec::new();
        let mut redo_entries = Vec::new();
        for (ordinal, row) in rows.iter().enumerate() {
            undo_entries.extend(history::undo_entries_for(ordinal as u32, row));
            redo_entries.extend(history::redo_entries_for(ordinal as u32, row));
        }
        DeltaFile::create(
            super::path_of_undo(dir),
            0,
            DeltaOrdering::Undo,
            undo_entries,
        )
        .await?;
        DeltaFile::create(
            super::path_of_redo(dir, 0),
            0,
            DeltaOrdering::Redo,
            redo_entries,
        )
        .await?;

        // Make the directory entry durable before any control record that
        // references this row set.
        std::fs::File::open(dir)?.sync_all()?;
        Ok(())
    }
}

struct ColumnWriter {
    builder: BlockBuilder,
    data: Vec<u8>,
    index: IndexBuilder,
    data_type: crate::types::DataType,
    nullable: bool,
    block_size: usize,
    next_ordinal: u32,
    block_first_ordinal: u32,
}

impl ColumnWriter {
    fn new(data_type: crate::types::DataType, nullable: bool, block_size: usize) -> Self {
        Self {
            builder: BlockBuilder::new(data_type, nullable, block_size),
            data: Vec::new(),
            index: IndexBuilder::new(),
            data_type,
            nullable,
            block_size,
            next_ordinal: 0,
            block_first_ordinal: 0,
        }
    }

    fn append(&mut self, datum: &Datum) {
        if self.builder.should_finish(datum) {
            self.cut_block();
        }
        self.builder.append(datum);
        self.next_ordinal += 1;
    }

    fn cut_block(&mut self) {
        let row_count = self.builder.count();
        let builder = std::mem::replace(
            &mut self.builder,
            BlockBuilder::new(self.data_type, self.nullable, self.block_size),
        );
        let encoded = builder.finish();
        self.index.append(BlockIndexEntry {
            offset: self.data.len() as u64,
            length: encoded.len() as u64,
            first_ordinal: self.block_first_ordinal,
            row_count,
        });
        self.data.extend_from_slice(&encoded);
        self.block_first_ordinal = self.next_ordinal;
    }

    fn finish(mut self) -> (Vec<u8>, Vec<u8>) {
        if !self.builder.is_empty() {
            self.cut_block();
        }
        (self.data, self.index.finish())
    }
}

async fn write_file(path: impl AsRef<Path>, data: &[u8]) -> EngineResult<()> {
    let mut file = tokio::fs::File::create(path.as_ref()).await?;
    file.write_all(data).await?;
    file.sync_data().await?;
    Ok(())
}
