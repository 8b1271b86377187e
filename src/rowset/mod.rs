//! On-disk row sets: column-major base data plus undo history and redo delta
//! files.
//!
//! A row set lives in its own directory:
//!
//! ```plain
//! rs-<id>/
//!   c0.data, c0.idx      per-column block data + block index
//!   c1.data, c1.idx
//!   ...
//!   pk.meta              encoded primary keys, bloom filter
//!   undo.delta           history before each row's anchor, (ordinal, ts desc)
//!   redo-0.delta         initial redo stream written at build time
//!   redo-<n>.delta       appended by DeltaMemStore flushes
//! ```

mod block;
mod block_index;
mod bloom;
mod builder;
mod column;
mod disk_rowset;
mod pk_index;

pub use block::{decode_block, Block, BlockBuilder, BlockCacheKey};
pub use block_index::{BlockIndexEntry, ColumnIndex, IndexBuilder};
pub use bloom::BloomFilter;
pub use builder::RowSetBuilder;
pub use column::Column;
pub use disk_rowset::{materialize_at, DeltaOverlay, DiskRowSet};
pub use pk_index::PkIndex;

use std::path::{Path, PathBuf};

pub fn rowset_dir_name(rowset_id: u32) -> String {
    format!("rs-{}", rowset_id)
}

pub fn path_of_data_column(dir: impl AsRef<Path>, idx: usize) -> PathBuf {
    dir.as_ref().join(format!("c{}.data", idx))
}

pub fn path_of_index_column(dir: impl AsRef<Path>, idx: usize) -> PathBuf {
    dir.as_ref().join(format!("c{}.idx", idx))
}

pub fn path_of_pk_meta(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join("pk.meta")
}

pub fn path_of_undo(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join("undo.delta")
}

pub fn path_of_redo(dir: impl AsRef<Path>, delta_id: u64) -> PathBuf {
    dir.as_ref().join(format!("redo-{}.delta", delta_id))
}
