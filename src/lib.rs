//! # tabulet
//!
//! A columnar, MVCC-capable single-tablet storage engine.
//!
//! The engine layers an in-memory row store ([`MemRowSet`]) over immutable
//! on-disk row sets ([`DiskRowSet`]), each of which carries an undo stream
//! (history before its base timestamp) and redo delta files (mutations after
//! it). Every mutation is stamped with a commit timestamp, and any past state
//! can be read back through snapshot scans. Flushes and compactions are pure
//! rewrites: they reduce read-path cost without changing what any snapshot
//! observes.
//!
//! ```no_run
//! use tabulet::{ColumnDesc, DataType, Datum, Schema, Tablet, TabletOptions};
//!
//! # async fn demo() -> tabulet::EngineResult<()> {
//! let schema = Schema::new(
//!     vec![
//!         ColumnDesc::new("key", DataType::I32, false),
//!         ColumnDesc::new("val", DataType::I32, true),
//!     ],
//!     1,
//! )?;
//! let tablet = Tablet::open(TabletOptions::new("/tmp/tablet"), schema).await?;
//! let mut session = tablet.new_session();
//! session.insert(vec![Datum::I32(1), Datum::I32(42)]);
//! session.flush().await?;
//! # Ok(())
//! # }
//! ```

#![feature(error_generic_member_access)]

mod clock;
mod compaction;
mod delta;
mod error;
mod flush;
mod history;
mod mem_rowset;
mod metadata;
mod mvcc;
mod rowset;
mod scanner;
mod schema;
mod tablet;
mod types;
mod version;
mod wal;

pub use clock::{Clock, ClockMode};
pub use delta::{DeltaChange, DeltaEntry, DeltaKey};
pub use error::{EngineError, EngineResult, RowError, TracedEngineError};
pub use mem_rowset::MemRowSet;
pub use mvcc::{MvccManager, MvccSnapshot};
pub use rowset::DiskRowSet;
pub use scanner::{OrderMode, Predicate, PredicateOp, ReadMode, ScanBuilder, Scanner};
pub use schema::{ColumnDesc, Schema};
pub use tablet::{
    BatchResult, HistoryRetention, RowOperation, Tablet, TabletOptions, WriteSession,
};
pub use types::{DataType, Datum, Row, Timestamp};
