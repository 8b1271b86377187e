use std::backtrace::Backtrace;
use std::sync::Arc;

use thiserror::Error;

/// Engine-level error taxonomy.
///
/// Per-row outcomes of a mutation batch are *not* errors at this level; they
/// are reported as [`RowError`] inside the batch result so a single rejected
/// row never poisons the tablet.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}({1}) not found")]
    NotFound(&'static str, String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("service busy: {0}")]
    ServiceBusy(String),
    #[error("operation timed out: {0}")]
    TimedOut(String),
    #[error("clock skew exceeds bound: {0}")]
    ClockSkew(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("tablet has failed and refuses further mutations")]
    TabletFailed,
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),
    #[error("{0}")]
    Nested(#[from] Arc<TracedEngineError>),
}

impl From<std::io::Error> for TracedEngineError {
    #[inline]
    fn from(e: std::io::Error) -> TracedEngineError {
        EngineError::Io(e.into()).into()
    }
}

impl From<serde_json::Error> for TracedEngineError {
    #[inline]
    fn from(e: serde_json::Error) -> TracedEngineError {
        EngineError::JsonDecode(e).into()
    }
}

impl From<Arc<TracedEngineError>> for TracedEngineError {
    #[inline]
    fn from(e: Arc<TracedEngineError>) -> TracedEngineError {
        EngineError::Nested(e).into()
    }
}

/// [`EngineError`] with a captured backtrace.
#[derive(Error)]
#[error("{source:?}\n{backtrace}")]
pub struct TracedEngineError {
    #[from]
    source: EngineError,
    backtrace: Backtrace,
}

impl std::fmt::Debug for TracedEngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl TracedEngineError {
    pub fn not_found(ty: &'static str, item: impl ToString) -> Self {
        EngineError::NotFound(ty, item.to_string()).into()
    }

    pub fn invalid_argument(message: impl ToString) -> Self {
        EngineError::InvalidArgument(message.to_string()).into()
    }

    pub fn schema_mismatch(message: impl ToString) -> Self {
        EngineError::SchemaMismatch(message.to_string()).into()
    }

    pub fn service_busy(message: impl ToString) -> Self {
        EngineError::ServiceBusy(message.to_string()).into()
    }

    pub fn timed_out(message: impl ToString) -> Self {
        EngineError::TimedOut(message.to_string()).into()
    }

    pub fn clock_skew(message: impl ToString) -> Self {
        EngineError::ClockSkew(message.to_string()).into()
    }

    pub fn corruption(message: impl ToString) -> Self {
        EngineError::Corruption(message.to_string()).into()
    }

    pub fn kind(&self) -> &EngineError {
        &self.source
    }
}

pub type EngineResult<T> = std::result::Result<T, TracedEngineError>;

/// Per-row status inside a batch result. These are user errors: they are
/// collected and returned alongside the rows that succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    /// An insert hit a key that already has a live row.
    AlreadyPresent,
    /// An update or delete addressed a key with no live row.
    NotFound,
    /// The row violated the schema (wrong arity, type, or null constraint).
    InvalidRow(String),
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowError::AlreadyPresent => write!(f, "key already present"),
            RowError::NotFound => write!(f, "key not found"),
            RowError::InvalidRow(msg) => write!(f, "invalid row: {}", msg),
        }
    }
}
