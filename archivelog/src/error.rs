use crate::MetricId;

use thiserror::Error;

/// Failures reported by an archive.  Callers generally only care about one distinction: whether
/// the error is `EndOfLog`, which is the normal way for a sequential fetch to terminate, or
/// something else, which means the archive (or the part of it being read) is unusable.

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("end of archive log")]
    EndOfLog,
    #[error("unknown metric name: {0}")]
    NoSuchName(String),
    #[error("unknown metric id: {0}")]
    NoSuchMetric(MetricId),
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{path}:{line}: {msg}")]
    Format {
        path: String,
        line: u64,
        msg: String,
    },
    #[error("archive library error: {0}")]
    Library(String),
}

impl ArchiveError {
    pub fn is_end_of_log(&self) -> bool {
        matches!(self, ArchiveError::EndOfLog)
    }

    pub fn is_no_such_name(&self) -> bool {
        matches!(self, ArchiveError::NoSuchName(_))
    }
}
