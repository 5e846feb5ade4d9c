/// Archives are closed, bounded recordings of the performance metrics of one node.  An archive
/// holds a label (host name, start and end time), a table of metric descriptors, instance domains
/// naming the instances of multi-valued metrics, and a time-ordered sequence of records.
///
/// This library defines the interface the summarizer uses to read archives - name lookup,
/// positioning, sequential fetch and explicit release of fetched sample sets - and provides one
/// implementation of it over a simple text format.  Other archive libraries plug in by implementing
/// `Archive` and `ArchiveSource`.
///
/// The important invariant on archives:
///
/// - no two records in one archive have the same timestamp
mod archive;
mod error;
mod textarchive;

// The archive interface and its data types.

pub use archive::Archive;
pub use archive::ArchiveLabel;
pub use archive::ArchiveSource;
pub use archive::Atom;
pub use archive::FetchMode;
pub use archive::IndomId;
pub use archive::MetricDesc;
pub use archive::MetricId;
pub use archive::MetricType;
pub use archive::MetricValues;
pub use archive::SampleSet;
pub use archive::Semantics;

// Instance id for the value of a metric that has no instance domain.

pub use archive::IN_NULL;

// Errors, including the distinguished end-of-log condition.

pub use error::ArchiveError;

// The text archive format.

pub use textarchive::TextArchive;
pub use textarchive::TextArchiveSource;

// Archive times are re-exported for the convenience of implementors.

pub use rustutils::Timeval;
