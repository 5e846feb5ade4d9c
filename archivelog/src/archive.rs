/// The archive interface: what the summarizer needs from a reader of per-node archives.
use crate::ArchiveError;

use rustutils::Timeval;
use std::fmt;
use ustr::Ustr;

/// Archive-local numeric metric identifier.  Ids from one archive mean nothing in another.

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId(pub u32);

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Archive-local instance domain identifier.

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IndomId(pub u32);

impl fmt::Display for IndomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instance id used for the single value of a metric without an instance domain.

pub const IN_NULL: i32 = -1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MetricType {
    I32,
    U32,
    I64,
    U64,
    Float,
    Double,
}

impl MetricType {
    pub fn parse(s: &str) -> Option<MetricType> {
        match s {
            "i32" => Some(MetricType::I32),
            "u32" => Some(MetricType::U32),
            "i64" => Some(MetricType::I64),
            "u64" => Some(MetricType::U64),
            "float" => Some(MetricType::Float),
            "double" => Some(MetricType::Double),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MetricType::I32 => "i32",
            MetricType::U32 => "u32",
            MetricType::I64 => "i64",
            MetricType::U64 => "u64",
            MetricType::Float => "float",
            MetricType::Double => "double",
        }
    }
}

/// How a metric's values evolve.  Only counters are expected to be monotonic.

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Semantics {
    Counter,
    Instant,
    Discrete,
}

impl Semantics {
    pub fn parse(s: &str) -> Option<Semantics> {
        match s {
            "counter" => Some(Semantics::Counter),
            "instant" => Some(Semantics::Instant),
            "discrete" => Some(Semantics::Discrete),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Semantics::Counter => "counter",
            Semantics::Instant => "instant",
            Semantics::Discrete => "discrete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricDesc {
    pub pmid: MetricId,
    pub name: Ustr,
    pub mtype: MetricType,
    pub semantics: Semantics,

    /// None for metrics with a single value per sample.
    pub indom: Option<IndomId>,
}

/// A raw value as stored in the archive, before conversion to the metric's declared type.

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Atom {
    I64(i64),
    U64(u64),
    F64(f64),
}

/// The values for one metric in one sample set.  `values` is empty if the metric was requested
/// but had no value at this time.  For metrics without an instance domain the single value has
/// instance id IN_NULL.

#[derive(Debug, Clone)]
pub struct MetricValues {
    pub pmid: MetricId,
    pub values: Vec<(i32, Atom)>,
}

/// One fetched snapshot.  Metrics appear in the order they were requested.  A SampleSet must be
/// handed back to the archive with `Archive::free` once the caller is done with it.

#[derive(Debug)]
pub struct SampleSet {
    pub timestamp: Timeval,
    pub metrics: Vec<MetricValues>,
}

#[derive(Debug, Clone)]
pub struct ArchiveLabel {
    pub hostname: Ustr,
    pub start: Timeval,
    pub end: Timeval,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FetchMode {
    Forward,
    Backward,
}

/// An open archive.  All operations are blocking.  An archive has a cursor and a direction;
/// `fetch` returns the next record in that direction that carries any of the requested metrics, or
/// `ArchiveError::EndOfLog` when there are none.

pub trait Archive {
    fn label(&self) -> &ArchiveLabel;

    /// Resolve a metric name.  Fails with `ArchiveError::NoSuchName` if the archive does not
    /// record the metric.
    fn lookup_name(&self, name: &str) -> Result<MetricId, ArchiveError>;

    fn describe(&self, pmid: MetricId) -> Result<MetricDesc, ArchiveError>;

    /// The external name of an instance, if the instance domain knows it.
    fn instance_name(&self, indom: IndomId, inst: i32) -> Option<Ustr>;

    /// Position the cursor at `when` and set the fetch direction.
    fn set_mode(&mut self, mode: FetchMode, when: Timeval) -> Result<(), ArchiveError>;

    fn fetch(&mut self, pmids: &[MetricId]) -> Result<SampleSet, ArchiveError>;

    /// Release a sample set obtained from `fetch`.
    fn free(&mut self, result: SampleSet);
}

/// Something that can open archives by location.

pub trait ArchiveSource {
    fn open(&self, location: &str) -> Result<Box<dyn Archive>, ArchiveError>;
}
