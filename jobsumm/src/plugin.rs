/// The interface between the summarizer and the analytics and preprocessors that consume samples.
///
/// A plugin instance lives for the whole summarization of one job and sees every node's archive
/// in turn.  Its status is transitioned only by the summarizer: it starts `Uninitialized`, and
/// becomes `Complete` or `Failure` once the plugin has been run against an archive in which all
/// its required metrics were found.  A plugin that never leaves `Uninitialized` contributes
/// nothing to the summary.
use anyhow::Result;
use archivelog::ArchiveLabel;
use rustutils::Timeval;
use serde_json::Value;
use std::fmt;
use ustr::Ustr;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Uninitialized,
    Complete,
    Failure,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Uninitialized => "uninitialized",
            Status::Complete => "complete",
            Status::Failure => "failure",
        })
    }
}

/// What a plugin wants after seeing a sample.

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// How an analytic is driven, and where its results go.
///
/// `All` and `Timeseries` analytics see every sample of an archive; their results go to the top
/// level of the summary and to the `timeseries` block respectively.  `FirstLast` analytics see
/// only the first and the last sample of each archive and their results go to the top level.

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AnalyticMode {
    All,
    Timeseries,
    FirstLast,
}

/// The metrics a plugin cannot do without.  With `AnyOf`, the alternatives are tried in order and
/// the first one whose metrics are all present in the archive is used.

#[derive(Debug, Clone)]
pub enum RequiredMetrics {
    All(Vec<String>),
    AnyOf(Vec<Vec<String>>),
}

impl RequiredMetrics {
    pub fn all(names: &[&str]) -> RequiredMetrics {
        RequiredMetrics::All(names.iter().map(|s| s.to_string()).collect())
    }

    pub fn alternatives(&self) -> Vec<&[String]> {
        match self {
            RequiredMetrics::All(names) => vec![names.as_slice()],
            RequiredMetrics::AnyOf(alts) => alts.iter().map(|a| a.as_slice()).collect(),
        }
    }
}

/// Immutable per-archive information handed to analytics.

#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub nodename: Ustr,
    pub nodeindex: usize,
    pub archive: ArchiveLabel,
}

/// Values of one metric in one sample.  `instances[i]` is the instance id of `values[i]`; for a
/// metric without an instance domain there is at most one value, with instance id IN_NULL.  Both
/// are empty if the metric had no value at this time.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricData {
    pub values: Vec<f64>,
    pub instances: Vec<i32>,
}

/// Named instances of one metric in one sample, empty for metrics without an instance domain.

pub type InstanceNames = Vec<(i32, Ustr)>;

/// One decoded sample as seen by a plugin.  The three slices are parallel and ordered like the
/// metrics the plugin asked for: required metrics first, then whichever optional metrics the
/// archive has.

#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub timestamp: Timeval,
    pub names: &'a [Ustr],
    pub data: &'a [MetricData],
    pub description: &'a [InstanceNames],
}

pub trait Plugin {
    fn name(&self) -> &str;

    fn required_metrics(&self) -> RequiredMetrics;

    /// Metrics that are used if present.  Absent ones are dropped silently.
    fn optional_metrics(&self) -> Vec<String> {
        vec![]
    }

    fn status(&self) -> Status;

    fn set_status(&mut self, status: Status);
}

pub trait Analytic: Plugin {
    fn mode(&self) -> AnalyticMode;

    /// For FirstLast analytics: whether the archive's own backward positioning may be used to
    /// obtain the last sample.  If false, or if the metrics need range correction, the whole
    /// archive is scanned and the last sample is delivered from a cache.
    fn passthrough(&self) -> bool {
        true
    }

    /// Consume one sample.  An error is recorded against the node and the analytic, and the
    /// analytic gets no further samples from this archive.
    fn process(&mut self, node: &NodeMeta, sample: &Sample) -> Result<Flow>;

    fn results(&self) -> Value;
}

/// Preprocessors see every sample of every archive exactly as recorded, without range correction.
/// They typically gather context that analytics use, but may also contribute fields to the top
/// level of the summary via `results`.

pub trait Preprocessor: Plugin {
    fn hoststart(&mut self, hostname: &str);

    fn process(&mut self, sample: &Sample) -> Result<Flow>;

    /// Called once per archive after `hoststart`, whatever the outcome.
    fn hostend(&mut self);

    fn results(&self) -> Option<Value>;
}
