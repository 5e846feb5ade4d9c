/// Summarization of per-job performance archives.
///
/// A job ran on some nodes, each of which left an archive of timestamped metric samples.  A
/// `Summarize` session runs a set of plugins (preprocessors and analytics) over every archive of
/// the job and assembles their results, together with job metadata and a record of what went
/// wrong, into one summary document.

mod datacache;
mod fetch;
mod job;
mod ledger;
mod output;
mod plugin;
mod rangechange;
mod selector;
mod summarize;

#[cfg(test)]
mod testutil;

// The plugin interface.

pub use plugin::Analytic;
pub use plugin::AnalyticMode;
pub use plugin::Flow;
pub use plugin::InstanceNames;
pub use plugin::MetricData;
pub use plugin::NodeMeta;
pub use plugin::Plugin;
pub use plugin::Preprocessor;
pub use plugin::RequiredMetrics;
pub use plugin::Sample;
pub use plugin::Status;

// The job description.

pub use job::parse_job;
pub use job::read_job;
pub use job::Job;
pub use job::NodeArchive;

// The session and its output.

pub use ledger::ErrorLedger;
pub use output::SUMMARIZE_VERSION;
pub use output::TIMESERIES_VERSION;
pub use summarize::Summarize;

// Building blocks of the fetch loop, exposed for plugins and tools that drive archives themselves.

pub use datacache::SampleCache;
pub use rangechange::RangeCorrector;
pub use selector::extract_values;
pub use selector::select_metrics;
pub use selector::Extracted;
pub use selector::Selection;
