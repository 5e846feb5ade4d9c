/// The plugins a job is summarized with.
use crate::hinv::HardwareInventory;
use crate::network::Network;
use crate::nfs::NfsTimeseries;

use jobsumm::{Analytic, Preprocessor};

pub fn all_plugins() -> (Vec<Box<dyn Preprocessor>>, Vec<Box<dyn Analytic>>) {
    (
        vec![Box::new(HardwareInventory::new())],
        vec![Box::new(NfsTimeseries::new()), Box::new(Network::new())],
    )
}

// Run all plugins over the two-node job in ../tests.

#[cfg(test)]
pub fn summarize_fixture_job() -> serde_json::Value {
    let job = jobsumm::read_job("../tests/job-2node.json").unwrap();
    let source = archivelog::TextArchiveSource::new(Some(std::path::Path::new("../tests")));
    let (preprocs, analytics) = all_plugins();
    let mut s = jobsumm::Summarize::new(
        preprocs,
        analytics,
        job,
        rustutils::SummarizeConfig::default(),
        Box::new(source),
        false,
    );
    assert!(s.process().unwrap());
    assert!(s.complete());
    s.get()
}

#[test]
fn test_fixture_job_summary() {
    let doc = summarize_fixture_job();
    assert!(doc["acct"]["id"] == "1234567");
    assert!(doc["acct"]["user"] == "alice");
    assert!(doc["summarization"]["srcdir"] == "/data/jobs/1234567");
    assert!(doc["summarization"]["complete"] == true);
    assert!(doc["timeseries"]["version"] == jobsumm::TIMESERIES_VERSION);
    assert!(doc.get("errors").is_none());
}
