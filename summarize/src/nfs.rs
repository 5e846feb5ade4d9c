/// NFS client traffic as a time series: MiB/s read and written over all mounts, per node.
///
/// Each sample is reduced to the total byte count of the six nfsclient.bytes counters over all
/// mounts; the rate is the change in that total between consecutive samples.  Mounts can appear
/// and disappear during a job, so samples with a different number of values than the node's first
/// one are skipped.
///
///   { "hosts": { "<nodeidx>": { "times": [secs, ...], "all": [MiB/s, ...] } } }
use anyhow::Result;
use jobsumm::{Analytic, AnalyticMode, Flow, NodeMeta, Plugin, RequiredMetrics, Sample, Status};
use rustutils::Timeval;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

const MIB: f64 = 1048576.0;

#[derive(Default)]
struct HostSeries {
    width: Option<usize>,
    last: Option<(Timeval, f64)>,
    times: Vec<f64>,
    rates: Vec<f64>,
}

pub struct NfsTimeseries {
    status: Status,
    hosts: BTreeMap<usize, HostSeries>,
}

impl NfsTimeseries {
    pub fn new() -> NfsTimeseries {
        NfsTimeseries {
            status: Status::Uninitialized,
            hosts: BTreeMap::new(),
        }
    }
}

impl Plugin for NfsTimeseries {
    fn name(&self) -> &str {
        "nfs"
    }

    fn required_metrics(&self) -> RequiredMetrics {
        RequiredMetrics::all(&[
            "nfsclient.bytes.read.normal",
            "nfsclient.bytes.read.direct",
            "nfsclient.bytes.read.server",
            "nfsclient.bytes.write.normal",
            "nfsclient.bytes.write.direct",
            "nfsclient.bytes.write.server",
        ])
    }

    fn status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status
    }
}

impl Analytic for NfsTimeseries {
    fn mode(&self) -> AnalyticMode {
        AnalyticMode::Timeseries
    }

    fn process(&mut self, node: &NodeMeta, sample: &Sample) -> Result<Flow> {
        let series = self.hosts.entry(node.nodeindex).or_default();
        let width = sample.data.iter().map(|d| d.values.len()).sum::<usize>();
        if *series.width.get_or_insert(width) != width {
            return Ok(Flow::Continue);
        }
        let point = sample.data.iter().flat_map(|d| d.values.iter()).sum::<f64>() / MIB;
        if let Some((t, prev)) = series.last {
            let dt = sample.timestamp.as_secs_f64() - t.as_secs_f64();
            if dt > 0.0 {
                series.times.push(sample.timestamp.as_secs_f64());
                series.rates.push((point - prev) / dt);
            }
        }
        series.last = Some((sample.timestamp, point));
        Ok(Flow::Continue)
    }

    fn results(&self) -> Value {
        let mut hosts = Map::new();
        for (idx, series) in &self.hosts {
            hosts.insert(
                idx.to_string(),
                json!({ "times": series.times, "all": series.rates }),
            );
        }
        json!({ "hosts": hosts })
    }
}

#[test]
fn test_nfs_rates() {
    let doc = crate::plugins::summarize_fixture_job();
    let nfs = &doc["timeseries"]["nfs"]["hosts"];
    assert!(nfs["0"]["times"] == json!([1020.0, 1040.0, 1060.0]));
    assert!(nfs["0"]["all"] == json!([0.05, 0.15, 0.05]));
    assert!(nfs["1"]["all"] == json!([0.0, 0.1, 0.0]));
    assert!(doc["timeseries"]["hosts"]["1"] == "c1-2");
}
