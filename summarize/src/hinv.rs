/// Hardware inventory: the number of CPUs of each node, and the total for the job.
///
///   { "hinv": { "cores": { "<hostname>": ncpu, ... }, "total_cores": n } }
use anyhow::Result;
use jobsumm::{Flow, Plugin, Preprocessor, RequiredMetrics, Sample, Status};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub struct HardwareInventory {
    status: Status,
    host: Option<String>,
    cores: BTreeMap<String, u64>,
}

impl HardwareInventory {
    pub fn new() -> HardwareInventory {
        HardwareInventory {
            status: Status::Uninitialized,
            host: None,
            cores: BTreeMap::new(),
        }
    }
}

impl Plugin for HardwareInventory {
    fn name(&self) -> &str {
        "hinv"
    }

    fn required_metrics(&self) -> RequiredMetrics {
        RequiredMetrics::all(&["hinv.ncpu"])
    }

    fn status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status
    }
}

impl Preprocessor for HardwareInventory {
    fn hoststart(&mut self, hostname: &str) {
        self.host = Some(hostname.to_string());
    }

    fn process(&mut self, sample: &Sample) -> Result<Flow> {
        if let (Some(host), Some(ncpu)) = (&self.host, sample.data[0].values.first()) {
            self.cores.insert(host.clone(), *ncpu as u64);
        }
        // The inventory does not change during a job.
        Ok(Flow::Stop)
    }

    fn hostend(&mut self) {
        self.host = None;
    }

    fn results(&self) -> Option<Value> {
        if self.cores.is_empty() {
            return None;
        }
        let mut cores = Map::new();
        for (host, n) in &self.cores {
            cores.insert(host.clone(), json!(n));
        }
        Some(json!({
            "hinv": {
                "cores": cores,
                "total_cores": self.cores.values().sum::<u64>(),
            }
        }))
    }
}

#[test]
fn test_hinv() {
    let doc = crate::plugins::summarize_fixture_job();
    assert!(doc["hinv"]["cores"]["c1-1"] == 16);
    assert!(doc["hinv"]["cores"]["c1-2"] == 32);
    assert!(doc["hinv"]["total_cores"] == 48);
}

#[test]
fn test_hinv_empty() {
    let h = HardwareInventory::new();
    assert!(h.results().is_none());
}
