/// Network traffic per interface: bytes (and packets, where recorded) moved over the job, from
/// the difference between the first and the last sample on each node.
///
/// Results are keyed by interface name, with an "all" entry summing the interfaces of each node.
/// For each metric the statistics are over nodes:
///
///   { "eth0": { "in-bytes": { "avg": ..., "min": ..., "max": ..., "cnt": ... }, ... },
///     "all": { ... } }
use anyhow::Result;
use itertools::{Itertools, MinMaxResult};
use jobsumm::{Analytic, AnalyticMode, Flow, NodeMeta, Plugin, RequiredMetrics, Sample, Status};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use ustr::Ustr;

// metric name -> device name -> value
type DeviceValues = BTreeMap<Ustr, BTreeMap<Ustr, f64>>;

pub struct Network {
    status: Status,
    first: HashMap<usize, DeviceValues>,
    diffs: BTreeMap<usize, DeviceValues>,
}

impl Network {
    pub fn new() -> Network {
        Network {
            status: Status::Uninitialized,
            first: HashMap::new(),
            diffs: BTreeMap::new(),
        }
    }
}

impl Plugin for Network {
    fn name(&self) -> &str {
        "network"
    }

    fn required_metrics(&self) -> RequiredMetrics {
        RequiredMetrics::all(&["network.interface.in.bytes", "network.interface.out.bytes"])
    }

    fn optional_metrics(&self) -> Vec<String> {
        vec![
            "network.interface.in.packets".to_string(),
            "network.interface.out.packets".to_string(),
        ]
    }

    fn status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status
    }
}

impl Analytic for Network {
    fn mode(&self) -> AnalyticMode {
        AnalyticMode::FirstLast
    }

    fn process(&mut self, node: &NodeMeta, sample: &Sample) -> Result<Flow> {
        let values = device_values(sample);
        match self.first.remove(&node.nodeindex) {
            None => {
                self.first.insert(node.nodeindex, values);
            }
            Some(first) => {
                let mut diff = DeviceValues::new();
                for (metric, devices) in values {
                    let Some(start) = first.get(&metric) else {
                        continue;
                    };
                    let d = diff.entry(metric).or_default();
                    for (device, v) in devices {
                        // Devices can come and go; only those present at both ends count.
                        if let Some(s) = start.get(&device) {
                            d.insert(device, v - s);
                        }
                    }
                }
                self.diffs.insert(node.nodeindex, diff);
            }
        }
        Ok(Flow::Continue)
    }

    fn results(&self) -> Value {
        if self.diffs.is_empty() {
            return json!({ "error": "insufficient data" });
        }

        // device -> metric -> per-node values
        let mut by_device: BTreeMap<String, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
        for diff in self.diffs.values() {
            for (metric, devices) in diff {
                let key = short_name(metric);
                for (device, v) in devices {
                    by_device
                        .entry(device.to_string())
                        .or_default()
                        .entry(key.clone())
                        .or_default()
                        .push(*v);
                }
                let total = devices.values().sum::<f64>();
                by_device
                    .entry("all".to_string())
                    .or_default()
                    .entry(key)
                    .or_default()
                    .push(total);
            }
        }

        let mut out = Map::new();
        for (device, metrics) in by_device {
            let mut m = Map::new();
            for (metric, values) in metrics {
                m.insert(metric, stats(&values));
            }
            out.insert(device, Value::Object(m));
        }
        Value::Object(out)
    }
}

fn device_values(sample: &Sample) -> DeviceValues {
    let mut result = DeviceValues::new();
    for ((name, data), description) in sample
        .names
        .iter()
        .zip(sample.data.iter())
        .zip(sample.description.iter())
    {
        let names = description.iter().copied().collect::<HashMap<i32, Ustr>>();
        let devices = result.entry(*name).or_default();
        for (inst, v) in data.instances.iter().zip(data.values.iter()) {
            if let Some(device) = names.get(inst) {
                devices.insert(*device, *v);
            }
        }
    }
    result
}

// "network.interface.in.bytes" -> "in-bytes"
fn short_name(metric: &str) -> String {
    metric
        .strip_prefix("network.interface.")
        .unwrap_or(metric)
        .replace('.', "-")
}

fn stats(values: &[f64]) -> Value {
    let (min, max) = match values.iter().copied().minmax_by(|a, b| a.total_cmp(b)) {
        MinMaxResult::NoElements => return json!({ "cnt": 0 }),
        MinMaxResult::OneElement(x) => (x, x),
        MinMaxResult::MinMax(lo, hi) => (lo, hi),
    };
    json!({
        "avg": values.iter().sum::<f64>() / values.len() as f64,
        "min": min,
        "max": max,
        "cnt": values.len(),
    })
}

#[test]
fn test_network_two_nodes() {
    let doc = crate::plugins::summarize_fixture_job();
    let net = &doc["network"];
    assert!(net["eth0"]["in-bytes"]["cnt"] == 2);
    assert!(net["eth0"]["in-bytes"]["max"] == 3000.0);
    // The reset on c1-2 is corrected, so the full 1500 bytes are counted.
    assert!(net["eth0"]["in-bytes"]["min"] == 1500.0);
    assert!(net["eth0"]["in-bytes"]["avg"] == 2250.0);
    assert!(net["eth0"]["out-bytes"]["avg"] == 1500.0);
    assert!(net["ib0"]["in-bytes"]["cnt"] == 1);
    assert!(net["ib0"]["out-bytes"]["max"] == 6000.0);
    assert!(net["all"]["in-bytes"]["max"] == 9000.0);
    assert!(net["all"]["in-bytes"]["min"] == 1500.0);
}

#[test]
fn test_network_no_data() {
    let n = Network::new();
    assert!(n.results()["error"] == "insufficient data");
}
