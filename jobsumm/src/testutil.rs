// Scripted plugins and archives for the whitebox tests.

use crate::{
    Analytic, AnalyticMode, Flow, NodeMeta, Plugin, Preprocessor, RequiredMetrics, Sample, Status,
};

use anyhow::{bail, Result};
use archivelog::{
    Archive, ArchiveError, ArchiveLabel, ArchiveSource, FetchMode, IndomId, MetricDesc, MetricId,
    SampleSet, TextArchive,
};
use rustutils::Timeval;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use ustr::Ustr;

/// An archive with a counter (`test.counter`, pmid 1) and an instant metric (`test.load`, pmid 2,
/// half the counter) at each of the given times.
pub fn counter_archive(host: &str, samples: &[(i64, u64)]) -> String {
    let start = samples.first().map(|s| s.0).unwrap_or(0);
    let end = samples.last().map(|s| s.0).unwrap_or(0);
    let mut s = format!(
        "label,{host},{start},{end}\n\
         metric,1,test.counter,u64,counter,-\n\
         metric,2,test.load,double,instant,-\n"
    );
    for (t, v) in samples {
        s += &format!("sample,{t},1={v},2={:.1}\n", *v as f64 / 2.0);
    }
    s
}

pub fn node_meta(archive: &dyn Archive) -> NodeMeta {
    NodeMeta {
        nodename: archive.label().hostname,
        nodeindex: 0,
        archive: archive.label().clone(),
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub node: Ustr,
    pub timestamp: Timeval,
    pub value: f64,
}

/// An analytic that records the first value of its first metric on every call.
pub struct ScriptedAnalytic {
    name: String,
    metrics: RequiredMetrics,
    mode: AnalyticMode,
    status: Status,
    pub passthrough: bool,
    pub stop_after: Option<usize>,
    pub fail: bool,
    calls: Rc<RefCell<Vec<Call>>>,
}

impl ScriptedAnalytic {
    pub fn new(
        name: &str,
        metrics: RequiredMetrics,
        mode: AnalyticMode,
    ) -> (ScriptedAnalytic, Rc<RefCell<Vec<Call>>>) {
        let calls = Rc::new(RefCell::new(vec![]));
        (
            ScriptedAnalytic {
                name: name.to_string(),
                metrics,
                mode,
                status: Status::Uninitialized,
                passthrough: true,
                stop_after: None,
                fail: false,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl Plugin for ScriptedAnalytic {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_metrics(&self) -> RequiredMetrics {
        self.metrics.clone()
    }

    fn status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status
    }
}

impl Analytic for ScriptedAnalytic {
    fn mode(&self) -> AnalyticMode {
        self.mode
    }

    fn passthrough(&self) -> bool {
        self.passthrough
    }

    fn process(&mut self, node: &NodeMeta, sample: &Sample) -> Result<Flow> {
        let value = sample.data[0].values.first().copied().unwrap_or(f64::NAN);
        let mut calls = self.calls.borrow_mut();
        calls.push(Call {
            node: node.nodename,
            timestamp: sample.timestamp,
            value,
        });
        if self.fail {
            bail!("scripted failure at {}", sample.timestamp)
        }
        if let Some(n) = self.stop_after {
            if calls.len() >= n {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn results(&self) -> Value {
        json!({ "calls": self.calls.borrow().len() })
    }
}

#[derive(Debug, Default)]
pub struct PreprocLog {
    pub hosts: Vec<String>,
    pub ended: usize,
    pub values: Vec<f64>,
}

pub struct ScriptedPreproc {
    name: String,
    metrics: RequiredMetrics,
    status: Status,
    log: Rc<RefCell<PreprocLog>>,
}

impl ScriptedPreproc {
    pub fn new(name: &str, metrics: RequiredMetrics) -> (ScriptedPreproc, Rc<RefCell<PreprocLog>>) {
        let log = Rc::new(RefCell::new(PreprocLog::default()));
        (
            ScriptedPreproc {
                name: name.to_string(),
                metrics,
                status: Status::Uninitialized,
                log: log.clone(),
            },
            log,
        )
    }
}

impl Plugin for ScriptedPreproc {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_metrics(&self) -> RequiredMetrics {
        self.metrics.clone()
    }

    fn status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status
    }
}

impl Preprocessor for ScriptedPreproc {
    fn hoststart(&mut self, hostname: &str) {
        self.log.borrow_mut().hosts.push(hostname.to_string());
    }

    fn process(&mut self, sample: &Sample) -> Result<Flow> {
        if let Some(v) = sample.data[0].values.first() {
            self.log.borrow_mut().values.push(*v);
        }
        Ok(Flow::Continue)
    }

    fn hostend(&mut self) {
        self.log.borrow_mut().ended += 1;
    }

    fn results(&self) -> Option<Value> {
        let mut m = serde_json::Map::new();
        m.insert(
            self.name.clone(),
            json!({ "hosts": self.log.borrow().hosts.len() }),
        );
        Some(Value::Object(m))
    }
}

#[derive(Debug, Default)]
pub struct FetchStats {
    pub fetches: usize,
    pub frees: usize,
}

/// Wraps a text archive, counting fetches and frees and failing every fetch after the first
/// `fail_after` ones.
pub struct FaultyArchive {
    inner: TextArchive,
    fail_after: Option<usize>,
    fetched: usize,
    stats: Rc<RefCell<FetchStats>>,
}

impl Archive for FaultyArchive {
    fn label(&self) -> &ArchiveLabel {
        self.inner.label()
    }

    fn lookup_name(&self, name: &str) -> Result<MetricId, ArchiveError> {
        self.inner.lookup_name(name)
    }

    fn describe(&self, pmid: MetricId) -> Result<MetricDesc, ArchiveError> {
        self.inner.describe(pmid)
    }

    fn instance_name(&self, indom: IndomId, inst: i32) -> Option<Ustr> {
        self.inner.instance_name(indom, inst)
    }

    fn set_mode(&mut self, mode: FetchMode, when: Timeval) -> Result<(), ArchiveError> {
        self.inner.set_mode(mode, when)
    }

    fn fetch(&mut self, pmids: &[MetricId]) -> Result<SampleSet, ArchiveError> {
        if let Some(n) = self.fail_after {
            if self.fetched >= n {
                return Err(ArchiveError::Library("injected failure".to_string()));
            }
        }
        let result = self.inner.fetch(pmids)?;
        self.fetched += 1;
        self.stats.borrow_mut().fetches += 1;
        Ok(result)
    }

    fn free(&mut self, result: SampleSet) {
        self.stats.borrow_mut().frees += 1;
        self.inner.free(result)
    }
}

/// Archives held in memory, keyed by location.  Unknown locations fail to open.
#[derive(Default)]
pub struct MemSource {
    archives: HashMap<String, (String, Option<usize>)>,
    pub stats: Rc<RefCell<FetchStats>>,
}

impl MemSource {
    pub fn new() -> MemSource {
        Default::default()
    }

    pub fn add(&mut self, location: &str, text: String) {
        self.archives.insert(location.to_string(), (text, None));
    }

    pub fn add_faulty(&mut self, location: &str, text: String, fail_after: usize) {
        self.archives
            .insert(location.to_string(), (text, Some(fail_after)));
    }
}

impl ArchiveSource for MemSource {
    fn open(&self, location: &str) -> Result<Box<dyn Archive>, ArchiveError> {
        let Some((text, fail_after)) = self.archives.get(location) else {
            return Err(ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{location}: no such archive"),
            )));
        };
        Ok(Box::new(FaultyArchive {
            inner: TextArchive::parse(location, &mut text.as_bytes())?,
            fail_after: *fail_after,
            fetched: 0,
            stats: self.stats.clone(),
        }))
    }
}
