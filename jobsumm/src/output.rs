/// Assembling the job summary document.
///
/// The document is a JSON object:
///
///   <analytic name>: results of each all-mode and first-last analytic that ran
///   <preprocessor fields>: the object returned by each preprocessor that ran, merged in
///   summarization: { version, elapsed, created, srcdir, complete, datasource }
///   created: RFC 3339 time of assembly
///   acct: the job's accounting data with "id" set to the job id
///   timeseries: { <analytic name>: results..., hosts: { <nodeidx>: <nodename> }, version }
///      present only if some timeseries analytic ran
///   errors: { <category>: [message, ...] }, present only if there are errors
///
/// A plugin "ran" if its status is not uninitialized.
use crate::{AnalyticMode, Status, Summarize};

use log::warn;
use rustutils::{now, timestamp_to_secs};
use serde_json::{json, Map, Value};

/// Version of the layout of the `timeseries` block.
pub const TIMESERIES_VERSION: u64 = 4;

pub const SUMMARIZE_VERSION: &str = env!("CARGO_PKG_VERSION");

impl Summarize {
    /// The summary document.  This does not change the session; it can be called repeatedly.
    pub fn get(&self) -> Value {
        let mut output = Map::new();
        let mut timeseries = Map::new();

        if self.job.nodecount > 0 {
            for analytic in self.alltimestamps.iter().chain(self.firstlast.iter()) {
                if analytic.status() == Status::Uninitialized {
                    continue;
                }
                let bucket = match analytic.mode() {
                    AnalyticMode::Timeseries => &mut timeseries,
                    AnalyticMode::All | AnalyticMode::FirstLast => &mut output,
                };
                bucket.insert(analytic.name().to_string(), analytic.results());
            }
        }

        let created = now();
        output.insert(
            "summarization".to_string(),
            json!({
                "version": SUMMARIZE_VERSION,
                "elapsed": self.start.elapsed().as_secs_f64(),
                "created": timestamp_to_secs(created),
                "srcdir": self.job.jobdir,
                "complete": self.complete(),
                "datasource": self.config.datasource,
            }),
        );
        output.insert("created".to_string(), Value::String(created.to_rfc3339()));

        let mut acct = self.job.acct.clone();
        acct.insert("id".to_string(), Value::String(self.job.job_id.clone()));
        output.insert("acct".to_string(), Value::Object(acct));

        if !timeseries.is_empty() {
            let mut hosts = Map::new();
            for n in self.job.nodearchives() {
                hosts.insert(n.nodeidx.to_string(), Value::String(n.nodename.clone()));
            }
            timeseries.insert("hosts".to_string(), Value::Object(hosts));
            timeseries.insert("version".to_string(), json!(TIMESERIES_VERSION));
            output.insert("timeseries".to_string(), Value::Object(timeseries));
        }

        for preproc in &self.preprocs {
            if preproc.status() == Status::Uninitialized {
                continue;
            }
            match preproc.results() {
                Some(Value::Object(fields)) => output.extend(fields),
                Some(_) => warn!("Preprocessor {} returned a non-object result", preproc.name()),
                None => {}
            }
        }

        let mut errors = self.errors.clone();
        for e in self.job.get_errors() {
            errors.add("job", e);
        }
        for (source, data) in self.job.data() {
            if let Some(e) = data.get("errors") {
                let msg = match e {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                errors.add(source, &msg);
            }
        }
        if !errors.is_empty() {
            output.insert("errors".to_string(), errors.to_json());
        }

        Value::Object(output)
    }
}

#[cfg(test)]
use crate::testutil::{counter_archive, MemSource, ScriptedAnalytic, ScriptedPreproc};
#[cfg(test)]
use crate::{Analytic, Job, RequiredMetrics};
#[cfg(test)]
use rustutils::SummarizeConfig;

#[cfg(test)]
fn session(analytics: Vec<Box<dyn Analytic>>, missing: bool) -> Summarize {
    let mut job = Job::new("42", "/jobs/42", 2);
    job.acct.insert("user".to_string(), json!("alice"));
    let mut source = MemSource::new();
    source.add("a", counter_archive("c1-1", &[(10, 1), (20, 2)]));
    if !missing {
        source.add("b", counter_archive("c1-2", &[(10, 1), (20, 2)]));
    }
    job.add_node("c1-1", "a");
    job.add_node("c1-2", "b");
    let (pp, _) = ScriptedPreproc::new("procs", RequiredMetrics::all(&["test.load"]));
    Summarize::new(
        vec![Box::new(pp)],
        analytics,
        job,
        SummarizeConfig::default(),
        Box::new(source),
        false,
    )
}

#[cfg(test)]
fn analytic(name: &str, metric: &str, mode: AnalyticMode) -> Box<dyn Analytic> {
    Box::new(ScriptedAnalytic::new(name, RequiredMetrics::all(&[metric]), mode).0)
}

#[test]
fn test_summary_document() {
    let mut s = session(
        vec![
            analytic("cpu", "test.counter", AnalyticMode::All),
            analytic("load", "test.load", AnalyticMode::Timeseries),
            analytic("net", "test.counter", AnalyticMode::FirstLast),
            analytic("gpu", "nvidia.gpuutil", AnalyticMode::All),
        ],
        false,
    );
    assert!(s.process().unwrap());
    let doc = s.get();

    assert!(doc["cpu"]["calls"] == 4);
    assert!(doc["net"]["calls"] == 4);
    assert!(doc.get("gpu").is_none());
    assert!(doc.get("load").is_none());
    assert!(doc["procs"]["hosts"] == 2);

    let summ = &doc["summarization"];
    assert!(summ["version"] == SUMMARIZE_VERSION);
    assert!(summ["srcdir"] == "/jobs/42");
    assert!(summ["complete"] == true);
    assert!(summ["datasource"] == "pcp");
    assert!(summ["elapsed"].as_f64().unwrap() >= 0.0);
    assert!(summ["created"].as_f64().unwrap() > 0.0);
    assert!(rustutils::parse_timestamp(doc["created"].as_str().unwrap()).is_ok());

    assert!(doc["acct"]["id"] == "42");
    assert!(doc["acct"]["user"] == "alice");

    let ts = &doc["timeseries"];
    assert!(ts["load"]["calls"] == 4);
    assert!(ts["hosts"]["0"] == "c1-1");
    assert!(ts["hosts"]["1"] == "c1-2");
    assert!(ts["version"] == TIMESERIES_VERSION);

    assert!(doc.get("errors").is_none());
}

#[test]
fn test_summary_errors_and_no_timeseries() {
    let mut s = session(vec![analytic("cpu", "test.counter", AnalyticMode::All)], true);
    s.job.add_error("no archive for c1-3");
    s.job.set_data("slurm", json!({ "errors": "accounting record truncated" }));
    assert!(!s.process().unwrap());
    let doc = s.get();
    assert!(doc.get("timeseries").is_none());
    assert!(doc["summarization"]["complete"] == false);
    let errors = &doc["errors"];
    assert!(errors["archive"].as_array().unwrap().len() == 1);
    assert!(errors["job"][0] == "no archive for c1-3");
    assert!(errors["slurm"][0] == "accounting record truncated");

    // Assembly leaves the session's ledger alone.
    assert!(s.errors().get("job").is_none());
    assert!(s.get()["errors"]["job"].as_array().unwrap().len() == 1);
}

#[test]
fn test_summary_of_empty_job() {
    let job = Job::new("7", "", 0);
    let s = Summarize::new(
        vec![],
        vec![analytic("cpu", "test.counter", AnalyticMode::All)],
        job,
        SummarizeConfig::default(),
        Box::new(MemSource::new()),
        false,
    );
    let doc = s.get();
    assert!(doc["acct"]["id"] == "7");
    assert!(doc["summarization"]["complete"] == true);
    assert!(doc.get("cpu").is_none());
}
