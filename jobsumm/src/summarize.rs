/// The per-job summarization session.
///
/// A `Summarize` owns the plugins, the job, and the error ledger for the whole run.  `process`
/// opens every node archive of the job in turn and runs every plugin over it: first the
/// preprocessors, then the all-timestamps analytics, then the first-last analytics, each in the
/// order given.  A failing node is recorded and skipped; it never stops the job unless the session
/// is fail-fast.
///
/// An archive counts as processed only if nothing went wrong with it at the archive level.  Errors
/// returned from plugin hooks are recorded against the node and plugin but do not fail the
/// archive; they do however make `process` return false.
use crate::fetch::FetchLoop;
use crate::job::NodeArchive;
use crate::{Analytic, AnalyticMode, ErrorLedger, Job, NodeMeta, Preprocessor, RangeCorrector, Status};

use anyhow::Result;
use archivelog::{ArchiveSource, FetchMode};
use log::{debug, info, warn};
use rustutils::SummarizeConfig;
use std::time::Instant;

pub struct Summarize {
    pub(crate) preprocs: Vec<Box<dyn Preprocessor>>,
    pub(crate) alltimestamps: Vec<Box<dyn Analytic>>,
    pub(crate) firstlast: Vec<Box<dyn Analytic>>,
    pub(crate) job: Job,
    pub(crate) config: SummarizeConfig,
    pub(crate) start: Instant,
    pub(crate) errors: ErrorLedger,
    source: Box<dyn ArchiveSource>,
    fail_fast: bool,
    rangechange: RangeCorrector,
    archives_processed: usize,
    hook_failures: usize,
}

impl Summarize {
    /// The analytics are sorted by mode, keeping their relative order.  `fail_fast` is or'ed with
    /// the config's setting.
    pub fn new(
        preprocs: Vec<Box<dyn Preprocessor>>,
        analytics: Vec<Box<dyn Analytic>>,
        job: Job,
        config: SummarizeConfig,
        source: Box<dyn ArchiveSource>,
        fail_fast: bool,
    ) -> Summarize {
        let (firstlast, alltimestamps): (Vec<_>, Vec<_>) = analytics
            .into_iter()
            .partition(|a| a.mode() == AnalyticMode::FirstLast);
        Summarize {
            preprocs,
            alltimestamps,
            firstlast,
            job,
            rangechange: RangeCorrector::new(&config),
            fail_fast: fail_fast || config.fail_fast,
            config,
            start: Instant::now(),
            errors: ErrorLedger::new(),
            source,
            archives_processed: 0,
            hook_failures: 0,
        }
    }

    /// Process all archives of the job.  Returns true if every archive was processed and no plugin
    /// hook failed.  Returns an error only in fail-fast mode.
    pub fn process(&mut self) -> Result<bool> {
        let mut failures = 0;
        self.archives_processed = 0;
        self.hook_failures = 0;

        let nodes = self.job.nodearchives().to_vec();
        for node in &nodes {
            match self.processarchive(node) {
                Ok(0) => {
                    self.archives_processed += 1;
                }
                Ok(n) => {
                    debug!("{}: {n} analytics failed", node.archive);
                    failures += 1;
                }
                Err(e) => {
                    warn!("{}: {:#}", node.archive, e);
                    failures += 1;
                    self.errors
                        .add("archive", &format!("{}: {:#}", node.archive, e));
                    if self.fail_fast {
                        return Err(e);
                    }
                }
            }
        }

        info!(
            "Job {}: {} of {} archives processed",
            self.job.job_id, self.archives_processed, self.job.nodecount
        );
        Ok(failures == 0 && self.hook_failures == 0)
    }

    /// True if archives for all of the job's nodes were processed.
    pub fn complete(&self) -> bool {
        self.job.nodecount == self.archives_processed
    }

    /// True if archives for a sufficient fraction of the job's nodes were processed.
    pub fn good_enough(&self) -> bool {
        self.archives_processed as f64
            >= self.config.good_enough_fraction * self.job.nodecount as f64
    }

    pub fn archives_processed(&self) -> usize {
        self.archives_processed
    }

    pub fn errors(&self) -> &ErrorLedger {
        &self.errors
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// (name, status) for every plugin, preprocessors first.
    pub fn plugin_statuses(&self) -> Vec<(&str, Status)> {
        let mut v = vec![];
        for p in &self.preprocs {
            v.push((p.name(), p.status()));
        }
        for a in self.alltimestamps.iter().chain(self.firstlast.iter()) {
            v.push((a.name(), a.status()));
        }
        v
    }

    // Returns the number of analytics that failed at the archive level.  Failure to open or
    // position the archive, or a failing preprocessor, is an error.

    fn processarchive(&mut self, node: &NodeArchive) -> Result<usize> {
        let mut archive = self.source.open(&node.archive)?;
        let meta = NodeMeta {
            nodename: ustr::ustr(&node.nodename),
            nodeindex: node.nodeidx,
            archive: archive.label().clone(),
        };
        let start = meta.archive.start;
        let fail_fast = self.fail_fast;

        let mut fl = FetchLoop::new(
            &mut self.rangechange,
            &mut self.errors,
            &meta,
            &self.job.job_id,
        );
        let mut failed = 0;

        for preproc in self.preprocs.iter_mut() {
            archive.set_mode(FetchMode::Forward, start)?;
            fl.process_preproc(archive.as_mut(), preproc.as_mut())?;
        }

        for analytic in self.alltimestamps.iter_mut() {
            archive.set_mode(FetchMode::Forward, start)?;
            if let Err(e) = fl.process_analytic(archive.as_mut(), analytic.as_mut()) {
                if fail_fast {
                    return Err(e.into());
                }
                fl.logerror(analytic.name(), &e.to_string());
                failed += 1;
            }
        }

        for analytic in self.firstlast.iter_mut() {
            archive.set_mode(FetchMode::Forward, start)?;
            if let Err(e) = fl.process_firstlast(archive.as_mut(), analytic.as_mut()) {
                if fail_fast {
                    return Err(e.into());
                }
                fl.logerror(analytic.name(), &e.to_string());
                failed += 1;
            }
        }

        self.hook_failures += fl.hook_failures;
        Ok(failed)
    }
}

#[cfg(test)]
use crate::testutil::{counter_archive, MemSource, ScriptedAnalytic, ScriptedPreproc};
#[cfg(test)]
use crate::RequiredMetrics;

#[cfg(test)]
const SAMPLES: [(i64, u64); 4] = [(100, 10), (110, 20), (120, 30), (130, 40)];

// A job of `nodecount` nodes of which the first `present` have archives, the others have archive
// locations that do not exist.

#[cfg(test)]
fn job_with(nodecount: usize, present: usize) -> (Job, MemSource) {
    let mut job = Job::new("42", "/jobs/42", nodecount);
    let mut source = MemSource::new();
    for i in 0..nodecount {
        let host = format!("c{i}");
        let loc = format!("{host}.txt");
        if i < present {
            source.add(&loc, counter_archive(&host, &SAMPLES));
        }
        job.add_node(&host, &loc);
    }
    (job, source)
}

#[cfg(test)]
fn counter_analytic(name: &str, mode: AnalyticMode) -> Box<dyn Analytic> {
    Box::new(ScriptedAnalytic::new(name, RequiredMetrics::all(&["test.counter"]), mode).0)
}

#[test]
fn test_all_archives_good() {
    let (job, source) = job_with(3, 3);
    let stats = source.stats.clone();
    let (pp, pplog) = ScriptedPreproc::new("pp", RequiredMetrics::all(&["test.load"]));
    let (all, calls) =
        ScriptedAnalytic::new("all", RequiredMetrics::all(&["test.counter"]), AnalyticMode::All);
    let mut s = Summarize::new(
        vec![Box::new(pp)],
        vec![
            counter_analytic("fl", AnalyticMode::FirstLast),
            Box::new(all),
            counter_analytic("ts", AnalyticMode::Timeseries),
        ],
        job,
        SummarizeConfig::default(),
        Box::new(source),
        false,
    );
    assert!(s.process().unwrap());
    assert!(s.archives_processed() == 3);
    assert!(s.complete());
    assert!(s.good_enough());
    assert!(s.errors().is_empty());

    // Plugins run in order: all-timestamps before first-last, whatever the declaration order.
    let names = s.plugin_statuses().iter().map(|(n, _)| n.to_string()).collect::<Vec<_>>();
    assert!(names == vec!["pp", "all", "ts", "fl"]);
    assert!(s.plugin_statuses().iter().all(|(_, st)| *st == Status::Complete));

    assert!(calls.borrow().len() == 12);
    let nodes = calls.borrow().iter().map(|c| c.node.to_string()).collect::<Vec<_>>();
    assert!(nodes[0] == "c0" && nodes[4] == "c1" && nodes[8] == "c2");
    assert!(pplog.borrow().hosts == vec!["c0", "c1", "c2"]);
    assert!(pplog.borrow().ended == 3);

    let stats = stats.borrow();
    assert!(stats.fetches > 0);
    assert!(stats.fetches == stats.frees);
}

#[test]
fn test_missing_archive_not_good_enough() {
    let (job, source) = job_with(10, 9);
    let mut s = Summarize::new(
        vec![],
        vec![counter_analytic("all", AnalyticMode::All)],
        job,
        SummarizeConfig::default(),
        Box::new(source),
        false,
    );
    assert!(!s.process().unwrap());
    assert!(s.archives_processed() == 9);
    assert!(!s.complete());
    assert!(!s.good_enough());
    let msgs = s.errors().get("archive").unwrap();
    assert!(msgs.len() == 1);
    assert!(msgs.iter().next().unwrap().starts_with("c9.txt: "));
}

#[test]
fn test_missing_archive_good_enough() {
    let (job, source) = job_with(20, 19);
    let mut s = Summarize::new(
        vec![],
        vec![counter_analytic("all", AnalyticMode::All)],
        job,
        SummarizeConfig::default(),
        Box::new(source),
        false,
    );
    assert!(!s.process().unwrap());
    assert!(s.archives_processed() == 19);
    assert!(!s.complete());
    assert!(s.good_enough());
}

#[test]
fn test_good_enough_fraction_from_config() {
    let (job, source) = job_with(10, 9);
    let mut config = SummarizeConfig::default();
    config.good_enough_fraction = 0.9;
    let mut s = Summarize::new(vec![], vec![], job, config, Box::new(source), false);
    s.process().unwrap();
    assert!(s.good_enough());
}

#[test]
fn test_failing_analytic_does_not_stop_others() {
    let (job, source) = job_with(3, 3);
    let (mut bad, _) =
        ScriptedAnalytic::new("bad", RequiredMetrics::all(&["test.counter"]), AnalyticMode::All);
    bad.fail = true;
    let (good, calls) =
        ScriptedAnalytic::new("good", RequiredMetrics::all(&["test.counter"]), AnalyticMode::All);
    let mut s = Summarize::new(
        vec![],
        vec![Box::new(bad), Box::new(good)],
        job,
        SummarizeConfig::default(),
        Box::new(source),
        false,
    );
    assert!(!s.process().unwrap());
    assert!(s.archives_processed() == 3);
    assert!(s.complete());
    assert!(calls.borrow().len() == 12);
    let msgs = s.errors().get("archive").unwrap();
    assert!(msgs.len() == 3);
    assert!(msgs.iter().all(|m| m.contains(" bad scripted failure")));
    let statuses = s.plugin_statuses();
    assert!(statuses[0] == ("bad", Status::Failure));
    assert!(statuses[1] == ("good", Status::Complete));
}

#[test]
fn test_fetch_error_fails_archive_but_not_analytics() {
    let (job, mut source) = job_with(2, 2);
    source.add_faulty("c1.txt", counter_archive("c1", &SAMPLES), 2);
    let stats = source.stats.clone();
    let (fl, flcalls) = ScriptedAnalytic::new(
        "fl",
        RequiredMetrics::all(&["test.load"]),
        AnalyticMode::FirstLast,
    );
    let mut s = Summarize::new(
        vec![],
        vec![counter_analytic("all", AnalyticMode::All), Box::new(fl)],
        job,
        SummarizeConfig::default(),
        Box::new(source),
        false,
    );
    assert!(!s.process().unwrap());
    assert!(s.archives_processed() == 1);
    let msgs = s.errors().get("archive").unwrap();
    assert!(msgs.contains("c1 all archive library error: injected failure"));
    assert!(msgs.contains("c1 fl archive library error: injected failure"));
    // The first-last analytic ran on the good node only.
    assert!(flcalls.borrow().len() == 2);
    let stats = stats.borrow();
    assert!(stats.fetches == stats.frees);
}

#[test]
fn test_fail_fast() {
    let (job, source) = job_with(3, 2);
    let mut s = Summarize::new(
        vec![],
        vec![counter_analytic("all", AnalyticMode::All)],
        job,
        SummarizeConfig::default(),
        Box::new(source),
        true,
    );
    assert!(s.process().is_err());
    assert!(s.archives_processed() == 2);
}

#[test]
fn test_fail_fast_on_analytic_fetch_error() {
    let (job, mut source) = job_with(2, 2);
    source.add_faulty("c0.txt", counter_archive("c0", &SAMPLES), 2);
    let stats = source.stats.clone();
    let (all, calls) =
        ScriptedAnalytic::new("all", RequiredMetrics::all(&["test.counter"]), AnalyticMode::All);
    let mut s = Summarize::new(
        vec![],
        vec![Box::new(all)],
        job,
        SummarizeConfig::default(),
        Box::new(source),
        true,
    );
    let e = s.process().unwrap_err();
    assert!(format!("{e:#}").contains("injected failure"));
    assert!(s.archives_processed() == 0);
    // The second node was never opened.
    assert!(calls.borrow().iter().all(|c| c.node.as_str() == "c0"));
    assert!(s.plugin_statuses()[0] == ("all", Status::Failure));
    assert!(s.errors().get("archive").unwrap().len() == 1);
    let stats = stats.borrow();
    assert!(stats.fetches == 2);
    assert!(stats.fetches == stats.frees);
}

#[test]
fn test_firstlast_scan_fetch_error() {
    // A counter needs correction, so first-last scans every sample and fails in the middle.
    let (job, mut source) = job_with(2, 2);
    source.add_faulty("c1.txt", counter_archive("c1", &SAMPLES), 2);
    let stats = source.stats.clone();
    let (fl, calls) = ScriptedAnalytic::new(
        "fl",
        RequiredMetrics::all(&["test.counter"]),
        AnalyticMode::FirstLast,
    );
    let mut s = Summarize::new(
        vec![],
        vec![Box::new(fl)],
        job,
        SummarizeConfig::default(),
        Box::new(source),
        false,
    );
    assert!(!s.process().unwrap());
    assert!(s.archives_processed() == 1);
    assert!(!s.complete());
    let msgs = s.errors().get("archive").unwrap();
    assert!(msgs.contains("c1 fl archive library error: injected failure"));
    assert!(s.plugin_statuses()[0] == ("fl", Status::Failure));
    // Both calls on c0; on c1 only the first sample was delivered.
    let nodes = calls.borrow().iter().map(|c| c.node.to_string()).collect::<Vec<_>>();
    assert!(nodes == vec!["c0", "c0", "c1"]);
    let stats = stats.borrow();
    assert!(stats.fetches == stats.frees);
}

#[test]
fn test_preproc_failure_fails_archive() {
    let (job, mut source) = job_with(2, 2);
    source.add_faulty("c0.txt", counter_archive("c0", &SAMPLES), 1);
    let (pp, pplog) = ScriptedPreproc::new("pp", RequiredMetrics::all(&["test.load"]));
    let (all, calls) =
        ScriptedAnalytic::new("all", RequiredMetrics::all(&["test.counter"]), AnalyticMode::All);
    let mut s = Summarize::new(
        vec![Box::new(pp)],
        vec![Box::new(all)],
        job,
        SummarizeConfig::default(),
        Box::new(source),
        false,
    );
    assert!(!s.process().unwrap());
    assert!(s.archives_processed() == 1);
    assert!(pplog.borrow().ended == 2);
    // Analytics did not run on the failed node.
    assert!(calls.borrow().iter().all(|c| c.node.as_str() == "c1"));
}

#[test]
fn test_missing_metrics_leave_analytic_uninitialized() {
    let (job, source) = job_with(2, 2);
    let (none, calls) =
        ScriptedAnalytic::new("none", RequiredMetrics::all(&["no.such"]), AnalyticMode::All);
    let mut s = Summarize::new(
        vec![],
        vec![Box::new(none)],
        job,
        SummarizeConfig::default(),
        Box::new(source),
        false,
    );
    assert!(s.process().unwrap());
    assert!(s.complete());
    assert!(calls.borrow().is_empty());
    assert!(s.plugin_statuses()[0] == ("none", Status::Uninitialized));
}
