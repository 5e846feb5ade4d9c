/// The fetch loop driver: runs one plugin over one archive.
///
/// There are three ways of doing it.  Preprocessors see every sample as recorded.  All-timestamps
/// analytics see every sample after range correction.  First-last analytics see the first sample
/// and the last one; the last one is obtained by positioning the archive at its end if the values
/// can be trusted as they are, and otherwise by scanning the whole archive through a SampleCache.
///
/// Every sample set obtained from the archive is freed exactly once, whichever way the loop exits.
/// The archive must already be positioned at its start when a driver function is called.
use crate::selector::{extract_values, select_metrics, Extracted, Selection};
use crate::{
    Analytic, ErrorLedger, Flow, NodeMeta, Preprocessor, RangeCorrector, Sample, SampleCache,
    Status,
};

use anyhow::Result;
use archivelog::{Archive, ArchiveError, FetchMode, MetricId, SampleSet};
use log::{debug, error, warn};
use rustutils::Timeval;

/// A fetched sample set that goes back to its archive when dropped.

struct Fetched<'a, A: Archive + ?Sized> {
    archive: &'a mut A,
    result: SampleSet,
}

impl<'a, A: Archive + ?Sized> Fetched<'a, A> {
    fn fetch(archive: &'a mut A, pmids: &[MetricId]) -> Result<Fetched<'a, A>, ArchiveError> {
        let result = archive.fetch(pmids)?;
        Ok(Fetched { archive, result })
    }
}

impl<A: Archive + ?Sized> Drop for Fetched<'_, A> {
    fn drop(&mut self) {
        let result = std::mem::replace(
            &mut self.result,
            SampleSet {
                timestamp: Timeval::default(),
                metrics: vec![],
            },
        );
        self.archive.free(result);
    }
}

// What the loop should do after one sample has been handed on.

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
    HookFailed,
}

/// Per-archive driver state.  `hook_failures` counts errors returned from plugin hooks, which do
/// not fail the archive but do fail the run.

pub(crate) struct FetchLoop<'a> {
    pub rangechange: &'a mut RangeCorrector,
    pub ledger: &'a mut ErrorLedger,
    pub node: &'a NodeMeta,
    pub job_id: &'a str,
    pub hook_failures: usize,
}

impl<'a> FetchLoop<'a> {
    pub fn new(
        rangechange: &'a mut RangeCorrector,
        ledger: &'a mut ErrorLedger,
        node: &'a NodeMeta,
        job_id: &'a str,
    ) -> FetchLoop<'a> {
        FetchLoop {
            rangechange,
            ledger,
            node,
            job_id,
            hook_failures: 0,
        }
    }

    /// Record a problem with one plugin on this node.
    pub fn logerror(&mut self, plugin: &str, msg: &str) {
        debug!(
            "archive processing exception: {} {} {}",
            self.node.nodename, plugin, msg
        );
        self.ledger
            .add("archive", &format!("{} {} {}", self.node.nodename, plugin, msg));
    }

    pub fn process_preproc(
        &mut self,
        archive: &mut dyn Archive,
        preproc: &mut dyn Preprocessor,
    ) -> Result<(), ArchiveError> {
        preproc.hoststart(self.node.nodename.as_str());

        // Preprocessors always see the data as recorded.
        self.rangechange.set_fetched_metrics(&[]);

        let selection =
            match select_metrics(&*archive, &preproc.required_metrics(), &preproc.optional_metrics()) {
                Ok(s) => s,
                Err(e) => {
                    preproc.set_status(Status::Failure);
                    preproc.hostend();
                    return Err(e);
                }
            };
        if selection.is_empty() {
            debug!("Skipping preprocessor {}", preproc.name());
            preproc.hostend();
            return Ok(());
        }

        let name = preproc.name().to_string();
        let outcome = loop {
            let fetched = match Fetched::fetch(&mut *archive, &selection.ids) {
                Ok(f) => f,
                Err(e) if e.is_end_of_log() => break Ok(Status::Complete),
                Err(e) => break Err(e),
            };
            let step = self.run_callback(
                &*fetched.archive,
                &fetched.result,
                &selection,
                &name,
                true,
                |s| preproc.process(s),
            );
            match step {
                Step::Continue => {}
                Step::Stop => break Ok(Status::Complete),
                Step::HookFailed => break Ok(Status::Failure),
            }
        };

        match outcome {
            Ok(status) => {
                preproc.set_status(status);
                preproc.hostend();
                Ok(())
            }
            Err(e) => {
                warn!("Preprocessor {name} raised exception {e}");
                preproc.set_status(Status::Failure);
                preproc.hostend();
                Err(e)
            }
        }
    }

    pub fn process_analytic(
        &mut self,
        archive: &mut dyn Archive,
        analytic: &mut dyn Analytic,
    ) -> Result<(), ArchiveError> {
        let selection =
            select_metrics(&*archive, &analytic.required_metrics(), &analytic.optional_metrics())?;
        if selection.is_empty() {
            debug!("Skipping analytic {}", analytic.name());
            return Ok(());
        }
        self.rangechange.set_fetched_metrics(&selection.descs);

        let name = analytic.name().to_string();
        let node = self.node;
        let mut status = Status::Complete;
        loop {
            let fetched = match Fetched::fetch(&mut *archive, &selection.ids) {
                Ok(f) => f,
                Err(e) if e.is_end_of_log() => break,
                Err(e) => {
                    warn!("Analytic {name} raised exception {e}");
                    analytic.set_status(Status::Failure);
                    return Err(e);
                }
            };
            let step = self.run_callback(
                &*fetched.archive,
                &fetched.result,
                &selection,
                &name,
                false,
                |s| analytic.process(node, s),
            );
            match step {
                Step::Continue => {}
                Step::Stop => break,
                Step::HookFailed => {
                    status = Status::Failure;
                    break;
                }
            }
        }
        analytic.set_status(status);
        Ok(())
    }

    pub fn process_firstlast(
        &mut self,
        archive: &mut dyn Archive,
        analytic: &mut dyn Analytic,
    ) -> Result<(), ArchiveError> {
        let selection =
            select_metrics(&*archive, &analytic.required_metrics(), &analytic.optional_metrics())?;
        if selection.is_empty() {
            debug!("Skipping analytic {}", analytic.name());
            return Ok(());
        }
        self.rangechange.set_fetched_metrics(&selection.descs);

        let name = analytic.name().to_string();
        let result = self.firstlast(archive, analytic, &selection, &name);
        if let Err(ref e) = result {
            warn!("Analytic {name} raised exception {e}");
            analytic.set_status(Status::Failure);
        }
        result
    }

    fn firstlast(
        &mut self,
        archive: &mut dyn Archive,
        analytic: &mut dyn Analytic,
        selection: &Selection,
        name: &str,
    ) -> Result<(), ArchiveError> {
        let node = self.node;

        let first = match Fetched::fetch(&mut *archive, &selection.ids) {
            Ok(f) => f,
            Err(e) if e.is_end_of_log() => return Ok(()),
            Err(e) => return Err(e),
        };
        let first_timestamp = first.result.timestamp;
        let step = self.run_callback(
            &*first.archive,
            &first.result,
            selection,
            name,
            false,
            |s| analytic.process(node, s),
        );
        drop(first);
        if step != Step::Continue {
            analytic.set_status(Status::Failure);
            return Ok(());
        }

        let step = if self.rangechange.passthrough() && analytic.passthrough() {
            let end = archive.label().end;
            archive.set_mode(FetchMode::Backward, end)?;
            let last = match Fetched::fetch(&mut *archive, &selection.ids) {
                Ok(f) => f,
                Err(e) if e.is_end_of_log() => {
                    // Nothing at or before the archive end: no later point than the first.
                    analytic.set_status(Status::Complete);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if last.result.timestamp == first_timestamp {
                // Only one data point for these metrics.
                analytic.set_status(Status::Complete);
                return Ok(());
            }
            self.run_callback(
                &*last.archive,
                &last.result,
                selection,
                name,
                false,
                |s| analytic.process(node, s),
            )
        } else {
            // Corrected values depend on every sample, so scan them all and keep the last.
            let mut cache = SampleCache::new();
            loop {
                let fetched = match Fetched::fetch(&mut *archive, &selection.ids) {
                    Ok(f) => f,
                    Err(e) if e.is_end_of_log() => break,
                    Err(e) => return Err(e),
                };
                let step = self.run_callback(
                    &*fetched.archive,
                    &fetched.result,
                    selection,
                    name,
                    false,
                    |s| Ok(cache.process(s)),
                );
                if step != Step::Continue {
                    break;
                }
            }
            let Some(timestamp) = cache.timestamp() else {
                debug!("No last sample for {name} on {}", node.nodename);
                analytic.set_status(Status::Failure);
                return Ok(());
            };
            match cache.docallback(|s| analytic.process(node, s)) {
                Some(r) => self.hook_result(name, timestamp, r),
                None => Step::Stop,
            }
        };

        analytic.set_status(if step == Step::Continue {
            Status::Complete
        } else {
            Status::Failure
        });
        Ok(())
    }

    // Decode one sample set, correct it unless `raw`, and hand it to `sink`.  Decoding problems
    // are logged here.  In raw mode unnamed instances are named by number.

    fn run_callback<F>(
        &mut self,
        archive: &dyn Archive,
        result: &SampleSet,
        selection: &Selection,
        name: &str,
        raw: bool,
        sink: F,
    ) -> Step
    where
        F: FnOnce(&Sample) -> Result<Flow>,
    {
        let (mut data, description) = match extract_values(archive, result, selection, !raw) {
            Extracted::Values(data, description) => (data, description),
            Extracted::MissingIndom(msg) => {
                warn!(
                    "{} {} missing indom @ {}: {msg}",
                    self.node.nodename, name, result.timestamp
                );
                self.logerror(name, "missing indom");
                return Step::Continue;
            }
            Extracted::Invalid(msg) => {
                self.logerror(name, &msg);
                return Step::Stop;
            }
        };
        if !raw {
            self.rangechange.normalise(result.timestamp, &mut data);
        }
        let r = sink(&Sample {
            timestamp: result.timestamp,
            names: &selection.names,
            data: &data,
            description: &description,
        });
        self.hook_result(name, result.timestamp, r)
    }

    fn hook_result(&mut self, name: &str, timestamp: Timeval, r: Result<Flow>) -> Step {
        match r {
            Ok(Flow::Continue) => Step::Continue,
            Ok(Flow::Stop) => Step::Stop,
            Err(e) => {
                error!("{} {} @ {}: {:#}", self.job_id, name, timestamp, e);
                self.logerror(name, &format!("{e:#}"));
                self.hook_failures += 1;
                Step::HookFailed
            }
        }
    }
}

#[cfg(test)]
use crate::testutil::{counter_archive, node_meta, ScriptedAnalytic, ScriptedPreproc};
#[cfg(test)]
use crate::{AnalyticMode, Plugin, RequiredMetrics};
#[cfg(test)]
use archivelog::TextArchive;
#[cfg(test)]
use rustutils::SummarizeConfig;

#[cfg(test)]
fn open_counter(samples: &[(i64, u64)]) -> TextArchive {
    let text = counter_archive("c1-1", samples);
    let mut a = TextArchive::parse("test", &mut text.as_bytes()).unwrap();
    a.set_mode(FetchMode::Forward, a.label().start).unwrap();
    a
}

#[cfg(test)]
fn with_loop<F>(meta: &NodeMeta, f: F) -> (ErrorLedger, usize)
where
    F: FnOnce(&mut FetchLoop),
{
    let mut rc = RangeCorrector::new(&SummarizeConfig::default());
    let mut ledger = ErrorLedger::new();
    let hook_failures = {
        let mut fl = FetchLoop::new(&mut rc, &mut ledger, meta, "42");
        f(&mut fl);
        fl.hook_failures
    };
    (ledger, hook_failures)
}

#[test]
fn test_all_timestamps_sees_corrected_samples() {
    let mut a = open_counter(&[(10, 100), (20, 200), (30, 50), (40, 80)]);
    let (mut an, calls) =
        ScriptedAnalytic::new("a", RequiredMetrics::all(&["test.counter"]), AnalyticMode::All);
    let (ledger, failures) = with_loop(&node_meta(&a), |fl| {
        fl.process_analytic(&mut a, &mut an).unwrap();
    });
    assert!(an.status() == Status::Complete);
    let calls = calls.borrow();
    assert!(calls.len() == 4);
    assert!(calls.iter().map(|c| c.value).collect::<Vec<_>>() == vec![100.0, 200.0, 200.0, 230.0]);
    assert!(calls[2].timestamp == Timeval::from_secs(30));
    assert!(ledger.is_empty());
    assert!(failures == 0);
    assert!(a.outstanding() == 0);
    assert!(a.fetch_count() == 4);
}

#[test]
fn test_all_timestamps_early_stop() {
    let mut a = open_counter(&[(10, 1), (20, 2), (30, 3), (40, 4)]);
    let (mut an, calls) =
        ScriptedAnalytic::new("a", RequiredMetrics::all(&["test.counter"]), AnalyticMode::All);
    an.stop_after = Some(2);
    with_loop(&node_meta(&a), |fl| {
        fl.process_analytic(&mut a, &mut an).unwrap();
    });
    assert!(an.status() == Status::Complete);
    assert!(calls.borrow().len() == 2);
    assert!(a.fetch_count() == 2);
    assert!(a.outstanding() == 0);
}

#[test]
fn test_missing_metric_skips() {
    let mut a = open_counter(&[(10, 1), (20, 2)]);
    let (mut an, calls) =
        ScriptedAnalytic::new("a", RequiredMetrics::all(&["no.such"]), AnalyticMode::All);
    with_loop(&node_meta(&a), |fl| {
        fl.process_analytic(&mut a, &mut an).unwrap();
        fl.process_firstlast(&mut a, &mut an).unwrap();
    });
    assert!(an.status() == Status::Uninitialized);
    assert!(calls.borrow().is_empty());
    assert!(a.fetch_count() == 0);
}

#[test]
fn test_hook_failure_is_recorded() {
    let mut a = open_counter(&[(10, 1), (20, 2), (30, 3)]);
    let (mut an, calls) =
        ScriptedAnalytic::new("bad", RequiredMetrics::all(&["test.counter"]), AnalyticMode::All);
    an.fail = true;
    let (ledger, failures) = with_loop(&node_meta(&a), |fl| {
        fl.process_analytic(&mut a, &mut an).unwrap();
    });
    assert!(an.status() == Status::Failure);
    assert!(calls.borrow().len() == 1);
    assert!(failures == 1);
    let msgs = ledger.get("archive").unwrap();
    assert!(msgs.iter().any(|m| m.starts_with("c1-1 bad ")));
    assert!(a.outstanding() == 0);
}

#[test]
fn test_firstlast_passthrough() {
    let mut a = open_counter(&[(10, 1), (20, 2), (30, 3), (40, 4)]);
    let (mut an, calls) = ScriptedAnalytic::new(
        "fl",
        RequiredMetrics::all(&["test.load"]),
        AnalyticMode::FirstLast,
    );
    with_loop(&node_meta(&a), |fl| {
        fl.process_firstlast(&mut a, &mut an).unwrap();
    });
    assert!(an.status() == Status::Complete);
    let calls = calls.borrow();
    assert!(calls.len() == 2);
    assert!(calls[0].timestamp == Timeval::from_secs(10));
    assert!(calls[1].timestamp == Timeval::from_secs(40));
    // Only the first and the last record are read.
    assert!(a.fetch_count() == 2);
    assert!(a.outstanding() == 0);
}

#[test]
fn test_firstlast_single_point() {
    let mut a = open_counter(&[(10, 1)]);
    let (mut an, calls) = ScriptedAnalytic::new(
        "fl",
        RequiredMetrics::all(&["test.load"]),
        AnalyticMode::FirstLast,
    );
    with_loop(&node_meta(&a), |fl| {
        fl.process_firstlast(&mut a, &mut an).unwrap();
    });
    assert!(an.status() == Status::Complete);
    assert!(calls.borrow().len() == 1);
    assert!(a.outstanding() == 0);
}

#[test]
fn test_firstlast_end_of_log_on_last_fetch() {
    // The only record lies past the label's end, so seeking back from the end finds nothing.
    let text = "label,c1-1,1,5\n\
                metric,2,test.load,double,instant,-\n\
                sample,10,2=1.0\n";
    let mut a = TextArchive::parse("test", &mut text.as_bytes()).unwrap();
    a.set_mode(FetchMode::Forward, a.label().start).unwrap();
    let (mut an, calls) = ScriptedAnalytic::new(
        "fl",
        RequiredMetrics::all(&["test.load"]),
        AnalyticMode::FirstLast,
    );
    let (ledger, hook_failures) = with_loop(&node_meta(&a), |fl| {
        assert!(fl.process_firstlast(&mut a, &mut an).is_ok());
    });
    assert!(an.status() == Status::Complete);
    assert!(calls.borrow().len() == 1);
    assert!(ledger.is_empty());
    assert!(hook_failures == 0);
    assert!(a.outstanding() == 0);
}

#[test]
fn test_firstlast_subsecond_timestamps_differ() {
    let text = "label,c1-1,10,10.5\n\
                metric,2,test.load,double,instant,-\n\
                sample,10,2=1.0\n\
                sample,10.5,2=2.0\n";
    let mut a = TextArchive::parse("test", &mut text.as_bytes()).unwrap();
    a.set_mode(FetchMode::Forward, a.label().start).unwrap();
    let (mut an, calls) = ScriptedAnalytic::new(
        "fl",
        RequiredMetrics::all(&["test.load"]),
        AnalyticMode::FirstLast,
    );
    with_loop(&node_meta(&a), |fl| {
        fl.process_firstlast(&mut a, &mut an).unwrap();
    });
    let calls = calls.borrow();
    assert!(calls.len() == 2);
    assert!(calls[1].timestamp == Timeval::new(10, 500000));
}

#[test]
fn test_firstlast_through_cache() {
    // The counter needs correction, so the last value comes from a full scan.
    let mut a = open_counter(&[(10, 100), (20, 200), (30, 50), (40, 80)]);
    let (mut an, calls) = ScriptedAnalytic::new(
        "fl",
        RequiredMetrics::all(&["test.counter"]),
        AnalyticMode::FirstLast,
    );
    with_loop(&node_meta(&a), |fl| {
        fl.process_firstlast(&mut a, &mut an).unwrap();
    });
    assert!(an.status() == Status::Complete);
    let calls = calls.borrow();
    assert!(calls.len() == 2);
    assert!(calls[0].value == 100.0);
    assert!(calls[1].timestamp == Timeval::from_secs(40));
    assert!(calls[1].value == 230.0);
    assert!(a.fetch_count() == 4);
    assert!(a.outstanding() == 0);
}

#[test]
fn test_firstlast_not_passthrough_by_choice() {
    let mut a = open_counter(&[(10, 1), (20, 2), (30, 3)]);
    let (mut an, calls) = ScriptedAnalytic::new(
        "fl",
        RequiredMetrics::all(&["test.load"]),
        AnalyticMode::FirstLast,
    );
    an.passthrough = false;
    with_loop(&node_meta(&a), |fl| {
        fl.process_firstlast(&mut a, &mut an).unwrap();
    });
    assert!(calls.borrow().len() == 2);
    assert!(a.fetch_count() == 3);
}

#[test]
fn test_firstlast_cache_empty_fails() {
    let mut a = open_counter(&[(10, 100)]);
    let (mut an, calls) = ScriptedAnalytic::new(
        "fl",
        RequiredMetrics::all(&["test.counter"]),
        AnalyticMode::FirstLast,
    );
    with_loop(&node_meta(&a), |fl| {
        fl.process_firstlast(&mut a, &mut an).unwrap();
    });
    assert!(an.status() == Status::Failure);
    assert!(calls.borrow().len() == 1);
}

#[test]
fn test_firstlast_stop_on_first_fails() {
    let mut a = open_counter(&[(10, 1), (20, 2)]);
    let (mut an, calls) = ScriptedAnalytic::new(
        "fl",
        RequiredMetrics::all(&["test.load"]),
        AnalyticMode::FirstLast,
    );
    an.stop_after = Some(1);
    with_loop(&node_meta(&a), |fl| {
        fl.process_firstlast(&mut a, &mut an).unwrap();
    });
    assert!(an.status() == Status::Failure);
    assert!(calls.borrow().len() == 1);
    assert!(a.outstanding() == 0);
}

#[test]
fn test_preproc_sees_raw_values() {
    let mut a = open_counter(&[(10, 100), (20, 200), (30, 50)]);
    let (mut pp, seen) = ScriptedPreproc::new("pp", RequiredMetrics::all(&["test.counter"]));
    with_loop(&node_meta(&a), |fl| {
        fl.process_preproc(&mut a, &mut pp).unwrap();
    });
    assert!(pp.status() == Status::Complete);
    let seen = seen.borrow();
    assert!(seen.hosts == vec!["c1-1".to_string()]);
    assert!(seen.ended == 1);
    assert!(seen.values == vec![100.0, 200.0, 50.0]);
    assert!(a.outstanding() == 0);
}

#[test]
fn test_preproc_skipped_still_ends() {
    let mut a = open_counter(&[(10, 100)]);
    let (mut pp, seen) = ScriptedPreproc::new("pp", RequiredMetrics::all(&["no.such"]));
    with_loop(&node_meta(&a), |fl| {
        fl.process_preproc(&mut a, &mut pp).unwrap();
    });
    assert!(pp.status() == Status::Uninitialized);
    assert!(seen.borrow().ended == 1);
    assert!(seen.borrow().values.is_empty());
}
