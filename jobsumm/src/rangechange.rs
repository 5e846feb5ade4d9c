/// Correction of counter metrics whose raw values go backwards.
///
/// A counter can decrease in an archive for two reasons: the counter is narrower than 64 bits and
/// wrapped, or the device or driver was reset and the counter restarted from zero.  Wrapping
/// counters are listed in the configuration with their width; on a decrease the corrector adds
/// 2^width to the running offset.  Other counters are assumed to have been reset, and the offset
/// grows by the size of the drop, so the corrected series continues from where it left off.
///
/// State is keyed by metric id and instance id and is only meaningful within one archive and one
/// set of fetched metrics: `set_fetched_metrics` discards it.
use crate::MetricData;

use archivelog::{MetricDesc, MetricId, Semantics};
use log::debug;
use rustutils::{SummarizeConfig, Timeval};
use std::collections::HashMap;

#[derive(Debug, Copy, Clone, PartialEq)]
enum Fixup {
    // Add this much (2^bits) on every decrease.
    Wrap(f64),
    // Add the size of the drop on every decrease.
    Reset,
}

#[derive(Debug, Clone, Copy)]
struct CounterState {
    last: f64,
    offset: f64,
}

pub struct RangeCorrector {
    config: SummarizeConfig,

    // Parallel to the fetched metrics.
    fixups: Vec<(MetricId, Option<Fixup>)>,
    state: HashMap<(MetricId, i32), CounterState>,
}

impl RangeCorrector {
    pub fn new(config: &SummarizeConfig) -> RangeCorrector {
        RangeCorrector {
            config: config.clone(),
            fixups: vec![],
            state: HashMap::new(),
        }
    }

    /// Announce the metrics of the samples that will be passed to `normalise`, in order.  Pass an
    /// empty slice to disable correction.
    pub fn set_fetched_metrics(&mut self, descs: &[MetricDesc]) {
        self.state.clear();
        self.fixups = descs
            .iter()
            .map(|d| {
                let fixup = if let Some(bits) = self.config.wrap_bits(d.name.as_str()) {
                    Some(Fixup::Wrap(2f64.powi(bits as i32)))
                } else if self.config.correct_counter_resets && d.semantics == Semantics::Counter {
                    Some(Fixup::Reset)
                } else {
                    None
                };
                (d.pmid, fixup)
            })
            .collect();
    }

    /// True if no fetched metric needs correction, ie, `normalise` would leave every value alone.
    pub fn passthrough(&self) -> bool {
        self.fixups.iter().all(|(_, f)| f.is_none())
    }

    /// Correct `data` in place.  The samples of one archive must be presented in time order.
    pub fn normalise(&mut self, timestamp: Timeval, data: &mut [MetricData]) {
        for ((pmid, fixup), md) in self.fixups.iter().zip(data.iter_mut()) {
            let Some(fixup) = fixup else {
                continue;
            };
            for (value, inst) in md.values.iter_mut().zip(md.instances.iter()) {
                let raw = *value;
                let s = self.state.entry((*pmid, *inst)).or_insert(CounterState {
                    last: raw,
                    offset: 0.0,
                });
                if raw < s.last {
                    let adjust = match fixup {
                        Fixup::Wrap(range) => *range,
                        Fixup::Reset => s.last - raw,
                    };
                    debug!(
                        "Counter {pmid} instance {inst} went from {} to {raw} at {timestamp}, adjusting by {adjust}",
                        s.last
                    );
                    s.offset += adjust;
                }
                s.last = raw;
                *value = raw + s.offset;
            }
        }
    }
}

#[cfg(test)]
fn desc(pmid: u32, name: &str, semantics: Semantics) -> MetricDesc {
    MetricDesc {
        pmid: MetricId(pmid),
        name: ustr::ustr(name),
        mtype: archivelog::MetricType::U64,
        semantics,
        indom: None,
    }
}

#[cfg(test)]
fn run(rc: &mut RangeCorrector, raw: &[f64]) -> Vec<f64> {
    raw.iter()
        .enumerate()
        .map(|(i, v)| {
            let mut data = vec![MetricData {
                values: vec![*v],
                instances: vec![archivelog::IN_NULL],
            }];
            rc.normalise(Timeval::from_secs(i as i64), &mut data);
            data[0].values[0]
        })
        .collect()
}

#[test]
fn test_monotonic_counter_untouched() {
    let mut rc = RangeCorrector::new(&SummarizeConfig::default());
    rc.set_fetched_metrics(&[desc(1, "c", Semantics::Counter)]);
    assert!(!rc.passthrough());
    assert!(run(&mut rc, &[1.0, 5.0, 5.0, 9.0]) == vec![1.0, 5.0, 5.0, 9.0]);
}

#[test]
fn test_counter_resets() {
    let mut rc = RangeCorrector::new(&SummarizeConfig::default());
    rc.set_fetched_metrics(&[desc(1, "c", Semantics::Counter)]);
    let out = run(&mut rc, &[10.0, 20.0, 5.0, 15.0, 2.0, 4.0]);
    assert!(out == vec![10.0, 20.0, 20.0, 30.0, 30.0, 32.0]);
    assert!(out.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_counter_wraps() {
    let mut config = SummarizeConfig::default();
    config.set_wrap_bits("hw.cycles", 8);
    let mut rc = RangeCorrector::new(&config);
    rc.set_fetched_metrics(&[desc(1, "hw.cycles", Semantics::Counter)]);
    assert!(run(&mut rc, &[200.0, 250.0, 10.0, 100.0]) == vec![200.0, 250.0, 266.0, 356.0]);
}

#[test]
fn test_uncorrected_metrics() {
    let mut rc = RangeCorrector::new(&SummarizeConfig::default());
    rc.set_fetched_metrics(&[desc(1, "load", Semantics::Instant)]);
    assert!(rc.passthrough());
    assert!(run(&mut rc, &[3.0, 1.0, 2.0]) == vec![3.0, 1.0, 2.0]);

    let mut config = SummarizeConfig::default();
    config.correct_counter_resets = false;
    let mut rc = RangeCorrector::new(&config);
    rc.set_fetched_metrics(&[desc(1, "c", Semantics::Counter)]);
    assert!(rc.passthrough());
    assert!(run(&mut rc, &[3.0, 1.0]) == vec![3.0, 1.0]);

    let mut rc = RangeCorrector::new(&SummarizeConfig::default());
    rc.set_fetched_metrics(&[]);
    assert!(rc.passthrough());
}

#[test]
fn test_state_is_per_instance_and_resettable() {
    let mut rc = RangeCorrector::new(&SummarizeConfig::default());
    let d = [desc(1, "c", Semantics::Counter)];
    rc.set_fetched_metrics(&d);
    let mut data = vec![MetricData {
        values: vec![10.0, 100.0],
        instances: vec![0, 1],
    }];
    rc.normalise(Timeval::from_secs(0), &mut data);
    data[0].values = vec![4.0, 150.0];
    rc.normalise(Timeval::from_secs(1), &mut data);
    assert!(data[0].values == vec![10.0, 150.0]);

    // A new fetch set starts from scratch.
    rc.set_fetched_metrics(&d);
    assert!(run(&mut rc, &[4.0, 6.0]) == vec![4.0, 6.0]);
}
