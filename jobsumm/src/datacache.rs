/// Holds on to the most recent sample so that it can be replayed later.
///
/// Used for first-last analytics when the archive cannot be asked for its last sample directly
/// (because the values need range correction, which requires seeing every sample in order).  The
/// buffers are reused from one sample to the next.
use crate::{Flow, InstanceNames, MetricData, Sample};

use anyhow::Result;
use rustutils::Timeval;
use ustr::Ustr;

#[derive(Debug, Default)]
pub struct SampleCache {
    timestamp: Option<Timeval>,
    names: Vec<Ustr>,
    data: Vec<MetricData>,
    description: Vec<InstanceNames>,
}

impl SampleCache {
    pub fn new() -> SampleCache {
        Default::default()
    }

    /// Remember the sample, replacing any earlier one.  Always asks for more.
    pub fn process(&mut self, sample: &Sample) -> Flow {
        self.timestamp = Some(sample.timestamp);
        // clone_into reuses the per-metric buffers as well as the outer vectors.
        sample.names.clone_into(&mut self.names);
        sample.data.clone_into(&mut self.data);
        sample.description.clone_into(&mut self.description);
        Flow::Continue
    }

    pub fn timestamp(&self) -> Option<Timeval> {
        self.timestamp
    }

    /// Run `f` on the remembered sample.  Returns None if no sample was ever remembered.
    pub fn docallback<F>(&self, f: F) -> Option<Result<Flow>>
    where
        F: FnOnce(&Sample) -> Result<Flow>,
    {
        let timestamp = self.timestamp?;
        Some(f(&Sample {
            timestamp,
            names: &self.names,
            data: &self.data,
            description: &self.description,
        }))
    }
}

#[cfg(test)]
fn sample_data(v: f64) -> Vec<MetricData> {
    vec![MetricData {
        values: vec![v],
        instances: vec![archivelog::IN_NULL],
    }]
}

#[test]
fn test_cache_keeps_last() {
    let mut c = SampleCache::new();
    assert!(c.docallback(|_| Ok(Flow::Continue)).is_none());

    let names = [ustr::ustr("m")];
    let desc = vec![vec![]];
    for (t, v) in [(1, 1.0), (2, 2.0), (3, 3.0)] {
        let data = sample_data(v);
        let s = Sample {
            timestamp: Timeval::from_secs(t),
            names: &names,
            data: &data,
            description: &desc,
        };
        assert!(c.process(&s) == Flow::Continue);
    }
    assert!(c.timestamp() == Some(Timeval::from_secs(3)));

    let mut seen = None;
    let r = c.docallback(|s| {
        seen = Some((s.timestamp, s.data[0].values[0], s.names[0]));
        Ok(Flow::Stop)
    });
    assert!(r.unwrap().unwrap() == Flow::Stop);
    assert!(seen == Some((Timeval::from_secs(3), 3.0, ustr::ustr("m"))));
}

#[test]
fn test_cache_shape_change() {
    let mut c = SampleCache::new();
    let names = [ustr::ustr("a"), ustr::ustr("b")];
    let two = vec![MetricData::default(), MetricData::default()];
    let desc = vec![vec![], vec![]];
    c.process(&Sample {
        timestamp: Timeval::from_secs(1),
        names: &names,
        data: &two,
        description: &desc,
    });
    let one = sample_data(7.0);
    c.process(&Sample {
        timestamp: Timeval::from_secs(2),
        names: &names[..1],
        data: &one,
        description: &desc[..1],
    });
    c.docallback(|s| {
        assert!(s.data.len() == 1);
        assert!(s.names.len() == 1);
        assert!(s.data[0].values == vec![7.0]);
        Ok(Flow::Continue)
    });
}
