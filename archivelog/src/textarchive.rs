/// A plain-text archive format, and an `Archive` implementation over it.
///
/// The format is line-oriented CSV, read with the `csv` crate.  Blank lines and lines starting with
/// `#` are ignored.  Fields are trimmed.  The first field of every record names its kind:
///
///   label,HOSTNAME,START,END
///     Exactly one, before any sample.  START and END are archive times, SEC[.FRACTION].
///
///   metric,PMID,NAME,TYPE,SEMANTICS,INDOM
///     TYPE is one of i32, u32, i64, u64, float, double.  SEMANTICS is one of counter, instant,
///     discrete.  INDOM is an instance domain number, or `-` for single-valued metrics.
///
///   indom,INDOM,INST,NAME
///     Name of one instance in an instance domain.  Instances that appear in samples but are not
///     named here are legal and show up as instances without a name.
///
///   sample,TIME,VALUE...
///     Where each VALUE is PMID=NUMBER for single-valued metrics and PMID:INST=NUMBER for metrics
///     with an instance domain.  Sample times must be strictly increasing.
///
/// Values are kept as they were written (signed, unsigned or floating); conversion to the metric's
/// declared type is the reader's business, as with any archive library.
///
/// The archive counts sample sets that have been fetched but not freed, which makes leaks
/// observable in tests.
use crate::{
    Archive, ArchiveError, ArchiveLabel, ArchiveSource, Atom, FetchMode, IndomId, MetricDesc,
    MetricId, MetricType, MetricValues, SampleSet, Semantics, IN_NULL,
};

use rustutils::Timeval;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use ustr::Ustr;

struct Record {
    timestamp: Timeval,
    values: HashMap<MetricId, Vec<(i32, Atom)>>,
}

pub struct TextArchive {
    label: ArchiveLabel,
    metrics: HashMap<MetricId, MetricDesc>,
    names: HashMap<Ustr, MetricId>,
    instances: HashMap<(IndomId, i32), Ustr>,
    records: Vec<Record>,

    // Forward: the index of the next candidate record.  Backward: one past it.
    pos: usize,
    mode: FetchMode,

    outstanding: usize,
    fetches: usize,
}

impl TextArchive {
    pub fn open(path: &Path) -> Result<TextArchive, ArchiveError> {
        let mut file = File::open(path)?;
        TextArchive::parse(&path.to_string_lossy(), &mut file)
    }

    /// Parse an archive from any reader.  `origin` is used only in error messages.

    pub fn parse(origin: &str, input: &mut dyn io::Read) -> Result<TextArchive, ArchiveError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(input);

        let mut label: Option<ArchiveLabel> = None;
        let mut metrics = HashMap::new();
        let mut names = HashMap::new();
        let mut instances = HashMap::new();
        let mut records: Vec<Record> = vec![];

        for item in reader.records() {
            let record = match item {
                Ok(r) => r,
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or(0);
                    let msg = e.to_string();
                    return Err(match e.into_kind() {
                        csv::ErrorKind::Io(ioe) => ArchiveError::Io(ioe),
                        _ => format_error(origin, line, &msg),
                    });
                }
            };
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let fail = |msg: &str| format_error(origin, line, msg);
            let field = |i: usize| record.get(i).unwrap_or("");

            match field(0) {
                "label" => {
                    if record.len() != 4 {
                        return Err(fail("label needs hostname, start and end"));
                    }
                    if label.is_some() {
                        return Err(fail("duplicate label"));
                    }
                    if !records.is_empty() {
                        return Err(fail("label must precede samples"));
                    }
                    let start = Timeval::parse(field(2)).map_err(|e| fail(&e.to_string()))?;
                    let end = Timeval::parse(field(3)).map_err(|e| fail(&e.to_string()))?;
                    if end < start {
                        return Err(fail("label end precedes start"));
                    }
                    label = Some(ArchiveLabel {
                        hostname: Ustr::from(field(1)),
                        start,
                        end,
                    });
                }
                "metric" => {
                    if record.len() != 6 {
                        return Err(fail("metric needs pmid, name, type, semantics and indom"));
                    }
                    let pmid = MetricId(parse_u32(field(1)).ok_or_else(|| fail("bad pmid"))?);
                    let name = Ustr::from(field(2));
                    let mtype = MetricType::parse(field(3)).ok_or_else(|| fail("bad type"))?;
                    let semantics =
                        Semantics::parse(field(4)).ok_or_else(|| fail("bad semantics"))?;
                    let indom = if field(5) == "-" {
                        None
                    } else {
                        Some(IndomId(parse_u32(field(5)).ok_or_else(|| fail("bad indom"))?))
                    };
                    if metrics.contains_key(&pmid) || names.contains_key(&name) {
                        return Err(fail("metric defined twice"));
                    }
                    names.insert(name, pmid);
                    metrics.insert(
                        pmid,
                        MetricDesc {
                            pmid,
                            name,
                            mtype,
                            semantics,
                            indom,
                        },
                    );
                }
                "indom" => {
                    if record.len() != 4 {
                        return Err(fail("indom needs id, instance and name"));
                    }
                    let indom = IndomId(parse_u32(field(1)).ok_or_else(|| fail("bad indom"))?);
                    let inst = i32::from_str(field(2)).map_err(|_| fail("bad instance"))?;
                    instances.insert((indom, inst), Ustr::from(field(3)));
                }
                "sample" => {
                    if record.len() < 2 {
                        return Err(fail("sample needs a time"));
                    }
                    let timestamp = Timeval::parse(field(1)).map_err(|e| fail(&e.to_string()))?;
                    if let Some(prev) = records.last() {
                        if timestamp <= prev.timestamp {
                            return Err(fail("sample times must be strictly increasing"));
                        }
                    }
                    let mut values: HashMap<MetricId, Vec<(i32, Atom)>> = HashMap::new();
                    for v in record.iter().skip(2) {
                        let (key, val) = v.split_once('=').ok_or_else(|| fail("expected '='"))?;
                        let (pmid, inst) = match key.split_once(':') {
                            Some((p, i)) => (
                                parse_u32(p).ok_or_else(|| fail("bad pmid"))?,
                                Some(i32::from_str(i).map_err(|_| fail("bad instance"))?),
                            ),
                            None => (parse_u32(key).ok_or_else(|| fail("bad pmid"))?, None),
                        };
                        let pmid = MetricId(pmid);
                        let desc = metrics.get(&pmid).ok_or_else(|| fail("undefined metric"))?;
                        let inst = match (desc.indom, inst) {
                            (None, None) => IN_NULL,
                            (Some(_), Some(i)) => i,
                            (None, Some(_)) => return Err(fail("instance on singular metric")),
                            (Some(_), None) => return Err(fail("missing instance")),
                        };
                        let atom = parse_atom(val).ok_or_else(|| fail("bad value"))?;
                        let slot = values.entry(pmid).or_default();
                        if slot.iter().any(|(i, _)| *i == inst) {
                            return Err(fail("duplicate value"));
                        }
                        slot.push((inst, atom));
                    }
                    records.push(Record { timestamp, values });
                }
                other => {
                    return Err(fail(&format!("unknown record kind '{other}'")));
                }
            }
        }

        let label = match label {
            Some(l) => l,
            None => return Err(format_error(origin, 0, "archive has no label")),
        };

        Ok(TextArchive {
            label,
            metrics,
            names,
            instances,
            records,
            pos: 0,
            mode: FetchMode::Forward,
            outstanding: 0,
            fetches: 0,
        })
    }

    /// All metric descriptors, sorted by id.

    pub fn metrics(&self) -> Vec<MetricDesc> {
        let mut ms = self.metrics.values().cloned().collect::<Vec<MetricDesc>>();
        ms.sort_by_key(|m| m.pmid);
        ms
    }

    pub fn num_samples(&self) -> usize {
        self.records.len()
    }

    /// Number of sample sets fetched and not yet freed.

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Number of successful fetches since the archive was opened.

    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    fn wanted(record: &Record, pmids: &[MetricId]) -> bool {
        pmids.iter().any(|p| record.values.contains_key(p))
    }

    fn extract(&self, ix: usize, pmids: &[MetricId]) -> SampleSet {
        let record = &self.records[ix];
        SampleSet {
            timestamp: record.timestamp,
            metrics: pmids
                .iter()
                .map(|pmid| MetricValues {
                    pmid: *pmid,
                    values: record.values.get(pmid).cloned().unwrap_or_default(),
                })
                .collect(),
        }
    }
}

impl Archive for TextArchive {
    fn label(&self) -> &ArchiveLabel {
        &self.label
    }

    fn lookup_name(&self, name: &str) -> Result<MetricId, ArchiveError> {
        self.names
            .get(&Ustr::from(name))
            .copied()
            .ok_or_else(|| ArchiveError::NoSuchName(name.to_string()))
    }

    fn describe(&self, pmid: MetricId) -> Result<MetricDesc, ArchiveError> {
        self.metrics
            .get(&pmid)
            .cloned()
            .ok_or(ArchiveError::NoSuchMetric(pmid))
    }

    fn instance_name(&self, indom: IndomId, inst: i32) -> Option<Ustr> {
        self.instances.get(&(indom, inst)).copied()
    }

    fn set_mode(&mut self, mode: FetchMode, when: Timeval) -> Result<(), ArchiveError> {
        self.mode = mode;
        self.pos = match mode {
            FetchMode::Forward => self.records.partition_point(|r| r.timestamp < when),
            FetchMode::Backward => self.records.partition_point(|r| r.timestamp <= when),
        };
        Ok(())
    }

    fn fetch(&mut self, pmids: &[MetricId]) -> Result<SampleSet, ArchiveError> {
        if let Some(p) = pmids.iter().find(|p| !self.metrics.contains_key(p)) {
            return Err(ArchiveError::NoSuchMetric(*p));
        }
        let found = match self.mode {
            FetchMode::Forward => {
                let hit = (self.pos..self.records.len())
                    .find(|ix| TextArchive::wanted(&self.records[*ix], pmids));
                self.pos = hit.map(|ix| ix + 1).unwrap_or(self.records.len());
                hit
            }
            FetchMode::Backward => {
                let hit = (0..self.pos)
                    .rev()
                    .find(|ix| TextArchive::wanted(&self.records[*ix], pmids));
                self.pos = hit.unwrap_or(0);
                hit
            }
        };
        match found {
            Some(ix) => {
                self.outstanding += 1;
                self.fetches += 1;
                Ok(self.extract(ix, pmids))
            }
            None => Err(ArchiveError::EndOfLog),
        }
    }

    fn free(&mut self, _result: SampleSet) {
        if self.outstanding == 0 {
            log::warn!("{}: sample set freed twice", self.label.hostname);
        } else {
            self.outstanding -= 1;
        }
    }
}

/// Opens text archives by path, relative to an optional root directory.

pub struct TextArchiveSource {
    root: Option<PathBuf>,
}

impl TextArchiveSource {
    pub fn new(root: Option<&Path>) -> TextArchiveSource {
        TextArchiveSource {
            root: root.map(|p| p.to_path_buf()),
        }
    }
}

impl ArchiveSource for TextArchiveSource {
    fn open(&self, location: &str) -> Result<Box<dyn Archive>, ArchiveError> {
        let path = match self.root {
            Some(ref root) => root.join(location),
            None => PathBuf::from(location),
        };
        Ok(Box::new(TextArchive::open(&path)?))
    }
}

fn format_error(origin: &str, line: u64, msg: &str) -> ArchiveError {
    ArchiveError::Format {
        path: origin.to_string(),
        line,
        msg: msg.to_string(),
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    u32::from_str(s).ok()
}

fn parse_atom(s: &str) -> Option<Atom> {
    if s.contains(|c| c == '.' || c == 'e' || c == 'E') {
        f64::from_str(s).ok().filter(|f| f.is_finite()).map(Atom::F64)
    } else if s.starts_with('-') {
        i64::from_str(s).ok().map(Atom::I64)
    } else {
        u64::from_str(s).ok().map(Atom::U64)
    }
}

#[cfg(test)]
const TEST_ARCHIVE: &str = r#"
# two metrics, one with instances
label,c1-1,100,130
metric,10,kernel.all.load,double,instant,-
metric,20,network.interface.in.bytes,u64,counter,3
indom,3,0,eth0
indom,3,1,ib0
sample,100,10=0.5,20:0=1000,20:1=2000
sample,110,10=1.5
sample,120.25,20:0=1500,20:1=2500
sample,130,10=-2
"#;

#[cfg(test)]
fn test_archive() -> TextArchive {
    TextArchive::parse("test", &mut TEST_ARCHIVE.as_bytes()).unwrap()
}

#[test]
fn test_parse() {
    let a = test_archive();
    assert!(a.label().hostname.as_str() == "c1-1");
    assert!(a.label().start == Timeval::from_secs(100));
    assert!(a.label().end == Timeval::from_secs(130));
    assert!(a.num_samples() == 4);
    assert!(a.lookup_name("network.interface.in.bytes").unwrap() == MetricId(20));
    assert!(a.lookup_name("nope").unwrap_err().is_no_such_name());
    let d = a.describe(MetricId(20)).unwrap();
    assert!(d.mtype == MetricType::U64);
    assert!(d.semantics == Semantics::Counter);
    assert!(d.indom == Some(IndomId(3)));
    assert!(a.instance_name(IndomId(3), 1).unwrap() == "ib0");
    assert!(a.instance_name(IndomId(3), 2).is_none());
    assert!(a.metrics().len() == 2);
}

#[test]
fn test_forward_fetch_skips_unrelated_records() {
    let mut a = test_archive();
    a.set_mode(FetchMode::Forward, a.label().start).unwrap();
    let pmids = [MetricId(20)];
    let r1 = a.fetch(&pmids).unwrap();
    assert!(r1.timestamp == Timeval::from_secs(100));
    assert!(r1.metrics.len() == 1 && r1.metrics[0].values.len() == 2);
    let r2 = a.fetch(&pmids).unwrap();
    assert!(r2.timestamp == Timeval::new(120, 250000));
    assert!(a.outstanding() == 2);
    a.free(r1);
    a.free(r2);
    assert!(a.outstanding() == 0);
    assert!(a.fetch(&pmids).unwrap_err().is_end_of_log());
}

#[test]
fn test_backward_fetch() {
    let mut a = test_archive();
    a.set_mode(FetchMode::Backward, a.label().end).unwrap();
    let r = a.fetch(&[MetricId(20)]).unwrap();
    assert!(r.timestamp == Timeval::new(120, 250000));
    a.free(r);
    let r = a.fetch(&[MetricId(10)]).unwrap();
    assert!(r.timestamp == Timeval::from_secs(110));
    assert!(r.metrics[0].values == vec![(IN_NULL, Atom::F64(1.5))]);
    a.free(r);
}

#[test]
fn test_absent_metric_in_record() {
    let mut a = test_archive();
    a.set_mode(FetchMode::Forward, Timeval::from_secs(105)).unwrap();
    let r = a.fetch(&[MetricId(20), MetricId(10)]).unwrap();
    assert!(r.timestamp == Timeval::from_secs(110));
    assert!(r.metrics[0].pmid == MetricId(20) && r.metrics[0].values.is_empty());
    assert!(r.metrics[1].values.len() == 1);
    a.free(r);
    // 120.25 carries no pmid 10.
    let r = a.fetch(&[MetricId(10)]).unwrap();
    assert!(r.timestamp == Timeval::from_secs(130));
    assert!(r.metrics[0].values == vec![(IN_NULL, Atom::I64(-2))]);
    a.free(r);
    assert!(a.fetch(&[MetricId(99)]).is_err());
}

#[test]
fn test_parse_errors() {
    let bad = |s: &str| TextArchive::parse("test", &mut s.as_bytes()).is_err();
    assert!(bad("metric,1,a,u64,counter,-\n"));
    assert!(bad("label,h,10,5\n"));
    assert!(bad("label,h,1,5\nmetric,1,a,u64,counter,-\nsample,2,1=1\nsample,2,1=2\n"));
    assert!(bad("label,h,1,5\nmetric,1,a,u64,counter,-\nsample,2,2=1\n"));
    assert!(bad("label,h,1,5\nmetric,1,a,u64,counter,-\nsample,2,1:0=1\n"));
    assert!(bad("label,h,1,5\nmetric,1,a,u64,counter,4\nsample,2,1=1\n"));
    assert!(bad("label,h,1,5\nmetric,1,a,u64,bogus,-\n"));
    assert!(bad("label,h,1,5\nwhat,1\n"));
    assert!(!bad("label,h,1,5\nmetric,1,a,u64,counter,-\nsample,2,1=1\n"));
}
