/// Resolving a plugin's metric names against an archive, and decoding fetched values for it.
use crate::{InstanceNames, MetricData, RequiredMetrics};

use archivelog::{Archive, ArchiveError, Atom, MetricDesc, MetricId, MetricType, SampleSet};
use ustr::Ustr;

/// The metrics to fetch for one plugin from one archive, in plugin order.  Parallel vectors.

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub ids: Vec<MetricId>,
    pub names: Vec<Ustr>,
    pub descs: Vec<MetricDesc>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Find the metrics to fetch.  The result is empty if no alternative of the required metrics is
/// fully present, in which case the plugin cannot run on this archive.  Optional metrics are
/// appended individually, when present.
///
/// Only a missing name is tolerated; any other archive error is returned.

pub fn select_metrics(
    archive: &dyn Archive,
    required: &RequiredMetrics,
    optional: &[String],
) -> Result<Selection, ArchiveError> {
    let mut selection = Selection::default();
    for alternative in required.alternatives() {
        if let Some(found) = resolve_all(archive, alternative)? {
            selection = found;
            break;
        }
    }
    if selection.is_empty() {
        return Ok(selection);
    }
    for name in optional {
        match archive.lookup_name(name) {
            Ok(id) => selection.push(archive, id)?,
            Err(e) if e.is_no_such_name() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(selection)
}

fn resolve_all(archive: &dyn Archive, names: &[String]) -> Result<Option<Selection>, ArchiveError> {
    if names.is_empty() {
        return Ok(None);
    }
    let mut selection = Selection::default();
    for name in names {
        match archive.lookup_name(name) {
            Ok(id) => selection.push(archive, id)?,
            Err(e) if e.is_no_such_name() => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(Some(selection))
}

impl Selection {
    fn push(&mut self, archive: &dyn Archive, id: MetricId) -> Result<(), ArchiveError> {
        let desc = archive.describe(id)?;
        self.ids.push(id);
        self.names.push(desc.name);
        self.descs.push(desc);
        Ok(())
    }
}

/// Outcome of decoding one fetched sample set.

#[derive(Debug)]
pub enum Extracted {
    Values(Vec<MetricData>, Vec<InstanceNames>),

    /// An instance had no name in its instance domain.  Only reported in strict mode.
    MissingIndom(String),

    /// A value could not be represented as the metric's declared type.
    Invalid(String),
}

/// Decode `result`, which was fetched for `selection`, into plugin form.
///
/// In strict mode an unnamed instance yields `MissingIndom`; otherwise the instance is named by
/// its number.

pub fn extract_values(
    archive: &dyn Archive,
    result: &SampleSet,
    selection: &Selection,
    strict: bool,
) -> Extracted {
    let mut data = Vec::with_capacity(selection.ids.len());
    let mut description = Vec::with_capacity(selection.ids.len());
    for (id, desc) in selection.ids.iter().zip(selection.descs.iter()) {
        let mut md = MetricData::default();
        let mut names = InstanceNames::new();
        if let Some(mv) = result.metrics.iter().find(|m| m.pmid == *id) {
            for (inst, atom) in &mv.values {
                let Some(v) = atom_value(*atom, desc.mtype) else {
                    return Extracted::Invalid(format!(
                        "value {:?} of {} is not a valid {}",
                        atom,
                        desc.name,
                        desc.mtype.name()
                    ));
                };
                if let Some(indom) = desc.indom {
                    let name = match archive.instance_name(indom, *inst) {
                        Some(name) => name,
                        None if strict => {
                            return Extracted::MissingIndom(format!(
                                "missing instance {inst} in indom {indom} for {}",
                                desc.name
                            ))
                        }
                        None => ustr::ustr(&inst.to_string()),
                    };
                    names.push((*inst, name));
                }
                md.values.push(v);
                md.instances.push(*inst);
            }
        }
        data.push(md);
        description.push(names);
    }
    Extracted::Values(data, description)
}

fn atom_value(atom: Atom, mtype: MetricType) -> Option<f64> {
    match (mtype, atom) {
        (MetricType::I32, Atom::I64(v)) => i32::try_from(v).ok().map(|v| v as f64),
        (MetricType::I32, Atom::U64(v)) => i32::try_from(v).ok().map(|v| v as f64),
        (MetricType::U32, Atom::U64(v)) => u32::try_from(v).ok().map(|v| v as f64),
        (MetricType::I64, Atom::I64(v)) => Some(v as f64),
        (MetricType::I64, Atom::U64(v)) => i64::try_from(v).ok().map(|v| v as f64),
        (MetricType::U64, Atom::U64(v)) => Some(v as f64),
        (MetricType::Float | MetricType::Double, Atom::F64(v)) => Some(v),
        (MetricType::Float | MetricType::Double, Atom::I64(v)) => Some(v as f64),
        (MetricType::Float | MetricType::Double, Atom::U64(v)) => Some(v as f64),
        _ => None,
    }
}

#[cfg(test)]
const SELECT_ARCHIVE: &str = r#"
label,c1-1,100,120
metric,1,a.one,u64,counter,-
metric,2,a.two,u32,instant,-
metric,3,b.one,double,instant,-
metric,4,c.inst,i32,instant,7
indom,7,0,cpu0
sample,100,1=5,2=7,3=1.5,4:0=-3,4:1=4
sample,110,2=-1
sample,120,2=4294967296
"#;

#[cfg(test)]
fn select_archive() -> archivelog::TextArchive {
    archivelog::TextArchive::parse("select", &mut SELECT_ARCHIVE.as_bytes()).unwrap()
}

#[test]
fn test_required_all_or_nothing() {
    let a = select_archive();
    let s = select_metrics(&a, &RequiredMetrics::all(&["a.one", "a.two"]), &[]).unwrap();
    assert!(s.ids == vec![MetricId(1), MetricId(2)]);
    assert!(s.names == vec![ustr::ustr("a.one"), ustr::ustr("a.two")]);

    let s = select_metrics(&a, &RequiredMetrics::all(&["a.one", "a.three"]), &[]).unwrap();
    assert!(s.is_empty());

    let s = select_metrics(&a, &RequiredMetrics::all(&[]), &[]).unwrap();
    assert!(s.is_empty());
}

#[test]
fn test_required_alternatives_and_optional() {
    let a = select_archive();
    let req = RequiredMetrics::AnyOf(vec![
        vec!["x.one".to_string(), "a.one".to_string()],
        vec!["b.one".to_string()],
        vec!["a.two".to_string()],
    ]);
    let s = select_metrics(&a, &req, &["nope".to_string(), "a.one".to_string()]).unwrap();
    assert!(s.ids == vec![MetricId(3), MetricId(1)]);

    // Optional metrics alone do not make a selection.
    let s = select_metrics(&a, &RequiredMetrics::all(&["x"]), &["a.one".to_string()]).unwrap();
    assert!(s.is_empty());
}

#[test]
fn test_extract_values() {
    use archivelog::FetchMode;

    let mut a = select_archive();
    let s = select_metrics(&a, &RequiredMetrics::all(&["a.one", "b.one", "c.inst"]), &[]).unwrap();
    a.set_mode(FetchMode::Forward, a.label().start).unwrap();
    let r = a.fetch(&s.ids).unwrap();

    match extract_values(&a, &r, &s, false) {
        Extracted::Values(data, desc) => {
            assert!(data[0].values == vec![5.0]);
            assert!(data[0].instances == vec![archivelog::IN_NULL]);
            assert!(desc[0].is_empty());
            assert!(data[1].values == vec![1.5]);
            assert!(data[2].values == vec![-3.0, 4.0]);
            assert!(desc[2] == vec![(0, ustr::ustr("cpu0")), (1, ustr::ustr("1"))]);
        }
        _ => panic!("Expected values"),
    }
    match extract_values(&a, &r, &s, true) {
        Extracted::MissingIndom(msg) => assert!(msg.contains("c.inst")),
        _ => panic!("Expected missing indom"),
    }
    a.free(r);
}

#[test]
fn test_extract_invalid() {
    use archivelog::FetchMode;

    let mut a = select_archive();
    let s = select_metrics(&a, &RequiredMetrics::all(&["a.two"]), &[]).unwrap();
    a.set_mode(FetchMode::Forward, a.label().start).unwrap();
    let r = a.fetch(&s.ids).unwrap();
    assert!(matches!(extract_values(&a, &r, &s, true), Extracted::Values(..)));
    a.free(r);
    let r = a.fetch(&s.ids).unwrap();
    assert!(matches!(extract_values(&a, &r, &s, true), Extracted::Invalid(_)));
    a.free(r);
    let r = a.fetch(&s.ids).unwrap();
    assert!(matches!(extract_values(&a, &r, &s, true), Extracted::Invalid(_)));
    a.free(r);
    assert!(a.outstanding() == 0);
}
