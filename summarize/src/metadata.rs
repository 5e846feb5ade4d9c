/// Print an archive's label and metric table as headerless CSV.
///
///   label,HOSTNAME,START,END
///   metric,PMID,NAME,TYPE,SEMANTICS,INDOM
///
/// Metrics are sorted by name.  INDOM is `-` for single-valued metrics.
use anyhow::Result;
use archivelog::{Archive, TextArchive};
use std::io;

pub fn print(output: &mut dyn io::Write, archive: &TextArchive) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_writer(output);

    let label = archive.label();
    writer.write_record([
        "label",
        label.hostname.as_str(),
        label.start.to_string().as_str(),
        label.end.to_string().as_str(),
    ])?;

    let mut metrics = archive.metrics();
    metrics.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
    for m in metrics {
        let indom = match m.indom {
            Some(indom) => indom.to_string(),
            None => "-".to_string(),
        };
        writer.write_record([
            "metric",
            m.pmid.to_string().as_str(),
            m.name.as_str(),
            m.mtype.name(),
            m.semantics.name(),
            indom.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[test]
fn test_print_metadata() {
    let archive = TextArchive::open(std::path::Path::new("../tests/archives/c1-1.txt")).unwrap();
    let mut out = vec![];
    print(&mut out, &archive).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines = text.lines().collect::<Vec<_>>();
    assert!(lines[0] == "label,c1-1,1000.000000,1060.000000");
    assert!(lines[1] == "metric,1,hinv.ncpu,u32,discrete,-");
    assert!(lines.iter().any(|l| *l == "metric,10,network.interface.in.bytes,u64,counter,1"));
    assert!(lines.len() == 1 + archive.metrics().len());
}
