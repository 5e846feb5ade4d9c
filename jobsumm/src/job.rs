/// The job being summarized: identity, accounting, and the archive of each node.
///
/// Job descriptions are read from JSON:
///
///   {
///     "job_id": "1234567",
///     "jobdir": "/data/jobs/1234567",
///     "acct": { "user": "alice", "partition": "normal", ... },
///     "nodecount": 2,
///     "nodes": [
///       { "nodename": "c1-1", "nodeidx": 0, "archive": "c1-1/1234567.txt" },
///       { "nodename": "c1-2", "nodeidx": 1, "archive": "c1-2/1234567.txt" }
///     ]
///   }
///
/// `nodecount` is the number of nodes the job ran on, which may be larger than the number of
/// archives found for it.  `acct` is copied into the summary as is, with the job id added.
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeArchive {
    pub nodename: String,
    pub nodeidx: usize,

    /// Location of the archive, meaningful to the archive source.
    pub archive: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub job_id: String,
    #[serde(default)]
    pub jobdir: String,
    #[serde(default)]
    pub acct: serde_json::Map<String, Value>,
    pub nodecount: usize,
    #[serde(default)]
    nodes: Vec<NodeArchive>,

    // Problems found while assembling the job, before summarization.
    #[serde(default)]
    errors: Vec<String>,

    // Extra per-source data.  Only an "errors" entry in a source is used, under that source's name.
    #[serde(default)]
    data: BTreeMap<String, Value>,
}

impl Job {
    pub fn new(job_id: &str, jobdir: &str, nodecount: usize) -> Job {
        Job {
            job_id: job_id.to_string(),
            jobdir: jobdir.to_string(),
            acct: serde_json::Map::new(),
            nodecount,
            nodes: vec![],
            errors: vec![],
            data: BTreeMap::new(),
        }
    }

    pub fn add_node(&mut self, nodename: &str, archive: &str) {
        let nodeidx = self.nodes.len();
        self.nodes.push(NodeArchive {
            nodename: nodename.to_string(),
            nodeidx,
            archive: archive.to_string(),
        })
    }

    pub fn add_error(&mut self, msg: &str) {
        self.errors.push(msg.to_string())
    }

    pub fn set_data(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn nodearchives(&self) -> &[NodeArchive] {
        &self.nodes
    }

    pub fn get_errors(&self) -> &[String] {
        &self.errors
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }
}

pub fn read_job(filename: &str) -> Result<Job> {
    let file = File::open(filename).with_context(|| format!("Opening job file {filename}"))?;
    let job: Job = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Parsing job file {filename}"))?;
    validate_job(&job)?;
    Ok(job)
}

pub fn parse_job(s: &str) -> Result<Job> {
    let job: Job = serde_json::from_str(s)?;
    validate_job(&job)?;
    Ok(job)
}

fn validate_job(job: &Job) -> Result<()> {
    if job.job_id.is_empty() {
        bail!("Job id must not be empty")
    }
    if job.nodes.len() > job.nodecount {
        bail!(
            "Job {} has {} archives but only {} nodes",
            job.job_id,
            job.nodes.len(),
            job.nodecount
        )
    }
    let mut seen = HashSet::new();
    for n in &job.nodes {
        if !seen.insert(n.nodeidx) {
            bail!("Job {}: duplicate node index {}", job.job_id, n.nodeidx)
        }
    }
    Ok(())
}

#[test]
fn test_read_job() {
    let job = read_job("../tests/job-2node.json").unwrap();
    assert!(job.job_id == "1234567");
    assert!(job.nodecount == 2);
    assert!(job.nodearchives().len() == 2);
    assert!(job.nodearchives()[1].nodename == "c1-2");
    assert!(job.acct["user"] == "alice");
    assert!(job.get_errors().is_empty());
}

#[test]
fn test_job_errors() {
    assert!(parse_job(r#"{"nodecount": 1}"#).is_err());
    assert!(parse_job(r#"{"job_id": "", "nodecount": 1}"#).is_err());
    assert!(parse_job(
        r#"{"job_id": "1", "nodecount": 1, "nodes": [
              {"nodename": "a", "nodeidx": 0, "archive": "a"},
              {"nodename": "b", "nodeidx": 1, "archive": "b"}]}"#
    )
    .is_err());
    assert!(parse_job(
        r#"{"job_id": "1", "nodecount": 2, "nodes": [
              {"nodename": "a", "nodeidx": 0, "archive": "a"},
              {"nodename": "b", "nodeidx": 0, "archive": "b"}]}"#
    )
    .is_err());

    let mut job = parse_job(r#"{"job_id": "7", "nodecount": 3, "errors": ["no archive for c3"]}"#)
        .unwrap();
    assert!(job.get_errors().len() == 1);
    job.add_node("c1", "c1.txt");
    job.add_node("c2", "c2.txt");
    assert!(job.nodearchives()[1].nodeidx == 1);
}
