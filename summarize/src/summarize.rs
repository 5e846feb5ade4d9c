/// `summarize` -- Summarize the performance archives of a job
///
/// Run with --help for brief help.
///
/// A job is described by a JSON file naming the job, its accounting data, and the archive of each
/// node (see `jobsumm::Job`).  Archive locations are relative to the directory of the job file
/// unless --archive-root is given.  The summary is written as JSON to stdout or to --output.
///
/// Logging goes to stderr and is controlled by -d/-q and RUST_LOG.
mod hinv;
mod metadata;
mod network;
mod nfs;
mod plugins;

use anyhow::{bail, Result};
use archivelog::TextArchiveSource;
use clap::{Args, Parser, Subcommand};
use jobsumm::Summarize;
use rustutils::SummarizeConfig;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log debug messages
    #[arg(long, short, global = true)]
    debug: bool,

    /// Log errors only
    #[arg(long, short, global = true, conflicts_with = "debug")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print information about the program
    Version,

    /// Summarize one job
    Job(JobCmdArgs),

    /// Print the label and metric table of an archive
    Metadata(MetadataCmdArgs),
}

#[derive(Args, Debug)]
pub struct JobCmdArgs {
    /// File containing the JSON job description
    #[arg(long)]
    job_file: String,

    /// File containing JSON data with summarizer configuration [default: none]
    #[arg(long)]
    config_file: Option<String>,

    /// Directory that archive locations are relative to [default: the job file's directory]
    #[arg(long)]
    archive_root: Option<String>,

    /// Stop at the first archive that fails, instead of recording the failure and moving on
    #[arg(long)]
    fail_fast: bool,

    /// Write the summary here [default: stdout]
    #[arg(long, short)]
    output: Option<String>,
}

#[derive(Args, Debug)]
pub struct MetadataCmdArgs {
    /// Archive file name
    archive: String,
}

fn main() {
    match summarize() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {:#}", msg);
            process::exit(1);
        }
    }
}

fn summarize() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Version => {
            // Syntax as for the other tools: space-separated keyword(value) components, the
            // program name first.
            println!(
                "summarize version({}) timeseries({})",
                jobsumm::SUMMARIZE_VERSION,
                jobsumm::TIMESERIES_VERSION
            );
            Ok(())
        }
        Commands::Job(ref job_args) => summarize_job(job_args),
        Commands::Metadata(ref meta_args) => {
            let archive = archivelog::TextArchive::open(Path::new(&meta_args.archive))?;
            let mut stdout = io::stdout();
            metadata::print(&mut stdout, &archive)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn summarize_job(args: &JobCmdArgs) -> Result<()> {
    let config = if let Some(ref config_filename) = args.config_file {
        rustutils::read_summarize_config(config_filename)?
    } else {
        SummarizeConfig::default()
    };

    let job = jobsumm::read_job(&args.job_file)?;
    if job.nodearchives().is_empty() {
        bail!("Job {} has no archives", job.job_id)
    }

    let root = match args.archive_root {
        Some(ref root) => Some(Path::new(root).to_path_buf()),
        None => Path::new(&args.job_file).parent().map(|p| p.to_path_buf()),
    };
    let source = TextArchiveSource::new(root.as_deref());

    let (preprocs, analytics) = plugins::all_plugins();
    let mut s = Summarize::new(
        preprocs,
        analytics,
        job,
        config,
        Box::new(source),
        args.fail_fast,
    );
    let success = s.process()?;

    for (name, status) in s.plugin_statuses() {
        log::debug!("{name}: {status}");
    }
    if !success {
        log::warn!(
            "Job {} summarized with errors (complete={}, good_enough={})",
            s.job().job_id,
            s.complete(),
            s.good_enough()
        );
    }

    let summary = s.get();
    match args.output {
        Some(ref filename) => {
            let mut w = BufWriter::new(File::create(filename)?);
            serde_json::to_writer_pretty(&mut w, &summary)?;
            writeln!(w)?;
            w.flush()?;
        }
        None => {
            let mut w = io::stdout().lock();
            serde_json::to_writer_pretty(&mut w, &summary)?;
            writeln!(w)?;
        }
    }
    Ok(())
}
