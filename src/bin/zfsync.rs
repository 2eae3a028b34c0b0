use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use human_panic::setup_panic;
use log::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use zfsync::core::inspect::{compare_snapshots, Inspector};
use zfsync::core::job::JobRunner;
use zfsync::core::runner::CommandRunner;
use zfsync::model::settings::RunnerSettings;
use zfsync::model::storage::{load_jobs, JobSet};
use zfsync::model::JobConfig;
use zfsync::observer::{ConsoleObserver, Reporter};
use zfsync::sys::process::{DuctExecutor, SystemSpawner};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

fn main() {
    setup_panic!();

    let options = CliOptions::parse();
    let level = match options.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    pretty_env_logger::formatted_builder().filter_level(level).init();

    let exit_code = match command_dispatch(options) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            for cause in e.chain().skip(1) {
                debug!("Caused by: {}", cause);
            }
            1
        }
    };
    std::process::exit(exit_code);
}

fn command_dispatch(options: CliOptions) -> Result<i32> {
    match options.subcmd {
        Commands::Run(options) => run_jobs(&options.jobs, options.dry_run),
        Commands::Plan(options) => run_jobs(&options, true),
        Commands::Status(options) => show_status(options).map(|_| 0),
    }
}

fn select_jobs(selection: &JobSelection) -> Result<Vec<JobConfig>> {
    let mut jobs: JobSet = load_jobs(&selection.jobfile)?;
    if selection.job.is_empty() {
        return Ok(jobs.into_values().collect());
    }

    selection
        .job
        .iter()
        .map(|name| {
            jobs.remove(name)
                .with_context(|| format!("Job {} is not defined in {}.", name, selection.jobfile.display()))
        })
        .collect()
}

fn run_jobs(selection: &JobSelection, dry_run: bool) -> Result<i32> {
    let jobs = select_jobs(selection)?;
    let mut settings = RunnerSettings::from_env()?;
    settings.dry_run |= dry_run;

    let executor = DuctExecutor;
    let spawner = SystemSpawner;
    let runner = JobRunner::new(
        &executor,
        &spawner,
        &settings,
        Arc::new(ConsoleObserver::new(PROGRESS_INTERVAL)),
    );

    let mut failed = Vec::new();
    for job in &jobs {
        let started = Instant::now();
        let report = runner.run(job);
        let elapsed = Duration::from_secs(started.elapsed().as_secs());
        if report.success {
            info!("{} completed in {}.", report.job, humantime::format_duration(elapsed));
        } else {
            failed.push(report.job);
        }
    }

    if failed.is_empty() {
        Ok(0)
    } else {
        error!("{} of {} jobs failed: {}", failed.len(), jobs.len(), failed.join(", "));
        Ok(1)
    }
}

fn show_status(options: StatusOptions) -> Result<()> {
    let jobs = load_jobs(&options.jobfile)?;
    let job = match jobs.get(&options.job) {
        Some(job) => job,
        None => bail!("Job {} is not defined in {}.", options.job, options.jobfile.display()),
    };

    let settings = RunnerSettings::from_env()?;
    let executor = DuctExecutor;
    let runner = CommandRunner::new(
        &executor,
        settings.ssh_options(),
        &job.ssh_user,
        Some(settings.command_timeout),
        true,
        Reporter::new(Arc::new(ConsoleObserver::new(PROGRESS_INTERVAL))),
    );
    let inspector = Inspector::new(&runner);

    let source = job.source();
    let destination = job.destination();
    let source_snapshots = inspector
        .list_snapshots_with_guid(source.dataset, source.host)
        .with_context(|| format!("Failed to list snapshots of {}.", source))?;
    let destination_snapshots = if inspector.dataset_exists(destination.dataset, destination.host) {
        inspector
            .list_snapshots_with_guid(destination.dataset, destination.host)
            .with_context(|| format!("Failed to list snapshots of {}.", destination))?
    } else {
        warn!("{} does not exist yet.", destination);
        Default::default()
    };

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Snapshot").add_attribute(Attribute::Bold),
            Cell::new("Source GUID").add_attribute(Attribute::Bold),
            Cell::new("Destination GUID").add_attribute(Attribute::Bold),
            Cell::new("State").add_attribute(Attribute::Bold),
        ]);

    for comparison in compare_snapshots(&source_snapshots, &destination_snapshots) {
        let state = match (comparison.source_guid, comparison.destination_guid) {
            _ if comparison.verified() => Cell::new("verified").fg(Color::Green),
            (Some(_), Some(_)) => Cell::new("guid mismatch").fg(Color::Red),
            (Some(_), None) => Cell::new("source only").fg(Color::Yellow),
            _ => Cell::new("destination only").fg(Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(&comparison.name).fg(Color::Blue),
            guid_cell(comparison.source_guid),
            guid_cell(comparison.destination_guid),
            state,
        ]);
    }

    println!("{} -> {}", source, destination);
    println!("{}", table);
    Ok(())
}

fn guid_cell(guid: Option<u64>) -> Cell {
    Cell::new(guid.map_or_else(|| "-".to_string(), |g| g.to_string()))
}

#[derive(Parser)]
#[clap(version, author = "opensource@rebeagle.com", about = "Replicate ZFS datasets between hosts.")]
struct CliOptions {
    /// Enable debug logs. Use twice to enable trace logs.
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[clap(subcommand)]
    subcmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run jobs from a job file, one after another.
    Run(RunOptions),
    /// Show what a run would do without changing anything.
    Plan(JobSelection),
    /// Compare source and destination snapshots of one job.
    Status(StatusOptions),
}

#[derive(Args)]
struct JobSelection {
    /// JSON file holding a single job or a map of named jobs.
    jobfile: PathBuf,
    /// Only run the named job. May be repeated.
    #[clap(long)]
    job: Vec<String>,
}

#[derive(Args)]
struct RunOptions {
    #[clap(flatten)]
    jobs: JobSelection,
    /// Log mutating commands instead of running them.
    #[clap(long)]
    dry_run: bool,
}

#[derive(Args)]
struct StatusOptions {
    jobfile: PathBuf,
    #[clap(long)]
    job: String,
}
