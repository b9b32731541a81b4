use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use itertools::Itertools;

use simflow::Status;
use simflow::common::setup::setup_logging;
use simflow::manager::TaskManager;
use simflow::manager::config::MANAGER_DOC;
use simflow::simcore::events::EventReport;
use simflow::simcore::resources::HintSet;
use simflow::task::Task;
use simflow::task::family::TaskFamily;
use simflow::task::input::AbinitInput;

#[derive(Parser)]
#[command(author, version, about)]
struct RootOptions {
    /// Enables more verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Inspects the queue manager configuration
    Manager(ManagerOpts),
    /// Ranks the parallel configurations reported by an autoparal run
    Hints(HintsOpts),
    /// Summarizes the events of a run log
    Events(EventsOpts),
    /// Runs a single task with the configured manager
    Run(RunOpts),
}

#[derive(Parser)]
struct ManagerOpts {
    #[command(subcommand)]
    subcmd: ManagerCommand,
}

#[derive(Subcommand)]
enum ManagerCommand {
    /// Prints the documentation of manager.yml
    Doc,
    /// Prints the adapters and the policy of the configured manager
    Show {
        /// Path to manager.yml, the default lookup is used if not set
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Parser)]
struct HintsOpts {
    /// Output file containing the `!Autoparal` document
    file: PathBuf,

    /// Upper bound on the number of cores (the manager limit by default)
    #[arg(long)]
    max_ncpus: Option<u32>,
}

#[derive(Parser)]
struct EventsOpts {
    /// Log file of the run
    file: PathBuf,
}

#[derive(Parser)]
struct RunOpts {
    /// Input file with `name value` lines
    input: PathBuf,

    /// Working directory of the task
    #[arg(long)]
    workdir: PathBuf,

    #[arg(long, value_enum, default_value_t = TaskFamily::Generic)]
    family: TaskFamily,

    /// Program executed by the job script
    #[arg(long, env = "SIMFLOW_EXECUTABLE", default_value = "abinit")]
    executable: String,
}

fn load_manager(path: Option<&PathBuf>) -> anyhow::Result<TaskManager> {
    let manager = match path {
        Some(path) => TaskManager::from_file(path)?,
        None => TaskManager::from_user_config()?,
    };
    Ok(manager)
}

fn command_manager(opts: ManagerOpts) -> anyhow::Result<()> {
    match opts.subcmd {
        ManagerCommand::Doc => println!("{MANAGER_DOC}"),
        ManagerCommand::Show { path } => print!("{}", load_manager(path.as_ref())?),
    }
    Ok(())
}

fn command_hints(opts: HintsOpts) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&opts.file)
        .with_context(|| format!("Cannot read {}", opts.file.display()))?;
    let hints = HintSet::parse(&text)?;
    let mut manager = TaskManager::from_user_config()?;
    let max_ncpus = opts.max_ncpus.unwrap_or(manager.max_cores());

    let ranked = hints.get_ordered_with_policy(manager.policy(), max_ncpus)?;
    println!(
        "{:>4} {:>4} {:>4} {:>10} {:>8} {:>8}  vars",
        "mpi", "omp", "cpus", "mem [MB]", "eff", "speedup"
    );
    for conf in &ranked {
        println!(
            "{:>4} {:>4} {:>4} {:>10.1} {:>8.3} {:>8.3}  {}",
            conf.mpi_procs(),
            conf.omp_threads(),
            conf.num_cores(),
            conf.mem_per_proc(),
            conf.efficiency(),
            conf.speedup(),
            conf.vars().iter().map(|(k, v)| format!("{k}={v}")).join(", ")
        );
    }

    match manager.select_qadapter(&hints) {
        Ok(conf) => println!(
            "\n{} mpi={} omp={} on {}",
            "Selected:".green().bold(),
            conf.mpi_procs(),
            conf.omp_threads(),
            manager.qadapter()
        ),
        Err(e) => println!("\n{} {e}", "No adapter can run these configurations:".red()),
    }
    Ok(())
}

fn command_events(opts: EventsOpts) -> anyhow::Result<()> {
    let report = EventReport::from_file(&opts.file)?;
    print!("{report}");
    Ok(())
}

fn status_colored(status: Status) -> String {
    let text = status.as_str();
    match status {
        Status::Ok => text.green().to_string(),
        s if s.is_critical() => text.red().to_string(),
        Status::Unconverged => text.yellow().to_string(),
        _ => text.to_string(),
    }
}

fn command_run(opts: RunOpts) -> anyhow::Result<()> {
    let input = AbinitInput::from_file(&opts.input)?;
    let manager = TaskManager::from_user_config()?;
    let name = opts
        .workdir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("task")
        .to_string();
    let task = Task::new(opts.family, input)
        .with_name(&name)
        .with_workdir(&opts.workdir)
        .with_manager(manager)
        .with_executable(&opts.executable)
        .into_ref();

    let mut task = task.get_mut();
    if task.start()? {
        let code = task.wait()?;
        log::debug!("Process of {name} finished with {code}");
        task.check_status()?;
    }

    println!("{} {}", "Status:".bold(), status_colored(task.status()));
    if let Some(conf) = task.optconf() {
        println!(
            "Autoparal: mpi={} omp={} efficiency={:.2}",
            conf.mpi_procs(),
            conf.omp_threads(),
            conf.efficiency()
        );
    }
    println!("{}", "History:".bold());
    for record in task.history().records() {
        println!("{}", textwrap::indent(&textwrap::fill(&record.to_string(), 100), "  "));
    }
    if task.status().is_critical() {
        anyhow::bail!("task {name} finished with status {}", task.status());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = RootOptions::parse();
    setup_logging(opts.verbose);

    match opts.subcmd {
        SubCommand::Manager(opts) => command_manager(opts),
        SubCommand::Hints(opts) => command_hints(opts),
        SubCommand::Events(opts) => command_events(opts),
        SubCommand::Run(opts) => command_run(opts),
    }
}
