pub mod adapter;
mod common;
pub mod errors;
pub mod pbs;
pub mod process;
pub mod shell;
pub mod slurm;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use adapter::{Allocation, QueueAdapter};
pub use errors::QueueError;
pub use process::{ChildProcess, CompletedProcess, FakeProcess, Process};

use crate::Vars;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Shell,
    Slurm,
    Pbs,
}

impl QueueKind {
    pub fn handler(&self) -> &'static dyn QueueHandler {
        static SHELL: shell::ShellHandler = shell::ShellHandler;
        static SLURM: slurm::SlurmHandler = slurm::SlurmHandler;
        static PBS: pbs::PbsHandler = pbs::PbsHandler;
        match self {
            QueueKind::Shell => &SHELL,
            QueueKind::Slurm => &SLURM,
            QueueKind::Pbs => &PBS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Shell => "shell",
            QueueKind::Slurm => "slurm",
            QueueKind::Pbs => "pbs",
        }
    }
}

impl Display for QueueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle of a job known to a queue backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJob {
    pub qid: String,
    pub kind: QueueKind,
}

impl Display for QueueJob {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.qid)
    }
}

/// Files involved in a single submission.
#[derive(Debug)]
pub struct JobFiles<'a> {
    pub script: &'a Path,
    pub qout: &'a Path,
    pub qerr: &'a Path,
}

#[derive(Debug)]
pub struct SubmitResult {
    /// Missing when the backend rejected the script.
    pub qid: Option<String>,
    pub process: Box<dyn Process>,
}

/// Resource request rendered into the backend header of a job script.
#[derive(Debug)]
pub struct HeaderParams<'a> {
    pub job_name: &'a str,
    pub qname: &'a str,
    pub qparams: &'a Vars,
    pub qout_path: &'a Path,
    pub qerr_path: &'a Path,
    pub mpi_procs: u32,
    pub omp_threads: u32,
    /// Megabytes
    pub mem_per_proc: f64,
    /// Set only when the adapter allocates whole nodes.
    pub num_nodes: Option<u32>,
    pub timelimit: Duration,
    pub exclude_nodes: &'a [String],
}

/// Handler that can communicate with some job backend (local shell, Slurm, PBS).
pub trait QueueHandler: Sync {
    fn kind(&self) -> QueueKind;

    /// Backend specific lines written right after the shebang.
    fn header(&self, params: &HeaderParams) -> String;

    /// Submits the script. A rejected submission is not an error: it yields no queue id
    /// and a process with a non-zero return code.
    fn submit(&self, files: &JobFiles) -> crate::Result<SubmitResult>;

    /// Cancels the job, returning the exit status of the cancel command.
    fn cancel(&self, qid: &str) -> crate::Result<i32>;

    /// Number of jobs of `username` in the queue, `None` if it cannot be determined.
    fn njobs_in_queue(&self, username: &str) -> Option<usize>;

    /// Classifies the failures reported by the backend in its stdout/stderr files.
    fn parse_errors(&self, qout: &str, qerr: &str) -> Vec<QueueError>;

    fn supports_exclude_nodes(&self) -> bool {
        false
    }
}

/// Parameters of the job script that do not depend on the backend.
#[derive(Debug)]
pub struct ScriptParams<'a> {
    pub job_name: &'a str,
    pub launch_dir: &'a Path,
    pub executable: &'a str,
    pub qout_path: &'a Path,
    pub qerr_path: &'a Path,
    pub in_file: &'a Path,
    pub stdout: &'a Path,
    pub stderr: &'a Path,
    pub exec_args: &'a [String],
}

pub(crate) fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_default()
}

pub(crate) fn script_dir(script: &Path) -> PathBuf {
    match script.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
