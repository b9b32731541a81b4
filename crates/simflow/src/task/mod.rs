//! A single run of the external program and its state machine.

mod autoparal;
pub mod datetimes;
pub mod deps;
pub mod family;
pub mod files;
pub mod gc;
pub mod handlers;
pub mod history;
pub mod input;
mod recovery;

use chrono::Local;
use serde::Serialize;
use serde_json::Value;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::fsutils::is_empty_file;
use crate::manager::TaskManager;
use crate::queue::errors::push_unique;
use crate::queue::{FakeProcess, Process, QueueError, QueueJob};
use crate::task::datetimes::{TaskDateTimes, local_datetime};
use crate::task::deps::{ConsumerEdge, Dependency};
use crate::task::family::TaskFamily;
use crate::task::files::{TaskDir, fix_numbered_ofiles, rename_last_timden};
use crate::task::gc::GcPolicy;
use crate::task::handlers::{EventHandler, default_handlers};
use crate::task::history::TaskHistory;
use crate::task::input::InputSpec;
use crate::{Status, TaskId, Vars, WrappedRcRefCell};
use simcore::events::{Event, EventReport};
use simcore::resources::{HintSet, ResourceConfiguration, SelectionPolicy};

pub use autoparal::AutoparalOutcome;

pub type TaskRef = WrappedRcRefCell<Task>;

/// Messages longer than this are cut before being recorded.
const MAX_MESSAGE_LEN: usize = 2000;

const DEFAULT_AUTOPARAL_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The task was restarted and submitted again.
    Submitted,
    /// The task was restarted and waits for a submission.
    Ready,
    NotRestartable,
}

/// Summary of a completed task.
#[derive(Clone, Debug, Serialize)]
pub struct TaskResults {
    pub task_id: u32,
    pub name: String,
    pub class_name: &'static str,
    pub status: Status,
    pub num_restarts: u32,
    pub num_launches: u32,
    pub runtime_secs: Option<i64>,
    pub outfiles: Vec<PathBuf>,
    pub num_warnings: usize,
    pub history: Vec<String>,
}

pub struct Task {
    id: TaskId,
    name: String,
    family: TaskFamily,
    input: Box<dyn InputSpec>,
    dir: Option<TaskDir>,
    manager: Option<TaskManager>,
    status: Status,
    history: TaskHistory,
    datetimes: TaskDateTimes,

    deps: Vec<Dependency>,
    consumers: Vec<ConsumerEdge>,

    process: Box<dyn Process>,
    returncode: i32,
    qjob: Option<QueueJob>,
    num_restarts: u32,
    finalized: bool,

    /// Memory per process decreases with the number of cores
    mem_scales: bool,
    /// Walltime decreases with the number of cores
    load_scales: bool,

    handlers: Vec<Box<dyn EventHandler>>,
    abi_errors: Vec<Event>,
    queue_errors: Vec<QueueError>,
    gc: Option<GcPolicy>,

    optconf: Option<ResourceConfiguration>,
    hints: Option<HintSet>,
    results: Option<TaskResults>,

    executable: String,
    autoparal_retry_delay: Duration,
}

fn truncate_message(message: String) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... snip ...\n", &message[..end])
}

/// Content of a file, `None` when missing or empty.
fn read_nonempty(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .filter(|text| !text.trim().is_empty())
}

impl Task {
    pub fn new(family: TaskFamily, input: impl InputSpec + 'static) -> Self {
        let id = TaskId::fresh();
        let name = format!("t{}", id.as_num());
        Task {
            id,
            history: TaskHistory::new(&name),
            name,
            family,
            input: Box::new(input),
            dir: None,
            manager: None,
            status: Status::Init,
            datetimes: TaskDateTimes::default(),
            deps: Vec::new(),
            consumers: Vec::new(),
            process: Box::new(FakeProcess),
            returncode: 0,
            qjob: None,
            num_restarts: 0,
            finalized: false,
            mem_scales: false,
            load_scales: false,
            handlers: default_handlers(),
            abi_errors: Vec::new(),
            queue_errors: Vec::new(),
            gc: None,
            optconf: None,
            hints: None,
            results: None,
            executable: "abinit".to_string(),
            autoparal_retry_delay: DEFAULT_AUTOPARAL_RETRY_DELAY,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self.history = TaskHistory::new(name);
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.set_workdir(workdir);
        self
    }

    pub fn with_manager(mut self, manager: TaskManager) -> Self {
        self.set_manager(manager);
        self
    }

    pub fn with_scaling(mut self, mem_scales: bool, load_scales: bool) -> Self {
        self.mem_scales = mem_scales;
        self.load_scales = load_scales;
        self
    }

    pub fn with_handlers(mut self, handlers: Vec<Box<dyn EventHandler>>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_gc(mut self, gc: GcPolicy) -> Self {
        self.gc = Some(gc);
        self
    }

    pub fn with_executable(mut self, executable: &str) -> Self {
        self.executable = executable.to_string();
        self
    }

    pub fn with_autoparal_retry_delay(mut self, delay: Duration) -> Self {
        self.autoparal_retry_delay = delay;
        self
    }

    pub fn into_ref(self) -> TaskRef {
        TaskRef::wrap(self)
    }

    /// The task gets its own copy of the manager with the limits of its family applied.
    pub fn set_manager(&mut self, mut manager: TaskManager) {
        manager.apply_limits_for_task_class(self.family.class_name());
        self.manager = Some(manager);
    }

    pub fn set_workdir(&mut self, workdir: impl Into<PathBuf>) {
        let dir = TaskDir::new(workdir);
        if let Some(old) = &self.dir {
            if old.path() != dir.path() {
                log::warn!(
                    "{}: changing workdir from {} to {}",
                    self.name,
                    old.path().display(),
                    dir.path().display()
                );
            }
        }
        self.dir = Some(dir);
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn family(&self) -> TaskFamily {
        self.family
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn dir(&self) -> crate::Result<&TaskDir> {
        self.dir.as_ref().ok_or_else(|| {
            crate::Error::GenericError(format!("working directory of {} is not set", self.name))
        })
    }

    pub fn manager(&self) -> crate::Result<&TaskManager> {
        self.manager.as_ref().ok_or_else(|| {
            crate::Error::GenericError(format!("{} has no manager", self.name))
        })
    }

    pub fn manager_mut(&mut self) -> crate::Result<&mut TaskManager> {
        let name = &self.name;
        self.manager
            .as_mut()
            .ok_or_else(|| crate::Error::GenericError(format!("{name} has no manager")))
    }

    pub fn history(&self) -> &TaskHistory {
        &self.history
    }

    pub fn datetimes(&self) -> &TaskDateTimes {
        &self.datetimes
    }

    pub fn input(&self) -> &dyn InputSpec {
        self.input.as_ref()
    }

    pub fn get_inpvar(&self, name: &str) -> Option<&Value> {
        self.input.get(name)
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.input.set_var(name, value);
    }

    pub fn set_vars(&mut self, vars: &Vars) {
        self.input.set_vars(vars);
    }

    #[inline]
    pub fn returncode(&self) -> i32 {
        self.returncode
    }

    pub fn qjob(&self) -> Option<&QueueJob> {
        self.qjob.as_ref()
    }

    #[inline]
    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    pub fn num_launches(&self) -> u32 {
        self.manager.as_ref().map(|m| m.num_launches()).unwrap_or(0)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn abi_errors(&self) -> &[Event] {
        &self.abi_errors
    }

    pub fn queue_errors(&self) -> &[QueueError] {
        &self.queue_errors
    }

    /// Configuration selected by the last autoparal run.
    pub fn optconf(&self) -> Option<&ResourceConfiguration> {
        self.optconf.as_ref()
    }

    pub fn hints(&self) -> Option<&HintSet> {
        self.hints.as_ref()
    }

    pub fn results(&self) -> Option<&TaskResults> {
        self.results.as_ref()
    }

    pub fn critical_events(&self) -> &'static [&'static str] {
        self.family.critical_events()
    }

    /// Records a status change. Locked tasks are changed only through `lock`/`unlock`.
    pub fn set_status(&mut self, status: Status, msg: impl Into<String>) -> crate::Result<Status> {
        if self.status == Status::Locked || status == Status::Locked {
            return Err(crate::Error::InvariantError(format!(
                "{}: cannot change status from {} to {} while locked",
                self.name,
                self.status.as_str(),
                status.as_str()
            )));
        }
        let msg = truncate_message(msg.into());

        if status == Status::Running && self.datetimes.start.is_none() {
            self.datetimes.start = Some(Local::now());
        }

        let changed = status != self.status;
        self.status = status;
        if changed {
            match status {
                Status::Submitted => {
                    self.datetimes.submission = Some(Local::now());
                    self.history.info(msg);
                }
                Status::Ok => self.history.info(format!("Task completed {msg}")),
                Status::AbiCritical => {
                    self.history
                        .info(format!("Status set to AbiCritical due to: {msg}"))
                }
                _ => self
                    .history
                    .info(format!("Status changed to {}. msg: {msg}", status.as_str())),
            }
        }

        if status == Status::Done {
            if let Err(e) = self.fix_ofiles() {
                self.history
                    .warning(format!("Cannot canonicalize output files: {e}"));
            }
        }

        if status == Status::Ok {
            if !self.finalized {
                self.on_ok();
            }
            if self.status == Status::Ok && self.gc.is_some() {
                if let Err(e) = self.clean_output_files() {
                    self.history
                        .warning(format!("Garbage collection failed: {e}"));
                }
            }
        }
        Ok(self.status)
    }

    /// Prevents any status change until `unlock` is called by the same `source`.
    pub fn lock(&mut self, source: &str) -> crate::Result<()> {
        if self.status != Status::Init {
            return Err(crate::Error::InvariantError(format!(
                "{}: only initialized tasks can be locked, status is {}",
                self.name,
                self.status.as_str()
            )));
        }
        self.status = Status::Locked;
        self.history.info(format!("Locked by {source}"));
        Ok(())
    }

    pub fn unlock(&mut self, source: &str, check_status: bool) -> crate::Result<Status> {
        if self.status != Status::Locked {
            return Err(crate::Error::InvariantError(format!(
                "{}: cannot unlock a task in status {}",
                self.name,
                self.status.as_str()
            )));
        }
        self.status = Status::Ready;
        self.history.info(format!("Unlocked by {source}"));
        if check_status {
            self.check_status()
        } else {
            Ok(self.status)
        }
    }

    /// Derives the status from the files of the working directory.
    pub fn check_status(&mut self) -> crate::Result<Status> {
        if matches!(self.status, Status::Locked | Status::Error) {
            return Ok(self.status);
        }
        match self.derive_status() {
            Ok(Some((status, msg))) => self.set_status(status, msg),
            Ok(None) => Ok(self.status),
            Err(e) => self.set_status(Status::AbiCritical, e.to_string()),
        }
    }

    fn derive_status(&mut self) -> crate::Result<Option<(Status, String)>> {
        let dir = self.dir()?.clone();

        if self.returncode != 0 {
            self.parse_queue_errors();
            return Ok(Some((
                Status::QCritical,
                format!(
                    "job.sh return code: {}\nPerhaps the job was not submitted properly?",
                    self.returncode
                ),
            )));
        }

        if dir.mpiabort_file().exists() {
            return Ok(Some((
                Status::AbiCritical,
                "Found ABINIT abort file".to_string(),
            )));
        }

        let log_file = dir.log_file();
        let err_msg = read_nonempty(&dir.stderr_file());

        if log_file.exists() {
            let Some(report) = self.get_event_report()? else {
                return Ok(Some((Status::Error, "got None report!".to_string())));
            };
            if report.run_completed {
                if let Some(start) = report.start_datetime.and_then(local_datetime) {
                    self.datetimes.start = Some(start);
                }
                if let Some(end) = report.end_datetime.and_then(local_datetime) {
                    self.datetimes.end = Some(end);
                }
                let critical = report.critical_events(self.critical_events());
                if critical.is_empty() {
                    return Ok(Some((Status::Ok, "status set to ok based on abiout".to_string())));
                }
                let msg = critical
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                return Ok(Some((Status::Unconverged, msg)));
            }

            let failures = report.failures();
            if !failures.is_empty() {
                let msg = failures
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                if self.status != Status::AbiCritical {
                    self.abi_errors = failures.into_iter().cloned().collect();
                }
                return Ok(Some((Status::AbiCritical, msg)));
            }

            if is_empty_file(&dir.stderr_file()) && is_empty_file(&dir.qerr_file()) {
                return Ok(Some((
                    Status::Running,
                    "Output file exists, no errors reported, still running".to_string(),
                )));
            }
        }

        if !log_file.exists() && !dir.stderr_file().exists() && !dir.qerr_file().exists() {
            return Ok(None);
        }

        if let Some(err_msg) = err_msg {
            self.history
                .warning(format!("found error message:\n{err_msg}"));
        }

        let frozen_timeout = self
            .manager
            .as_ref()
            .map(|m| m.policy().frozen_timeout)
            .unwrap_or_else(|| SelectionPolicy::default().frozen_timeout);
        if let Ok(modified) = std::fs::metadata(&log_file).and_then(|m| m.modified()) {
            if modified.elapsed().is_ok_and(|age| age > frozen_timeout) {
                return Ok(Some((
                    Status::Error,
                    format!(
                        "Task seems to be frozen, last change more than {} ago",
                        humantime::format_duration(frozen_timeout)
                    ),
                )));
            }
        }

        Ok(Some((
            Status::Running,
            "final option: nothing seems to be wrong, the job must still be running".to_string(),
        )))
    }

    /// Classifies the failures reported by the backend in the queue files.
    pub(crate) fn parse_queue_errors(&mut self) {
        let (Ok(dir), Ok(manager)) = (self.dir(), self.manager()) else {
            return;
        };
        let qout = std::fs::read_to_string(dir.qout_file()).unwrap_or_default();
        let qerr = std::fs::read_to_string(dir.qerr_file()).unwrap_or_default();
        let errors = manager.qadapter().handler().parse_errors(&qout, &qerr);
        for error in errors {
            push_unique(&mut self.queue_errors, error);
        }
    }

    /// Events of the last run, amended with the last event of the abort file.
    pub fn get_event_report(&self) -> crate::Result<Option<EventReport>> {
        let dir = self.dir()?;
        let log_file = dir.log_file();
        let abort_file = dir.mpiabort_file();
        let abort_report = if abort_file.exists() {
            Some(EventReport::from_file(&abort_file)?)
        } else {
            None
        };
        if !log_file.exists() {
            return Ok(abort_report);
        }
        let mut report = EventReport::from_file(&log_file)?;
        if let Some(last) = abort_report.as_ref().and_then(|r| r.last_event()) {
            if report.last_event() != Some(last) {
                report.append(last.clone());
            }
        }
        Ok(Some(report))
    }

    fn mark_done(&mut self, returncode: i32) {
        self.returncode = returncode;
        if self.status < Status::Done {
            if let Err(e) = self.set_status(Status::Done, "status set to Done") {
                log::warn!("{e}");
            }
        }
    }

    /// Returns the return code of the process if it has terminated.
    pub fn poll(&mut self) -> Option<i32> {
        let code = self.process.poll();
        if let Some(code) = code {
            self.mark_done(code);
        }
        code
    }

    /// Blocks until the process terminates.
    pub fn wait(&mut self) -> crate::Result<i32> {
        let code = self.process.wait()?;
        self.mark_done(code);
        Ok(code)
    }

    pub fn communicate(&mut self) -> crate::Result<(String, String)> {
        let output = self.process.communicate()?;
        let code = self.process.wait()?;
        self.mark_done(code);
        Ok(output)
    }

    pub fn kill(&mut self) -> crate::Result<()> {
        self.process.kill()?;
        self.set_status(Status::Error, "status set to Error by task.kill")?;
        Ok(())
    }

    /// Gives the produced files their canonical names.
    pub fn fix_ofiles(&mut self) -> crate::Result<()> {
        let outdir = self.dir()?.outdir().clone();
        for (old, new) in fix_numbered_ofiles(&outdir)? {
            self.history
                .info(format!("Renamed {} to {}", old.display(), new.display()));
        }
        if self.family == TaskFamily::Relax {
            if let Some(den) = rename_last_timden(&outdir)? {
                self.history
                    .info(format!("Renamed last TIM density to {}", den.display()));
            }
        }
        Ok(())
    }

    fn on_ok(&mut self) {
        if let Err(e) = self.fix_ofiles() {
            self.history
                .warning(format!("Cannot canonicalize output files: {e}"));
        }
        let num_warnings = match self.get_event_report() {
            Ok(Some(report)) => report.warnings().len(),
            _ => 0,
        };
        self.results = Some(TaskResults {
            task_id: self.id.as_num(),
            name: self.name.clone(),
            class_name: self.family.class_name(),
            status: self.status,
            num_restarts: self.num_restarts,
            num_launches: self.num_launches(),
            runtime_secs: self.datetimes.get_runtime().map(|d| d.num_seconds()),
            outfiles: self
                .dir
                .as_ref()
                .map(|d| d.outdir().list_filepaths())
                .unwrap_or_default(),
            num_warnings,
            history: self.history.records().iter().map(|r| r.to_string()).collect(),
        });
        self.history.info("Task finalized");
        self.finalized = true;
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("family", &self.family)
            .field("status", &self.status)
            .field("workdir", &self.dir.as_ref().map(|d| d.path()))
            .field("num_restarts", &self.num_restarts)
            .field("deps", &self.deps)
            .finish()
    }
}
