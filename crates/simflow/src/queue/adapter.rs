use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

use crate::Vars;
use crate::common::error::ManagerIncreaseError;
use crate::common::size::{deserialize_memory, deserialize_opt_memory};
use crate::common::timeutils::{
    deserialize_duration, deserialize_opt_duration, format_slurm_time, serialize_duration,
    serialize_opt_duration,
};
use crate::queue::{HeaderParams, JobFiles, QueueHandler, QueueKind, ScriptParams, SubmitResult};
use simcore::resources::{Condition, ResourceConfiguration};

/// Memory added to each process by a single `more_mem_per_proc` step (MB).
const MEM_INCREASE_STEP: f64 = 2000.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    pub qtype: QueueKind,
    #[serde(default)]
    pub qname: String,
    /// Extra backend options, rendered as `--key=value` (Slurm) or `-l key=value` (PBS)
    #[serde(default)]
    pub qparams: Vars,
    /// Lines copied verbatim after the backend header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qverbatim: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde(default)]
    pub mpi_runner: String,
    #[serde(default)]
    pub mpi_runner_options: String,
    /// Runner used when the job is executed through the shell backend
    #[serde(default)]
    pub shell_runner: String,
    #[serde(default)]
    pub shell_runner_options: String,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub pre_run: Vec<String>,
    #[serde(default)]
    pub post_run: Vec<String>,
    /// Whether the executable can use OpenMP threads
    #[serde(default = "default_true")]
    pub omp: bool,
}

fn default_true() -> bool {
    true
}

fn default_min_cores() -> u32 {
    1
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Allocation {
    #[default]
    Cores,
    Nodes,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timelimit: Duration,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_duration",
        serialize_with = "serialize_opt_duration"
    )]
    pub timelimit_hard: Option<Duration>,
    #[serde(default = "default_min_cores")]
    pub min_cores: u32,
    pub max_cores: u32,
    /// Ceiling passed to the autoparal probe, defaults to `max_cores`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint_cores: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_memory")]
    pub min_mem_per_proc: f64,
    #[serde(default, deserialize_with = "deserialize_opt_memory")]
    pub max_mem_per_proc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_launches: Option<u32>,
    /// Condition that configurations must satisfy to run on this adapter
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub allocation: Allocation,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareConfig {
    pub num_nodes: u32,
    pub sockets_per_node: u32,
    pub cores_per_socket: u32,
    /// Megabytes
    #[serde(deserialize_with = "deserialize_memory")]
    pub mem_per_node: f64,
}

impl HardwareConfig {
    pub fn cores_per_node(&self) -> u32 {
        self.sockets_per_node * self.cores_per_socket
    }

    pub fn num_cores(&self) -> u32 {
        self.num_nodes * self.cores_per_node()
    }
}

/// Limits overridden for a single task family (e.g. `scf`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cores: Option<u32>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_duration",
        serialize_with = "serialize_opt_duration"
    )]
    pub timelimit: Option<Duration>,
}

/// One entry of the `qadapters` list of `manager.yml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub queue: QueueConfig,
    #[serde(default)]
    pub job: JobConfig,
    pub limits: LimitsConfig,
    pub hardware: HardwareConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits_for_task_class: BTreeMap<String, LimitsOverride>,
}

/// Maps a resource request onto a concrete backend and keeps the state of the current
/// request (processes, threads, memory, walltime, excluded nodes, number of launches).
#[derive(Clone, Debug)]
pub struct QueueAdapter {
    priority: u32,
    queue: QueueConfig,
    job: JobConfig,
    limits: LimitsConfig,
    hardware: HardwareConfig,
    limits_for_task_class: BTreeMap<String, LimitsOverride>,

    mpi_procs: u32,
    omp_threads: u32,
    mem_per_proc: f64,
    excluded_nodes: Vec<String>,
    num_launches: u32,
}

impl QueueAdapter {
    /// Validates the configuration. The priority must be positive.
    pub fn new(config: AdapterConfig) -> crate::Result<Self> {
        let AdapterConfig {
            priority,
            enabled: _,
            queue,
            job,
            limits,
            hardware,
            limits_for_task_class,
        } = config;
        let priority = u32::try_from(priority)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| {
                crate::Error::ConfigError(format!(
                    "qadapter priority must be positive, got {priority}"
                ))
            })?;
        let adapter = QueueAdapter {
            priority,
            mpi_procs: limits.min_cores.max(1),
            omp_threads: 1,
            mem_per_proc: limits.min_mem_per_proc,
            queue,
            job,
            limits,
            hardware,
            limits_for_task_class,
            excluded_nodes: Vec::new(),
            num_launches: 0,
        };
        adapter.validate()?;
        Ok(adapter)
    }

    fn validate(&self) -> crate::Result<()> {
        let error = |msg: String| Err(crate::Error::ConfigError(msg));
        let limits = &self.limits;
        if self.hardware.cores_per_node() == 0 || self.hardware.num_nodes == 0 {
            return error("hardware must have at least one node and one core".to_string());
        }
        if limits.min_cores == 0 || limits.min_cores > limits.max_cores {
            return error(format!(
                "invalid core limits: min_cores={}, max_cores={}",
                limits.min_cores, limits.max_cores
            ));
        }
        if limits.max_cores > self.hardware.num_cores() {
            return error(format!(
                "max_cores={} exceeds the number of cores of the hardware ({})",
                limits.max_cores,
                self.hardware.num_cores()
            ));
        }
        if self.hint_cores() > limits.max_cores {
            return error(format!(
                "hint_cores={} exceeds max_cores={}",
                self.hint_cores(),
                limits.max_cores
            ));
        }
        if let Some(max_mem) = limits.max_mem_per_proc {
            if max_mem < limits.min_mem_per_proc {
                return error(format!(
                    "max_mem_per_proc={max_mem} is smaller than min_mem_per_proc={}",
                    limits.min_mem_per_proc
                ));
            }
        }
        if let Some(hard) = limits.timelimit_hard {
            if hard < limits.timelimit {
                return error("timelimit_hard must not be smaller than timelimit".to_string());
            }
        }
        Ok(())
    }

    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.queue.qtype
    }

    pub fn handler(&self) -> &'static dyn QueueHandler {
        self.queue.qtype.handler()
    }

    pub fn qname(&self) -> &str {
        &self.queue.qname
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn hardware(&self) -> &HardwareConfig {
        &self.hardware
    }

    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    pub fn allocation(&self) -> Allocation {
        self.limits.allocation
    }

    pub fn has_omp(&self) -> bool {
        self.job.omp
    }

    pub fn mpi_procs(&self) -> u32 {
        self.mpi_procs
    }

    pub fn omp_threads(&self) -> u32 {
        self.omp_threads
    }

    /// Megabytes
    pub fn mem_per_proc(&self) -> f64 {
        self.mem_per_proc
    }

    pub fn num_cores(&self) -> u32 {
        self.mpi_procs * self.omp_threads
    }

    pub fn timelimit(&self) -> Duration {
        self.limits.timelimit
    }

    pub fn hint_cores(&self) -> u32 {
        self.limits.hint_cores.unwrap_or(self.limits.max_cores)
    }

    pub fn excluded_nodes(&self) -> &[String] {
        &self.excluded_nodes
    }

    pub fn num_launches(&self) -> u32 {
        self.num_launches
    }

    /// Highest memory per process this adapter can grant.
    pub fn max_mem_per_proc(&self) -> f64 {
        match self.limits.max_mem_per_proc {
            Some(max_mem) => max_mem.min(self.hardware.mem_per_node),
            None => self.hardware.mem_per_node,
        }
    }

    pub fn set_mpi_procs(&mut self, mpi_procs: u32) {
        self.mpi_procs = mpi_procs.max(1);
    }

    pub fn set_omp_threads(&mut self, omp_threads: u32) {
        self.omp_threads = omp_threads.max(1);
    }

    pub fn set_mem_per_proc(&mut self, mem_mb: f64) {
        self.mem_per_proc = mem_mb.max(0.0);
    }

    pub(crate) fn set_kind(&mut self, kind: QueueKind) {
        self.queue.qtype = kind;
    }

    pub(crate) fn set_core_limits(&mut self, min_cores: u32, max_cores: u32) {
        self.limits.min_cores = min_cores;
        self.limits.max_cores = max_cores;
        self.limits.hint_cores = Some(max_cores);
        self.hardware.num_nodes = self
            .hardware
            .num_nodes
            .max(max_cores.div_ceil(self.hardware.cores_per_node()));
    }

    pub(crate) fn use_shell_runner(&mut self) {
        self.job.mpi_runner = self.job.shell_runner.clone();
        self.job.mpi_runner_options = self.job.shell_runner_options.clone();
    }

    /// Applies the limits configured for the given task family, if any.
    pub fn apply_limits_for_task_class(&mut self, class_name: &str) {
        if let Some(limits) = self.limits_for_task_class.get(class_name) {
            log::debug!(
                "Applying limits of task class {class_name} to qadapter {}",
                self.priority
            );
            if let Some(min_cores) = limits.min_cores {
                self.limits.min_cores = min_cores;
            }
            if let Some(max_cores) = limits.max_cores {
                self.limits.max_cores = max_cores;
                if self.limits.hint_cores.is_some_and(|hint| hint > max_cores) {
                    self.limits.hint_cores = Some(max_cores);
                }
            }
            if let Some(timelimit) = limits.timelimit {
                self.limits.timelimit = timelimit;
            }
        }
    }

    /// Checks whether the configuration can be executed by this adapter.
    pub fn can_run_conf(&self, conf: &ResourceConfiguration) -> bool {
        let num_cores = conf.num_cores();
        if num_cores < self.limits.min_cores || num_cores > self.hint_cores() {
            return false;
        }
        if conf.omp_threads() > 1
            && (!self.has_omp() || conf.omp_threads() > self.hardware.cores_per_node())
        {
            return false;
        }
        if conf.mem_per_proc() > self.max_mem_per_proc() {
            return false;
        }
        self.limits.condition.evaluate(&conf.fields())
    }

    /// Adds memory to each process, failing once the per-process ceiling is reached.
    pub fn more_mem_per_proc(&mut self, factor: u32) -> Result<f64, ManagerIncreaseError> {
        let new_mem = self.mem_per_proc + factor as f64 * MEM_INCREASE_STEP;
        if new_mem > self.max_mem_per_proc() {
            return Err(ManagerIncreaseError::new(
                "mem_per_proc",
                format!(
                    "{new_mem} MB exceeds the limit of {} MB",
                    self.max_mem_per_proc()
                ),
            ));
        }
        self.set_mem_per_proc(new_mem);
        Ok(new_mem)
    }

    /// Adds one core (or one node when allocating whole nodes).
    pub fn more_cores(&mut self, factor: u32) -> Result<u32, ManagerIncreaseError> {
        let base_increase = match self.limits.allocation {
            Allocation::Nodes => self.hardware.cores_per_node(),
            Allocation::Cores => 1,
        };
        let new_cores = self.limits.min_cores.max(self.num_cores()) + factor * base_increase;
        if new_cores > self.limits.max_cores {
            return Err(ManagerIncreaseError::new(
                "cores",
                format!(
                    "{new_cores} cores exceed max_cores={}",
                    self.limits.max_cores
                ),
            ));
        }
        self.limits.min_cores = new_cores;
        self.set_mpi_procs(new_cores / self.omp_threads);
        Ok(new_cores)
    }

    /// Extends the walltime by a tenth of the hard limit.
    pub fn more_time(&mut self, factor: u32) -> Result<Duration, ManagerIncreaseError> {
        let hard = self.limits.timelimit_hard.ok_or_else(|| {
            ManagerIncreaseError::new("timelimit", "no timelimit_hard is configured")
        })?;
        let new_time = self.limits.timelimit + (hard / 10) * factor;
        if new_time >= hard {
            return Err(ManagerIncreaseError::new(
                "timelimit",
                format!(
                    "{} reaches timelimit_hard={}",
                    format_slurm_time(&new_time),
                    format_slurm_time(&hard)
                ),
            ));
        }
        self.limits.timelimit = new_time;
        Ok(new_time)
    }

    pub fn exclude_nodes(&mut self, nodes: &[String]) -> Result<(), ManagerIncreaseError> {
        if !self.handler().supports_exclude_nodes() {
            return Err(ManagerIncreaseError::new(
                "excluded nodes",
                format!("{} backend cannot exclude nodes", self.kind()),
            ));
        }
        for node in nodes {
            if !self.excluded_nodes.contains(node) {
                self.excluded_nodes.push(node.clone());
            }
        }
        Ok(())
    }

    fn num_nodes(&self) -> Option<u32> {
        match self.limits.allocation {
            Allocation::Nodes => Some(self.num_cores().div_ceil(self.hardware.cores_per_node())),
            Allocation::Cores => None,
        }
    }

    /// Renders the complete job script.
    pub fn get_script_str(&self, params: &ScriptParams) -> String {
        let mut lines = vec!["#!/bin/bash".to_string()];
        let header = self.handler().header(&HeaderParams {
            job_name: params.job_name,
            qname: &self.queue.qname,
            qparams: &self.queue.qparams,
            qout_path: params.qout_path,
            qerr_path: params.qerr_path,
            mpi_procs: self.mpi_procs,
            omp_threads: self.omp_threads,
            mem_per_proc: self.mem_per_proc,
            num_nodes: self.num_nodes(),
            timelimit: self.limits.timelimit,
            exclude_nodes: &self.excluded_nodes,
        });
        if !header.is_empty() {
            lines.push(header);
        }
        if let Some(verbatim) = &self.queue.qverbatim {
            lines.push(verbatim.trim_end().to_string());
        }
        lines.push(String::new());
        lines.push(format!("cd {}", params.launch_dir.display()));
        lines.push(format!("export OMP_NUM_THREADS={}", self.omp_threads));
        for module in &self.job.modules {
            lines.push(format!("module load {module}"));
        }
        lines.extend(self.job.pre_run.iter().cloned());
        lines.push(String::new());
        lines.push(self.run_line(params));
        if !self.job.post_run.is_empty() {
            lines.push(String::new());
            lines.extend(self.job.post_run.iter().cloned());
        }
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }

    fn run_line(&self, params: &ScriptParams) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !self.job.mpi_runner.is_empty() {
            parts.push(self.job.mpi_runner.clone());
            if !self.job.mpi_runner_options.is_empty() {
                parts.push(self.job.mpi_runner_options.clone());
            }
            parts.push(format!("-n {}", self.mpi_procs));
        }
        parts.push(params.executable.to_string());
        parts.push(params.in_file.display().to_string());
        parts.extend(params.exec_args.iter().cloned());
        parts.push(format!("> {}", params.stdout.display()));
        parts.push(format!("2> {}", params.stderr.display()));
        parts.join(" ")
    }

    /// Submits the job script. Fails once `max_num_launches` submissions have been made.
    pub fn submit_to_queue(
        &mut self,
        script: &Path,
        qout: &Path,
        qerr: &Path,
    ) -> crate::Result<SubmitResult> {
        if let Some(max_launches) = self.limits.max_num_launches {
            if self.num_launches >= max_launches {
                return Err(crate::Error::MaxNumLaunches(max_launches));
            }
        }
        let result = self.handler().submit(&JobFiles {
            script,
            qout,
            qerr,
        })?;
        self.num_launches += 1;
        Ok(result)
    }

    pub fn cancel(&self, qid: &str) -> crate::Result<i32> {
        self.handler().cancel(qid)
    }

    pub fn get_njobs_in_queue(&self, username: Option<&str>) -> Option<usize> {
        let username = username
            .map(|u| u.to_string())
            .unwrap_or_else(crate::queue::default_username);
        self.handler().njobs_in_queue(&username)
    }
}

impl Display for QueueAdapter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} adapter (priority {}{}): cores {}..{} (hint {}), mpi={}, omp={}, mem_per_proc={} MB, timelimit={}",
            self.kind(),
            self.priority,
            if self.queue.qname.is_empty() {
                String::new()
            } else {
                format!(", queue {}", self.queue.qname)
            },
            self.limits.min_cores,
            self.limits.max_cores,
            self.hint_cores(),
            self.mpi_procs,
            self.omp_threads,
            self.mem_per_proc,
            format_slurm_time(&self.limits.timelimit)
        )
    }
}
