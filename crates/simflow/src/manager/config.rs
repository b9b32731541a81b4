use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::timeutils::{deserialize_duration, serialize_duration};
use crate::queue::adapter::AdapterConfig;
use simcore::resources::{Condition, Precedence, RankingPriority, SelectionPolicy};

/// Name of the configuration file looked up by `TaskManager::from_user_config`.
pub const MANAGER_FILE: &str = "manager.yml";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default = "default_autoparal")]
    pub autoparal: u32,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub vars_condition: Condition,
    #[serde(default = "default_precedence")]
    pub precedence: Precedence,
    #[serde(default = "default_priorities")]
    pub autoparal_priorities: Vec<RankingPriority>,
    #[serde(
        default = "default_frozen_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub frozen_timeout: Duration,
}

fn default_autoparal() -> u32 {
    SelectionPolicy::default().autoparal
}

fn default_precedence() -> Precedence {
    SelectionPolicy::default().precedence
}

fn default_priorities() -> Vec<RankingPriority> {
    SelectionPolicy::default().autoparal_priorities
}

fn default_frozen_timeout() -> Duration {
    SelectionPolicy::default().frozen_timeout
}

impl Default for PolicyConfig {
    fn default() -> Self {
        SelectionPolicy::default().into()
    }
}

impl From<PolicyConfig> for SelectionPolicy {
    fn from(config: PolicyConfig) -> Self {
        SelectionPolicy {
            autoparal: config.autoparal,
            condition: config.condition,
            vars_condition: config.vars_condition,
            precedence: config.precedence,
            autoparal_priorities: config.autoparal_priorities,
            frozen_timeout: config.frozen_timeout,
        }
    }
}

impl From<SelectionPolicy> for PolicyConfig {
    fn from(policy: SelectionPolicy) -> Self {
        PolicyConfig {
            autoparal: policy.autoparal,
            condition: policy.condition,
            vars_condition: policy.vars_condition,
            precedence: policy.precedence,
            autoparal_priorities: policy.autoparal_priorities,
            frozen_timeout: policy.frozen_timeout,
        }
    }
}

/// Content of `manager.yml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
    pub qadapters: Vec<AdapterConfig>,
}

impl ManagerConfig {
    pub fn from_yaml(text: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text).map_err(|e| {
            crate::Error::ConfigError(format!(
                "error while reading manager parameters from {}: {e}",
                path.display()
            ))
        })
    }
}

/// Directory with the user configuration (`~/.simflow`).
pub fn user_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".simflow"))
}

/// Paths probed for the configuration file, in order.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(MANAGER_FILE));
    }
    if let Some(dir) = user_config_dir() {
        paths.push(dir.join(MANAGER_FILE));
    }
    paths
}

/// Minimal configuration for a laptop running jobs through the shell.
pub const SIMPLE_MANAGER: &str = r#"qadapters:
    - priority: 1
      queue:
          qtype: shell
      job:
          mpi_runner: mpirun
          pre_run:
              - export OMP_NUM_THREADS=1
      limits:
          timelimit: "1:00:00"
          max_cores: 2
      hardware:
          num_nodes: 1
          sockets_per_node: 1
          cores_per_socket: 2
          mem_per_node: 4 Gb
"#;

pub const MANAGER_DOC: &str = r#"# manager.yml

The file describes the machine and the job backends used to execute tasks.
It is looked up in the current directory and then in `~/.simflow/`.

policy:                          # optional
    autoparal: 1                 # 0 disables the autoparal probe run
    condition: {}                # filter over configurations, e.g. {efficiency: {$gte: 0.8}}
    vars_condition: {}           # filter over the variables of configurations
    precedence: autoparal_conf   # `autoparal_conf` (best configuration first) or `qadapter` (adapter priority first)
    autoparal_priorities:        # speedup, efficiency, mem_per_proc or one meta priority:
        - speedup                #   {meta_priority: highest_speedup_minimum_efficiency_cutoff, minimum_efficiency: 0.8}
    frozen_timeout: "0-1:00:00"  # a run whose log did not change for this long is considered frozen

qadapters:                       # list of backends, tried by ascending priority
    - priority: 1                # unique, positive. 0 disables the adapter
      enabled: true              # optional
      queue:
          qtype: slurm           # shell, slurm or pbs
          qname: debug           # partition/queue name (optional)
          qparams: {}            # extra backend options (optional)
          qverbatim: ""          # lines copied in the header of the script (optional)
      job:                       # optional
          mpi_runner: mpirun
          mpi_runner_options: ""
          shell_runner: ""       # replaces mpi_runner for jobs executed on the frontend
          shell_runner_options: ""
          modules: []
          pre_run: []            # commands executed before the program
          post_run: []           # commands executed after the program
          omp: true              # the program supports OpenMP threads
      limits:
          timelimit: "0:30:00"   # [D-]HH:MM:SS or humantime
          timelimit_hard: "2:00:00"  # ceiling for walltime increases (optional)
          min_cores: 1
          max_cores: 16
          hint_cores: 16         # ceiling given to the autoparal probe (defaults to max_cores)
          min_mem_per_proc: 0    # MB or a string with unit (Kb, Mb, Gb, Tb)
          max_mem_per_proc: 4 Gb # defaults to mem_per_node
          max_num_launches: 10   # optional
          condition: {}          # configurations must satisfy this condition
          allocation: cores      # cores or nodes
      hardware:
          num_nodes: 10
          sockets_per_node: 1
          cores_per_socket: 16
          mem_per_node: 64 Gb
      limits_for_task_class:     # optional overrides per task family
          sigma: {max_cores: 8, timelimit: "1:00:00"}
"#;
