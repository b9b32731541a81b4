use colored::Colorize;
use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::path::Path;

use crate::common::error::{ManagerIncreaseError, NoQueueAdapterError};
use crate::manager::config::{MANAGER_FILE, ManagerConfig, SIMPLE_MANAGER, config_search_paths};
use crate::queue::adapter::{Allocation, QueueAdapter};
use crate::queue::{QueueKind, ScriptParams, SubmitResult};
use simcore::resources::{HintSet, Precedence, ResourceConfiguration, SelectionPolicy};

pub mod config;

thread_local! {
    static USER_CONFIG_OVERRIDE: RefCell<Option<TaskManager>> = const { RefCell::new(None) };
}

/// Set of queue adapters ordered by priority plus the policy used to pick one of them.
///
/// Every task owns its own copy, escalation primitives only change the state of that copy.
#[derive(Clone, Debug)]
pub struct TaskManager {
    policy: SelectionPolicy,
    qads: Vec<QueueAdapter>,
    qadpos: usize,
}

impl TaskManager {
    pub fn new(policy: SelectionPolicy, mut qads: Vec<QueueAdapter>) -> crate::Result<Self> {
        policy.validate()?;
        if qads.is_empty() {
            return Err(crate::Error::ConfigError(
                "at least one enabled qadapter is required".to_string(),
            ));
        }
        qads.sort_by_key(|q| q.priority());
        if let Some(pair) = qads.windows(2).find(|w| w[0].priority() == w[1].priority()) {
            return Err(crate::Error::ConfigError(format!(
                "two qadapters have the same priority {}",
                pair[0].priority()
            )));
        }
        Ok(TaskManager {
            policy,
            qads,
            qadpos: 0,
        })
    }

    /// Builds the manager from a parsed `manager.yml`.
    /// Disabled adapters and adapters with priority 0 are skipped.
    pub fn from_config(config: ManagerConfig) -> crate::Result<Self> {
        let mut qads = Vec::with_capacity(config.qadapters.len());
        for qad in config.qadapters {
            if qad.priority < 0 {
                return Err(crate::Error::ConfigError(format!(
                    "qadapter priority must not be negative, got {}",
                    qad.priority
                )));
            }
            if !qad.enabled || qad.priority == 0 {
                log::debug!("Skipping disabled qadapter {:?}", qad.queue.qtype);
                continue;
            }
            qads.push(QueueAdapter::new(qad)?);
        }
        Self::new(config.policy.into(), qads)
    }

    pub fn from_yaml(text: &str) -> crate::Result<Self> {
        Self::from_config(ManagerConfig::from_yaml(text)?)
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        log::debug!("Reading manager from {}", path.display());
        Self::from_config(ManagerConfig::from_file(path)?)
    }

    /// Returns the explicitly installed override, else reads `manager.yml` from the
    /// current directory or from `~/.simflow`.
    pub fn from_user_config() -> crate::Result<Self> {
        if let Some(manager) = USER_CONFIG_OVERRIDE.with(|m| m.borrow().clone()) {
            return Ok(manager);
        }
        let paths = config_search_paths();
        match paths.iter().find(|p| p.exists()) {
            Some(path) => Self::from_file(path),
            None => Err(crate::Error::ConfigError(missing_config_message(&paths))),
        }
    }

    pub fn set_user_config_override(manager: TaskManager) {
        USER_CONFIG_OVERRIDE.with(|m| *m.borrow_mut() = Some(manager));
    }

    pub fn clear_user_config_override() {
        USER_CONFIG_OVERRIDE.with(|m| *m.borrow_mut() = None);
    }

    #[inline]
    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    #[inline]
    pub fn policy_mut(&mut self) -> &mut SelectionPolicy {
        &mut self.policy
    }

    #[inline]
    pub fn qads(&self) -> &[QueueAdapter] {
        &self.qads
    }

    /// The active adapter.
    #[inline]
    pub fn qadapter(&self) -> &QueueAdapter {
        &self.qads[self.qadpos]
    }

    #[inline]
    pub fn qadapter_mut(&mut self) -> &mut QueueAdapter {
        &mut self.qads[self.qadpos]
    }

    #[inline]
    pub fn qadpos(&self) -> usize {
        self.qadpos
    }

    pub fn has_queue(&self) -> bool {
        self.qadapter().kind() != QueueKind::Shell
    }

    pub fn has_omp(&self) -> bool {
        self.qadapter().has_omp()
    }

    /// Largest number of cores the autoparal probe may consider.
    pub fn max_cores(&self) -> u32 {
        self.qads.iter().map(|q| q.hint_cores()).max().unwrap_or(1)
    }

    pub fn num_cores(&self) -> u32 {
        self.qadapter().num_cores()
    }

    pub fn mpi_procs(&self) -> u32 {
        self.qadapter().mpi_procs()
    }

    pub fn omp_threads(&self) -> u32 {
        self.qadapter().omp_threads()
    }

    pub fn mem_per_proc(&self) -> f64 {
        self.qadapter().mem_per_proc()
    }

    pub fn set_mpi_procs(&mut self, mpi_procs: u32) {
        self.qadapter_mut().set_mpi_procs(mpi_procs);
    }

    pub fn set_omp_threads(&mut self, omp_threads: u32) {
        self.qadapter_mut().set_omp_threads(omp_threads);
    }

    pub fn set_mem_per_proc(&mut self, mem_mb: f64) {
        self.qadapter_mut().set_mem_per_proc(mem_mb);
    }

    /// Launches recorded by all adapters.
    pub fn num_launches(&self) -> u32 {
        self.qads.iter().map(|q| q.num_launches()).sum()
    }

    pub fn apply_limits_for_task_class(&mut self, class_name: &str) {
        for qad in self.qads.iter_mut() {
            qad.apply_limits_for_task_class(class_name);
        }
    }

    /// Copy that runs `mpi_procs` processes through the shell without autoparal.
    /// Used for the autoparal probe and for small jobs executed on the frontend.
    pub fn to_shell_manager(&self, mpi_procs: u32) -> TaskManager {
        let mut qads: Vec<QueueAdapter> = if self.qads.iter().any(|q| q.kind() == QueueKind::Shell)
        {
            self.qads
                .iter()
                .filter(|q| q.kind() == QueueKind::Shell)
                .cloned()
                .collect()
        } else {
            self.qads.clone()
        };
        for qad in qads.iter_mut() {
            qad.set_kind(QueueKind::Shell);
            qad.set_core_limits(mpi_procs, mpi_procs);
            qad.use_shell_runner();
        }
        let mut manager = TaskManager {
            policy: SelectionPolicy {
                autoparal: 0,
                ..self.policy.clone()
            },
            qads,
            qadpos: 0,
        };
        manager.set_mpi_procs(mpi_procs);
        manager
    }

    /// Copy with autoparal disabled and fixed process and thread counts on every adapter.
    pub fn new_with_fixed_mpi_omp(&self, mpi_procs: u32, omp_threads: u32) -> TaskManager {
        let mut manager = self.clone();
        manager.policy.autoparal = 0;
        for qad in manager.qads.iter_mut() {
            qad.set_mpi_procs(mpi_procs);
            qad.set_omp_threads(omp_threads);
        }
        manager
    }

    /// Ranks the configurations with the policy and activates the first adapter able to
    /// host one of them. The process and thread counts of that adapter are updated.
    pub fn select_qadapter(&mut self, hints: &HintSet) -> crate::Result<ResourceConfiguration> {
        let confs = hints.get_ordered_with_policy(&self.policy, self.max_cores())?;
        let selected = match self.policy.precedence {
            Precedence::QAdapter => self.qads.iter().enumerate().find_map(|(qadpos, qad)| {
                let possible: Vec<&ResourceConfiguration> =
                    confs.iter().filter(|c| qad.can_run_conf(c)).collect();
                let fits_nodes = |c: &&&ResourceConfiguration| {
                    c.num_cores() % qad.hardware().cores_per_node() == 0
                };
                let conf = if qad.allocation() == Allocation::Nodes {
                    possible
                        .iter()
                        .find(fits_nodes)
                        .or_else(|| possible.first())
                } else {
                    possible.first()
                };
                conf.map(|c| (qadpos, (*c).clone()))
            }),
            Precedence::AutoparalConf => confs.iter().find_map(|conf| {
                self.qads
                    .iter()
                    .position(|qad| {
                        if qad.allocation() == Allocation::Nodes
                            && conf.num_cores() % qad.hardware().cores_per_node() != 0
                        {
                            return false;
                        }
                        qad.can_run_conf(conf)
                    })
                    .map(|qadpos| (qadpos, conf.clone()))
            }),
        };
        match selected {
            Some((qadpos, conf)) => {
                self.use_qadpos_conf(qadpos, &conf);
                Ok(conf)
            }
            None => Err(NoQueueAdapterError(format!(
                "{} configurations, {} qadapters",
                confs.len(),
                self.qads.len()
            ))
            .into()),
        }
    }

    fn use_qadpos_conf(&mut self, qadpos: usize, conf: &ResourceConfiguration) {
        log::debug!(
            "Selected qadapter {} for mpi_procs={}, omp_threads={}",
            self.qads[qadpos].priority(),
            conf.mpi_procs(),
            conf.omp_threads()
        );
        self.qadpos = qadpos;
        self.set_mpi_procs(conf.mpi_procs());
        if self.has_omp() {
            self.set_omp_threads(conf.omp_threads());
        }
    }

    pub fn get_script_str(&self, params: &ScriptParams) -> String {
        self.qadapter().get_script_str(params)
    }

    /// Writes the job script of the active adapter to `path`.
    pub fn write_jobfile(&self, params: &ScriptParams, path: &Path) -> crate::Result<()> {
        let script = self.get_script_str(params);
        std::fs::write(path, script)?;
        crate::common::fsutils::make_executable(path)?;
        Ok(())
    }

    pub fn submit(
        &mut self,
        script: &Path,
        qout: &Path,
        qerr: &Path,
    ) -> crate::Result<SubmitResult> {
        self.qadapter_mut().submit_to_queue(script, qout, qerr)
    }

    pub fn cancel(&self, qid: &str) -> crate::Result<i32> {
        self.qadapter().cancel(qid)
    }

    pub fn get_njobs_in_queue(&self, username: Option<&str>) -> Option<usize> {
        self.qadapter().get_njobs_in_queue(username)
    }

    pub fn increase_mem(&mut self) -> Result<(), ManagerIncreaseError> {
        let mem = self.qadapter_mut().more_mem_per_proc(1)?;
        log::info!("Memory per process increased to {mem} MB");
        Ok(())
    }

    pub fn increase_ncpus(&mut self) -> Result<(), ManagerIncreaseError> {
        let cores = self.qadapter_mut().more_cores(1)?;
        log::info!("Number of cores increased to {cores}");
        Ok(())
    }

    /// Increases the number of cores, falling back to memory.
    pub fn increase_resources(&mut self) -> Result<(), ManagerIncreaseError> {
        match self.increase_ncpus() {
            Ok(()) => Ok(()),
            Err(e) => {
                log::debug!("{e}");
                self.increase_mem()
            }
        }
    }

    pub fn increase_time(&mut self) -> Result<(), ManagerIncreaseError> {
        self.qadapter_mut().more_time(1)?;
        Ok(())
    }

    pub fn exclude_nodes(&mut self, nodes: &[String]) -> Result<(), ManagerIncreaseError> {
        self.qadapter_mut().exclude_nodes(nodes)
    }
}

impl Display for TaskManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Policy: autoparal={}, precedence={:?}, priorities={:?}",
            self.policy.autoparal, self.policy.precedence, self.policy.autoparal_priorities
        )?;
        for (pos, qad) in self.qads.iter().enumerate() {
            let marker = if pos == self.qadpos { "*" } else { " " };
            writeln!(f, "{marker} {qad}")?;
        }
        Ok(())
    }
}

fn missing_config_message(paths: &[std::path::PathBuf]) -> String {
    let searched = paths
        .iter()
        .map(|p| format!("    {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{}\nSearched in:\n{searched}\n\n{}\n{}\nRun `simflow manager doc` for the description of all options.",
        format!("Cannot find {MANAGER_FILE}.").red().bold(),
        format!("Create {MANAGER_FILE} in the working directory or in ~/.simflow, for example:")
            .yellow(),
        SIMPLE_MANAGER
    )
}

#[cfg(test)]
mod tests {
    use super::TaskManager;
    use crate::tests::utils::{manager_yaml, shell_adapter_yaml, slurm_adapter_yaml};
    use crate::queue::QueueKind;
    use simcore::resources::{HintInfo, HintSet, ResourceConfiguration};

    fn hints(confs: &[(u32, u32, f64)]) -> HintSet {
        HintSet::new(
            HintInfo::default(),
            confs
                .iter()
                .map(|(mpi, omp, eff)| ResourceConfiguration::new(*mpi, *omp, 100.0, *eff).unwrap())
                .collect(),
        )
    }

    #[test]
    fn test_duplicate_priorities() {
        let yaml = manager_yaml(
            "",
            &[shell_adapter_yaml(1, 2), slurm_adapter_yaml(1, 16, false)],
        );
        assert!(TaskManager::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_adapters_sorted_and_skipped() {
        let disabled =
            slurm_adapter_yaml(2, 16, false).replace("priority: 2", "priority: 2\nenabled: false");
        let yaml = manager_yaml(
            "",
            &[
                slurm_adapter_yaml(3, 16, false),
                shell_adapter_yaml(1, 2),
                disabled,
                slurm_adapter_yaml(0, 8, false),
            ],
        );
        let manager = TaskManager::from_yaml(&yaml).unwrap();
        let priorities: Vec<u32> = manager.qads().iter().map(|q| q.priority()).collect();
        assert_eq!(priorities, vec![1, 3]);
        assert_eq!(manager.max_cores(), 16);
        assert!(!manager.has_queue());
    }

    #[test]
    fn test_invalid_managers() {
        assert!(TaskManager::from_yaml("qadapters: []\n").is_err());
        let yaml = manager_yaml("", &[slurm_adapter_yaml(-1, 16, false)]);
        assert!(TaskManager::from_yaml(&yaml).is_err());
        let yaml = manager_yaml("", &[slurm_adapter_yaml(0, 16, false)]);
        assert!(TaskManager::from_yaml(&yaml).is_err());
        let yaml = manager_yaml("autoparal_priorities: []", &[shell_adapter_yaml(1, 2)]);
        assert!(TaskManager::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_select_best_configuration() {
        let yaml = manager_yaml(
            "",
            &[shell_adapter_yaml(1, 2), slurm_adapter_yaml(2, 16, false)],
        );
        let mut manager = TaskManager::from_yaml(&yaml).unwrap();
        let conf = manager
            .select_qadapter(&hints(&[(2, 1, 1.0), (8, 1, 0.9), (4, 1, 0.9)]))
            .unwrap();
        assert_eq!(conf.mpi_procs(), 8);
        assert_eq!(manager.qadpos(), 1);
        assert_eq!(manager.mpi_procs(), 8);
        assert!(manager.has_queue());
    }

    #[test]
    fn test_select_by_adapter_priority() {
        let yaml = manager_yaml(
            "precedence: qadapter",
            &[shell_adapter_yaml(1, 2), slurm_adapter_yaml(2, 16, false)],
        );
        let mut manager = TaskManager::from_yaml(&yaml).unwrap();
        let conf = manager
            .select_qadapter(&hints(&[(2, 1, 1.0), (8, 1, 0.9), (4, 1, 0.9)]))
            .unwrap();
        assert_eq!(conf.mpi_procs(), 2);
        assert_eq!(manager.qadpos(), 0);
        assert!(!manager.has_queue());
    }

    #[test]
    fn test_select_node_allocation() {
        let yaml = manager_yaml("precedence: qadapter", &[slurm_adapter_yaml(1, 16, true)]);
        let mut manager = TaskManager::from_yaml(&yaml).unwrap();
        // 8 cores per node
        let conf = manager
            .select_qadapter(&hints(&[(12, 1, 1.0), (8, 1, 0.5), (4, 1, 1.0)]))
            .unwrap();
        assert_eq!(conf.num_cores(), 8);

        let yaml = manager_yaml("", &[slurm_adapter_yaml(1, 16, true)]);
        let mut manager = TaskManager::from_yaml(&yaml).unwrap();
        assert!(manager.select_qadapter(&hints(&[(12, 1, 1.0), (4, 1, 1.0)])).is_err());
    }

    #[test]
    fn test_select_omp() {
        let yaml = manager_yaml("", &[slurm_adapter_yaml(1, 16, false)]);
        let mut manager = TaskManager::from_yaml(&yaml).unwrap();
        manager.select_qadapter(&hints(&[(4, 2, 1.0)])).unwrap();
        assert_eq!(manager.mpi_procs(), 4);
        assert_eq!(manager.omp_threads(), 2);
        assert_eq!(manager.num_cores(), 8);
    }

    #[test]
    fn test_no_adapter() {
        let yaml = manager_yaml("", &[shell_adapter_yaml(1, 2)]);
        let mut manager = TaskManager::from_yaml(&yaml).unwrap();
        let err = manager.select_qadapter(&hints(&[(4, 1, 1.0)])).unwrap_err();
        assert!(matches!(err, crate::Error::NoQueueAdapter(_)));
    }

    #[test]
    fn test_to_shell_manager() {
        let yaml = manager_yaml("", &[slurm_adapter_yaml(1, 16, false)]);
        let manager = TaskManager::from_yaml(&yaml).unwrap();
        let shell = manager.to_shell_manager(1);
        assert_eq!(shell.policy().autoparal, 0);
        assert_eq!(shell.qadapter().kind(), QueueKind::Shell);
        assert_eq!(shell.max_cores(), 1);
        assert_eq!(shell.mpi_procs(), 1);
        assert_eq!(shell.qadapter().job().mpi_runner, "");
        // the original manager is untouched
        assert_eq!(manager.qadapter().kind(), QueueKind::Slurm);
        assert_eq!(manager.policy().autoparal, 1);

        let yaml = manager_yaml(
            "",
            &[slurm_adapter_yaml(1, 16, false), shell_adapter_yaml(2, 2)],
        );
        let shell = TaskManager::from_yaml(&yaml).unwrap().to_shell_manager(2);
        assert_eq!(shell.qads().len(), 1);
        assert_eq!(shell.qadapter().priority(), 2);
        assert_eq!(shell.mpi_procs(), 2);
    }

    #[test]
    fn test_fixed_mpi_omp() {
        let yaml = manager_yaml("", &[slurm_adapter_yaml(1, 16, false)]);
        let manager = TaskManager::from_yaml(&yaml).unwrap().new_with_fixed_mpi_omp(4, 2);
        assert_eq!(manager.policy().autoparal, 0);
        assert_eq!(manager.num_cores(), 8);
    }

    #[test]
    fn test_increase_resources() {
        let yaml = manager_yaml("", &[shell_adapter_yaml(1, 2)]);
        let mut manager = TaskManager::from_yaml(&yaml).unwrap();
        manager.increase_ncpus().unwrap();
        assert_eq!(manager.mpi_procs(), 2);
        assert!(manager.increase_ncpus().is_err());
        // cores exhausted, memory grows instead
        manager.increase_resources().unwrap();
        assert_eq!(manager.mem_per_proc(), 2000.0);
        assert!(manager.increase_time().is_err());
        assert!(manager.exclude_nodes(&["n1".to_string()]).is_err());
    }

    #[test]
    fn test_user_config_override() {
        let yaml = manager_yaml("autoparal: 0", &[shell_adapter_yaml(7, 2)]);
        TaskManager::set_user_config_override(TaskManager::from_yaml(&yaml).unwrap());
        let manager = TaskManager::from_user_config().unwrap();
        assert_eq!(manager.qadapter().priority(), 7);
        TaskManager::clear_user_config_override();
    }
}
