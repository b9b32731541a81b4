//! Kinds of calculations and how each of them restarts from its own output.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use crate::common::error::{DecreaseDemandsError, RestartError};
use crate::task::files::{NumberedFile, irdvars_for_ext, rename_last_timden};
use crate::task::{RestartOutcome, Task};
use crate::Vars;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TaskFamily {
    /// Ground-state self-consistent run
    Scf,
    /// Non self-consistent band structure
    Nscf,
    /// Structural relaxation
    Relax,
    /// Density functional perturbation theory
    Dfpt,
    /// Screening
    Scr,
    /// Self-energy
    Sigma,
    /// Bethe-Salpeter equation
    Bse,
    Generic,
}

impl TaskFamily {
    /// Name used to look up family specific limits of the queue adapters.
    pub fn class_name(&self) -> &'static str {
        match self {
            TaskFamily::Scf => "ScfTask",
            TaskFamily::Nscf => "NscfTask",
            TaskFamily::Relax => "RelaxTask",
            TaskFamily::Dfpt => "DfptTask",
            TaskFamily::Scr => "ScrTask",
            TaskFamily::Sigma => "SigmaTask",
            TaskFamily::Bse => "BseTask",
            TaskFamily::Generic => "AbinitTask",
        }
    }

    /// Events that turn a completed run into an unconverged one.
    pub fn critical_events(&self) -> &'static [&'static str] {
        match self {
            TaskFamily::Scf | TaskFamily::Dfpt => &["ScfConvergenceWarning"],
            TaskFamily::Nscf => &["NscfConvergenceWarning"],
            TaskFamily::Relax => &["RelaxConvergenceWarning"],
            TaskFamily::Sigma => &["QPSConvergenceWarning"],
            TaskFamily::Bse => &["HaydockConvergenceWarning"],
            TaskFamily::Scr | TaskFamily::Generic => &[],
        }
    }

    pub fn can_reduce_memory_demand(&self) -> bool {
        matches!(self, TaskFamily::Scr | TaskFamily::Sigma | TaskFamily::Bse)
    }
}

impl Display for TaskFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.class_name())
    }
}

fn restart_error(message: &str) -> crate::Error {
    RestartError(message.to_string()).into()
}

/// Reading flag of `ext` merged into `vars`.
fn add_irdvars(vars: &mut Vars, ext: &str) {
    if let Some(irdvars) = irdvars_for_ext(ext) {
        vars.extend(irdvars);
    }
}

fn single(files: &[NumberedFile]) -> Option<PathBuf> {
    match files {
        [file] => Some(file.path.clone()),
        _ => None,
    }
}

/// Value of `gwmem` with the memory of the second digit released first.
fn reduced_gwmem(value: Option<&Value>) -> Result<String, DecreaseDemandsError> {
    let gwmem = match value {
        None => "11".to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(n) => format!("{n:02}"),
            None => return Err(DecreaseDemandsError(format!("invalid gwmem {n}"))),
        },
        Some(other) => {
            return Err(DecreaseDemandsError(format!("invalid gwmem {other}")));
        }
    };
    let digits: Vec<char> = gwmem.chars().collect();
    match digits.as_slice() {
        [first, '1'] => Ok(format!("{first}0")),
        ['1', second] => Ok(format!("0{second}")),
        _ => Err(DecreaseDemandsError(format!(
            "gwmem {gwmem} cannot be decreased any further"
        ))),
    }
}

impl Task {
    /// Restarts the task from the artifacts of its previous run.
    /// The input is updated to read them and the task is resubmitted if `submit` is set.
    pub fn restart_from_artifacts(&mut self, submit: bool) -> crate::Result<RestartOutcome> {
        let (vars, source) = self.restart_vars()?;
        if let Some(source) = source {
            self.input.set_vars(&vars);
            self.history
                .info(format!("Will restart from {}", source.display()));
        }
        Ok(self.restart_now(submit))
    }

    /// Prepares the files of the restart and returns the variables to read them.
    fn restart_vars(&mut self) -> crate::Result<(Vars, Option<PathBuf>)> {
        let dir = self.dir()?.clone();
        let outdir = dir.outdir();
        let mut vars = Vars::new();
        let source = match self.family {
            TaskFamily::Scf => {
                let (ext, file) = ["WFK", "DEN"]
                    .into_iter()
                    .find_map(|ext| outdir.has_abiext(ext).map(|f| (ext, f)))
                    .ok_or_else(|| restart_error("Cannot find WFK or DEN file to restart from."))?;
                let restart_file = dir.out_to_in(&file)?;
                add_irdvars(&mut vars, ext);
                Some(restart_file)
            }
            TaskFamily::Nscf => {
                let file = outdir
                    .has_abiext("WFK")
                    .ok_or_else(|| restart_error("Cannot find the WFK file to restart from."))?;
                let restart_file = dir.out_to_in(&file)?;
                add_irdvars(&mut vars, "WFK");
                Some(restart_file)
            }
            TaskFamily::Relax => {
                let mut file = outdir.has_abiext("DEN");
                if file.is_none() {
                    file = rename_last_timden(outdir)?;
                }
                match file {
                    Some(file) => {
                        let restart_file = dir.out_to_in(&file)?;
                        add_irdvars(&mut vars, "DEN");
                        Some(restart_file)
                    }
                    None => {
                        self.history
                            .warning("Cannot find the DEN file to restart from, restarting from scratch");
                        None
                    }
                }
            }
            TaskFamily::Dfpt => {
                let wf_files = outdir.find_1wf_files();
                let den_files = outdir.find_1den_files();
                let (file, ext) = if let Some(file) = single(&wf_files) {
                    (file, "1WF")
                } else if let Some(file) = single(&den_files) {
                    (file, "1DEN")
                } else {
                    if wf_files.len() > 1 || den_files.len() > 1 {
                        self.history.critical(format!(
                            "Found {} 1WF files and {} DEN files, cannot choose the restart file",
                            wf_files.len(),
                            den_files.len()
                        ));
                        return Err(restart_error("Ambiguous restart files in outdata."));
                    }
                    return Err(restart_error("Cannot find the 1WF|1DEN file to restart from."));
                };
                let restart_file = dir.out_to_in(&file)?;
                add_irdvars(&mut vars, ext);
                Some(restart_file)
            }
            TaskFamily::Sigma => {
                let file = outdir
                    .has_abiext("QPS")
                    .ok_or_else(|| restart_error("Cannot find the QPS file to restart from."))?;
                let restart_file = dir.out_to_in(&file)?;
                add_irdvars(&mut vars, "QPS");
                Some(restart_file)
            }
            TaskFamily::Bse => {
                let mut restart_file = None;
                let mut found = false;
                for ext in ["BSR", "BSC"] {
                    if let Some(file) = outdir.has_abiext(ext) {
                        restart_file = Some(dir.out_to_in(&file)?);
                        add_irdvars(&mut vars, ext);
                        found = true;
                    }
                }
                if !found {
                    let indir = dir.indir();
                    if !["BSR", "BSC"].iter().any(|ext| indir.has_abiext(ext).is_some()) {
                        return Err(restart_error(
                            "Cannot find BSR|BSC files in outdata or indata.",
                        ));
                    }
                }
                let mut haydock = false;
                for ext in ["HAYDR_SAVE", "HAYDC_SAVE"] {
                    if let Some(file) = outdir.has_abiext(ext) {
                        dir.out_to_in(&file)?;
                        add_irdvars(&mut vars, ext);
                        haydock = true;
                    }
                }
                if !haydock {
                    return Err(restart_error("Cannot find the HAYDR_SAVE file to restart from."));
                }
                restart_file.or_else(|| Some(dir.indir().path().to_path_buf()))
            }
            TaskFamily::Scr | TaskFamily::Generic => None,
        };
        Ok((vars, source))
    }

    /// Decreases the memory requested by the external program.
    pub fn reduce_memory_demand(&mut self) -> Result<(), DecreaseDemandsError> {
        if !self.family.can_reduce_memory_demand() {
            return Err(DecreaseDemandsError(format!(
                "{} cannot reduce its memory demand",
                self.family
            )));
        }
        let gwmem = reduced_gwmem(self.input.get("gwmem"))?;
        self.history
            .info(format!("Reducing memory demand with gwmem {gwmem}"));
        self.input.set_var("gwmem", Value::String(gwmem));
        Ok(())
    }

    /// Makes the run faster without changing its resources.
    pub fn speed_up(&mut self) -> Result<(), DecreaseDemandsError> {
        Err(DecreaseDemandsError(format!(
            "{} does not know how to speed up",
            self.family
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{TaskFamily, reduced_gwmem};
    use crate::Status;
    use crate::task::RestartOutcome;
    use crate::tests::utils::{TestEnv, scf_input, touch};
    use serde_json::json;

    #[test]
    fn test_critical_events() {
        assert_eq!(TaskFamily::Scf.critical_events(), &["ScfConvergenceWarning"]);
        assert_eq!(TaskFamily::Dfpt.critical_events(), &["ScfConvergenceWarning"]);
        assert!(TaskFamily::Scr.critical_events().is_empty());
        assert_eq!(TaskFamily::Sigma.class_name(), "SigmaTask");
    }

    #[test]
    fn test_reduced_gwmem() {
        assert_eq!(reduced_gwmem(None).unwrap(), "10");
        assert_eq!(reduced_gwmem(Some(&json!("10"))).unwrap(), "00");
        assert_eq!(reduced_gwmem(Some(&json!(11))).unwrap(), "10");
        assert_eq!(reduced_gwmem(Some(&json!(1))).unwrap(), "00");
        assert!(reduced_gwmem(Some(&json!("00"))).is_err());
        assert!(reduced_gwmem(Some(&json!(1.5))).is_err());
    }

    #[test]
    fn test_reduce_memory_demand() {
        let env = TestEnv::new();
        let sigma = env.task("sigma", TaskFamily::Sigma, scf_input());
        let mut sigma = sigma.get_mut();
        sigma.reduce_memory_demand().unwrap();
        assert_eq!(sigma.get_inpvar("gwmem"), Some(&json!("10")));
        sigma.reduce_memory_demand().unwrap();
        assert_eq!(sigma.get_inpvar("gwmem"), Some(&json!("00")));
        assert!(sigma.reduce_memory_demand().is_err());

        let bse = env.task("bse", TaskFamily::Bse, scf_input());
        bse.get_mut().reduce_memory_demand().unwrap();
        assert_eq!(bse.get().get_inpvar("gwmem"), Some(&json!("10")));

        let scf = env.task("scf", TaskFamily::Scf, scf_input());
        assert!(scf.get_mut().reduce_memory_demand().is_err());
        assert!(scf.get_mut().speed_up().is_err());
    }

    #[test]
    fn test_scf_restart() {
        let env = TestEnv::new();
        let task = env.task("scf", TaskFamily::Scf, scf_input());
        let mut task = task.get_mut();
        task.status = Status::Unconverged;
        assert!(task.restart_from_artifacts(false).is_err());

        let outdir = task.dir().unwrap().outdir().clone();
        touch(&outdir.path_in("out_DEN.nc"));
        assert_eq!(
            task.restart_from_artifacts(false).unwrap(),
            RestartOutcome::Ready
        );
        assert_eq!(task.status(), Status::Ready);
        assert_eq!(task.num_restarts(), 1);
        assert_eq!(task.get_inpvar("irdden"), Some(&json!(1)));
        assert!(task.dir().unwrap().indir().path_in("in_DEN.nc").exists());
        assert!(task.history().contains("Will restart from"));
    }

    #[test]
    fn test_relax_restart_from_timden() {
        let env = TestEnv::new();
        let task = env.task("relax", TaskFamily::Relax, scf_input());
        let mut task = task.get_mut();
        let outdir = task.dir().unwrap().outdir().clone();
        touch(&outdir.path_in("out_TIM3_DEN"));
        touch(&outdir.path_in("out_TIM4_DEN"));
        task.restart_from_artifacts(false).unwrap();
        assert!(task.dir().unwrap().indir().path_in("in_DEN").exists());
        assert_eq!(task.get_inpvar("irdden"), Some(&json!(1)));
    }

    #[test]
    fn test_relax_restart_without_density() {
        let env = TestEnv::new();
        let task = env.task("relax", TaskFamily::Relax, scf_input());
        let mut task = task.get_mut();
        assert_eq!(
            task.restart_from_artifacts(false).unwrap(),
            RestartOutcome::Ready
        );
        assert!(task.get_inpvar("irdden").is_none());
    }

    #[test]
    fn test_dfpt_restart() {
        let env = TestEnv::new();
        let task = env.task("dfpt", TaskFamily::Dfpt, scf_input());
        let mut task = task.get_mut();
        let outdir = task.dir().unwrap().outdir().clone();
        assert!(task.restart_from_artifacts(false).is_err());

        touch(&outdir.path_in("out_1WF4"));
        touch(&outdir.path_in("out_1WF5"));
        assert!(task.restart_from_artifacts(false).is_err());

        std::fs::remove_file(outdir.path_in("out_1WF5")).unwrap();
        task.restart_from_artifacts(false).unwrap();
        assert_eq!(task.get_inpvar("ird1wf"), Some(&json!(1)));
        assert!(task.dir().unwrap().indir().path_in("in_1WF4").exists());
    }

    #[test]
    fn test_bse_restart() {
        let env = TestEnv::new();
        let task = env.task("bse", TaskFamily::Bse, scf_input());
        let mut task = task.get_mut();
        let outdir = task.dir().unwrap().outdir().clone();
        assert!(task.restart_from_artifacts(false).is_err());

        touch(&outdir.path_in("out_BSR"));
        assert!(task.restart_from_artifacts(false).is_err());

        // BSR already moved to indata by the failed attempt
        touch(&outdir.path_in("out_HAYDR_SAVE"));
        task.restart_from_artifacts(false).unwrap();
        assert_eq!(task.get_inpvar("irdhaydock"), Some(&json!(1)));
        assert!(task.dir().unwrap().indir().path_in("in_HAYDR_SAVE").exists());
    }

    #[test]
    fn test_generic_restart() {
        let env = TestEnv::new();
        let task = env.task("scr", TaskFamily::Scr, scf_input());
        let mut task = task.get_mut();
        assert_eq!(
            task.restart_from_artifacts(false).unwrap(),
            RestartOutcome::Ready
        );
        assert_eq!(task.num_restarts(), 1);
    }
}
