//! Building, launching and resource negotiation of a task.

use chrono::Local;
use serde_json::{Value, json};
use std::path::Path;

use crate::Status;
use crate::common::fsutils::{remove_if_exists, write_atomic};
use crate::common::timeutils::format_slurm_time;
use crate::manager::TaskManager;
use crate::queue::{FakeProcess, QueueJob, ScriptParams, SubmitResult};
use crate::task::Task;
use crate::task::files::OUTPUT_FILE;
use simcore::resources::{HintSet, ResourceConfiguration};

const AUTOPARAL_VARS: [&str; 3] = ["autoparal", "max_ncpus", "mem_test"];

#[derive(Debug)]
pub enum AutoparalOutcome {
    /// Negotiation disabled or pointless (a single core is available).
    Skipped,
    Selected(ResourceConfiguration),
    /// The probe ran but its output contained no usable hints.
    ParseFailed(String),
}

fn parse_hints(path: &Path) -> crate::Result<HintSet> {
    let text = std::fs::read_to_string(path)?;
    Ok(HintSet::parse(&text)?)
}

fn quoted(path: &Path) -> Value {
    Value::String(path.display().to_string())
}

impl Task {
    /// Creates the working directory and writes the input file.
    pub fn build(&mut self) -> crate::Result<()> {
        let dir = self.dir()?.clone();
        dir.create()?;
        let mut input = self.input.make_input();
        for (name, value) in [
            ("indata_prefix", quoted(&dir.indir().prefix_path())),
            ("outdata_prefix", quoted(&dir.outdir().prefix_path())),
            ("tmpdata_prefix", quoted(&dir.tmpdir().prefix_path())),
            ("output_file", quoted(&dir.output_file())),
        ] {
            input.push_str(&format!("{name} {value}\n"));
        }
        std::fs::write(dir.input_file(), input)?;
        Ok(())
    }

    /// Prepares the working directory for a new run.
    pub fn setup(&mut self) -> crate::Result<()> {
        let dir = self.dir()?.clone();
        let output = dir.output_file();
        if output.exists() {
            let archived = (1..)
                .map(|n| dir.file(&format!("{OUTPUT_FILE}_{n}")))
                .find(|p| !p.exists())
                .ok_or_else(|| crate::Error::GenericError("no free output name".to_string()))?;
            std::fs::rename(&output, &archived)?;
            self.history.info(format!(
                "Renamed previous output file to {}",
                archived.display()
            ));
        }
        self.make_links()
    }

    /// Starts the task. Returns `false` if the task was not submitted.
    pub fn start(&mut self) -> crate::Result<bool> {
        if self.status >= Status::Submitted {
            return Err(crate::Error::InvariantError(format!(
                "{}: cannot start a task in status {}",
                self.name,
                self.status.as_str()
            )));
        }
        self.manager()?;
        let dir = self.dir()?.clone();
        dir.create()?;
        let lockfile = dir.start_lockfile();
        if lockfile.exists() {
            self.history
                .warning(format!("Found lock file: {}", lockfile.display()));
            return Ok(false);
        }
        std::fs::write(&lockfile, format!("Started on {}", Local::now()))?;

        self.build()?;
        self.setup()?;
        self.add_connecting_vars();

        match self.autoparal_run() {
            Ok(outcome) => self.report_autoparal(outcome),
            Err(crate::Error::NoQueueAdapter(e)) => {
                self.history.critical(e.to_string());
                self.set_status(Status::QCritical, e.to_string())?;
                return Ok(false);
            }
            Err(e) => {
                self.history.critical(format!(
                    "First call to autoparal failed with `{e}`. Will try fix_abicritical"
                ));
                if !self.fix_abicritical()? {
                    self.set_status(
                        Status::AbiCritical,
                        "fix_abicritical could not solve the problem",
                    )?;
                    return Ok(false);
                }
                match self.autoparal_run() {
                    Ok(outcome) => self.report_autoparal(outcome),
                    Err(e) => {
                        self.history
                            .critical(format!("Second call to autoparal failed with `{e}`"));
                        self.set_status(
                            Status::AbiCritical,
                            format!("autoparal failed twice: {e}"),
                        )?;
                        return Ok(false);
                    }
                }
            }
        }

        self.launch()?;
        Ok(true)
    }

    fn report_autoparal(&mut self, outcome: AutoparalOutcome) {
        if let AutoparalOutcome::ParseFailed(reason) = outcome {
            self.history.warning(format!(
                "Cannot parse the autoparal output ({reason}), using the default configuration"
            ));
        }
    }

    /// Runs the probe of the external program and selects the optimal configuration.
    pub fn autoparal_run(&mut self) -> crate::Result<AutoparalOutcome> {
        let manager = self.manager()?;
        let max_ncpus = manager.max_cores();
        if !manager.policy().autoparal_enabled() || max_ncpus == 1 {
            log::debug!("{}: skipping autoparal", self.name);
            return Ok(AutoparalOutcome::Skipped);
        }
        let mut shell_manager = manager.to_shell_manager(1);
        let autoparal = manager.policy().autoparal;

        let saved_mem_test = self.input.get("mem_test").cloned();
        self.set_var("autoparal", autoparal.into());
        self.set_var("max_ncpus", max_ncpus.into());
        self.set_var("mem_test", 0.into());

        let probe = self.run_probe(&mut shell_manager);

        self.input.remove_vars(&AUTOPARAL_VARS);
        if let Some(mem_test) = saved_mem_test {
            self.set_var("mem_test", mem_test);
        }
        self.returncode = 0;
        self.qjob = None;
        self.process = Box::new(FakeProcess);
        probe?;

        let dir = self.dir()?.clone();
        let output = dir.output_file();
        let hints = match parse_hints(&output) {
            Ok(hints) => hints,
            Err(e) => {
                log::debug!("{}: cannot parse hints ({e}), retrying", self.name);
                std::thread::sleep(self.autoparal_retry_delay);
                match parse_hints(&output) {
                    Ok(hints) => hints,
                    Err(e) => {
                        self.clean_probe_files()?;
                        self.set_status(Status::Init, "autoparal output could not be parsed")?;
                        return Ok(AutoparalOutcome::ParseFailed(e.to_string()));
                    }
                }
            }
        };

        if !self.input.contains("paral_kgb") {
            if let Some(paral_kgb) = hints.info().paral_kgb {
                self.set_var("paral_kgb", paral_kgb.into());
            }
        }

        let optconf = self.manager_mut()?.select_qadapter(&hints)?;
        self.set_vars(optconf.vars());
        self.history.info(format!(
            "Autoparal selected mpi_procs={}, omp_threads={}, mem_per_proc={:.1} MB, efficiency={:.2}",
            optconf.mpi_procs(),
            optconf.omp_threads(),
            optconf.mem_per_proc(),
            optconf.efficiency()
        ));

        let record = json!({"hints": &hints, "optimal_conf": &optconf});
        write_atomic(
            &dir.autoparal_file(),
            serde_json::to_string_pretty(&record)?.as_bytes(),
        )?;
        self.optconf = Some(optconf.clone());
        self.hints = Some(hints);

        self.set_status(Status::Init, "finished autoparal run")?;
        self.clean_probe_files()?;
        Ok(AutoparalOutcome::Selected(optconf))
    }

    fn run_probe(&mut self, shell_manager: &mut TaskManager) -> crate::Result<()> {
        self.launch_with(shell_manager)?;
        // The submission record of the probe is not part of the task history
        self.history.pop();
        // The probe exits with a non-zero code once the hints are written
        self.process.wait()?;
        Ok(())
    }

    fn clean_probe_files(&mut self) -> crate::Result<()> {
        let dir = self.dir()?.clone();
        for path in [dir.output_file(), dir.log_file(), dir.stderr_file()] {
            remove_if_exists(&path)?;
        }
        Ok(())
    }

    /// Submits the task with its own manager.
    pub(crate) fn launch(&mut self) -> crate::Result<()> {
        let mut manager = self.manager.take().ok_or_else(|| {
            crate::Error::GenericError(format!("{} has no manager", self.name))
        })?;
        let result = self.launch_with(&mut manager);
        self.manager = Some(manager);
        result
    }

    pub(crate) fn launch_with(&mut self, manager: &mut TaskManager) -> crate::Result<()> {
        if self.status == Status::Locked {
            return Err(crate::Error::InvariantError(format!(
                "{}: cannot launch a locked task",
                self.name
            )));
        }
        self.build()?;
        let dir = self.dir()?.clone();
        let exec_args = vec![format!(
            "--timelimit {}",
            format_slurm_time(&manager.qadapter().timelimit())
        )];
        let (qout, qerr, script) = (dir.qout_file(), dir.qerr_file(), dir.job_file());
        manager.write_jobfile(
            &ScriptParams {
                job_name: &self.name,
                launch_dir: dir.path(),
                executable: &self.executable,
                qout_path: &qout,
                qerr_path: &qerr,
                in_file: &dir.input_file(),
                stdout: &dir.log_file(),
                stderr: &dir.stderr_file(),
                exec_args: &exec_args,
            },
            &script,
        )?;

        let SubmitResult { qid, process } = match manager.submit(&script, &qout, &qerr) {
            Err(crate::Error::MaxNumLaunches(max_launches)) => {
                self.set_status(
                    Status::Error,
                    format!("max_num_launches reached: {max_launches}"),
                )?;
                return Err(crate::Error::MaxNumLaunches(max_launches));
            }
            result => result?,
        };
        self.process = process;
        self.returncode = 0;
        let kind = manager.qadapter().kind();
        self.qjob = qid.map(|qid| QueueJob { qid, kind });
        self.set_status(
            Status::Submitted,
            format!(
                "Submitted with MPI={}, Omp={}, Memproc={:.1} [Gb] to {kind}",
                manager.mpi_procs(),
                manager.omp_threads(),
                manager.mem_per_proc() / 1024.0
            ),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::task::family::TaskFamily;
    use crate::tests::utils::{TestEnv, scf_input, touch};

    #[test]
    fn test_build_writes_prefixes() {
        let env = TestEnv::new();
        let task = env.task("t", TaskFamily::Scf, scf_input());
        let mut task = task.get_mut();
        task.build().unwrap();
        let dir = task.dir().unwrap().clone();
        let text = std::fs::read_to_string(dir.input_file()).unwrap();
        assert!(text.contains("ecut 10"));
        assert!(text.contains(&format!(
            "outdata_prefix \"{}\"",
            dir.outdir().prefix_path().display()
        )));
        assert!(text.contains(&format!(
            "output_file \"{}\"",
            dir.output_file().display()
        )));
    }

    #[test]
    fn test_setup_archives_output() {
        let env = TestEnv::new();
        let task = env.task("t", TaskFamily::Scf, scf_input());
        let mut task = task.get_mut();
        let dir = task.dir().unwrap().clone();
        touch(&dir.output_file());
        touch(&dir.file("run.abo_1"));
        task.setup().unwrap();
        assert!(!dir.output_file().exists());
        assert!(dir.file("run.abo_2").exists());
    }

    #[test]
    fn test_start_without_manager() {
        let env = TestEnv::new();
        let task = env.task("t", TaskFamily::Scf, scf_input());
        assert!(task.get_mut().start().is_err());
    }
}
