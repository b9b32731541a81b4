//! Restarts, resets and the fixes applied to failed runs.

use chrono::Local;

use crate::Status;
use crate::common::error::FixQueueCriticalError;
use crate::common::fsutils::remove_if_exists;
use crate::queue::{FakeProcess, QueueError};
use crate::task::files::RESET_COUNTER;
use crate::task::{RestartOutcome, Task};

impl Task {
    /// Applies the registered event handlers to the errors of the last run.
    /// Returns `true` if at least one handler changed the input; the task is then reset.
    pub fn fix_abicritical(&mut self) -> crate::Result<bool> {
        if self.handlers.is_empty() {
            self.set_status(Status::Error, "No handlers registered to fix AbiCritical events")?;
            return Ok(false);
        }
        let report = match self.get_event_report() {
            Ok(Some(report)) => report,
            Ok(None) => {
                self.set_status(Status::Error, "Cannot find the event report of the last run")?;
                return Ok(false);
            }
            Err(e) => {
                self.set_status(Status::Error, format!("Cannot parse the event report: {e}"))?;
                return Ok(false);
            }
        };

        let mut handlers = std::mem::take(&mut self.handlers);
        let mut fired = vec![false; handlers.len()];
        let mut count = 0;
        for event in &report.events {
            for (handler, fired) in handlers.iter_mut().zip(fired.iter_mut()) {
                if *fired || !handler.can_handle(event) {
                    continue;
                }
                match handler.handle_task_event(self, event) {
                    Ok(true) => {
                        *fired = true;
                        count += 1;
                    }
                    Ok(false) => {}
                    Err(e) => self.history.warning(format!(
                        "Handler of {} failed: {e}",
                        handler.event_class()
                    )),
                }
            }
        }
        self.handlers = handlers;

        if count > 0 {
            self.history
                .info(format!("{count} AbiCritical events fixed, resetting from scratch"));
            self.reset_from_scratch()?;
            return Ok(true);
        }
        self.set_status(
            Status::Error,
            "We encountered AbiCritical events that could not be fixed",
        )?;
        Ok(false)
    }

    /// Moves the output of the last run into `_reset/` and restarts without submitting.
    pub fn reset_from_scratch(&mut self) -> crate::Result<RestartOutcome> {
        let dir = self.dir()?.clone();
        let reset_dir = dir.reset_dir();
        std::fs::create_dir_all(&reset_dir)?;
        let counter_file = reset_dir.join(RESET_COUNTER);
        let num_reset = std::fs::read_to_string(&counter_file)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0)
            + 1;

        for path in [
            dir.output_file(),
            dir.log_file(),
            dir.stderr_file(),
            dir.qout_file(),
            dir.qerr_file(),
            dir.mpiabort_file(),
        ] {
            if !path.exists() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let dest = reset_dir.join(format!("{name}_{num_reset}"));
            std::fs::rename(&path, &dest)?;
        }
        std::fs::write(&counter_file, num_reset.to_string())?;
        remove_if_exists(&dir.start_lockfile())?;
        self.datetimes.reset();
        Ok(self.restart_now(false))
    }

    /// Moves the task back to `Ready` and optionally submits it again.
    pub(crate) fn restart_now(&mut self, submit: bool) -> RestartOutcome {
        if let Err(e) = self.set_status(Status::Ready, format!("Restarted on {}", Local::now())) {
            self.history.warning(format!("Cannot restart: {e}"));
            return RestartOutcome::NotRestartable;
        }
        self.num_restarts += 1;
        self.history
            .info(format!("Restarted, num_restarts {}", self.num_restarts));
        self.datetimes.reset();
        self.queue_errors.clear();
        self.abi_errors.clear();
        if let Ok(dir) = self.dir() {
            if let Err(e) = remove_if_exists(&dir.start_lockfile()) {
                log::warn!("{}: cannot remove the lock file: {e}", self.name);
            }
        }
        self.returncode = 0;

        if !submit {
            return RestartOutcome::Ready;
        }
        match self.start() {
            Ok(true) => RestartOutcome::Submitted,
            Ok(false) => {
                self.history.warning("Restart failed, the task was not submitted");
                RestartOutcome::Ready
            }
            Err(e) => {
                self.history.warning(format!("Restart failed: {e}"));
                RestartOutcome::Ready
            }
        }
    }

    /// Restarts the task from the output of its previous run.
    /// Fails with `RestartError` when the family finds no usable restart file.
    pub fn restart(&mut self, submit: bool) -> crate::Result<RestartOutcome> {
        if matches!(self.status, Status::Locked | Status::Ok) {
            return Ok(RestartOutcome::NotRestartable);
        }
        self.restart_from_artifacts(submit)
    }

    /// Rewinds the task to its initial state.
    pub fn reset(&mut self) -> crate::Result<()> {
        let dir = self.dir()?.clone();
        for path in [
            dir.output_file(),
            dir.log_file(),
            dir.stderr_file(),
            dir.start_lockfile(),
            dir.qerr_file(),
            dir.qout_file(),
            dir.mpiabort_file(),
        ] {
            remove_if_exists(&path)?;
        }
        self.set_status(Status::Init, format!("Reset on {}", Local::now()))?;
        self.num_restarts = 0;
        self.qjob = None;
        self.queue_errors.clear();
        self.abi_errors.clear();
        self.finalized = false;
        self.returncode = 0;
        self.process = Box::new(FakeProcess);
        self.datetimes.reset();
        Ok(())
    }

    /// Cancels the queue job. Returns `false` if there was nothing to cancel.
    pub fn cancel(&mut self) -> crate::Result<bool> {
        let Some(qjob) = self.qjob.clone() else {
            return Ok(false);
        };
        if self.status >= Status::Done {
            return Ok(false);
        }
        let exit_status = self.manager()?.cancel(&qjob.qid)?;
        if exit_status != 0 {
            self.history.warning(format!(
                "Cancelling job {qjob} returned exit status {exit_status}"
            ));
            return Ok(false);
        }
        self.history.info(format!("Job {qjob} cancelled by user"));
        self.reset()?;
        Ok(true)
    }

    fn fixed(&mut self, msg: &str) -> String {
        self.history.info(msg);
        msg.to_string()
    }

    fn unfixable(&mut self, msg: String) -> crate::Result<String> {
        self.set_status(Status::Error, msg.clone())?;
        Err(FixQueueCriticalError(msg).into())
    }

    /// Tries to solve the failure reported by the queue backend by changing the request.
    /// Returns a description of the applied fix.
    pub fn fix_queue_critical(&mut self) -> crate::Result<String> {
        self.history.info("fixing queue critical");
        if self.queue_errors.is_empty() {
            self.parse_queue_errors();
        }
        let errors = self.queue_errors.clone();

        if errors.iter().all(QueueError::is_unknown) {
            if !(self.mem_scales || self.load_scales) {
                return self.unfixable("unknown queue error, no options left".to_string());
            }
            return match self.manager_mut()?.increase_resources() {
                Ok(()) => {
                    self.reset_from_scratch()?;
                    Ok(self.fixed("increased resources"))
                }
                Err(e) => self.unfixable(format!(
                    "unknown queue error, could not increase resources any further: {e}"
                )),
            };
        }

        for error in errors {
            match error {
                QueueError::NodeFailure { nodes } => {
                    if nodes.is_empty() {
                        return self.unfixable("Node error but no node identified.".to_string());
                    }
                    if let Err(e) = self.manager_mut()?.exclude_nodes(&nodes) {
                        return self.unfixable(format!("Cannot exclude nodes: {e}"));
                    }
                    self.reset_from_scratch()?;
                    self.set_status(Status::Ready, "excluding nodes")?;
                    return Ok(self.fixed(&format!("excluding nodes {}", nodes.join(","))));
                }
                QueueError::MemoryCancel => {
                    if self.mem_scales && self.manager_mut()?.increase_ncpus().is_ok() {
                        self.reset_from_scratch()?;
                        return Ok(self.fixed("increased ncps to solve memory problem"));
                    }
                    if self.manager_mut()?.increase_mem().is_ok() {
                        self.reset_from_scratch()?;
                        return Ok(self.fixed("increased mem"));
                    }
                    if self.reduce_memory_demand().is_ok() {
                        self.reset_from_scratch()?;
                        return Ok(self.fixed("decreased mem demand"));
                    }
                    return self.unfixable(
                        "increasing mem and decreasing the mem demand failed, no options left"
                            .to_string(),
                    );
                }
                QueueError::TimeCancel => {
                    if self.manager_mut()?.increase_time().is_ok() {
                        self.reset_from_scratch()?;
                        return Ok(self.fixed("increased wall time"));
                    }
                    if self.load_scales && self.manager_mut()?.increase_ncpus().is_ok() {
                        self.reset_from_scratch()?;
                        return Ok(self.fixed("increased number of cpus"));
                    }
                    if self.speed_up().is_ok() {
                        self.reset_from_scratch()?;
                        return Ok(self.fixed("task speedup"));
                    }
                    return self.unfixable(
                        "increasing the wall time and speeding up failed, no options left"
                            .to_string(),
                    );
                }
                QueueError::Unknown(_) => continue,
            }
        }
        self.unfixable("no fix applies to the reported queue errors".to_string())
    }
}
