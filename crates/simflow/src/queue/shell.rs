use std::fs::File;
use std::process::{Command, Stdio};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::queue::process::ChildProcess;
use crate::queue::{
    HeaderParams, JobFiles, QueueError, QueueHandler, QueueKind, SubmitResult, script_dir,
};

/// Runs the job script directly with bash, without any queue in between.
pub struct ShellHandler;

impl QueueHandler for ShellHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Shell
    }

    fn header(&self, _params: &HeaderParams) -> String {
        String::new()
    }

    fn submit(&self, files: &JobFiles) -> crate::Result<SubmitResult> {
        let stdout = File::create(files.qout)?;
        let stderr = File::create(files.qerr)?;
        log::debug!("Running `/bin/bash {}`", files.script.display());
        let child = Command::new("/bin/bash")
            .arg(files.script)
            .current_dir(script_dir(files.script))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        Ok(SubmitResult {
            qid: Some(child.id().to_string()),
            process: Box::new(ChildProcess::new(child)),
        })
    }

    fn cancel(&self, qid: &str) -> crate::Result<i32> {
        let pid: i32 = qid
            .parse()
            .map_err(|e| crate::Error::QueueError(format!("Invalid process id `{qid}`: {e}")))?;
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => Ok(0),
            Err(e) => {
                log::warn!("Cannot kill process {pid}: {e}");
                Ok(1)
            }
        }
    }

    fn njobs_in_queue(&self, _username: &str) -> Option<usize> {
        None
    }

    fn parse_errors(&self, _qout: &str, _qerr: &str) -> Vec<QueueError> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ShellHandler;
    use crate::queue::{JobFiles, QueueHandler};

    #[test]
    fn test_submit_script() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "echo out\necho err >&2\nexit 2\n").unwrap();
        let qout = dir.path().join("queue.qout");
        let qerr = dir.path().join("queue.qerr");

        let mut result = ShellHandler
            .submit(&JobFiles {
                script: &script,
                qout: &qout,
                qerr: &qerr,
            })
            .unwrap();
        assert!(result.qid.is_some());
        assert_eq!(result.process.wait().unwrap(), 2);
        assert_eq!(std::fs::read_to_string(&qout).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(&qerr).unwrap(), "err\n");
    }

    #[test]
    fn test_cancel_invalid_pid() {
        assert!(ShellHandler.cancel("abc").is_err());
    }
}
