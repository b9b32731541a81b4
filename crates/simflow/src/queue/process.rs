use std::io::Read;
use std::process::{Child, ExitStatus};

use bstr::ByteSlice;

/// A running (or finished) job as seen by the Task.
pub trait Process: std::fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Returns the return code if the process has terminated.
    fn poll(&mut self) -> Option<i32>;

    /// Blocks until the process terminates and returns its return code.
    fn wait(&mut self) -> crate::Result<i32>;

    /// Waits for the process and returns its (stdout, stderr).
    fn communicate(&mut self) -> crate::Result<(String, String)>;

    fn kill(&mut self) -> crate::Result<()>;
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(1))
}

/// Local subprocess spawned by the shell backend.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    returncode: Option<i32>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        ChildProcess {
            child,
            returncode: None,
        }
    }
}

impl Process for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn poll(&mut self) -> Option<i32> {
        if self.returncode.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.returncode = Some(exit_code(status)),
                Ok(None) => {}
                Err(e) => log::warn!("Cannot poll process {}: {e}", self.child.id()),
            }
        }
        self.returncode
    }

    fn wait(&mut self) -> crate::Result<i32> {
        if let Some(code) = self.returncode {
            return Ok(code);
        }
        let code = exit_code(self.child.wait()?);
        self.returncode = Some(code);
        Ok(code)
    }

    fn communicate(&mut self) -> crate::Result<(String, String)> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut out) = self.child.stdout.take() {
            out.read_to_end(&mut stdout)?;
        }
        if let Some(mut err) = self.child.stderr.take() {
            err.read_to_end(&mut stderr)?;
        }
        self.wait()?;
        Ok((
            stdout.to_str_lossy().into_owned(),
            stderr.to_str_lossy().into_owned(),
        ))
    }

    fn kill(&mut self) -> crate::Result<()> {
        self.child.kill()?;
        self.wait()?;
        Ok(())
    }
}

/// Outcome of a submission command that has already finished (e.g. `sbatch`).
#[derive(Debug)]
pub struct CompletedProcess {
    returncode: i32,
    stdout: String,
    stderr: String,
}

impl CompletedProcess {
    pub fn new(returncode: i32, stdout: String, stderr: String) -> Self {
        CompletedProcess {
            returncode,
            stdout,
            stderr,
        }
    }
}

impl Process for CompletedProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn poll(&mut self) -> Option<i32> {
        Some(self.returncode)
    }

    fn wait(&mut self) -> crate::Result<i32> {
        Ok(self.returncode)
    }

    fn communicate(&mut self) -> crate::Result<(String, String)> {
        Ok((self.stdout.clone(), self.stderr.clone()))
    }

    fn kill(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// Stands in for the process of a Task that has not been launched yet.
#[derive(Debug, Default)]
pub struct FakeProcess;

impl Process for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn poll(&mut self) -> Option<i32> {
        None
    }

    fn wait(&mut self) -> crate::Result<i32> {
        crate::common::error::error("Cannot wait a FakeProcess".to_string())
    }

    fn communicate(&mut self) -> crate::Result<(String, String)> {
        crate::common::error::error("Cannot communicate with a FakeProcess".to_string())
    }

    fn kill(&mut self) -> crate::Result<()> {
        crate::common::error::error("Cannot kill a FakeProcess".to_string())
    }
}
