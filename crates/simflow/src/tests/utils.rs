use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use crate::common::fsutils::make_executable;
use crate::manager::TaskManager;
use crate::task::family::TaskFamily;
use crate::task::input::AbinitInput;
use crate::task::{Task, TaskRef};

/// Hints printed by the fake program when it runs in autoparal mode.
pub const HINTS: &str = r#"--- !Autoparal
info: {version: 1, autoparal: 1, max_ncpus: 2, paral_kgb: 0}
configurations:
    - {tot_ncpus: 1, mpi_ncpus: 1, efficiency: 1.0, mem_per_cpu: 100.0, vars: {npkpt: 1}}
    - {tot_ncpus: 2, mpi_ncpus: 2, efficiency: 0.95, mem_per_cpu: 100.0, vars: {npkpt: 2}}
...
"#;

/// A single configuration no adapter can satisfy.
pub const HUGE_HINTS: &str = r#"--- !Autoparal
info: {version: 1, autoparal: 1, max_ncpus: 2}
configurations:
    - {tot_ncpus: 1, mpi_ncpus: 1, efficiency: 1.0, mem_per_cpu: 100000.0}
...
"#;

pub const FINAL_SUMMARY: &str = r#"--- !FinalSummary
program: abinit
start_datetime: Sat Feb 13 11:27:14 2021
end_datetime: Sat Feb 13 11:30:02 2021
...
"#;

pub const SCF_WARNING: &str = r#"--- !ScfConvergenceWarning
message: nstep reached, not converged
tolname: tolvrs
...
"#;

pub const TOLSYM_ERROR: &str = r#"--- !TolSymError
message: Too large tolsym
...
"#;

pub const OTHER_ERROR: &str = r#"--- !ERROR
src_file: m_abi.F90
src_line: 100
message: Bad input
...
"#;

pub struct TestEnv {
    dir: TempDir,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    pub fn new() -> TestEnv {
        TestEnv {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn new_task(&self, name: &str, family: TaskFamily, input: AbinitInput) -> Task {
        Task::new(family, input)
            .with_name(name)
            .with_workdir(self.path().join(name))
    }

    /// Task with a created working directory and no manager.
    pub fn task(&self, name: &str, family: TaskFamily, input: AbinitInput) -> TaskRef {
        let task = self.new_task(name, family, input);
        task.dir().unwrap().create().unwrap();
        task.into_ref()
    }

    /// Task that runs `program` through `manager` in a local shell.
    pub fn runnable_task(
        &self,
        name: &str,
        family: TaskFamily,
        manager: TaskManager,
        program: &Path,
    ) -> TaskRef {
        self.new_task(name, family, scf_input())
            .with_manager(manager)
            .with_executable(&program.display().to_string())
            .with_autoparal_retry_delay(Duration::from_millis(10))
            .into_ref()
    }

    /// Writes an executable bash script. It is called as `program run.abi [args]`
    /// from the working directory of the task.
    pub fn program(&self, name: &str, body: &str) -> PathBuf {
        let bin = self.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join(name);
        std::fs::write(&path, format!("#!/bin/bash\n{body}")).unwrap();
        make_executable(&path).unwrap();
        path
    }

    /// Program that answers autoparal probes with `hints` and otherwise prints `stdout`
    /// and creates the given files in `outdata/`.
    pub fn fake_abinit(&self, name: &str, hints: &str, stdout: &str, outfiles: &[&str]) -> PathBuf {
        let mut body = String::new();
        body.push_str("if grep -q '^autoparal ' \"$1\"; then\n");
        if !hints.is_empty() {
            body.push_str(&heredoc("run.abo", hints));
        }
        body.push_str("exit 1\nfi\n");
        for file in outfiles {
            body.push_str(&format!("touch outdata/out_{file}\n"));
        }
        body.push_str(&heredoc("", stdout));
        self.program(name, &body)
    }
}

fn heredoc(target: &str, text: &str) -> String {
    let redirect = if target.is_empty() {
        String::new()
    } else {
        format!(" > {target}")
    };
    format!("cat <<'EOF'{redirect}\n{text}EOF\n")
}

pub fn scf_input() -> AbinitInput {
    AbinitInput::parse("ecut 10\nnband 8\nngkpt 4 4 4\n").unwrap()
}

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, "").unwrap();
}

fn indent_adapter(adapter: &str) -> String {
    let mut lines = adapter.lines();
    let mut out = String::new();
    if let Some(first) = lines.next() {
        out.push_str(&format!("  - {first}\n"));
    }
    for line in lines {
        out.push_str(&format!("    {line}\n"));
    }
    out
}

/// `manager.yml` with an optional policy line and the given adapters.
pub fn manager_yaml(policy: &str, adapters: &[String]) -> String {
    let mut yaml = String::new();
    if !policy.is_empty() {
        yaml.push_str(&format!("policy:\n  {policy}\n"));
    }
    yaml.push_str("qadapters:\n");
    for adapter in adapters {
        yaml.push_str(&indent_adapter(adapter));
    }
    yaml
}

pub fn shell_adapter_yaml(priority: i64, max_cores: u32) -> String {
    format!(
        "priority: {priority}
queue: {{qtype: shell}}
limits: {{timelimit: \"1:00:00\", max_cores: {max_cores}}}
hardware: {{num_nodes: 1, sockets_per_node: 1, cores_per_socket: {max_cores}, mem_per_node: 4 Gb}}"
    )
}

pub fn slurm_adapter_yaml(priority: i64, max_cores: u32, nodes: bool) -> String {
    let allocation = if nodes { ", allocation: nodes" } else { "" };
    format!(
        "priority: {priority}
queue: {{qtype: slurm, qname: debug}}
job: {{mpi_runner: mpirun}}
limits: {{timelimit: \"0:30:00\", timelimit_hard: \"2:00:00\", max_cores: {max_cores}{allocation}}}
hardware: {{num_nodes: 2, sockets_per_node: 2, cores_per_socket: 4, mem_per_node: 32 Gb}}"
    )
}

pub fn shell_manager(policy: &str, max_cores: u32) -> TaskManager {
    TaskManager::from_yaml(&manager_yaml(policy, &[shell_adapter_yaml(1, max_cores)])).unwrap()
}
