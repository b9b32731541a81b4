use serde_json::json;
use std::time::Duration;

use crate::Status;
use crate::manager::TaskManager;
use crate::task::family::TaskFamily;
use crate::task::{RestartOutcome, TaskRef};
use crate::tests::utils::{
    FINAL_SUMMARY, OTHER_ERROR, SCF_WARNING, TOLSYM_ERROR, TestEnv, manager_yaml, scf_input,
    shell_manager, slurm_adapter_yaml,
};

const SLURM_MEMORY: &str = "slurmstepd: error: Exceeded job memory limit\n";
const SLURM_TIME: &str =
    "slurmstepd: error: *** JOB 1234 ON node01 CANCELLED AT 2021-02-13T11:27:14 DUE TO TIME LIMIT ***\n";
const SLURM_NODE: &str =
    "*** JOB 1234 ON node07 CANCELLED AT 2021-02-13T11:27:14 DUE TO NODE FAILURE ***\n";

/// Task on a Slurm adapter whose queue files are written by the test.
fn slurm_task(
    env: &TestEnv,
    family: TaskFamily,
    adapter: String,
    mem_scales: bool,
    load_scales: bool,
) -> TaskRef {
    let manager = TaskManager::from_yaml(&manager_yaml("autoparal: 0", &[adapter])).unwrap();
    let task = env
        .new_task("t", family, scf_input())
        .with_manager(manager)
        .with_scaling(mem_scales, load_scales);
    task.dir().unwrap().create().unwrap();
    task.into_ref()
}

fn write_qerr(task: &TaskRef, text: &str) {
    let qerr = task.get().dir().unwrap().qerr_file();
    std::fs::write(qerr, text).unwrap();
}

#[test]
fn test_handler_fixes_abicritical() {
    let env = TestEnv::new();
    let body = format!(
        "if grep -q '^tolsym ' \"$1\"; then\ncat <<'EOF'\n{FINAL_SUMMARY}EOF\nelse\ncat <<'EOF'\n{TOLSYM_ERROR}EOF\nfi\n"
    );
    let program = env.program("abinit", &body);
    let task = env.runnable_task(
        "scf",
        TaskFamily::Scf,
        shell_manager("autoparal: 0", 1),
        &program,
    );
    let mut task = task.get_mut();

    assert!(task.start().unwrap());
    task.wait().unwrap();
    assert_eq!(task.check_status().unwrap(), Status::AbiCritical);
    assert_eq!(task.abi_errors()[0].class_tag, "TolSymError");

    assert!(task.fix_abicritical().unwrap());
    assert_eq!(task.status(), Status::Ready);
    assert_eq!(task.num_restarts(), 1);
    let tolsym = task.get_inpvar("tolsym").and_then(|v| v.as_f64()).unwrap();
    assert!((tolsym - 1e-7).abs() < 1e-12);

    let dir = task.dir().unwrap().clone();
    let reset_dir = dir.reset_dir();
    assert!(reset_dir.join("run.log_1").exists());
    assert_eq!(
        std::fs::read_to_string(reset_dir.join("_counter")).unwrap(),
        "1"
    );
    assert!(!dir.log_file().exists());
    assert!(!dir.start_lockfile().exists());

    assert!(task.start().unwrap());
    task.wait().unwrap();
    assert_eq!(task.check_status().unwrap(), Status::Ok);
    assert_eq!(task.results().unwrap().num_restarts, 1);
}

#[test]
fn test_unfixable_abicritical() {
    let env = TestEnv::new();
    let program = env.fake_abinit("abinit", "", OTHER_ERROR, &[]);
    let task = env.runnable_task(
        "scf",
        TaskFamily::Scf,
        shell_manager("autoparal: 0", 1),
        &program,
    );
    let mut task = task.get_mut();
    assert!(task.start().unwrap());
    task.wait().unwrap();
    assert_eq!(task.check_status().unwrap(), Status::AbiCritical);

    assert!(!task.fix_abicritical().unwrap());
    assert_eq!(task.status(), Status::Error);
    assert!(task.history().contains("could not be fixed"));
    assert_eq!(task.num_restarts(), 0);
}

#[test]
fn test_fix_abicritical_without_handlers() {
    let env = TestEnv::new();
    let task = env
        .new_task("t", TaskFamily::Scf, scf_input())
        .with_handlers(Vec::new());
    task.dir().unwrap().create().unwrap();
    let task = task.into_ref();
    std::fs::write(task.get().dir().unwrap().log_file(), TOLSYM_ERROR).unwrap();

    let mut task = task.get_mut();
    assert!(!task.fix_abicritical().unwrap());
    assert_eq!(task.status(), Status::Error);
}

#[test]
fn test_restart_unconverged() {
    let env = TestEnv::new();
    let stdout = format!("{SCF_WARNING}{FINAL_SUMMARY}");
    let program = env.fake_abinit("abinit", "", &stdout, &["WFK"]);
    let task = env.runnable_task(
        "scf",
        TaskFamily::Scf,
        shell_manager("autoparal: 0", 1),
        &program,
    );
    let mut task = task.get_mut();
    assert!(task.start().unwrap());
    task.wait().unwrap();
    assert_eq!(task.check_status().unwrap(), Status::Unconverged);

    assert_eq!(task.restart(false).unwrap(), RestartOutcome::Ready);
    assert_eq!(task.status(), Status::Ready);
    assert_eq!(task.num_restarts(), 1);
    assert_eq!(task.get_inpvar("irdwfk"), Some(&json!(1)));
    assert!(task.dir().unwrap().indir().path_from_ext("WFK").exists());
    assert!(task.history().contains("Will restart from"));

    assert!(task.start().unwrap());
    task.wait().unwrap();
    assert_eq!(task.check_status().unwrap(), Status::Unconverged);
    assert_eq!(task.restart(true).unwrap(), RestartOutcome::Submitted);
    assert_eq!(task.status(), Status::Submitted);
    assert_eq!(task.num_restarts(), 2);
    task.wait().unwrap();
    assert_eq!(task.check_status().unwrap(), Status::Unconverged);
}

#[test]
fn test_restart_without_artifacts() {
    let env = TestEnv::new();
    let task = env.task("scf", TaskFamily::Scf, scf_input());
    let mut task = task.get_mut();
    task.set_status(Status::Unconverged, "by hand").unwrap();
    let err = task.restart(false).unwrap_err();
    assert!(matches!(err, crate::Error::Restart(_)));
    assert_eq!(task.num_restarts(), 0);

    task.set_status(Status::Ok, "by hand").unwrap();
    assert_eq!(task.restart(false).unwrap(), RestartOutcome::NotRestartable);
}

#[test]
fn test_memory_cancel_more_cores() {
    let env = TestEnv::new();
    let task = slurm_task(
        &env,
        TaskFamily::Scf,
        slurm_adapter_yaml(1, 16, false),
        true,
        false,
    );
    write_qerr(&task, SLURM_MEMORY);
    let mut task = task.get_mut();

    let fix = task.fix_queue_critical().unwrap();
    assert_eq!(fix, "increased ncps to solve memory problem");
    assert_eq!(task.manager().unwrap().mpi_procs(), 2);
    assert_eq!(task.status(), Status::Ready);
    assert_eq!(task.num_restarts(), 1);
    assert!(task.dir().unwrap().reset_dir().join("queue.qerr_1").exists());
}

#[test]
fn test_memory_cancel_more_memory() {
    let env = TestEnv::new();
    let task = slurm_task(
        &env,
        TaskFamily::Scf,
        slurm_adapter_yaml(1, 1, false),
        true,
        false,
    );
    write_qerr(&task, SLURM_MEMORY);
    let mut task = task.get_mut();

    assert_eq!(task.fix_queue_critical().unwrap(), "increased mem");
    assert_eq!(task.manager().unwrap().mpi_procs(), 1);
    assert_eq!(task.manager().unwrap().mem_per_proc(), 2000.0);
    assert_eq!(task.status(), Status::Ready);
    assert_eq!(task.num_restarts(), 1);
}

#[test]
fn test_memory_then_time_cancel() {
    let env = TestEnv::new();
    let task = slurm_task(
        &env,
        TaskFamily::Scf,
        slurm_adapter_yaml(1, 1, false),
        true,
        false,
    );
    write_qerr(&task, SLURM_MEMORY);
    assert_eq!(task.get_mut().fix_queue_critical().unwrap(), "increased mem");
    assert!(task.get().queue_errors().is_empty());

    write_qerr(&task, SLURM_TIME);
    let mut task = task.get_mut();
    assert_eq!(task.fix_queue_critical().unwrap(), "increased wall time");
    assert_eq!(task.manager().unwrap().mem_per_proc(), 2000.0);
    assert_eq!(
        task.manager().unwrap().qadapter().timelimit(),
        Duration::from_secs(42 * 60)
    );
    assert_eq!(task.num_restarts(), 2);
    assert!(task.dir().unwrap().reset_dir().join("queue.qerr_2").exists());
}

#[test]
fn test_memory_cancel_reduce_demand() {
    let env = TestEnv::new();
    let adapter = slurm_adapter_yaml(1, 1, false)
        .replace("max_cores: 1}", "max_cores: 1, max_mem_per_proc: 1 Gb}");
    let task = slurm_task(&env, TaskFamily::Sigma, adapter.clone(), false, false);
    write_qerr(&task, SLURM_MEMORY);
    {
        let mut task = task.get_mut();
        assert_eq!(task.fix_queue_critical().unwrap(), "decreased mem demand");
        assert_eq!(task.get_inpvar("gwmem"), Some(&json!("10")));
    }

    let env = TestEnv::new();
    let task = slurm_task(&env, TaskFamily::Scf, adapter, false, false);
    write_qerr(&task, SLURM_MEMORY);
    let mut task = task.get_mut();
    let err = task.fix_queue_critical().unwrap_err();
    assert!(matches!(err, crate::Error::FixQueueCritical(_)));
    assert_eq!(task.status(), Status::Error);
}

#[test]
fn test_time_cancel() {
    let env = TestEnv::new();
    let task = slurm_task(
        &env,
        TaskFamily::Scf,
        slurm_adapter_yaml(1, 16, false),
        false,
        false,
    );
    write_qerr(&task, SLURM_TIME);
    let mut task = task.get_mut();
    assert_eq!(task.fix_queue_critical().unwrap(), "increased wall time");
    assert_eq!(
        task.manager().unwrap().qadapter().timelimit(),
        Duration::from_secs(42 * 60)
    );
}

#[test]
fn test_time_cancel_without_hard_limit() {
    let adapter =
        slurm_adapter_yaml(1, 16, false).replace("timelimit_hard: \"2:00:00\", ", "");

    let env = TestEnv::new();
    let task = slurm_task(&env, TaskFamily::Scf, adapter.clone(), false, true);
    write_qerr(&task, SLURM_TIME);
    assert_eq!(
        task.get_mut().fix_queue_critical().unwrap(),
        "increased number of cpus"
    );

    let env = TestEnv::new();
    let task = slurm_task(&env, TaskFamily::Scf, adapter, false, false);
    write_qerr(&task, SLURM_TIME);
    let mut task = task.get_mut();
    assert!(task.fix_queue_critical().is_err());
    assert_eq!(task.status(), Status::Error);
}

#[test]
fn test_node_failure() {
    let env = TestEnv::new();
    let task = slurm_task(
        &env,
        TaskFamily::Scf,
        slurm_adapter_yaml(1, 16, false),
        false,
        false,
    );
    write_qerr(&task, SLURM_NODE);
    let mut task = task.get_mut();
    assert_eq!(task.fix_queue_critical().unwrap(), "excluding nodes node07");
    assert_eq!(
        task.manager().unwrap().qadapter().excluded_nodes(),
        &["node07".to_string()]
    );
    assert_eq!(task.status(), Status::Ready);
}

#[test]
fn test_unknown_queue_error() {
    let env = TestEnv::new();
    let task = slurm_task(
        &env,
        TaskFamily::Scf,
        slurm_adapter_yaml(1, 16, false),
        false,
        false,
    );
    write_qerr(&task, "segmentation fault\n");
    let mut task = task.get_mut();
    let err = task.fix_queue_critical().unwrap_err();
    assert!(matches!(err, crate::Error::FixQueueCritical(_)));
    assert_eq!(task.status(), Status::Error);
    assert!(task.history().contains("no options left"));

    let env = TestEnv::new();
    let task = slurm_task(
        &env,
        TaskFamily::Scf,
        slurm_adapter_yaml(1, 16, false),
        true,
        false,
    );
    write_qerr(&task, "segmentation fault\n");
    let mut task = task.get_mut();
    assert_eq!(task.fix_queue_critical().unwrap(), "increased resources");
    assert_eq!(task.manager().unwrap().mpi_procs(), 2);
}

#[test]
fn test_no_queue_errors_recorded() {
    let env = TestEnv::new();
    let task = slurm_task(
        &env,
        TaskFamily::Scf,
        slurm_adapter_yaml(1, 16, false),
        false,
        false,
    );
    assert!(!task.get().dir().unwrap().qerr_file().exists());
    let mut task = task.get_mut();
    let err = task.fix_queue_critical().unwrap_err();
    assert!(matches!(err, crate::Error::FixQueueCritical(_)));
    assert_eq!(task.status(), Status::Error);
    assert!(task.history().contains("no options left"));
    assert!(task.queue_errors().is_empty());
    assert_eq!(task.num_restarts(), 0);
}
