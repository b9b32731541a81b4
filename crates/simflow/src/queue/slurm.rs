use crate::common::timeutils::format_slurm_time;
use crate::queue::common::{
    check_command_output, output_text, param_to_string, run_command,
};
use crate::queue::errors::parse_slurm_errors;
use crate::queue::process::CompletedProcess;
use crate::queue::{
    HeaderParams, JobFiles, QueueError, QueueHandler, QueueKind, SubmitResult, script_dir,
};

pub struct SlurmHandler;

pub fn build_slurm_header(params: &HeaderParams) -> String {
    let mut lines = vec![format!("#SBATCH --job-name={}", params.job_name)];
    if !params.qname.is_empty() {
        lines.push(format!("#SBATCH --partition={}", params.qname));
    }
    if let Some(nodes) = params.num_nodes {
        lines.push(format!("#SBATCH --nodes={nodes}"));
    }
    lines.push(format!("#SBATCH --ntasks={}", params.mpi_procs));
    lines.push(format!("#SBATCH --cpus-per-task={}", params.omp_threads));
    if params.mem_per_proc > 0.0 {
        lines.push(format!(
            "#SBATCH --mem-per-cpu={}M",
            params.mem_per_proc.ceil() as u64
        ));
    }
    lines.push(format!(
        "#SBATCH --time={}",
        format_slurm_time(&params.timelimit)
    ));
    if !params.exclude_nodes.is_empty() {
        lines.push(format!(
            "#SBATCH --exclude={}",
            params.exclude_nodes.join(",")
        ));
    }
    for (key, value) in params.qparams {
        lines.push(format!("#SBATCH --{key}={}", param_to_string(value)));
    }
    lines.push(format!("#SBATCH --output={}", params.qout_path.display()));
    lines.push(format!("#SBATCH --error={}", params.qerr_path.display()));
    lines.join("\n")
}

pub fn parse_sbatch_output(output: &str) -> Option<String> {
    output
        .lines()
        .map(|l| l.trim())
        .find(|l| l.to_lowercase().starts_with("submitted batch job"))
        .and_then(|l| l.split(' ').nth(3))
        .map(|l| l.to_string())
}

impl QueueHandler for SlurmHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Slurm
    }

    fn header(&self, params: &HeaderParams) -> String {
        build_slurm_header(params)
    }

    fn submit(&self, files: &JobFiles) -> crate::Result<SubmitResult> {
        let script = files.script.display().to_string();
        let output = run_command(&["sbatch", &script], &script_dir(files.script))?;
        let returncode = output.status.code().unwrap_or(-1);
        let stdout = output_text(&output.stdout);
        let stderr = output_text(&output.stderr);
        log::debug!("Sbatch output: {stdout}");

        let qid = if output.status.success() {
            let qid = parse_sbatch_output(&stdout);
            if qid.is_none() {
                log::error!("Missing job id in sbatch output\n{stdout}");
            }
            qid
        } else {
            log::error!("sbatch failed with exit code {returncode}: {stderr}");
            None
        };
        Ok(SubmitResult {
            qid,
            process: Box::new(CompletedProcess::new(returncode, stdout, stderr)),
        })
    }

    fn cancel(&self, qid: &str) -> crate::Result<i32> {
        let output = run_command(&["scancel", qid], &std::env::temp_dir())?;
        Ok(output.status.code().unwrap_or(-1))
    }

    fn njobs_in_queue(&self, username: &str) -> Option<usize> {
        let result = run_command(
            &["squeue", "-h", "-u", username, "-o", "%i"],
            &std::env::temp_dir(),
        )
        .and_then(check_command_output);
        match result {
            Ok(output) => Some(
                output_text(&output.stdout)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .count(),
            ),
            Err(e) => {
                log::warn!("Cannot get the number of jobs in the queue: {e:?}");
                None
            }
        }
    }

    fn parse_errors(&self, qout: &str, qerr: &str) -> Vec<QueueError> {
        parse_slurm_errors(qout, qerr)
    }

    fn supports_exclude_nodes(&self) -> bool {
        true
    }
}
