use crate::common::timeutils::format_duration;
use crate::queue::common::{
    check_command_output, output_text, param_to_string, run_command,
};
use crate::queue::errors::parse_pbs_errors;
use crate::queue::process::CompletedProcess;
use crate::queue::{
    HeaderParams, JobFiles, QueueError, QueueHandler, QueueKind, SubmitResult, script_dir,
};

pub struct PbsHandler;

pub fn build_pbs_header(params: &HeaderParams) -> String {
    let mut lines = vec![format!("#PBS -N {}", params.job_name)];
    if !params.qname.is_empty() {
        lines.push(format!("#PBS -q {}", params.qname));
    }
    let chunks = params.num_nodes.unwrap_or(params.mpi_procs);
    let mpi_per_chunk = params.mpi_procs.div_ceil(chunks.max(1));
    let mut select = format!(
        "#PBS -l select={chunks}:ncpus={}:mpiprocs={mpi_per_chunk}:ompthreads={}",
        mpi_per_chunk * params.omp_threads,
        params.omp_threads
    );
    if params.mem_per_proc > 0.0 {
        select.push_str(&format!(
            ":mem={}mb",
            (params.mem_per_proc * mpi_per_chunk as f64).ceil() as u64
        ));
    }
    lines.push(select);
    lines.push(format!(
        "#PBS -l walltime={}",
        format_duration(&params.timelimit)
    ));
    for (key, value) in params.qparams {
        lines.push(format!("#PBS -l {key}={}", param_to_string(value)));
    }
    lines.push(format!("#PBS -o {}", params.qout_path.display()));
    lines.push(format!("#PBS -e {}", params.qerr_path.display()));
    lines.join("\n")
}

impl QueueHandler for PbsHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Pbs
    }

    fn header(&self, params: &HeaderParams) -> String {
        build_pbs_header(params)
    }

    fn submit(&self, files: &JobFiles) -> crate::Result<SubmitResult> {
        let script = files.script.display().to_string();
        let output = run_command(&["qsub", &script], &script_dir(files.script))?;
        let returncode = output.status.code().unwrap_or(-1);
        let stdout = output_text(&output.stdout);
        let stderr = output_text(&output.stderr);
        log::debug!("Qsub output: {stdout}");

        let qid = if output.status.success() && !stdout.is_empty() {
            stdout.lines().next().map(|l| l.trim().to_string())
        } else {
            log::error!("qsub failed with exit code {returncode}: {stderr}");
            None
        };
        Ok(SubmitResult {
            qid,
            process: Box::new(CompletedProcess::new(returncode, stdout, stderr)),
        })
    }

    fn cancel(&self, qid: &str) -> crate::Result<i32> {
        let output = run_command(&["qdel", qid], &std::env::temp_dir())?;
        Ok(output.status.code().unwrap_or(-1))
    }

    fn njobs_in_queue(&self, username: &str) -> Option<usize> {
        let result = run_command(&["qstat", "-u", username], &std::env::temp_dir())
            .and_then(check_command_output);
        match result {
            Ok(output) => Some(
                output_text(&output.stdout)
                    .lines()
                    .filter(|l| l.trim_start().starts_with(|c: char| c.is_ascii_digit()))
                    .count(),
            ),
            Err(e) => {
                log::warn!("Cannot get the number of jobs in the queue: {e:?}");
                None
            }
        }
    }

    fn parse_errors(&self, qout: &str, qerr: &str) -> Vec<QueueError> {
        parse_pbs_errors(qout, qerr)
    }
}
