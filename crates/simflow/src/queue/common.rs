use std::path::Path;
use std::process::{Command, Output};

use anyhow::Context;
use bstr::ByteSlice;

pub fn create_command(arguments: &[&str], workdir: &Path) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command.current_dir(workdir);
    command
}

/// Runs the command and waits for it, without interpreting the exit status.
pub fn run_command(arguments: &[&str], workdir: &Path) -> anyhow::Result<Output> {
    log::debug!("Running command `{}`", arguments.join(" "));
    create_command(arguments, workdir)
        .output()
        .with_context(|| format!("{} start failed", arguments[0]))
}

pub fn check_command_output(output: Output) -> anyhow::Result<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

pub fn output_text(bytes: &[u8]) -> String {
    bytes.to_str_lossy().trim().to_string()
}

/// Renders a YAML/JSON scalar as it should appear in a script header.
pub fn param_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
