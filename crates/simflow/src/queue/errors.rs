use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Failure reported by a queue backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueError {
    /// The job died because of a faulty node; `nodes` is empty when the node is not known.
    NodeFailure { nodes: Vec<String> },
    /// The job was killed for exceeding its memory request.
    MemoryCancel,
    /// The job was killed for exceeding its walltime.
    TimeCancel,
    /// Something the backend complained about that we cannot classify.
    Unknown(String),
}

impl QueueError {
    pub fn is_unknown(&self) -> bool {
        matches!(self, QueueError::Unknown(_))
    }
}

impl Display for QueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::NodeFailure { nodes } if nodes.is_empty() => {
                f.write_str("node failure (unknown node)")
            }
            QueueError::NodeFailure { nodes } => write!(f, "node failure on {}", nodes.join(",")),
            QueueError::MemoryCancel => f.write_str("memory cancel"),
            QueueError::TimeCancel => f.write_str("time cancel"),
            QueueError::Unknown(msg) => write!(f, "unknown queue error: {msg}"),
        }
    }
}

pub(crate) fn push_unique(errors: &mut Vec<QueueError>, error: QueueError) {
    if let QueueError::NodeFailure { nodes: new_nodes } = &error {
        if let Some(QueueError::NodeFailure { nodes }) = errors
            .iter_mut()
            .find(|e| matches!(e, QueueError::NodeFailure { .. }))
        {
            for node in new_nodes {
                if !nodes.contains(node) {
                    nodes.push(node.clone());
                }
            }
            return;
        }
    }
    if !errors.contains(&error) {
        errors.push(error);
    }
}

fn clean_node_name(name: &str) -> String {
    name.trim_matches(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .to_string()
}

/// `*** JOB 1234 ON node01 CANCELLED AT ... DUE TO NODE FAILURE ***`
fn job_line_node(line: &str) -> Option<String> {
    let rest = line.split_once("*** JOB ")?.1;
    let rest = rest.split_once(" ON ")?.1;
    rest.split_whitespace()
        .next()
        .map(clean_node_name)
        .filter(|node| !node.is_empty())
}

/// Scans the Slurm stdout/stderr of a job.
pub fn parse_slurm_errors(qout: &str, qerr: &str) -> Vec<QueueError> {
    let mut errors = Vec::new();
    for line in qerr.lines().chain(qout.lines()) {
        let lower = line.to_lowercase();
        if line.contains("DUE TO TIME LIMIT") {
            push_unique(&mut errors, QueueError::TimeCancel);
        } else if lower.contains("exceeded memory limit")
            || lower.contains("exceeded job memory limit")
            || lower.contains("oom-kill")
        {
            push_unique(&mut errors, QueueError::MemoryCancel);
        } else if line.contains("DUE TO NODE FAILURE") {
            let nodes = job_line_node(line).into_iter().collect();
            push_unique(&mut errors, QueueError::NodeFailure { nodes });
        } else if let Some((_, node)) = line.split_once("Node failure on ") {
            let nodes = node
                .split_whitespace()
                .next()
                .map(clean_node_name)
                .into_iter()
                .filter(|n| !n.is_empty())
                .collect();
            push_unique(&mut errors, QueueError::NodeFailure { nodes });
        }
    }
    if errors.is_empty() && !qerr.trim().is_empty() {
        errors.push(QueueError::Unknown(qerr.trim().to_string()));
    }
    errors
}

/// Scans the PBS stdout/stderr of a job.
pub fn parse_pbs_errors(qout: &str, qerr: &str) -> Vec<QueueError> {
    let mut errors = Vec::new();
    for line in qerr.lines().chain(qout.lines()) {
        if line.contains("=>> PBS: job killed: walltime") {
            push_unique(&mut errors, QueueError::TimeCancel);
        } else if line.contains("job killed: mem") || line.contains("job killed: vmem") {
            push_unique(&mut errors, QueueError::MemoryCancel);
        }
    }
    if errors.is_empty() && !qerr.trim().is_empty() {
        errors.push(QueueError::Unknown(qerr.trim().to_string()));
    }
    errors
}
