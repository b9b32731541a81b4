use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Progress of a task.
///
/// Variants are ordered by progress, so `status >= Status::Submitted` reads as
/// "the task has at least been submitted".
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    Init,
    Locked,
    Ready,
    Submitted,
    Running,
    /// The external process exited. Not terminal.
    Done,
    AbiCritical,
    QCritical,
    Error,
    Unconverged,
    Ok,
}

impl Status {
    pub const ALL: [Status; 11] = [
        Status::Init,
        Status::Locked,
        Status::Ready,
        Status::Submitted,
        Status::Running,
        Status::Done,
        Status::AbiCritical,
        Status::QCritical,
        Status::Error,
        Status::Unconverged,
        Status::Ok,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Init => "Initialized",
            Status::Locked => "Locked",
            Status::Ready => "Ready",
            Status::Submitted => "Submitted",
            Status::Running => "Running",
            Status::Done => "Done",
            Status::AbiCritical => "AbiCritical",
            Status::QCritical => "QCritical",
            Status::Error => "Error",
            Status::Unconverged => "Unconverged",
            Status::Ok => "Completed",
        }
    }

    /// Failure states that require a fix before the task can progress.
    pub fn is_critical(&self) -> bool {
        matches!(self, Status::AbiCritical | Status::QCritical | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| crate::Error::GenericError(format!("Unknown status `{s}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn test_status_ordering() {
        assert!(Status::Init < Status::Locked);
        assert!(Status::Locked < Status::Ready);
        assert!(Status::Submitted < Status::Running);
        assert!(Status::Done < Status::AbiCritical);
        assert!(Status::QCritical < Status::Error);
        assert!(Status::Unconverged < Status::Ok);
        let mut sorted = Status::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Status::ALL.to_vec());
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("completed".parse::<Status>().unwrap(), Status::Ok);
        assert_eq!("QCritical".parse::<Status>().unwrap(), Status::QCritical);
        assert!("foo".parse::<Status>().is_err());
    }

    #[test]
    fn test_critical_states() {
        assert!(Status::Error.is_critical());
        assert!(!Status::Unconverged.is_critical());
        assert!(!Status::Ok.is_critical());
    }
}
