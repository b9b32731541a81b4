use chrono::{DateTime, Local};
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug)]
pub struct HistoryRecord {
    pub time: DateTime<Local>,
    pub level: log::Level,
    pub message: String,
}

impl Display for HistoryRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.time.format("%a %b %d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Chronological log of a task. Every record is forwarded to `log` with the owner's name.
#[derive(Clone, Debug, Default)]
pub struct TaskHistory {
    owner: String,
    records: Vec<HistoryRecord>,
}

impl TaskHistory {
    pub fn new(owner: &str) -> Self {
        TaskHistory {
            owner: owner.to_string(),
            records: Vec::new(),
        }
    }

    fn push(&mut self, level: log::Level, message: String) {
        log::log!(level, "{}: {}", self.owner, message);
        self.records.push(HistoryRecord {
            time: Local::now(),
            level,
            message,
        });
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.push(log::Level::Debug, message.into());
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(log::Level::Info, message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.push(log::Level::Warn, message.into());
    }

    pub fn critical(&mut self, message: impl Into<String>) {
        self.push(log::Level::Error, message.into());
    }

    /// Removes the last record.
    pub fn pop(&mut self) -> Option<HistoryRecord> {
        self.records.pop()
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&HistoryRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.records.iter().any(|r| r.message.contains(needle))
    }
}

impl Display for TaskHistory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for record in &self.records {
            writeln!(f, "{record}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TaskHistory;

    #[test]
    fn test_history() {
        let mut history = TaskHistory::new("t0");
        history.info("submitted");
        history.warning("slow");
        assert_eq!(history.len(), 2);
        assert!(history.contains("slow"));
        assert_eq!(history.pop().unwrap().level, log::Level::Warn);
        assert_eq!(history.last().unwrap().message, "submitted");
        assert!(history.to_string().contains("INFO: submitted"));
    }
}
