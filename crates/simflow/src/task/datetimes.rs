use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, TimeZone};

/// Timestamps of the current run of a task.
#[derive(Clone, Debug)]
pub struct TaskDateTimes {
    pub init: DateTime<Local>,
    pub submission: Option<DateTime<Local>>,
    pub start: Option<DateTime<Local>>,
    pub end: Option<DateTime<Local>>,
}

impl Default for TaskDateTimes {
    fn default() -> Self {
        TaskDateTimes {
            init: Local::now(),
            submission: None,
            start: None,
            end: None,
        }
    }
}

/// Interprets a timestamp read from the run log as local time.
pub fn local_datetime(datetime: NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(&datetime).earliest()
}

impl TaskDateTimes {
    pub fn reset(&mut self) {
        self.submission = None;
        self.start = None;
        self.end = None;
    }

    /// Time spent running, up to now if the run is not finished.
    pub fn get_runtime(&self) -> Option<TimeDelta> {
        let start = self.start?;
        Some(self.end.unwrap_or_else(Local::now) - start)
    }

    /// Time spent in the queue, up to now if the run did not start yet.
    pub fn get_time_inqueue(&self) -> Option<TimeDelta> {
        let submission = self.submission?;
        let delta = self.start.unwrap_or_else(Local::now) - submission;
        Some(delta.max(TimeDelta::zero()))
    }
}
