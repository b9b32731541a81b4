//! Structured events reported by the external program in its run log.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::Vars;
use crate::doc::{TaggedDoc, tagged_docs};

/// Tag of the document written when a run terminates normally.
pub const FINAL_SUMMARY_TAG: &str = "FinalSummary";

const DATETIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Info,
    Warning,
    Error,
    Bug,
}

impl EventKind {
    /// Classifies a document tag. Tags that do not describe an event return `None`.
    pub fn from_tag(tag: &str) -> Option<EventKind> {
        match tag {
            "COMMENT" => Some(EventKind::Info),
            "WARNING" => Some(EventKind::Warning),
            "ERROR" => Some(EventKind::Error),
            "BUG" => Some(EventKind::Bug),
            t if t.ends_with("Comment") => Some(EventKind::Info),
            t if t.ends_with("Warning") => Some(EventKind::Warning),
            t if t.ends_with("Error") => Some(EventKind::Error),
            t if t.ends_with("Bug") => Some(EventKind::Bug),
            _ => None,
        }
    }

    fn is_base_tag(tag: &str) -> bool {
        matches!(tag, "COMMENT" | "WARNING" | "ERROR" | "BUG")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Specialized event name (e.g. `ScfConvergenceWarning`) or `other`.
    pub class_tag: String,
    pub message: String,
    pub src_file: Option<String>,
    pub src_line: Option<u64>,
    /// Remaining keys of the event document
    pub data: Vars,
}

impl Event {
    pub const OTHER: &'static str = "other";

    pub fn new(kind: EventKind, class_tag: &str, message: &str) -> Self {
        Event {
            kind,
            class_tag: class_tag.to_string(),
            message: message.to_string(),
            src_file: None,
            src_line: None,
            data: Vars::new(),
        }
    }

    fn from_doc(doc: &TaggedDoc) -> Option<Self> {
        let kind = EventKind::from_tag(&doc.tag)?;
        let class_tag = if EventKind::is_base_tag(&doc.tag) {
            Event::OTHER
        } else {
            doc.tag.as_str()
        };
        let mut event = Event::new(kind, class_tag, "");
        match doc.parse_body::<Vars>() {
            Ok(mut data) => {
                event.message = match data.remove("message") {
                    Some(serde_json::Value::String(message)) => message,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                event.src_file = data
                    .remove("src_file")
                    .and_then(|v| v.as_str().map(|s| s.to_string()));
                event.src_line = data.remove("src_line").and_then(|v| v.as_u64());
                event.data = data;
            }
            Err(e) => {
                log::debug!("Event at line {} is not valid YAML: {e}", doc.line);
                event.message = doc.body.clone();
            }
        }
        Some(event)
    }

    pub fn is_critical_for(&self, kinds: &[&str]) -> bool {
        kinds.contains(&self.class_tag.as_str())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.class_tag)?;
        if let (Some(file), Some(line)) = (&self.src_file, self.src_line) {
            write!(f, " ({file}:{line})")?;
        }
        write!(f, ": {}", self.message.trim())
    }
}

#[derive(Deserialize)]
struct FinalSummary {
    start_datetime: Option<String>,
    end_datetime: Option<String>,
}

/// Events extracted from one run of the external program.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    pub filename: PathBuf,
    pub events: Vec<Event>,
    pub run_completed: bool,
    pub start_datetime: Option<NaiveDateTime>,
    pub end_datetime: Option<NaiveDateTime>,
}

fn parse_datetime(value: Option<&str>) -> Option<NaiveDateTime> {
    let value = value?;
    match NaiveDateTime::parse_from_str(value.trim(), DATETIME_FORMAT) {
        Ok(datetime) => Some(datetime),
        Err(e) => {
            log::warn!("Cannot parse datetime `{value}`: {e}");
            None
        }
    }
}

impl EventReport {
    /// Parses the text of a run log.
    pub fn parse(text: &str, filename: &Path) -> Self {
        let mut report = EventReport {
            filename: filename.to_path_buf(),
            ..Default::default()
        };
        for doc in tagged_docs(text) {
            if doc.tag == FINAL_SUMMARY_TAG {
                report.run_completed = true;
                match doc.parse_body::<FinalSummary>() {
                    Ok(summary) => {
                        report.start_datetime = parse_datetime(summary.start_datetime.as_deref());
                        report.end_datetime = parse_datetime(summary.end_datetime.as_deref());
                    }
                    Err(e) => log::warn!("Invalid {FINAL_SUMMARY_TAG} in {filename:?}: {e}"),
                }
            } else if let Some(event) = Event::from_doc(&doc) {
                report.events.push(event);
            }
        }
        if !report.run_completed && text.lines().any(|l| l.trim() == "Calculation completed.") {
            report.run_completed = true;
        }
        report
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text, path))
    }

    pub fn append(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn filter_kind(&self, kind: EventKind) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    pub fn comments(&self) -> Vec<&Event> {
        self.filter_kind(EventKind::Info).collect()
    }

    pub fn warnings(&self) -> Vec<&Event> {
        self.filter_kind(EventKind::Warning).collect()
    }

    pub fn errors(&self) -> Vec<&Event> {
        self.filter_kind(EventKind::Error).collect()
    }

    pub fn bugs(&self) -> Vec<&Event> {
        self.filter_kind(EventKind::Bug).collect()
    }

    /// Error and bug events.
    pub fn failures(&self) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.kind >= EventKind::Error)
            .collect()
    }

    pub fn critical_events(&self, kinds: &[&str]) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.is_critical_for(kinds))
            .collect()
    }
}

impl fmt::Display for EventReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: completed={}, {} comments, {} warnings, {} errors, {} bugs",
            self.filename.display(),
            self.run_completed,
            self.comments().len(),
            self.warnings().len(),
            self.errors().len(),
            self.bugs().len()
        )?;
        for event in &self.events {
            writeln!(f, "{event}")?;
        }
        Ok(())
    }
}
