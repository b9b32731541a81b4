//! Fixes for errors reported by the external program.

use serde_json::Value;
use std::fmt::Debug;

use crate::task::Task;
use simcore::events::Event;

/// Reacts to one class of events by changing the input of the task.
pub trait EventHandler: Debug {
    /// Class tag of the events handled by this handler.
    fn event_class(&self) -> &str;

    fn can_handle(&self, event: &Event) -> bool {
        event.class_tag == self.event_class()
    }

    /// Returns `Ok(true)` if the input of the task was changed so that a new run may succeed.
    fn handle_task_event(&mut self, task: &mut Task, event: &Event) -> crate::Result<bool>;

    /// Maximum number of fixes this handler applies to a single task.
    fn max_fixes(&self) -> u32 {
        3
    }
}

/// Loosens the tolerance of the symmetry finder.
#[derive(Debug, Default)]
pub struct TolSymErrorHandler {
    nfixes: u32,
}

impl TolSymErrorHandler {
    const DEFAULT_TOLSYM: f64 = 1e-8;
    const MAX_TOLSYM: f64 = 1e-4;
}

impl EventHandler for TolSymErrorHandler {
    fn event_class(&self) -> &str {
        "TolSymError"
    }

    fn handle_task_event(&mut self, task: &mut Task, _event: &Event) -> crate::Result<bool> {
        if self.nfixes >= self.max_fixes() {
            return Ok(false);
        }
        let old = task
            .get_inpvar("tolsym")
            .and_then(Value::as_f64)
            .unwrap_or(Self::DEFAULT_TOLSYM);
        let new = old * 10.0;
        if new > Self::MAX_TOLSYM {
            task.history
                .warning(format!("tolsym {old} cannot be increased any further"));
            return Ok(false);
        }
        task.set_var("tolsym", new.into());
        task.history.info(format!("Increased tolsym from {old} to {new}"));
        self.nfixes += 1;
        Ok(true)
    }
}

/// Disables the memory test of the external program.
#[derive(Debug, Default)]
pub struct MemanaErrorHandler {
    nfixes: u32,
}

impl EventHandler for MemanaErrorHandler {
    fn event_class(&self) -> &str {
        "MemanaError"
    }

    fn handle_task_event(&mut self, task: &mut Task, _event: &Event) -> crate::Result<bool> {
        if self.nfixes >= self.max_fixes() || task.get_inpvar("mem_test") == Some(&Value::from(0)) {
            return Ok(false);
        }
        task.set_var("mem_test", 0.into());
        task.history.info("Disabled the memory test (mem_test 0)");
        self.nfixes += 1;
        Ok(true)
    }

    fn max_fixes(&self) -> u32 {
        1
    }
}

/// Handlers installed on every new task.
pub fn default_handlers() -> Vec<Box<dyn EventHandler>> {
    vec![
        Box::new(TolSymErrorHandler::default()),
        Box::new(MemanaErrorHandler::default()),
    ]
}

#[cfg(test)]
mod tests {
    use super::{EventHandler, MemanaErrorHandler, TolSymErrorHandler};
    use crate::task::family::TaskFamily;
    use crate::tests::utils::{TestEnv, scf_input};
    use serde_json::json;
    use simcore::events::{Event, EventKind};

    #[test]
    fn test_tolsym_handler() {
        let env = TestEnv::new();
        let task = env.task("t", TaskFamily::Scf, scf_input());
        let mut task = task.get_mut();
        let event = Event::new(EventKind::Error, "TolSymError", "symmetry");
        let mut handler = TolSymErrorHandler::default();
        assert!(handler.can_handle(&event));
        assert!(!handler.can_handle(&Event::new(EventKind::Error, "MemanaError", "")));

        assert!(handler.handle_task_event(&mut task, &event).unwrap());
        let tolsym = task.get_inpvar("tolsym").and_then(|v| v.as_f64()).unwrap();
        assert!((tolsym - 1e-7).abs() < 1e-12);

        task.set_var("tolsym", json!(1e-4));
        assert!(!handler.handle_task_event(&mut task, &event).unwrap());
    }

    #[test]
    fn test_memana_handler() {
        let env = TestEnv::new();
        let task = env.task("t", TaskFamily::Scf, scf_input());
        let mut task = task.get_mut();
        let event = Event::new(EventKind::Error, "MemanaError", "not enough memory");
        let mut handler = MemanaErrorHandler::default();
        assert!(handler.handle_task_event(&mut task, &event).unwrap());
        assert_eq!(task.get_inpvar("mem_test"), Some(&json!(0)));
        assert!(!handler.handle_task_event(&mut task, &event).unwrap());
    }
}
