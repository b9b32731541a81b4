pub mod common;
pub mod manager;
pub mod queue;
pub mod task;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::FlowError;
pub type Result<T> = std::result::Result<T, Error>;

// Reexports
pub use simcore;
pub use simcore::{Map, Set, Status, TaskId, Vars, WeakRcRefCell, WrappedRcRefCell};
