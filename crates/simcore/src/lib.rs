pub mod common;

pub mod doc;
pub mod events;
pub mod resources;
pub mod status;

pub use crate::common::ids::TaskId;
pub use crate::common::{Map, Set, Vars, WeakRcRefCell, WrappedRcRefCell};
pub use crate::status::Status;

pub type Error = common::error::DsError;
pub type Result<T> = std::result::Result<T, Error>;
