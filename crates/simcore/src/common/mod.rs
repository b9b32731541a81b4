pub use wrapped::{WeakRcRefCell, WrappedRcRefCell};

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

/// Free-form variables attached to inputs and configurations.
pub type Vars = serde_json::Map<String, serde_json::Value>;

pub mod error;
pub mod ids;
mod wrapped;
