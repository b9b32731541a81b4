mod condition;
mod conf;
mod hints;
pub mod histogram;
mod policy;

pub use condition::Condition;
pub use conf::ResourceConfiguration;
pub use hints::{AUTOPARAL_TAG, HintInfo, HintSet};
pub use policy::{MetaPriority, Precedence, RankingField, RankingPriority, SelectionPolicy};
