pub mod error;
pub mod fsutils;
pub mod parser;
pub mod setup;
pub mod size;
pub mod timeutils;
