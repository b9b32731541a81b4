pub mod utils;

mod test_recovery;
