pub mod logger;

pub use logger::{RoundLog, RunLog, RunLogger};
