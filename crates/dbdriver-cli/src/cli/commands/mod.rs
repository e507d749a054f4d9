//! CLI command handlers, one file per command.

mod config;
mod stress;

pub use config::run_config;
pub use stress::{run_stress, StressOptions};
