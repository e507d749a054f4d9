//! `dbdriver config` – show where the config lives and what is in effect.

use anyhow::Result;
use dbdriver_core::config::{self, DriverConfig};
use std::path::Path;

pub fn run_config(cfg: &DriverConfig, explicit: Option<&Path>) -> Result<()> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => config::config_path()?,
    };
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(cfg)?);
    Ok(())
}
