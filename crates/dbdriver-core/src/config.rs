use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Retry policy parameters (`[retry]` section in config.toml).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts per operation (including the first).
    pub max_attempts: u32,
    /// Base delay of the fast profile (unavailable, undetermined), in ms.
    pub fast_base_ms: u64,
    /// Upper bound of the fast profile, in ms.
    pub fast_cap_ms: u64,
    /// Base delay of the slow profile (overloaded), in ms.
    pub slow_base_ms: u64,
    /// Upper bound of the slow profile, in ms.
    pub slow_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            fast_base_ms: 5,
            fast_cap_ms: 500,
            slow_base_ms: 50,
            slow_cap_ms: 5_000,
        }
    }
}

/// Session pool parameters (`[pool]` section in config.toml).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of sessions, counting creations in flight.
    pub size_limit: usize,
    /// Attempts per session creation; kept small so pool growth never stalls.
    pub creation_max_attempts: u32,
    /// Per-attempt deadline for `CreateSession`, in ms.
    pub create_timeout_ms: u64,
    /// Deadline for a best-effort `DeleteSession`, in ms.
    pub delete_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size_limit: 50,
            creation_max_attempts: 3,
            create_timeout_ms: 10_000,
            delete_timeout_ms: 5_000,
        }
    }
}

/// Driver configuration loaded from `~/.config/dbdriver/config.toml`.
///
/// Values are passed explicitly to each pool; nothing here is global.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("dbdriver")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<DriverConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = DriverConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    load_from_path(&path)
}

/// Load configuration from an explicit file.
pub fn load_from_path(path: &Path) -> Result<DriverConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let cfg: DriverConfig =
        toml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.pool.size_limit, 50);
        assert_eq!(cfg.pool.creation_max_attempts, 3);
        assert_eq!(cfg.retry.max_attempts, 10);
        assert_eq!(cfg.retry.fast_base_ms, 5);
        assert_eq!(cfg.retry.slow_cap_ms, 5_000);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = DriverConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: DriverConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn config_toml_partial_sections_fall_back_to_defaults() {
        let toml = r#"
            [pool]
            size_limit = 8

            [retry]
            max_attempts = 4
            slow_cap_ms = 2000
        "#;
        let cfg: DriverConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.pool.size_limit, 8);
        assert_eq!(cfg.pool.creation_max_attempts, 3);
        assert_eq!(cfg.retry.max_attempts, 4);
        assert_eq!(cfg.retry.slow_cap_ms, 2000);
        assert_eq!(cfg.retry.fast_base_ms, 5);
    }

    #[test]
    fn config_toml_empty_is_default() {
        let cfg: DriverConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, DriverConfig::default());
    }

    #[test]
    fn load_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[pool]\nsize_limit = 2\ndelete_timeout_ms = 100\n").unwrap();
        let cfg = load_from_path(&path).unwrap();
        assert_eq!(cfg.pool.size_limit, 2);
        assert_eq!(cfg.pool.delete_timeout_ms, 100);
    }

    #[test]
    fn load_from_path_reports_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[pool\nsize_limit = ").unwrap();
        let err = load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config"));
    }
}
