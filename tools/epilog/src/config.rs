use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::EpilogError;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub query: QueryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryConfig {
    pub default_limit: u32,
    pub max_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub budget_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                db_path: PathBuf::from(".cache/epilog/episodes.sqlite"),
            },
            query: QueryConfig {
                default_limit: 50,
                max_limit: 500,
            },
            logging: LoggingConfig {
                dir: PathBuf::from(".cache/epilog/logs"),
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

impl AppConfig {
    /// Clamps a requested list limit into the configured 1..=max range,
    /// falling back to the default when none was requested.
    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.query.default_limit)
            .clamp(1, self.query.max_limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    storage: Option<PartialStorageConfig>,
    query: Option<PartialQueryConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStorageConfig {
    db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialQueryConfig {
    default_limit: Option<u32>,
    max_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    dir: Option<PathBuf>,
    budget_bytes: Option<u64>,
}

pub fn load_config(overrides: &CliOverrides) -> Result<AppConfig, EpilogError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = read_config_file(path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| EpilogError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<String, EpilogError> {
    std::fs::read_to_string(path).map_err(|e| {
        EpilogError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
    })
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(storage) = partial.storage {
        if let Some(db_path) = storage.db_path {
            cfg.storage.db_path = db_path;
        }
    }

    if let Some(query) = partial.query {
        if let Some(default_limit) = query.default_limit {
            cfg.query.default_limit = default_limit;
        }
        if let Some(max_limit) = query.max_limit {
            cfg.query.max_limit = max_limit;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(dir) = logging.dir {
            cfg.logging.dir = dir;
        }
        if let Some(budget_bytes) = logging.budget_bytes {
            cfg.logging.budget_bytes = budget_bytes;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(db_path) = &overrides.db_path {
        cfg.storage.db_path = db_path.clone();
    }
    if let Some(log_dir) = &overrides.log_dir {
        cfg.logging.dir = log_dir.clone();
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), EpilogError> {
    if cfg.query.max_limit == 0 {
        return Err(EpilogError::InvalidConfig(
            "query.max_limit must be at least 1".to_string(),
        ));
    }
    if cfg.query.default_limit == 0 || cfg.query.default_limit > cfg.query.max_limit {
        return Err(EpilogError::InvalidConfig(format!(
            "query.default_limit must be in 1..={}",
            cfg.query.max_limit
        )));
    }
    Ok(())
}
