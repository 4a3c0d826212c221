// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{JobgraphError, Result};
use crate::types::StoreMode;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = JobgraphError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.engine, raw.store))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_engine(cfg)?;
    validate_store(cfg)?;
    Ok(())
}

fn validate_engine(cfg: &RawConfigFile) -> Result<()> {
    if cfg.engine.worker_count == 0 {
        return Err(JobgraphError::ConfigError(
            "[engine].worker_count must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.engine.event_buffer == 0 {
        return Err(JobgraphError::ConfigError(
            "[engine].event_buffer must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_store(cfg: &RawConfigFile) -> Result<()> {
    if cfg.store.mode == StoreMode::File && cfg.store.path.as_os_str().is_empty() {
        return Err(JobgraphError::ConfigError(
            "[store].path must be set when mode = \"file\"".to_string(),
        ));
    }
    Ok(())
}
