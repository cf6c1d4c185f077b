use std::path::{Path, PathBuf};

use super::types::AppConfig;

/// Get the default seqflow data directory: ~/.seqflow
pub fn get_seqflow_data_dir() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(PathBuf::from(home).join(".seqflow"))
}

pub fn load_default() -> anyhow::Result<AppConfig> {
    // Priority 1: ~/.seqflow/config.toml (highest)
    let data_dir = get_seqflow_data_dir()?;
    let user_config = data_dir.join("config.toml");

    // Priority 2: ./config.toml (current directory)
    let local_config = Path::new("config.toml");

    let mut cfg: AppConfig = if user_config.exists() {
        let s = std::fs::read_to_string(&user_config)?;
        toml::from_str::<AppConfig>(&s)?
    } else if local_config.exists() {
        let s = std::fs::read_to_string(local_config)?;
        toml::from_str::<AppConfig>(&s)?
    } else {
        AppConfig::default()
    };

    // Use the data directory for log files if none was configured.
    if cfg.logging.file
        && cfg
            .logging
            .directory
            .as_deref()
            .map(|s| s.trim().is_empty())
            .unwrap_or(true)
    {
        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        cfg.logging.directory = Some(logs_dir.to_string_lossy().to_string());
    }

    // Environment variable overrides (Priority 0: highest)
    if let Ok(v) = std::env::var("SEQFLOW_LOG_LEVEL") {
        if !v.trim().is_empty() {
            cfg.logging.level = v;
        }
    }
    if let Ok(v) = std::env::var("SEQFLOW_FETCH_TIMEOUT_SECS") {
        if let Ok(secs) = v.trim().parse::<u64>() {
            cfg.fetch.request_timeout_secs = secs;
        }
    }
    if let Ok(v) = std::env::var("SEQFLOW_CONSOLE_ENCODING") {
        if !v.trim().is_empty() {
            cfg.process.console_encoding = v;
        }
    }

    Ok(cfg)
}
