use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::types::ClusterConfig;

pub const CONFIG_FILE: &str = ".k3sbox.yaml";

/// Load config from `.k3sbox.yaml` in the given directory.
///
/// A missing file yields the defaults.
pub fn load(dir: &Path) -> Result<ClusterConfig> {
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(ClusterConfig::default());
    }
    load_file(&path)
}

/// Load config from an explicit file path.
pub fn load_file(path: &Path) -> Result<ClusterConfig> {
    let contents = std::fs::read_to_string(path)?;
    let mut config: ClusterConfig =
        serde_yaml::from_str(&contents).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    // Relative paths are relative to the config file, not the process cwd.
    if let Some(base) = path.parent() {
        config.workdir = anchor(base, &config.workdir);
        config.image_cache_dir = anchor(base, &config.image_cache_dir);
    }
    validate(path, &config)?;
    Ok(config)
}

fn anchor(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn validate(path: &Path, config: &ClusterConfig) -> Result<()> {
    let invalid = |reason: &str| Error::Config {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if config.name.trim().is_empty() {
        return Err(invalid("name cannot be blank"));
    }
    if config.image.trim().is_empty() {
        return Err(invalid("image cannot be blank"));
    }
    if config.timeouts.poll_interval_ms == 0 {
        return Err(invalid("timeouts.poll_interval_ms must be positive"));
    }
    if let Some(port) = config.ports.iter().find(|p| !p.contains(':')) {
        return Err(invalid(&format!("port '{port}' must be host:container")));
    }
    Ok(())
}
