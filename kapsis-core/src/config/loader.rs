//! Configuration file loading and merging

use super::builtin;
use super::schema::Config;
use crate::error::ConfigError;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "KAPSIS_CONFIG";

/// Environment variable overriding the audit log location
pub const AUDIT_LOG_ENV: &str = "KAPSIS_AUDIT_LOG";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Find user config by checking environment and standard locations
    pub fn find_user_config() -> Option<PathBuf> {
        // 1. $KAPSIS_CONFIG
        if let Ok(path) = env::var(CONFIG_ENV) {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }

        // 2. $XDG_CONFIG_HOME/kapsis/scope.toml
        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            let p = PathBuf::from(xdg).join("kapsis/scope.toml");
            if p.exists() {
                return Some(p);
            }
        }

        // 3. ~/.config/kapsis/scope.toml
        if let Ok(home) = env::var("HOME") {
            let p = PathBuf::from(home).join(".config/kapsis/scope.toml");
            if p.exists() {
                return Some(p);
            }
        }

        None
    }

    /// Load config from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&contents)?;
        config.rules.validate()?;
        Ok(config)
    }

    /// Merge an override layer on top of a base layer
    ///
    /// Rule lists are extended, never replaced, so a user layer can add
    /// blocked entries but cannot silently drop builtin ones. Scalar
    /// settings from the override win when present.
    pub fn merge_configs(mut base: Config, override_cfg: Config) -> Config {
        base.rules.extend(override_cfg.rules);

        if override_cfg.audit.log_path.is_some() {
            base.audit.log_path = override_cfg.audit.log_path;
        }
        if override_cfg.sandbox.root.is_some() {
            base.sandbox.root = override_cfg.sandbox.root;
        }

        base
    }

    /// Load with full priority order: built-in < user < explicit
    pub fn load_with_priority(explicit_config: Option<PathBuf>) -> Result<Config, ConfigError> {
        let mut config = builtin::get_builtin().clone();

        if let Some(user_path) = Self::find_user_config() {
            tracing::debug!("Loading user config from {:?}", user_path);
            config = Self::merge_configs(config, Self::load_from_file(&user_path)?);
        }

        if let Some(explicit_path) = explicit_config {
            tracing::debug!("Loading explicit config from {:?}", explicit_path);
            config = Self::merge_configs(config, Self::load_from_file(&explicit_path)?);
        }

        Ok(config)
    }
}

impl Config {
    /// Resolve the audit log path: $KAPSIS_AUDIT_LOG, then config, then ~/.kapsis
    pub fn audit_log_path(&self) -> Result<PathBuf, ConfigError> {
        if let Ok(path) = env::var(AUDIT_LOG_ENV) {
            return Ok(PathBuf::from(path));
        }
        if let Some(path) = &self.audit.log_path {
            return expand_home(path);
        }
        Ok(home_dir()?.join(".kapsis/audit/scope-violations.jsonl"))
    }

    /// Resolve the base directory for per-run sandbox directories
    pub fn sandbox_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.sandbox.root {
            Some(root) => expand_home(root),
            None => Ok(home_dir()?.join(".kapsis/sandboxes")),
        }
    }
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| ConfigError::EnvVarNotFound("HOME".to_string()))
}

fn expand_home(path: &Path) -> Result<PathBuf, ConfigError> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home_dir()?.join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}
