//! Configuration schema types

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete scope-engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub sandbox: SandboxDirsConfig,
    #[serde(default)]
    pub rules: RuleTable,
}

/// Where scope violations are recorded
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Append-only JSON-lines log (default: ~/.kapsis/audit/scope-violations.jsonl)
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

/// Where per-run sandbox directories are created
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxDirsConfig {
    /// Base directory for upper/work/git directories (default: ~/.kapsis/sandboxes)
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Pattern table driving the path classifier
///
/// All patterns are mount-root-relative and matched segment by segment.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuleTable {
    /// Globs naming home directories (e.g. `home/*`)
    #[serde(default)]
    pub home_roots: Vec<String>,
    /// Credential stores and shell startup files, blocked under every home root
    #[serde(default)]
    pub sensitive_home_entries: Vec<String>,
    /// Per-agent home configuration, blocked under every home root
    #[serde(default)]
    pub agent_config_dirs: Vec<String>,
    /// Blocked subtrees anchored at the mount root
    #[serde(default)]
    pub blocked: Vec<String>,
    /// Subtrees that are surfaced but never fatal
    #[serde(default)]
    pub warning: Vec<String>,
    /// Dependency caches, allowed under every home root
    #[serde(default)]
    pub allowed_home_caches: Vec<String>,
    /// Allowed subtrees anchored at the mount root
    #[serde(default)]
    pub allowed: Vec<String>,
}

impl RuleTable {
    /// Extend this table with another; entries already present are skipped
    pub fn extend(&mut self, other: RuleTable) {
        fn merge(into: &mut Vec<String>, from: Vec<String>) {
            for entry in from {
                if !into.contains(&entry) {
                    into.push(entry);
                }
            }
        }

        merge(&mut self.home_roots, other.home_roots);
        merge(&mut self.sensitive_home_entries, other.sensitive_home_entries);
        merge(&mut self.agent_config_dirs, other.agent_config_dirs);
        merge(&mut self.blocked, other.blocked);
        merge(&mut self.warning, other.warning);
        merge(&mut self.allowed_home_caches, other.allowed_home_caches);
        merge(&mut self.allowed, other.allowed);
    }

    /// Reject patterns that are empty or climb out of the mount root
    pub fn validate(&self) -> Result<(), ConfigError> {
        let lists = [
            &self.home_roots,
            &self.sensitive_home_entries,
            &self.agent_config_dirs,
            &self.blocked,
            &self.warning,
            &self.allowed_home_caches,
            &self.allowed,
        ];
        for pattern in lists.into_iter().flatten() {
            if pattern.split('/').all(|s| s.is_empty()) {
                return Err(ConfigError::Invalid(format!("empty rule pattern {pattern:?}")));
            }
            if pattern.split('/').any(|s| s == "..") {
                return Err(ConfigError::Invalid(format!(
                    "rule pattern {pattern:?} contains '..'"
                )));
            }
        }
        Ok(())
    }

    /// Every entry blocked beneath a home root, credential and agent entries alike
    pub fn home_blocked_entries(&self) -> impl Iterator<Item = &String> {
        self.sensitive_home_entries
            .iter()
            .chain(self.agent_config_dirs.iter())
    }
}
