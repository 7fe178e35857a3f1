//! Post-run scope verification
//!
//! After the agent exits, every path that differs from the pristine state is
//! classified. Any blocked path fails the run and is recorded in the audit
//! log; warning paths are logged and tolerated. In worktree mode a change to
//! the real repository's `.git` marker, hooks or config is blocked whatever
//! the rules say.
//!
//! Paths are reported from their raw bytes; see [`path_text`].

use crate::audit::{path_text, AuditLog, ScopeViolation};
use crate::classify::{PathClassification, PathClassifier};
use crate::error::ScopeVerificationError;
use crate::mount::SandboxMount;
use std::fs;
use std::path::Path;
use std::process::Command;
use walkdir::WalkDir;

/// Classified change set of a run that passed verification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeReport {
    /// Changed paths classified as warnings, relative to the mount root
    pub warnings: Vec<String>,
    /// Number of changed paths classified as allowed
    pub allowed: usize,
}

impl ScopeReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Applies the path classifier to a finished run
#[derive(Debug, Clone)]
pub struct ScopeVerifier {
    classifier: PathClassifier,
    audit: AuditLog,
    run_id: Option<String>,
}

impl ScopeVerifier {
    /// Verifier over the builtin rule table
    pub fn new(audit: AuditLog) -> Self {
        Self {
            classifier: PathClassifier::builtin().clone(),
            audit,
            run_id: None,
        }
    }

    pub fn with_classifier(mut self, classifier: PathClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Verify the changes recorded by `mount`, which the runtime mounted at `mount_root`
    pub fn verify(
        &self,
        mount_root: &Path,
        mount: &SandboxMount,
    ) -> Result<ScopeReport, ScopeVerificationError> {
        let changed = changed_paths(mount)?;
        tracing::debug!(
            "Verifying {} changed path(s) under {} ({})",
            changed.len(),
            mount_root.display(),
            mount.mode_name()
        );

        let prefix = mount_root
            .to_string_lossy()
            .trim_matches('/')
            .to_string();
        let mut blocked = host_git_tampering(mount)?;
        for path in &blocked {
            tracing::warn!("Real git metadata modified: {}", path);
        }
        let mut report = ScopeReport::default();

        for path in changed {
            let classified = if prefix.is_empty() {
                path.clone()
            } else {
                format!("{prefix}/{path}")
            };
            match self.classifier.classify(&classified) {
                PathClassification::Blocked => {
                    tracing::warn!("Blocked path modified: {}", classified);
                    blocked.push(path);
                }
                PathClassification::Warning => {
                    tracing::warn!("Scope warning: {}", classified);
                    report.warnings.push(path);
                }
                PathClassification::Allowed => report.allowed += 1,
            }
        }

        if blocked.is_empty() {
            return Ok(report);
        }

        let mut violation = ScopeViolation::new(
            mount_root.display().to_string(),
            mount.mode_name(),
            blocked,
        );
        if let Some(run_id) = &self.run_id {
            violation = violation.with_run_id(run_id.clone());
        }
        self.audit
            .append(&violation)
            .map_err(|source| ScopeVerificationError::Audit {
                path: self.audit.path().to_path_buf(),
                source,
            })?;

        Err(ScopeVerificationError::Violation(violation))
    }
}

/// Verify `mount` against the builtin rules, auditing to `audit`
pub fn verify(
    mount_root: &Path,
    mount: &SandboxMount,
    audit: AuditLog,
) -> Result<ScopeReport, ScopeVerificationError> {
    ScopeVerifier::new(audit).verify(mount_root, mount)
}

/// Every path that differs from the pristine state, relative to the mount root
pub fn changed_paths(mount: &SandboxMount) -> Result<Vec<String>, ScopeVerificationError> {
    match mount {
        SandboxMount::Overlay { upper_dir, .. } => overlay_changes(upper_dir),
        SandboxMount::Worktree {
            worktree_path,
            sanitized_git_dir,
            real_git_dir,
            ..
        } => {
            let mut changes = worktree_changes(worktree_path, real_git_dir)?;
            changes.extend(planted_hooks(sanitized_git_dir)?);
            Ok(changes)
        }
    }
}

/// Guarded host git entries that differ from the recorded baseline
fn host_git_tampering(mount: &SandboxMount) -> Result<Vec<String>, ScopeVerificationError> {
    match mount {
        SandboxMount::Overlay { .. } => Ok(Vec::new()),
        SandboxMount::Worktree {
            worktree_path,
            baseline,
            ..
        } => Ok(baseline.tampered(worktree_path)?),
    }
}

/// Files, symlinks, whiteouts and empty directories in the write layer
fn overlay_changes(upper_dir: &Path) -> Result<Vec<String>, ScopeVerificationError> {
    let enumerate_error = |path: &Path, source: std::io::Error| ScopeVerificationError::Enumerate {
        path: path.to_path_buf(),
        source,
    };

    let mut changes = Vec::new();
    let walker = WalkDir::new(upper_dir)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(upper_dir).to_path_buf();
            enumerate_error(&path, e.into())
        })?;

        if entry.file_type().is_dir() {
            let mut children =
                fs::read_dir(entry.path()).map_err(|e| enumerate_error(entry.path(), e))?;
            if children.next().is_some() {
                continue;
            }
        }

        let relative = entry
            .path()
            .strip_prefix(upper_dir)
            .map_err(|e| enumerate_error(entry.path(), std::io::Error::other(e)))?;
        changes.push(path_text(relative.as_os_str().as_encoded_bytes()));
    }
    Ok(changes)
}

/// Modified, added, deleted and untracked paths as reported by git
///
/// Hooks and fsmonitor are disabled so the scan never runs repository code.
/// `git_dir` is passed explicitly; the worktree's own marker is not trusted.
fn worktree_changes(
    worktree: &Path,
    git_dir: &Path,
) -> Result<Vec<String>, ScopeVerificationError> {
    let git_error = |message: String| ScopeVerificationError::GitStatus {
        path: worktree.to_path_buf(),
        message,
    };

    let output = Command::new("git")
        .arg("--git-dir")
        .arg(git_dir)
        .arg("--work-tree")
        .arg(worktree)
        .args([
            "--no-optional-locks",
            "-c",
            "core.fsmonitor=false",
            "-c",
            "core.hooksPath=/dev/null",
            "status",
            "--porcelain=v1",
            "-z",
            "--untracked-files=all",
            "--no-renames",
        ])
        .current_dir(worktree)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .map_err(|e| git_error(e.to_string()))?;

    if !output.status.success() {
        return Err(git_error(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    Ok(parse_porcelain_z(&output.stdout))
}

/// Parse `XY path\0` records; paths are unquoted raw bytes
fn parse_porcelain_z(output: &[u8]) -> Vec<String> {
    output
        .split(|byte| *byte == 0)
        .filter_map(|record| record.get(3..))
        .filter(|path| !path.is_empty())
        .map(path_text)
        .collect()
}

/// Hooks the agent wrote into the sanitized git directory
fn planted_hooks(sanitized_git_dir: &Path) -> Result<Vec<String>, ScopeVerificationError> {
    let hooks = sanitized_git_dir.join("hooks");
    let entries = match fs::read_dir(&hooks) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(ScopeVerificationError::Enumerate { path: hooks, source }),
    };

    let mut planted = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ScopeVerificationError::Enumerate {
            path: hooks.clone(),
            source,
        })?;
        let name = path_text(entry.file_name().as_encoded_bytes());
        planted.push(format!(".git/hooks/{name}"));
    }
    planted.sort();
    Ok(planted)
}
