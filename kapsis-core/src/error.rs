//! Error types for sandbox isolation operations

use std::path::PathBuf;
use thiserror::Error;

use crate::audit::ScopeViolation;

/// Why a staged copy was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("staged copy unreadable: {0}")]
    Unreadable(String),
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("Copy source does not exist: {0}")]
    SourceNotFound(PathBuf),

    #[error("Copy source is not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("Copy source is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Validation failed for {path}: {reason}")]
    ValidationFailed {
        path: PathBuf,
        reason: ValidationFailure,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl CopyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("No .git file or directory in worktree: {0}")]
    NotAGitWorktree(PathBuf),

    #[error("Malformed gitdir pointer in {0}")]
    MalformedGitFile(PathBuf),

    #[error("Sanitized git directory failed readiness check: {0}")]
    NotReady(String),

    #[error("Failed to copy git metadata: {0}")]
    Copy(#[from] CopyError),

    #[error(transparent)]
    Baseline(#[from] BaselineError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors reading or storing the host git metadata baseline
#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid git baseline {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to copy index into real git directory: {0}")]
    Copy(#[from] CopyError),

    #[error("Malformed gitdir pointer in {0}")]
    MalformedGitFile(PathBuf),

    #[error("Worktree .git marker now points at {found}, prepared against {expected}")]
    MarkerChanged { expected: PathBuf, found: PathBuf },

    #[error(transparent)]
    Baseline(#[from] BaselineError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ScopeVerificationError {
    #[error("Scope violation under {}: {} blocked path(s): {}", .0.mount_root, .0.violations.len(), .0.violations.join(", "))]
    Violation(ScopeViolation),

    #[error("Failed to enumerate changes under {path}: {source}")]
    Enumerate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("git status failed in {path}: {message}")]
    GitStatus { path: PathBuf, message: String },

    #[error(transparent)]
    Baseline(#[from] BaselineError),

    #[error("Failed to write audit record to {path}: {source}")]
    Audit {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config from {path}: {source}")]
    Load {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Environment variable {0} not found")]
    EnvVarNotFound(String),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid run identifier: {0:?}")]
    InvalidRunId(String),

    #[error("Run is in phase {actual}, expected {expected}")]
    WrongPhase {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Failed to create sandbox directory {path}: {source}")]
    DirCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to remove sandbox directory {path}: {source}")]
    Teardown {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Sanitize(#[from] SanitizeError),

    #[error(transparent)]
    Scope(#[from] ScopeVerificationError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}
