//! Filesystem and git isolation for sandboxed coding agents
//!
//! Classifies the paths an agent may touch, performs crash-safe host-side
//! copies, builds a sanitized git directory for worktree runs, and audits
//! what a run changed before any git state is merged back.

pub mod audit;
pub mod classify;
pub mod config;
pub mod copy;
pub mod env;
pub mod error;
pub mod git_baseline;
pub mod git_sandbox;
pub mod mount;
pub mod run;
pub mod verify;

pub use audit::{AuditLog, ScopeViolation};
pub use classify::{classify, ClassificationRule, PathClassification, PathClassifier};
pub use config::{Config, ConfigLoader};
pub use copy::{copy_dir, copy_file, CopyEngine, CopyJob, CopyKind};
pub use error::{
    BaselineError, ConfigError, CopyError, RunError, SanitizeError, ScopeVerificationError, SyncError,
    ValidationFailure,
};
pub use git_baseline::GitBaseline;
pub use git_sandbox::{
    prepare_sandbox_git, sync_index_from_container, sync_index_recorded, worktree_mount,
    GitSandboxState, SyncOutcome,
};
pub use mount::{MountMode, MountPoint, RunId, SandboxLayout, SandboxMount};
pub use run::{RunMode, RunOutcome, RunPhase, SandboxRun};
pub use verify::{verify, ScopeReport, ScopeVerifier};
