//! Sandbox mount descriptors and per-run directory layout

use crate::error::RunError;
use crate::git_baseline::GitBaseline;
use crate::git_sandbox::GitSandboxState;
use std::fmt;
use std::path::{Path, PathBuf};

/// Caller-supplied identifier naming one run's sandbox directories
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    /// Accepts ASCII alphanumerics, `-`, `_` and `.`; rejects `.` and `..`
    pub fn new(id: impl Into<String>) -> Result<Self, RunError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(Self(id))
        } else {
            Err(RunError::InvalidRunId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host directories owned by one run
#[derive(Debug, Clone)]
pub struct SandboxLayout {
    run_dir: PathBuf,
    run_id: RunId,
}

impl SandboxLayout {
    pub fn new(sandbox_root: &Path, run_id: RunId) -> Self {
        Self {
            run_dir: sandbox_root.join(run_id.as_str()),
            run_id,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Overlay write layer
    pub fn upper_dir(&self) -> PathBuf {
        self.run_dir.join("upper")
    }

    /// Overlay scratch space
    pub fn work_dir(&self) -> PathBuf {
        self.run_dir.join("work")
    }

    pub fn sanitized_git_dir(&self) -> PathBuf {
        self.run_dir.join("git")
    }
}

/// A mount point the container runtime is expected to create
#[derive(Debug, Clone, PartialEq)]
pub struct MountPoint {
    /// Source path on host
    pub source: PathBuf,

    /// Target path in the container
    pub target: PathBuf,

    pub mode: MountMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MountMode {
    /// Read-only bind mount
    ReadOnly,

    /// Read-write bind mount
    ReadWrite,

    /// Copy-on-write overlay of `source`, writes landing in `upper`
    Overlay { upper: PathBuf, work: PathBuf },
}

impl MountPoint {
    /// Create a read-only mount point
    pub fn ro<P: AsRef<Path>>(source: P, target: P) -> Self {
        Self {
            source: source.as_ref().to_path_buf(),
            target: target.as_ref().to_path_buf(),
            mode: MountMode::ReadOnly,
        }
    }

    /// Create a read-write mount point
    pub fn rw<P: AsRef<Path>>(source: P, target: P) -> Self {
        Self {
            source: source.as_ref().to_path_buf(),
            target: target.as_ref().to_path_buf(),
            mode: MountMode::ReadWrite,
        }
    }

    /// Create an overlay mount point
    pub fn overlay<P: AsRef<Path>>(lower: P, target: P, upper: P, work: P) -> Self {
        Self {
            source: lower.as_ref().to_path_buf(),
            target: target.as_ref().to_path_buf(),
            mode: MountMode::Overlay {
                upper: upper.as_ref().to_path_buf(),
                work: work.as_ref().to_path_buf(),
            },
        }
    }

    /// Render as a `source:target[:options]` volume specification
    pub fn to_volume_spec(&self) -> String {
        let source = self.source.display();
        let target = self.target.display();
        match &self.mode {
            MountMode::ReadOnly => format!("{source}:{target}:ro"),
            MountMode::ReadWrite => format!("{source}:{target}"),
            MountMode::Overlay { upper, work } => format!(
                "{source}:{target}:O,upperdir={},workdir={}",
                upper.display(),
                work.display()
            ),
        }
    }
}

/// The mount strategy of one run
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxMount {
    /// Copy-on-write: reads from `lower_dir`, writes land in `upper_dir`
    Overlay {
        lower_dir: PathBuf,
        upper_dir: PathBuf,
        work_dir: PathBuf,
    },
    /// Agent works on a checkout; git metadata is split
    Worktree {
        worktree_path: PathBuf,
        sanitized_git_dir: PathBuf,
        real_git_dir: PathBuf,
        /// Real object store, exposed read-only
        object_store: PathBuf,
        /// Host git metadata recorded at preparation
        baseline: GitBaseline,
    },
}

impl SandboxMount {
    pub fn overlay(lower_dir: &Path, layout: &SandboxLayout) -> Self {
        SandboxMount::Overlay {
            lower_dir: lower_dir.to_path_buf(),
            upper_dir: layout.upper_dir(),
            work_dir: layout.work_dir(),
        }
    }

    pub fn worktree(state: &GitSandboxState) -> Self {
        SandboxMount::Worktree {
            worktree_path: state.worktree_path().to_path_buf(),
            sanitized_git_dir: state.sanitized_git_dir().to_path_buf(),
            real_git_dir: state.real_git_dir().to_path_buf(),
            object_store: state.object_store().to_path_buf(),
            baseline: state.baseline().clone(),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            SandboxMount::Overlay { .. } => "overlay",
            SandboxMount::Worktree { .. } => "worktree",
        }
    }

    /// Mounts the runtime must create, with the project at `workspace`
    ///
    /// In worktree mode the `.git` marker is mounted read-only over the
    /// writable checkout, so the agent can neither repoint it nor reach the
    /// real hooks and config through it.
    pub fn mount_points(&self, workspace: &Path) -> Vec<MountPoint> {
        match self {
            SandboxMount::Overlay {
                lower_dir,
                upper_dir,
                work_dir,
            } => vec![MountPoint::overlay(
                lower_dir.as_path(),
                workspace,
                upper_dir.as_path(),
                work_dir.as_path(),
            )],
            SandboxMount::Worktree {
                worktree_path,
                sanitized_git_dir,
                object_store,
                ..
            } => vec![
                MountPoint::rw(worktree_path.as_path(), workspace),
                MountPoint::ro(worktree_path.join(".git"), workspace.join(".git")),
                MountPoint::rw(sanitized_git_dir, sanitized_git_dir),
                MountPoint::ro(object_store, object_store),
            ],
        }
    }

    /// Directories this run created and must remove when torn down
    pub fn owned_dirs(&self) -> Vec<&Path> {
        match self {
            SandboxMount::Overlay {
                upper_dir,
                work_dir,
                ..
            } => vec![upper_dir.as_path(), work_dir.as_path()],
            SandboxMount::Worktree {
                sanitized_git_dir, ..
            } => vec![sanitized_git_dir.as_path()],
        }
    }
}
