//! Operator tool for the Kapsis sandbox isolation engine
//!
//! Exposes path classification, atomic copies, sanitized git preparation,
//! index synchronization and post-run scope verification as subcommands.
//! Container orchestration stays outside this tool.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kapsis_core::{
    git_baseline, git_sandbox, AuditLog, Config, ConfigLoader, CopyJob, CopyKind, PathClassifier, RunId,
    SandboxLayout, SandboxMount, ScopeVerificationError, ScopeVerifier, SyncOutcome,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "kapsis-scope",
    about = "Filesystem and git isolation for sandboxed coding agents",
    version
)]
struct Args {
    /// Configuration file (TOML format), layered over builtin and user config
    #[arg(long, short, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify mount-root-relative paths as allowed, blocked or warning
    Classify {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Copy a file or directory atomically with validation
    Copy {
        source: PathBuf,
        destination: PathBuf,

        /// Require the file to parse as JSON whatever its name
        #[arg(long, conflicts_with = "dir")]
        json: bool,

        /// Copy a directory recursively
        #[arg(long)]
        dir: bool,
    },

    /// Build a sanitized git directory for a worktree
    PrepareGit {
        worktree: PathBuf,

        /// Sanitized git directory (default: <sandbox root>/<run id>/git)
        #[arg(long, value_name = "PATH", required_unless_present = "run_id")]
        git_dir: Option<PathBuf>,

        /// Run identifier naming the sandbox directories
        #[arg(long)]
        run_id: Option<String>,

        /// Worktree path inside the container
        #[arg(long, value_name = "PATH", default_value = "/workspace")]
        workspace: PathBuf,
    },

    /// Copy the sandbox's staging index back into the real git directory
    SyncIndex {
        worktree: PathBuf,
        git_dir: PathBuf,
    },

    /// Classify everything a finished run changed
    Verify {
        /// Container path the verified tree was mounted at
        #[arg(long, value_name = "PATH", default_value = "/workspace")]
        mount_root: PathBuf,

        /// Run identifier recorded in the audit log
        #[arg(long)]
        run_id: Option<String>,

        #[command(subcommand)]
        mode: VerifyMode,
    },
}

#[derive(Subcommand)]
enum VerifyMode {
    /// Scan an overlay write layer
    Overlay {
        /// Overlay upper directory
        upper_dir: PathBuf,
    },

    /// Scan a worktree with git status
    Worktree {
        worktree: PathBuf,

        /// Sanitized git directory used by the run
        #[arg(long, value_name = "PATH")]
        git_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(if args.verbose { "debug" } else { "warn" })
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if matches!(
                e.downcast_ref::<ScopeVerificationError>(),
                Some(ScopeVerificationError::Violation(_))
            ) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config =
        ConfigLoader::load_with_priority(args.config).context("Failed to load configuration")?;

    match args.command {
        Command::Classify { paths } => {
            let classifier = PathClassifier::from_table(&config.rules);
            for path in paths {
                let rule = classifier
                    .matching_rule(&path)
                    .map(|rule| rule.pattern.as_str())
                    .unwrap_or("-");
                println!("{}\t{}\t{}", classifier.classify(&path), path, rule);
            }
        }

        Command::Copy {
            source,
            destination,
            json,
            dir,
        } => {
            let kind = if dir {
                CopyKind::Directory
            } else if json {
                CopyKind::JsonFile
            } else {
                CopyKind::PlainFile
            };
            CopyJob::new(&source, &destination, kind)
                .run()
                .with_context(|| {
                    format!("Failed to copy {} to {}", source.display(), destination.display())
                })?;
        }

        Command::PrepareGit {
            worktree,
            git_dir,
            run_id,
            workspace,
        } => {
            let git_dir = match git_dir {
                Some(git_dir) => git_dir,
                None => sanitized_dir_for_run(&config, run_id.as_deref())?,
            };
            let state = git_sandbox::prepare_sandbox_git(&worktree, &git_dir)
                .context("Failed to prepare sanitized git directory")?;
            let mount = SandboxMount::worktree(&state);

            let report = serde_json::json!({
                "sanitized_git_dir": state.sanitized_git_dir().display().to_string(),
                "real_git_dir": state.real_git_dir().display().to_string(),
                "baseline": git_baseline::baseline_path(state.sanitized_git_dir())
                    .display()
                    .to_string(),
                "mounts": mount
                    .mount_points(&workspace)
                    .iter()
                    .map(|m| m.to_volume_spec())
                    .collect::<Vec<_>>(),
                "env": state.environment(&workspace).vars(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::SyncIndex { worktree, git_dir } => {
            let outcome = git_sandbox::sync_index_from_container(&worktree, &git_dir)
                .context("Failed to synchronize index")?;
            match outcome {
                SyncOutcome::Synced { index, objects } => {
                    println!("synced {} ({} object file(s) imported)", index.display(), objects)
                }
                SyncOutcome::NoIndex => println!("no sandbox index; real index untouched"),
                SyncOutcome::NoGitMarker => println!("no .git marker; nothing to reconcile"),
            }
        }

        Command::Verify {
            mount_root,
            run_id,
            mode,
        } => {
            let mount = match mode {
                // Only the upper layer is scanned; the other dirs are descriptive.
                VerifyMode::Overlay { upper_dir } => SandboxMount::Overlay {
                    lower_dir: mount_root.clone(),
                    work_dir: upper_dir.clone(),
                    upper_dir,
                },
                VerifyMode::Worktree { worktree, git_dir } => {
                    git_sandbox::worktree_mount(&worktree, &git_dir)
                        .context("Failed to locate worktree git metadata")?
                }
            };

            let audit = AuditLog::new(config.audit_log_path()?);
            let mut verifier = ScopeVerifier::new(audit)
                .with_classifier(PathClassifier::from_table(&config.rules));
            if let Some(run_id) = run_id {
                verifier = verifier.with_run_id(run_id);
            }

            let report = verifier.verify(&mount_root, &mount)?;
            for path in &report.warnings {
                println!("warning\t{path}");
            }
            println!(
                "{} change(s) in scope, {} warning(s)",
                report.allowed + report.warnings.len(),
                report.warnings.len()
            );
        }
    }

    Ok(())
}

fn sanitized_dir_for_run(config: &Config, run_id: Option<&str>) -> Result<PathBuf> {
    let run_id = run_id.context("--run-id is required without --git-dir")?;
    let run_id = RunId::new(run_id)?;
    let root = config.sandbox_root()?;
    Ok(SandboxLayout::new(&root, run_id).sanitized_git_dir())
}
