//! Host git metadata recorded before a worktree run
//!
//! A worktree run exposes the worktree's `.git` marker to the agent, and
//! through it the real repository's hooks and config. Their state is
//! captured when the sandbox is prepared and compared after the run. Any
//! difference is a violation no rule table can allow.
//!
//! The baseline also pins the real git directory resolved at preparation,
//! so reconciliation never follows a marker the agent rewrote.

use crate::audit::path_text;
use crate::copy;
use crate::error::{BaselineError, SanitizeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

const BASELINE_SUFFIX: &str = ".baseline.json";

/// State of one guarded entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
enum EntryState {
    Missing,
    Directory,
    File { mode: u32, contents: Vec<u8> },
    Symlink { target: Vec<u8> },
    /// FIFOs, sockets and devices; never opened
    Special,
}

/// Snapshot of the real repository's `.git` marker, hooks and config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitBaseline {
    real_git_dir: PathBuf,
    common_dir: PathBuf,
    /// Keyed by worktree-relative label, e.g. `.git/hooks/pre-commit`
    entries: BTreeMap<String, EntryState>,
}

impl GitBaseline {
    /// Record the guarded entries of `worktree` as they are now
    pub fn capture(
        worktree: &Path,
        real_git_dir: &Path,
        common_dir: &Path,
    ) -> Result<Self, BaselineError> {
        let mut baseline = Self {
            real_git_dir: real_git_dir.to_path_buf(),
            common_dir: common_dir.to_path_buf(),
            entries: BTreeMap::new(),
        };
        baseline.entries = baseline.scan(worktree)?;
        tracing::debug!(
            "Recorded {} guarded git entries for {}",
            baseline.entries.len(),
            worktree.display()
        );
        Ok(baseline)
    }

    /// Git directory the worktree's marker resolved to at preparation
    pub fn real_git_dir(&self) -> &Path {
        &self.real_git_dir
    }

    /// Shared git directory holding objects, hooks and config
    pub fn common_dir(&self) -> &Path {
        &self.common_dir
    }

    pub fn object_store(&self) -> PathBuf {
        self.common_dir.join("objects")
    }

    /// Labels of guarded entries that were changed, added or removed
    pub fn tampered(&self, worktree: &Path) -> Result<Vec<String>, BaselineError> {
        let current = self.scan(worktree)?;
        let mut labels: Vec<String> = self
            .entries
            .keys()
            .chain(current.keys())
            .filter(|label| self.entries.get(*label) != current.get(*label))
            .cloned()
            .collect();
        labels.sort();
        labels.dedup();
        Ok(labels)
    }

    fn scan(&self, worktree: &Path) -> Result<BTreeMap<String, EntryState>, BaselineError> {
        let mut entries = BTreeMap::new();
        entries.insert(".git".to_string(), entry_state(&worktree.join(".git"))?);
        entries.insert(
            ".git/config".to_string(),
            entry_state(&self.common_dir.join("config"))?,
        );
        entries.insert(
            ".git/config.worktree".to_string(),
            entry_state(&self.real_git_dir.join("config.worktree"))?,
        );

        let hooks = self.common_dir.join("hooks");
        let hooks_state = entry_state(&hooks)?;
        if hooks_state == EntryState::Directory {
            let dir = fs::read_dir(&hooks).map_err(|e| read_error(&hooks, e))?;
            for entry in dir {
                let entry = entry.map_err(|e| read_error(&hooks, e))?;
                let name = path_text(entry.file_name().as_encoded_bytes());
                entries.insert(format!(".git/hooks/{name}"), entry_state(&entry.path())?);
            }
        }
        entries.insert(".git/hooks".to_string(), hooks_state);

        Ok(entries)
    }

    /// Store the baseline beside `sanitized_git_dir`
    pub fn save(&self, sanitized_git_dir: &Path) -> Result<(), SanitizeError> {
        let path = baseline_path(sanitized_git_dir);
        let json = serde_json::to_vec(self).map_err(|e| BaselineError::Invalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        copy::write_atomic(&path, &json)?;
        Ok(())
    }

    /// Load the baseline stored beside `sanitized_git_dir`
    pub fn load(sanitized_git_dir: &Path) -> Result<Self, BaselineError> {
        let path = baseline_path(sanitized_git_dir);
        let contents = fs::read(&path).map_err(|e| read_error(&path, e))?;
        serde_json::from_slice(&contents).map_err(|e| BaselineError::Invalid {
            path,
            reason: e.to_string(),
        })
    }

    /// Load the stored baseline, if preparation left one
    pub fn load_if_present(sanitized_git_dir: &Path) -> Result<Option<Self>, BaselineError> {
        match Self::load(sanitized_git_dir) {
            Ok(baseline) => Ok(Some(baseline)),
            Err(BaselineError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Where the baseline for `sanitized_git_dir` is stored
///
/// A sibling of the sanitized directory, so it is never inside a mount.
pub fn baseline_path(sanitized_git_dir: &Path) -> PathBuf {
    let mut name = sanitized_git_dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(BASELINE_SUFFIX);
    sanitized_git_dir.with_file_name(name)
}

fn entry_state(path: &Path) -> Result<EntryState, BaselineError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(EntryState::Missing),
        Err(e) => return Err(read_error(path, e)),
    };

    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(path).map_err(|e| read_error(path, e))?;
        Ok(EntryState::Symlink {
            target: target.into_os_string().into_encoded_bytes(),
        })
    } else if file_type.is_dir() {
        Ok(EntryState::Directory)
    } else if file_type.is_file() {
        Ok(EntryState::File {
            mode: file_mode(&metadata),
            contents: fs::read(path).map_err(|e| read_error(path, e))?,
        })
    } else {
        Ok(EntryState::Special)
    }
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &Metadata) -> u32 {
    u32::from(metadata.permissions().readonly())
}

fn read_error(path: &Path, source: io::Error) -> BaselineError {
    BaselineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn traditional_repo(dir: &Path) -> PathBuf {
        let worktree = dir.join("repo");
        let git = worktree.join(".git");
        fs::create_dir_all(git.join("hooks")).unwrap();
        fs::write(git.join("config"), "[core]\n\tbare = false\n").unwrap();
        fs::write(git.join("hooks/pre-commit.sample"), "#!/bin/sh\n").unwrap();
        worktree
    }

    fn capture(worktree: &Path) -> GitBaseline {
        let git = worktree.join(".git");
        GitBaseline::capture(worktree, &git, &git).unwrap()
    }

    #[test]
    fn test_untouched_repo_is_not_tampered() {
        let dir = TempDir::new().unwrap();
        let worktree = traditional_repo(dir.path());
        let baseline = capture(&worktree);

        fs::write(worktree.join("src.rs"), "fn main() {}\n").unwrap();
        fs::write(worktree.join(".git/index"), "DIRC").unwrap();

        assert!(baseline.tampered(&worktree).unwrap().is_empty());
    }

    #[test]
    fn test_new_hook_is_tampering() {
        let dir = TempDir::new().unwrap();
        let worktree = traditional_repo(dir.path());
        let baseline = capture(&worktree);

        fs::write(worktree.join(".git/hooks/pre-commit"), "#!/bin/sh\ncurl evil\n").unwrap();

        assert_eq!(
            baseline.tampered(&worktree).unwrap(),
            vec![".git/hooks/pre-commit".to_string()]
        );
    }

    #[test]
    fn test_config_edit_and_hooks_removal_are_tampering() {
        let dir = TempDir::new().unwrap();
        let worktree = traditional_repo(dir.path());
        let baseline = capture(&worktree);

        fs::write(
            worktree.join(".git/config"),
            "[core]\n\tfsmonitor = /tmp/payload\n",
        )
        .unwrap();
        fs::remove_dir_all(worktree.join(".git/hooks")).unwrap();

        assert_eq!(
            baseline.tampered(&worktree).unwrap(),
            vec![
                ".git/config".to_string(),
                ".git/hooks".to_string(),
                ".git/hooks/pre-commit.sample".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_enabling_a_hook_is_tampering() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let worktree = traditional_repo(dir.path());
        let hook = worktree.join(".git/hooks/pre-commit.sample");
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o644)).unwrap();
        let baseline = capture(&worktree);

        fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(
            baseline.tampered(&worktree).unwrap(),
            vec![".git/hooks/pre-commit.sample".to_string()]
        );
    }

    #[test]
    fn test_rewritten_marker_is_tampering() {
        let dir = TempDir::new().unwrap();
        let common = dir.path().join("main/.git");
        let wt_git = common.join("worktrees/feature");
        fs::create_dir_all(common.join("hooks")).unwrap();
        fs::create_dir_all(&wt_git).unwrap();
        let worktree = dir.path().join("feature");
        fs::create_dir_all(&worktree).unwrap();
        fs::write(worktree.join(".git"), format!("gitdir: {}\n", wt_git.display())).unwrap();
        let baseline = GitBaseline::capture(&worktree, &wt_git, &common).unwrap();

        fs::write(worktree.join(".git"), "gitdir: /tmp/elsewhere\n").unwrap();

        assert_eq!(baseline.tampered(&worktree).unwrap(), vec![".git".to_string()]);
        assert_eq!(baseline.real_git_dir(), wt_git);
        assert_eq!(baseline.object_store(), common.join("objects"));
    }

    #[test]
    fn test_stored_beside_sanitized_dir() {
        let dir = TempDir::new().unwrap();
        let worktree = traditional_repo(dir.path());
        let sanitized = dir.path().join("run/git");
        fs::create_dir_all(&sanitized).unwrap();

        assert!(GitBaseline::load_if_present(&sanitized).unwrap().is_none());

        let baseline = capture(&worktree);
        baseline.save(&sanitized).unwrap();

        assert_eq!(baseline_path(&sanitized), dir.path().join("run/git.baseline.json"));
        assert_eq!(GitBaseline::load(&sanitized).unwrap(), baseline);
    }

    #[test]
    fn test_corrupt_baseline_is_rejected() {
        let dir = TempDir::new().unwrap();
        let sanitized = dir.path().join("git");
        fs::write(baseline_path(&sanitized), "{not json").unwrap();

        assert!(matches!(
            GitBaseline::load_if_present(&sanitized),
            Err(BaselineError::Invalid { .. })
        ));
    }
}
