//! Sanitized git control directory for worktree-mode runs
//!
//! The agent never sees the real git directory. It gets a throwaway one with
//! the current HEAD, index and refs, an object store that borrows the real
//! objects through `info/alternates`, an empty hooks directory, and a config
//! holding nothing beyond what git needs to operate. After the run the
//! objects the agent wrote are moved into the real store and the staged index
//! is carried back into the git directory recorded at preparation.

use crate::copy::{self, CopyEngine};
use crate::env::EnvironmentBuilder;
use crate::error::{CopyError, SanitizeError, SyncError};
use crate::git_baseline::GitBaseline;
use crate::mount::SandboxMount;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Where a worktree's real git metadata lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitMarker {
    /// `.git` is a file with a `gitdir:` pointer (linked worktree, submodule)
    File { git_dir: PathBuf },
    /// `.git` is the git directory itself
    Directory(PathBuf),
}

impl GitMarker {
    pub fn git_dir(&self) -> &Path {
        match self {
            GitMarker::File { git_dir } => git_dir,
            GitMarker::Directory(git_dir) => git_dir,
        }
    }
}

#[derive(Debug)]
enum MarkerError {
    Malformed(PathBuf),
    Io { path: PathBuf, source: io::Error },
}

impl From<MarkerError> for SanitizeError {
    fn from(err: MarkerError) -> Self {
        match err {
            MarkerError::Malformed(path) => SanitizeError::MalformedGitFile(path),
            MarkerError::Io { path, source } => SanitizeError::Io { path, source },
        }
    }
}

impl From<MarkerError> for SyncError {
    fn from(err: MarkerError) -> Self {
        match err {
            MarkerError::Malformed(path) => SyncError::MalformedGitFile(path),
            MarkerError::Io { path, source } => SyncError::Io { path, source },
        }
    }
}

/// Inspect `<worktree>/.git`; `None` when there is no marker at all
fn find_git_marker(worktree: &Path) -> Result<Option<GitMarker>, MarkerError> {
    let marker = worktree.join(".git");
    let metadata = match fs::metadata(&marker) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(MarkerError::Io { path: marker, source }),
    };

    if metadata.is_dir() {
        return Ok(Some(GitMarker::Directory(marker)));
    }

    let contents = fs::read_to_string(&marker).map_err(|source| MarkerError::Io {
        path: marker.clone(),
        source,
    })?;
    let pointer = contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("gitdir:"))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| MarkerError::Malformed(marker.clone()))?;

    Ok(Some(GitMarker::File {
        git_dir: worktree.join(pointer),
    }))
}

/// Directory holding objects, refs and shared config for `git_dir`
fn common_dir(git_dir: &Path) -> Result<PathBuf, MarkerError> {
    let pointer = git_dir.join("commondir");
    match fs::read_to_string(&pointer) {
        Ok(contents) => {
            let relative = contents.trim();
            if relative.is_empty() {
                return Err(MarkerError::Malformed(pointer));
            }
            Ok(git_dir.join(relative))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(git_dir.to_path_buf()),
        Err(source) => Err(MarkerError::Io {
            path: pointer,
            source,
        }),
    }
}

/// A prepared sanitized git directory
///
/// Only [`prepare_sandbox_git`] constructs this, and only after both readiness
/// checks have passed.
#[derive(Debug, Clone)]
pub struct GitSandboxState {
    worktree_path: PathBuf,
    sanitized_git_dir: PathBuf,
    real_git_dir: PathBuf,
    object_store: PathBuf,
    baseline: GitBaseline,
    hooks_stripped: bool,
    config_minimized: bool,
}

impl GitSandboxState {
    pub fn worktree_path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn sanitized_git_dir(&self) -> &Path {
        &self.sanitized_git_dir
    }

    pub fn real_git_dir(&self) -> &Path {
        &self.real_git_dir
    }

    /// Real object store, to be mounted read-only
    pub fn object_store(&self) -> &Path {
        &self.object_store
    }

    /// Host git metadata recorded before the run
    pub fn baseline(&self) -> &GitBaseline {
        &self.baseline
    }

    pub fn hooks_stripped(&self) -> bool {
        self.hooks_stripped
    }

    pub fn config_minimized(&self) -> bool {
        self.config_minimized
    }

    pub fn is_ready(&self) -> bool {
        self.hooks_stripped && self.config_minimized
    }

    /// Variables pointing git inside the container at the sanitized directory
    ///
    /// System and global config are disabled so host credential helpers
    /// cannot leak in. `workspace` is where the runtime mounts the worktree.
    pub fn environment(&self, workspace: &Path) -> EnvironmentBuilder {
        let workspace = workspace.display().to_string();
        let mut env = EnvironmentBuilder::new();
        env.set("GIT_DIR", self.sanitized_git_dir.display().to_string())
            .set("GIT_WORK_TREE", workspace.clone())
            .set("GIT_CONFIG_NOSYSTEM", "1")
            .set("GIT_CONFIG_GLOBAL", "/dev/null")
            .set("GIT_TERMINAL_PROMPT", "0")
            .git_config("safe.directory", &workspace);
        env
    }
}

/// Build a sanitized git directory for `worktree_path` at `sanitized_git_dir`
///
/// The directory is assembled beside its final location and renamed into
/// place once hooks and config have been checked, replacing any previous
/// sanitized directory for the run. The real repository's marker, hooks and
/// config are recorded in a [`GitBaseline`] stored beside the sanitized
/// directory. Nothing is written under the real git directory.
pub fn prepare_sandbox_git(
    worktree_path: &Path,
    sanitized_git_dir: &Path,
) -> Result<GitSandboxState, SanitizeError> {
    let marker = find_git_marker(worktree_path)?
        .ok_or_else(|| SanitizeError::NotAGitWorktree(worktree_path.to_path_buf()))?;
    let real_git_dir = marker.git_dir().to_path_buf();
    let common = common_dir(&real_git_dir)?;
    let object_store = common.join("objects");
    let baseline = GitBaseline::capture(worktree_path, &real_git_dir, &common)?;

    tracing::info!(
        "Preparing sanitized git directory for {} (real: {})",
        worktree_path.display(),
        real_git_dir.display()
    );

    if let Some(parent) = sanitized_git_dir.parent() {
        fs::create_dir_all(parent).map_err(|source| SanitizeError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let staging = copy::staging_dir(sanitized_git_dir)?;
    let staged = staging.path();
    let engine = CopyEngine::new();

    engine.copy_file(&real_git_dir.join("HEAD"), &staged.join("HEAD"))?;
    copy_optional(|| engine.copy_file(&real_git_dir.join("index"), &staged.join("index")))?;
    copy_optional(|| engine.copy_file(&common.join("packed-refs"), &staged.join("packed-refs")))?;
    if !copy_optional(|| engine.copy_dir(&common.join("refs"), &staged.join("refs")))? {
        create_dirs(staged, &["refs/heads", "refs/tags"])?;
    }

    create_dirs(staged, &["objects/info", "objects/pack", "hooks"])?;
    let object_store = fs::canonicalize(&object_store).unwrap_or(object_store);
    write_file(
        &staged.join("objects/info/alternates"),
        &format!("{}\n", object_store.display()),
    )?;
    write_file(
        &staged.join("config"),
        &minimal_config(worktree_path, sanitized_git_dir),
    )?;

    let hooks_stripped = hooks_empty(&staged.join("hooks"))?;
    let config_minimized = config_is_minimal(&staged.join("config"))?;
    if !hooks_stripped {
        return Err(SanitizeError::NotReady("hooks directory is not empty".to_string()));
    }
    if !config_minimized {
        return Err(SanitizeError::NotReady(
            "config contains settings beyond the minimal set".to_string(),
        ));
    }

    copy::replace_dir(&staging, sanitized_git_dir)?;
    baseline.save(sanitized_git_dir)?;

    tracing::info!("Sanitized git directory ready at {}", sanitized_git_dir.display());
    Ok(GitSandboxState {
        worktree_path: worktree_path.to_path_buf(),
        sanitized_git_dir: sanitized_git_dir.to_path_buf(),
        real_git_dir,
        object_store,
        baseline,
        hooks_stripped,
        config_minimized,
    })
}

/// Describe a worktree run whose sanitized directory already exists
///
/// The git directories come from the baseline stored at preparation, never
/// from the worktree's current marker.
pub fn worktree_mount(
    worktree_path: &Path,
    sanitized_git_dir: &Path,
) -> Result<SandboxMount, SanitizeError> {
    let baseline = GitBaseline::load(sanitized_git_dir)?;
    Ok(SandboxMount::Worktree {
        worktree_path: worktree_path.to_path_buf(),
        sanitized_git_dir: sanitized_git_dir.to_path_buf(),
        real_git_dir: baseline.real_git_dir().to_path_buf(),
        object_store: baseline.object_store(),
        baseline,
    })
}

/// Result of reconciling the index after a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The sandbox index was copied to `index` after importing `objects` new objects
    Synced { index: PathBuf, objects: usize },
    /// The sandbox produced no index; the real one was left alone
    NoIndex,
    /// The worktree has no `.git` marker; nothing to reconcile
    NoGitMarker,
}

/// Copy the sandbox's staging index back into the real git directory
///
/// When preparation left a baseline, the worktree's marker must still resolve
/// to the recorded git directory.
pub fn sync_index_from_container(
    worktree_path: &Path,
    sanitized_git_dir: &Path,
) -> Result<SyncOutcome, SyncError> {
    let Some(marker) = find_git_marker(worktree_path)? else {
        tracing::debug!("No .git marker in {}, skipping index sync", worktree_path.display());
        return Ok(SyncOutcome::NoGitMarker);
    };
    let real_git_dir = marker.git_dir();

    match GitBaseline::load_if_present(sanitized_git_dir)? {
        Some(baseline) if baseline.real_git_dir() != real_git_dir => {
            tracing::warn!(
                "Refusing index sync: {} now points at {}",
                worktree_path.join(".git").display(),
                real_git_dir.display()
            );
            Err(SyncError::MarkerChanged {
                expected: baseline.real_git_dir().to_path_buf(),
                found: real_git_dir.to_path_buf(),
            })
        }
        Some(baseline) => sync_into(real_git_dir, &baseline.object_store(), sanitized_git_dir),
        None => {
            let objects = common_dir(real_git_dir)?.join("objects");
            sync_into(real_git_dir, &objects, sanitized_git_dir)
        }
    }
}

/// Copy the sandbox's staging index into the git directory `baseline` recorded
pub fn sync_index_recorded(
    baseline: &GitBaseline,
    sanitized_git_dir: &Path,
) -> Result<SyncOutcome, SyncError> {
    sync_into(baseline.real_git_dir(), &baseline.object_store(), sanitized_git_dir)
}

fn sync_into(
    real_git_dir: &Path,
    real_objects: &Path,
    sanitized_git_dir: &Path,
) -> Result<SyncOutcome, SyncError> {
    let source = sanitized_git_dir.join("index");
    if !source.is_file() {
        tracing::debug!("No index in {}, leaving real index untouched", sanitized_git_dir.display());
        return Ok(SyncOutcome::NoIndex);
    }

    if !real_git_dir.is_dir() {
        return Err(SyncError::Io {
            path: real_git_dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "real git directory missing"),
        });
    }

    // The index may name blobs that only exist in the sandbox store.
    let objects = import_objects(&sanitized_git_dir.join("objects"), real_objects)?;

    let target = real_git_dir.join("index");
    match copy::copy_file(&source, &target) {
        Ok(()) => {}
        Err(CopyError::SourceNotFound(_)) => return Ok(SyncOutcome::NoIndex),
        Err(e) => return Err(e.into()),
    }

    tracing::info!("Synchronized index into {}", target.display());
    Ok(SyncOutcome::Synced {
        index: target,
        objects,
    })
}

/// Copy loose objects and packs the sandbox wrote into the real store
///
/// Only well-formed object and pack names are taken, so `info/alternates`
/// and anything else the agent left in the store stays behind. Objects
/// already present are not touched. Pack indexes land after their packs.
fn import_objects(sandbox_objects: &Path, real_objects: &Path) -> Result<usize, SyncError> {
    if !sandbox_objects.is_dir() {
        return Ok(0);
    }

    let mut loose = Vec::new();
    let mut packs = Vec::new();
    let walker = WalkDir::new(sandbox_objects)
        .follow_links(false)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| SyncError::Io {
            path: e.path().unwrap_or(sandbox_objects).to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = entry
            .path()
            .strip_prefix(sandbox_objects)
            .ok()
            .and_then(Path::to_str)
        else {
            continue;
        };

        if is_loose_object(relative) {
            loose.push(relative.to_string());
        } else if let Some(rank) = pack_rank(relative) {
            packs.push((rank, relative.to_string()));
        } else {
            tracing::debug!("Not importing {}", entry.path().display());
        }
    }
    packs.sort();

    let mut imported = 0;
    for relative in loose.into_iter().chain(packs.into_iter().map(|(_, name)| name)) {
        let target = real_objects.join(&relative);
        if fs::symlink_metadata(&target).is_ok() {
            continue;
        }
        copy::copy_file(&sandbox_objects.join(&relative), &target)?;
        imported += 1;
    }

    if imported > 0 {
        tracing::info!("Imported {} object file(s) into {}", imported, real_objects.display());
    }
    Ok(imported)
}

/// `xx/yyyy...` with a SHA-1 or SHA-256 hex name
fn is_loose_object(relative: &str) -> bool {
    let Some((dir, name)) = relative.split_once('/') else {
        return false;
    };
    dir.len() == 2 && matches!(name.len(), 38 | 62) && is_lower_hex(dir) && is_lower_hex(name)
}

/// Import order for `pack/pack-<hex>.<ext>`; `None` for anything else
fn pack_rank(relative: &str) -> Option<u8> {
    let name = relative.strip_prefix("pack/")?;
    let (stem, ext) = name.rsplit_once('.')?;
    let hash = stem.strip_prefix("pack-")?;
    if hash.is_empty() || !is_lower_hex(hash) {
        return None;
    }
    match ext {
        "pack" => Some(0),
        "rev" => Some(1),
        "idx" => Some(2),
        _ => None,
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Run a copy whose source may legitimately be absent; true if it copied
fn copy_optional(op: impl FnOnce() -> Result<(), CopyError>) -> Result<bool, CopyError> {
    match op() {
        Ok(()) => Ok(true),
        Err(CopyError::SourceNotFound(path)) => {
            tracing::debug!("Skipping absent {}", path.display());
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn create_dirs(root: &Path, dirs: &[&str]) -> Result<(), SanitizeError> {
    for dir in dirs {
        let path = root.join(dir);
        fs::create_dir_all(&path).map_err(|source| SanitizeError::Io { path, source })?;
    }
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<(), SanitizeError> {
    fs::write(path, contents).map_err(|source| SanitizeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn minimal_config(worktree_path: &Path, sanitized_git_dir: &Path) -> String {
    let hooks = sanitized_git_dir.join("hooks");
    format!(
        "[core]\n\
         \trepositoryformatversion = 0\n\
         \tfilemode = true\n\
         \tbare = false\n\
         \thooksPath = {}\n\
         [safe]\n\
         \tdirectory = {}\n",
        quote_config_value(&hooks.display().to_string()),
        quote_config_value(&worktree_path.display().to_string()),
    )
}

/// Quote a git config value so quotes and backslashes survive
fn quote_config_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn hooks_empty(hooks: &Path) -> Result<bool, SanitizeError> {
    let mut entries = fs::read_dir(hooks).map_err(|source| SanitizeError::Io {
        path: hooks.to_path_buf(),
        source,
    })?;
    Ok(entries.next().is_none())
}

/// Keys permitted in the sanitized config, by section
const MINIMAL_CONFIG_KEYS: &[(&str, &[&str])] = &[
    ("core", &["repositoryformatversion", "filemode", "bare", "hookspath"]),
    ("safe", &["directory"]),
];

/// Every key is whitelisted and `safe.directory` is present
fn config_is_minimal(config: &Path) -> Result<bool, SanitizeError> {
    let contents = fs::read_to_string(config).map_err(|source| SanitizeError::Io {
        path: config.to_path_buf(),
        source,
    })?;

    let mut allowed: &[&str] = &[];
    let mut has_safe_directory = false;
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[') {
            let name = section.trim_end_matches(']').trim().to_ascii_lowercase();
            match MINIMAL_CONFIG_KEYS.iter().find(|(s, _)| *s == name) {
                Some((_, keys)) => allowed = keys,
                None => return Ok(false),
            }
            continue;
        }
        let key = line.split('=').next().unwrap_or_default().trim().to_ascii_lowercase();
        if !allowed.contains(&key.as_str()) {
            return Ok(false);
        }
        if key == "directory" {
            has_safe_directory = true;
        }
    }
    Ok(has_safe_directory)
}
