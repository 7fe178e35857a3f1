//! Crash-safe file and directory copies
//!
//! Every copy is staged under a temporary name in the destination's own
//! directory, validated, and only then renamed over the destination. A reader
//! never observes a half-written destination, and a failed copy leaves
//! neither a staged artifact nor an unvalidated destination behind.

use crate::error::{CopyError, ValidationFailure};
use std::fs::{self, File, Metadata, Permissions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile, TempDir};
use walkdir::WalkDir;

/// What a [`CopyJob`] copies and how it is validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    /// Single file; JSON-validated only if the destination ends in `.json`
    PlainFile,
    /// Single file that must parse as JSON whatever its name
    JsonFile,
    /// Recursive directory copy
    Directory,
}

/// A single copy request
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub kind: CopyKind,
}

impl CopyJob {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, kind: CopyKind) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            kind,
        }
    }

    /// Run this job with the standard validator
    pub fn run(&self) -> Result<(), CopyError> {
        CopyEngine::new().run(self)
    }
}

/// Post-copy check applied to a staged file before it is renamed into place
pub trait CopyValidator {
    fn validate(&self, expected_len: u64, staged: &Path, json: bool)
        -> Result<(), ValidationFailure>;
}

/// Byte-size equality, plus JSON well-formedness when requested
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardValidator;

impl CopyValidator for StandardValidator {
    fn validate(
        &self,
        expected_len: u64,
        staged: &Path,
        json: bool,
    ) -> Result<(), ValidationFailure> {
        let actual = fs::metadata(staged)
            .map_err(|e| ValidationFailure::Unreadable(e.to_string()))?
            .len();
        if actual != expected_len {
            return Err(ValidationFailure::SizeMismatch {
                expected: expected_len,
                actual,
            });
        }

        if json {
            let bytes = fs::read(staged).map_err(|e| ValidationFailure::Unreadable(e.to_string()))?;
            serde_json::from_slice::<serde_json::Value>(&bytes)
                .map_err(|e| ValidationFailure::InvalidJson(e.to_string()))?;
        }

        Ok(())
    }
}

/// Transactional copier parameterized by its validation step
#[derive(Debug, Clone, Default)]
pub struct CopyEngine<V = StandardValidator> {
    validator: V,
}

impl CopyEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V: CopyValidator> CopyEngine<V> {
    pub fn with_validator(validator: V) -> Self {
        Self { validator }
    }

    pub fn run(&self, job: &CopyJob) -> Result<(), CopyError> {
        match job.kind {
            CopyKind::PlainFile => self.copy_file(&job.source, &job.destination),
            CopyKind::JsonFile => self.copy_file_checked(&job.source, &job.destination, true),
            CopyKind::Directory => self.copy_dir(&job.source, &job.destination),
        }
    }

    /// Copy one file byte-for-byte
    ///
    /// Missing destination parents are created. The destination keeps the
    /// source's mode bits with owner-write added.
    pub fn copy_file(&self, src: &Path, dst: &Path) -> Result<(), CopyError> {
        self.copy_file_checked(src, dst, false)
    }

    fn copy_file_checked(&self, src: &Path, dst: &Path, force_json: bool) -> Result<(), CopyError> {
        // Opening a FIFO blocks, so the type is checked on the path first.
        if !source_metadata(src)?.is_file() {
            return Err(CopyError::NotAFile(src.to_path_buf()));
        }
        let mut reader = open_source(src)?;
        let metadata = reader.metadata().map_err(|e| CopyError::io(src, e))?;
        if !metadata.is_file() {
            return Err(CopyError::NotAFile(src.to_path_buf()));
        }

        let parent = parent_dir(dst);
        fs::create_dir_all(parent).map_err(|e| CopyError::io(parent, e))?;

        let json = force_json || is_json_path(dst);
        let staged = match self.stage_file(&mut reader, &metadata, dst, json) {
            Ok(staged) => staged,
            Err(e @ CopyError::ValidationFailed { .. }) => {
                remove_destination(dst)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        staged
            .persist(dst)
            .map_err(|e| CopyError::io(dst, e.error))?;

        tracing::debug!("Copied {} -> {} ({} bytes)", src.display(), dst.display(), metadata.len());
        Ok(())
    }

    /// Write `reader` to a sibling temporary of `dst`, then validate it
    ///
    /// The returned file has not been renamed yet; dropping it removes it.
    fn stage_file(
        &self,
        reader: &mut File,
        metadata: &Metadata,
        dst: &Path,
        json: bool,
    ) -> Result<NamedTempFile, CopyError> {
        let mut staged = staging_file(dst)?;

        io::copy(reader, staged.as_file_mut()).map_err(|e| CopyError::io(staged.path(), e))?;
        staged
            .as_file()
            .sync_all()
            .map_err(|e| CopyError::io(staged.path(), e))?;
        fs::set_permissions(staged.path(), owner_writable(metadata.permissions()))
            .map_err(|e| CopyError::io(staged.path(), e))?;

        if let Err(reason) = self.validator.validate(metadata.len(), staged.path(), json) {
            tracing::warn!("Rolling back copy to {}: {}", dst.display(), reason);
            return Err(CopyError::ValidationFailed {
                path: dst.to_path_buf(),
                reason,
            });
        }

        Ok(staged)
    }

    /// Recursively copy a directory tree
    ///
    /// The tree is assembled in a sibling staging directory and swapped in
    /// with a rename, replacing any previous destination tree. Every copied
    /// directory is owner-readable, -writable and -traversable.
    pub fn copy_dir(&self, src: &Path, dst: &Path) -> Result<(), CopyError> {
        let metadata = source_metadata(src)?;
        if !metadata.is_dir() {
            return Err(CopyError::NotADirectory(src.to_path_buf()));
        }

        let parent = parent_dir(dst);
        fs::create_dir_all(parent).map_err(|e| CopyError::io(parent, e))?;

        let staging = staging_dir(dst)?;
        match self.populate(src, staging.path()) {
            Ok(()) => {}
            Err(e @ CopyError::ValidationFailed { .. }) => {
                remove_destination(dst)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        fs::set_permissions(staging.path(), owner_traversable(metadata.permissions()))
            .map_err(|e| CopyError::io(staging.path(), e))?;

        replace_dir(&staging, dst)?;

        tracing::debug!("Copied directory {} -> {}", src.display(), dst.display());
        // `staging` now names a path that no longer exists; its drop is a no-op.
        Ok(())
    }

    fn populate(&self, src: &Path, staged_root: &Path) -> Result<(), CopyError> {
        for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf());
                CopyError::io(path, e.into())
            })?;
            let relative = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| CopyError::io(entry.path(), io::Error::other(e)))?;
            let target = staged_root.join(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                let metadata = entry.metadata().map_err(|e| CopyError::io(entry.path(), e.into()))?;
                fs::create_dir(&target).map_err(|e| CopyError::io(&target, e))?;
                fs::set_permissions(&target, owner_traversable(metadata.permissions()))
                    .map_err(|e| CopyError::io(&target, e))?;
            } else if file_type.is_file() {
                let mut reader = open_source(entry.path())?;
                let metadata = reader.metadata().map_err(|e| CopyError::io(entry.path(), e))?;
                let staged = self.stage_file(&mut reader, &metadata, &target, false)?;
                staged
                    .persist(&target)
                    .map_err(|e| CopyError::io(&target, e.error))?;
            } else if file_type.is_symlink() {
                copy_symlink(entry.path(), &target)?;
            } else {
                tracing::warn!("Skipping special file {}", entry.path().display());
            }
        }
        Ok(())
    }
}

/// Copy a single file with the standard validator
pub fn copy_file(src: &Path, dst: &Path) -> Result<(), CopyError> {
    CopyEngine::new().copy_file(src, dst)
}

/// Copy a directory tree with the standard validator
pub fn copy_dir(src: &Path, dst: &Path) -> Result<(), CopyError> {
    CopyEngine::new().copy_dir(src, dst)
}

fn source_metadata(src: &Path) -> Result<Metadata, CopyError> {
    fs::metadata(src).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CopyError::SourceNotFound(src.to_path_buf()),
        _ => CopyError::io(src, e),
    })
}

fn open_source(src: &Path) -> Result<File, CopyError> {
    File::open(src).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CopyError::SourceNotFound(src.to_path_buf()),
        _ => CopyError::io(src, e),
    })
}

/// Rollback: a failed validation leaves nothing at the destination
fn remove_destination(dst: &Path) -> Result<(), CopyError> {
    let result = match fs::symlink_metadata(dst) {
        Ok(existing) if existing.is_dir() => fs::remove_dir_all(dst),
        Ok(_) => fs::remove_file(dst),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CopyError::io(dst, e)),
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn is_json_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

const TEMP_SUFFIX: &str = ".kapsis-tmp";

fn temp_prefix(dst: &Path) -> String {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(".{name}.")
}

/// Temporary file beside `dst`, removed on drop unless persisted
fn staging_file(dst: &Path) -> Result<NamedTempFile, CopyError> {
    let parent = parent_dir(dst);
    Builder::new()
        .prefix(&temp_prefix(dst))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)
        .map_err(|e| CopyError::io(parent, e))
}

/// Temporary directory beside `dst`, removed on drop
pub(crate) fn staging_dir(dst: &Path) -> Result<TempDir, CopyError> {
    let parent = parent_dir(dst);
    Builder::new()
        .prefix(&temp_prefix(dst))
        .suffix(TEMP_SUFFIX)
        .tempdir_in(parent)
        .map_err(|e| CopyError::io(parent, e))
}

/// Write `contents` to `dst` through a sibling temporary and a rename
pub(crate) fn write_atomic(dst: &Path, contents: &[u8]) -> Result<(), CopyError> {
    let parent = parent_dir(dst);
    fs::create_dir_all(parent).map_err(|e| CopyError::io(parent, e))?;

    let mut staged = staging_file(dst)?;
    staged
        .as_file_mut()
        .write_all(contents)
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|e| CopyError::io(dst, e))?;
    staged
        .persist(dst)
        .map_err(|e| CopyError::io(dst, e.error))?;
    Ok(())
}

/// Swap a fully staged tree into place at `dst`
pub(crate) fn replace_dir(staging: &TempDir, dst: &Path) -> Result<(), CopyError> {
    match fs::symlink_metadata(dst) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return fs::rename(staging.path(), dst).map_err(|e| CopyError::io(dst, e));
        }
        Err(e) => return Err(CopyError::io(dst, e)),
        Ok(existing) if !existing.is_dir() => {
            fs::remove_file(dst).map_err(|e| CopyError::io(dst, e))?;
            return fs::rename(staging.path(), dst).map_err(|e| CopyError::io(dst, e));
        }
        Ok(_) => {}
    }

    // Move the old tree aside so a failed swap can be undone.
    let backup = staging_dir(dst)?;
    let previous = backup.path().join("previous");
    fs::rename(dst, &previous).map_err(|e| CopyError::io(dst, e))?;

    if let Err(e) = fs::rename(staging.path(), dst) {
        if let Err(restore) = fs::rename(&previous, dst) {
            tracing::warn!("Failed to restore {}: {}", dst.display(), restore);
        }
        return Err(CopyError::io(dst, e));
    }

    backup.close().map_err(|e| CopyError::io(dst, e))
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> Result<(), CopyError> {
    let link = fs::read_link(src).map_err(|e| CopyError::io(src, e))?;
    std::os::unix::fs::symlink(&link, target).map_err(|e| CopyError::io(target, e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _target: &Path) -> Result<(), CopyError> {
    tracing::warn!("Skipping symlink {}", src.display());
    Ok(())
}

#[cfg(unix)]
fn owner_writable(perms: Permissions) -> Permissions {
    use std::os::unix::fs::PermissionsExt;
    Permissions::from_mode((perms.mode() & 0o7777) | 0o200)
}

#[cfg(not(unix))]
fn owner_writable(mut perms: Permissions) -> Permissions {
    perms.set_readonly(false);
    perms
}

#[cfg(unix)]
fn owner_traversable(perms: Permissions) -> Permissions {
    use std::os::unix::fs::PermissionsExt;
    Permissions::from_mode((perms.mode() & 0o7777) | 0o700)
}

#[cfg(not(unix))]
fn owner_traversable(perms: Permissions) -> Permissions {
    owner_writable(perms)
}
