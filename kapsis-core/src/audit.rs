//! Append-only scope violation log
//!
//! One JSON object per line. Each record is serialized in full before it is
//! written with a single `write_all` on an append-mode handle, under a
//! process-wide lock, so concurrent runs never interleave partial lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

static AUDIT_LOCK: Mutex<()> = Mutex::new(());

/// Render raw path bytes for a record
///
/// Valid UTF-8 passes through unchanged. Each byte that is not part of a
/// valid sequence becomes `\xNN`, so distinct names stay distinct.
pub fn path_text(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
        for byte in chunk.invalid() {
            let _ = write!(text, "\\x{byte:02x}");
        }
    }
    text
}

/// A blocked-path finding for one sandboxed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeViolation {
    pub timestamp: DateTime<Utc>,
    /// Container path the verified tree was mounted at
    pub mount_root: String,
    /// `overlay` or `worktree`
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Every blocked path, mount-root-relative, in discovery order
    pub violations: Vec<String>,
}

impl ScopeViolation {
    pub fn new(mount_root: impl Into<String>, mode: impl Into<String>, violations: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            mount_root: mount_root.into(),
            mode: mode.into(),
            run_id: None,
            violations,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Serialize as a single JSON line, newline included
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Handle on the audit log file
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, creating the log and its parent directories
    pub fn append(&self, record: &ScopeViolation) -> std::io::Result<()> {
        let line = record.to_json_line()?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let _guard = AUDIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }

    /// Read every record back; used by tooling and tests
    pub fn read_all(&self) -> std::io::Result<Vec<ScopeViolation>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(std::io::Error::from))
            .collect()
    }
}
