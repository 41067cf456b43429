//! Data-directory registry — single source of truth for persisted file paths.
//!
//! Every subsystem resolves its on-disk artifacts through [`DataDir`] so that
//! the layout lives in exactly one place. Writes that must survive a crash go
//! through [`write_atomic`] (write-temp-then-rename).

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use rand::RngCore;

use crate::error::{AgentError, ErrorCode, Result};

const GROUP_HISTORY_DIR: &str = "group_history";

/// Resolved data directory for one agent instance.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory tree if missing.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.root.join(GROUP_HISTORY_DIR))?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn server_pid(&self) -> PathBuf {
        self.root.join("server.pid")
    }

    pub fn storage_key(&self) -> PathBuf {
        self.root.join(".storage_key")
    }

    pub fn identity(&self) -> PathBuf {
        self.root.join("identity.json")
    }

    pub fn messages(&self) -> PathBuf {
        self.root.join("messages.jsonl")
    }

    pub fn commands(&self) -> PathBuf {
        self.root.join("commands.jsonl")
    }

    pub fn results(&self) -> PathBuf {
        self.root.join("results.jsonl")
    }

    pub fn health(&self) -> PathBuf {
        self.root.join("health.json")
    }

    pub fn groups(&self) -> PathBuf {
        self.root.join("groups.json")
    }

    pub fn offline_queue(&self) -> PathBuf {
        self.root.join("offline_queue.jsonl")
    }

    pub fn relay_stats(&self) -> PathBuf {
        self.root.join("relay_stats.json")
    }

    /// Per-group history journal. The id is validated so a hostile group id
    /// can never name a path outside the data directory.
    pub fn group_history(&self, group_id: &str) -> Result<PathBuf> {
        if group_id.is_empty() || !group_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AgentError::new(
                ErrorCode::FileError,
                format!("unsafe group id for history path: {group_id:?}"),
            ));
        }
        let path = self
            .root
            .join(GROUP_HISTORY_DIR)
            .join(format!("{group_id}.jsonl"));
        self.guard_inside(&path)?;
        Ok(path)
    }

    /// Reject any path that lexically escapes the data directory.
    pub fn guard_inside(&self, path: &Path) -> Result<()> {
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes || !path.starts_with(&self.root) {
            return Err(AgentError::new(
                ErrorCode::FileError,
                format!("path resolves outside the data directory: {}", path.display()),
            ));
        }
        Ok(())
    }
}

/// Random 32-hex-char identifier (queue entries, groups, events).
pub fn new_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Write `bytes` to a sibling temp file, flush, then atomically rename over
/// `path`. Readers observe either the old or the new content, never a mix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_sibling(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Same as [`write_atomic`] but with owner-only permissions on the final file.
#[cfg(unix)]
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let tmp = temp_sibling(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic(path, bytes)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "file".into());
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
