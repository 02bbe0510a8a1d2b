//! Mounted files: content the user pinned into the stable prefix.
//!
//! Each mounted file renders as one system notice in the stable layer, in
//! mount order. The table is keyed by normalized absolute path so `./a.rs`,
//! `a.rs` and `/work/a.rs` all name the same entry.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Message;

/// Leading text of every mount notice.
///
/// Both the notice writer and the cache-hint check reference this constant
/// so they can't drift out of sync.
pub const MOUNTED_FILE_PREFIX: &str = "User added file";

/// Notice text for a mounted file.
pub fn mount_notice(display_path: &str, content: &str) -> String {
    format!("{MOUNTED_FILE_PREFIX} '{display_path}':\n\n{content}")
}

pub fn is_mount_notice(content: &str) -> bool {
    content.starts_with(MOUNTED_FILE_PREFIX)
}

/// Absolute, lexically cleaned form of `path` (`.` dropped, `..` applied).
/// The filesystem is not consulted, so the file need not exist.
pub fn normalize_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct MountedFile {
    /// Normalized absolute path.
    pub path: PathBuf,
    /// Path as the caller named it; used in the notice.
    pub display_path: String,
    pub content: String,
    pub token_count: usize,
    pub refreshed_at: DateTime<Utc>,
}

impl MountedFile {
    pub fn notice(&self) -> Message {
        Message::system(mount_notice(&self.display_path, &self.content))
    }
}

/// Mounted files in mount order.
#[derive(Debug, Default, Clone)]
pub struct MountTable {
    files: Vec<MountedFile>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. A replaced file keeps its position. Returns true
    /// when the path was not mounted before.
    pub fn mount(&mut self, file: MountedFile) -> bool {
        match self.files.iter_mut().find(|f| f.path == file.path) {
            Some(existing) => {
                *existing = file;
                false
            }
            None => {
                self.files.push(file);
                true
            }
        }
    }

    pub fn unmount(&mut self, path: &Path) -> Option<MountedFile> {
        let index = self.files.iter().position(|f| f.path == path)?;
        Some(self.files.remove(index))
    }

    pub fn get(&self, path: &Path) -> Option<&MountedFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut MountedFile> {
        self.files.iter_mut().find(|f| f.path == path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountedFile> {
        self.files.iter()
    }

    /// Stable-layer notices, one per file.
    pub fn notices(&self) -> Vec<Message> {
        self.files.iter().map(MountedFile::notice).collect()
    }

    pub fn total_tokens(&self) -> usize {
        self.files.iter().map(|f| f.token_count).sum()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}
