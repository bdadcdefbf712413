// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Storage directory owned by the download subsystem.
//!
//! Layout:
//!
//! ```text
//! <root>/
//! ├── records.json        completed-transfer records
//! ├── records.lock        advisory lock for the record file
//! ├── .partial/<id>.part  bytes of in-flight transfers
//! └── media/<files>       completed downloads
//! ```
//!
//! All operations are synchronous and fallible; they run inside the
//! scheduler's serialization point.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use url::Url;

use super::types::TransferId;
use crate::error::Result;

const PARTIAL_DIR: &str = ".partial";
const RECORD_FILE: &str = "records.json";
const MEDIA_DIR: &str = "media";

/// Maximum length of a sanitized file name component.
const MAX_NAME_LEN: usize = 120;

/// Filesystem operations over the storage root.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open the storage root, creating it and its subdirectories if absent.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let storage = Self { root: root.into() };
        storage.create_dir(&storage.root)?;
        storage.create_dir(&storage.partial_dir())?;
        storage.create_dir(&storage.media_dir())?;
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the durable record file.
    pub fn record_file(&self) -> PathBuf {
        self.root.join(RECORD_FILE)
    }

    /// Completed downloads live here, apart from the record store's own files.
    pub fn media_dir(&self) -> PathBuf {
        self.root.join(MEDIA_DIR)
    }

    pub fn partial_dir(&self) -> PathBuf {
        self.root.join(PARTIAL_DIR)
    }

    /// Where the transport writes bytes for a transfer.
    pub fn partial_path(&self, id: TransferId) -> PathBuf {
        self.partial_dir().join(format!("{id}.part"))
    }

    /// Create a directory (and parents) if absent.
    pub fn create_dir(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        Ok(())
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    pub fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    /// Delete a file. A file that is already gone counts as deleted.
    pub fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Free bytes on the volume holding the storage root.
    pub fn available_space(&self) -> Result<u64> {
        Ok(fs2::available_space(&self.root)?)
    }

    /// Remove leftover partial files from a previous run.
    pub fn clear_partials(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(self.partial_dir())? {
            let path = entry?.path();
            if path.is_file() {
                self.delete(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Move a finished temporary file into the media directory under `name`,
    /// returning the final path and its size.
    pub fn adopt(&self, temporary: &Path, name: &str, id: TransferId) -> Result<(PathBuf, u64)> {
        let destination = self.unique_destination(name, id);
        self.move_file(temporary, &destination)?;
        let size = self.file_size(&destination)?;
        Ok((destination, size))
    }

    /// Rename, falling back to copy + delete across filesystems.
    pub fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            self.create_dir(parent)?;
        }
        if fs::rename(from, to).is_ok() {
            return Ok(());
        }
        fs::copy(from, to)?;
        self.delete(from)
    }

    /// `name` inside the media directory, or `name-<short id>` when that is taken.
    fn unique_destination(&self, name: &str, id: TransferId) -> PathBuf {
        let media = self.media_dir();
        let candidate = media.join(name);
        if !candidate.exists() {
            return candidate;
        }
        let path = Path::new(name);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
        let suffixed = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{stem}-{}.{ext}", id.short()),
            None => format!("{stem}-{}", id.short()),
        };
        media.join(suffixed)
    }
}

/// Pick the local file name for a transfer: the hint, else the last URL path
/// segment, else the id.
pub fn destination_name(hint: Option<&str>, source: &Url, id: TransferId) -> String {
    let from_url = source
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty());

    hint.or(from_url)
        .map(sanitize_file_name)
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| id.to_string())
}

fn sanitize_file_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.' | ' ') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    trimmed.chars().take(MAX_NAME_LEN).collect()
}
