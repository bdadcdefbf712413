// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable store of completed-transfer records.
//!
//! The whole record set lives in one JSON file that is rewritten on every
//! change. Writes go to a temp file which is synced and renamed over the
//! original, so readers see either the old set or the new one. A sibling
//! `.lock` file serializes writers across processes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use url::Url;

use super::types::TransferRecord;
use crate::error::{DownloadError, Result};

/// Default timeout for acquiring file locks
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Current on-disk format version.
const FORMAT_VERSION: u32 = 1;

/// On-disk layout of the record file.
#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    version: u32,
    saved_at: Option<DateTime<Utc>>,
    records: Vec<TransferRecord>,
}

/// Owner of the completed-record list.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    records: Vec<TransferRecord>,
}

impl RecordStore {
    /// Store backed by `path`. Nothing is read until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Read the record file.
    ///
    /// A missing or unreadable file yields an empty set. Records whose local
    /// file no longer exists are dropped, and the pruned set is written back.
    pub fn load(&mut self) -> Vec<TransferRecord> {
        let stored = match self.read_file() {
            Ok(Some(file)) => file.records,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Ignoring unreadable record file: {}", e);
                Vec::new()
            }
        };

        let total = stored.len();
        let surviving: Vec<TransferRecord> = stored
            .into_iter()
            .filter(|record| record.local_path.is_file())
            .collect();

        let dropped = total - surviving.len();
        if dropped > 0 {
            tracing::info!(dropped, "Dropping records whose files were removed");
            if let Err(e) = self.save(surviving.clone()) {
                tracing::warn!("Failed to rewrite pruned record file: {}", e);
            }
        }

        self.records = surviving;
        self.records.clone()
    }

    fn read_file(&self) -> Result<Option<RecordFile>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let lock_file = open_lock_file(&self.lock_path())?;
        acquire_shared_lock_with_timeout(&lock_file, LOCK_TIMEOUT)?;

        let content = fs::read_to_string(&self.path)?;
        let file: RecordFile = serde_json::from_str(&content)?;
        if file.version > FORMAT_VERSION {
            tracing::warn!(version = file.version, "Record file is from a newer version; reading anyway");
        }
        Ok(Some(file))
    }

    /// Replace the stored set with `records`. All or nothing: on error the
    /// file and the in-memory set are unchanged.
    pub fn save(&mut self, records: Vec<TransferRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let _lock_guard = acquire_exclusive_lock_with_timeout(&self.lock_path(), LOCK_TIMEOUT)?;

        let file = RecordFile {
            version: FORMAT_VERSION,
            saved_at: Some(Utc::now()),
            records,
        };
        let content = serde_json::to_string_pretty(&file)?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            temp_file.write_all(content.as_bytes())?;
            temp_file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        self.records = file.records;
        Ok(())
    }

    /// Add a record, replacing any earlier record for the same source.
    pub fn append(&mut self, record: TransferRecord) -> Result<()> {
        let mut next: Vec<TransferRecord> = self
            .records
            .iter()
            .filter(|r| r.source_url != record.source_url)
            .cloned()
            .collect();
        next.push(record);
        self.save(next)
    }

    /// Remove the record for a local file.
    pub fn remove(&mut self, local_path: &Path) -> Result<TransferRecord> {
        let position = self
            .records
            .iter()
            .position(|r| r.local_path == local_path)
            .ok_or_else(|| DownloadError::NotFound(local_path.display().to_string()))?;

        let mut next = self.records.clone();
        let removed = next.remove(position);
        self.save(next)?;
        Ok(removed)
    }

    pub fn records(&self) -> &[TransferRecord] {
        &self.records
    }

    pub fn find_by_source(&self, source: &Url) -> Option<&TransferRecord> {
        self.records.iter().find(|r| &r.source_url == source)
    }

    pub fn find_by_local_path(&self, local_path: &Path) -> Option<&TransferRecord> {
        self.records.iter().find(|r| r.local_path == local_path)
    }

    /// Sum of recorded file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.file_size).sum()
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// Acquire an exclusive lock with timeout.
///
/// Returns the locked file handle; the lock is released when it is dropped.
fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    retry_lock(timeout, || FileExt::try_lock_exclusive(&lock_file))?;
    Ok(lock_file)
}

/// Acquire a shared lock with timeout.
fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
    retry_lock(timeout, || FileExt::try_lock_shared(file))
}

fn retry_lock(timeout: Duration, mut attempt: impl FnMut() -> io::Result<()>) -> Result<()> {
    let start = Instant::now();
    loop {
        match attempt() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    return Err(DownloadError::Storage(format!(
                        "Timed out waiting for record file lock after {:?}. \
                         Another instance may be writing records.",
                        timeout
                    )));
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
