// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error type shared by the download subsystem.
//!
//! Structural errors (`DuplicateTransfer`, `NotActive`, `NotPaused`, `NotFound`)
//! are returned to the caller and leave scheduler state untouched. Runtime
//! failures (`Transport`, `Storage`) end up on [`TransferState::last_error`]
//! and move the transfer to `failed`.
//!
//! [`TransferState::last_error`]: crate::download::TransferState::last_error

use url::Url;

use crate::download::{TransferId, TransferState};

/// Result alias for download operations.
pub type Result<T, E = DownloadError> = std::result::Result<T, E>;

/// Errors produced by the download subsystem.
///
/// `Clone` so the error can travel inside broadcast snapshots.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
    /// A non-terminal transfer already exists for this source.
    #[error("a transfer for {url} is already in progress")]
    DuplicateTransfer { url: Url },

    /// A completed record already covers this source.
    #[error("{} is already downloaded", .0.source_url)]
    AlreadyPresent(Box<TransferState>),

    /// Pause requested for a transfer that is not downloading.
    #[error("transfer {0} is not downloading")]
    NotActive(TransferId),

    /// Resume requested for a transfer that is not paused.
    #[error("transfer {0} is not paused")]
    NotPaused(TransferId),

    /// Lookup or delete miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Failure reported by the transport.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Filesystem or persistence failure.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The transfer may not start under the current cellular policy.
    #[error("{url} is waiting for an unmetered connection")]
    PolicyRejected { url: Url },

    /// The scheduler mailbox is closed.
    #[error("download scheduler is not running")]
    SchedulerClosed,
}

impl DownloadError {
    /// Returns true for errors that were caused by the caller's request
    /// rather than by a failure while transferring.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            DownloadError::DuplicateTransfer { .. }
                | DownloadError::AlreadyPresent(_)
                | DownloadError::NotActive(_)
                | DownloadError::NotPaused(_)
                | DownloadError::NotFound(_)
        )
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(err: serde_json::Error) -> Self {
        DownloadError::Storage(format!("record file: {err}"))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Transport(err.to_string())
    }
}
