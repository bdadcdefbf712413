// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types: requests, per-transfer state, durable records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::DownloadError;

/// Unique identifier of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in file names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TransferId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A caller's request to download one remote resource. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    /// Unique identifier
    pub id: TransferId,
    /// Remote resource to fetch
    pub source_url: Url,
    /// Preferred local file name
    pub destination_hint: Option<String>,
    /// Opaque caller data, persisted with the record
    pub metadata: Option<serde_json::Value>,
    /// Per-request override of the cellular policy (`None` follows the global flag)
    pub allows_metered: Option<bool>,
}

impl TransferRequest {
    /// Create a request for a source URL.
    pub fn new(source_url: Url) -> Self {
        Self {
            id: TransferId::new(),
            source_url,
            destination_hint: None,
            metadata: None,
            allows_metered: None,
        }
    }

    /// Set the preferred local file name.
    pub fn with_destination_hint(mut self, hint: impl Into<String>) -> Self {
        self.destination_hint = Some(hint.into());
        self
    }

    /// Attach caller metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Override the global cellular policy for this request.
    pub fn allow_metered(mut self, allowed: bool) -> Self {
        self.allows_metered = Some(allowed);
        self
    }
}

/// Why a transfer is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseReason {
    /// Paused by the caller; waits for an explicit resume
    User,
    /// Network became unreachable
    Offline,
    /// Connection became metered while cellular downloads are disallowed
    Metered,
    /// Scheduler shut down with the transfer in flight
    Shutdown,
}

/// Lifecycle phase of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Phase {
    /// Waiting for a concurrency slot or for the network
    Pending,
    /// Bytes are moving
    Downloading,
    /// Suspended; keeps its partial bytes
    Paused(PauseReason),
    /// Stored locally and recorded
    Completed,
    /// Ended with an error
    Failed(String),
    /// Cancelled by the caller
    Cancelled,
}

impl Phase {
    /// Terminal phases never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed(_) | Phase::Cancelled)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Phase::Paused(_))
    }

    /// Short label for status output.
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Downloading => "downloading",
            Phase::Paused(_) => "paused",
            Phase::Completed => "completed",
            Phase::Failed(_) => "failed",
            Phase::Cancelled => "cancelled",
        }
    }
}

/// Point-in-time state of one transfer, owned and mutated only by the scheduler.
#[derive(Debug, Clone)]
pub struct TransferState {
    /// Transfer id (same as the request id)
    pub id: TransferId,
    /// Remote resource
    pub source_url: Url,
    /// Final local file, set once completed
    pub local_path: Option<PathBuf>,
    /// Completed fraction in `[0.0, 1.0]`
    pub fraction: f64,
    /// Current phase
    pub phase: Phase,
    /// Total size when the transport knows it
    pub total_bytes: Option<u64>,
    /// Bytes received so far
    pub downloaded_bytes: u64,
    /// When the transfer was enqueued
    pub started_at: DateTime<Utc>,
    /// Set on a terminal phase
    pub ended_at: Option<DateTime<Utc>>,
    /// Caller metadata from the request
    pub metadata: Option<serde_json::Value>,
    /// Last failure or policy hold
    pub last_error: Option<DownloadError>,
    /// Number of transport starts so far; byte counters are monotonic within one attempt
    pub attempt: u32,
    /// Average speed over the current attempt
    pub speed_bps: Option<u64>,
    /// Estimated seconds remaining
    pub eta_seconds: Option<u64>,
}

impl TransferState {
    /// Fresh `pending` state for a request.
    pub fn pending(request: &TransferRequest) -> Self {
        Self {
            id: request.id,
            source_url: request.source_url.clone(),
            local_path: None,
            fraction: 0.0,
            phase: Phase::Pending,
            total_bytes: None,
            downloaded_bytes: 0,
            started_at: Utc::now(),
            ended_at: None,
            metadata: request.metadata.clone(),
            last_error: None,
            attempt: 0,
            speed_bps: None,
            eta_seconds: None,
        }
    }

    /// Completed snapshot rebuilt from a durable record.
    pub fn from_record(record: &TransferRecord) -> Self {
        let started_at = record
            .attempt_duration_ms
            .and_then(|ms| chrono::Duration::try_milliseconds(ms as i64))
            .map(|d| record.completed_at - d)
            .unwrap_or(record.completed_at);
        Self {
            id: record.id,
            source_url: record.source_url.clone(),
            local_path: Some(record.local_path.clone()),
            fraction: 1.0,
            phase: Phase::Completed,
            total_bytes: Some(record.file_size),
            downloaded_bytes: record.file_size,
            started_at,
            ended_at: Some(record.completed_at),
            metadata: record.metadata.clone(),
            last_error: None,
            attempt: 0,
            speed_bps: None,
            eta_seconds: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Get formatted ETA string.
    pub fn eta_string(&self) -> Option<String> {
        self.eta_seconds.map(|secs| {
            if secs >= 3600 {
                format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
            } else if secs >= 60 {
                format!("{}m {}s", secs / 60, secs % 60)
            } else {
                format!("{}s", secs)
            }
        })
    }
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Durable metadata for a completed transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Id of the transfer that produced the file
    pub id: TransferId,
    /// Remote source
    pub source_url: Url,
    /// Stored file
    pub local_path: PathBuf,
    /// Completion time
    pub completed_at: DateTime<Utc>,
    /// Size on disk
    pub file_size: u64,
    /// Caller metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Duration of the successful attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_duration_ms: Option<u64>,
}

/// Reachability and metering of the current network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPathState {
    pub reachable: bool,
    pub metered: bool,
}

impl NetworkPathState {
    pub const OFFLINE: Self = Self { reachable: false, metered: false };
    pub const UNMETERED: Self = Self { reachable: true, metered: false };
    pub const METERED: Self = Self { reachable: true, metered: true };
}

impl Default for NetworkPathState {
    fn default() -> Self {
        Self::UNMETERED
    }
}

/// Network path plus the cellular policy; published whenever either changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub path: NetworkPathState,
    pub cellular_allowed: bool,
}

impl NetworkPolicy {
    /// Whether a transfer with the given per-request override may run now.
    pub fn permits(&self, allows_metered: Option<bool>) -> bool {
        self.path.reachable && (!self.path.metered || allows_metered.unwrap_or(self.cellular_allowed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TransferRequest {
        TransferRequest::new(Url::parse("https://media.example/ep1.mp3").unwrap())
    }

    #[test]
    fn test_pending_state_from_request() {
        let req = request().with_metadata(serde_json::json!({"title": "Episode 1"}));
        let state = TransferState::pending(&req);
        assert_eq!(state.id, req.id);
        assert_eq!(state.phase, Phase::Pending);
        assert_eq!(state.downloaded_bytes, 0);
        assert!(state.local_path.is_none());
        assert!(state.ended_at.is_none());
        assert_eq!(state.metadata, req.metadata);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Failed("boom".into()).is_terminal());
        assert!(Phase::Cancelled.is_terminal());
        assert!(!Phase::Pending.is_terminal());
        assert!(!Phase::Downloading.is_terminal());
        assert!(!Phase::Paused(PauseReason::User).is_terminal());
    }

    #[test]
    fn test_state_from_record_is_completed() {
        let record = TransferRecord {
            id: TransferId::new(),
            source_url: Url::parse("https://media.example/ep2.mp3").unwrap(),
            local_path: PathBuf::from("/tmp/ep2.mp3"),
            completed_at: Utc::now(),
            file_size: 42,
            metadata: None,
            attempt_duration_ms: Some(1500),
        };
        let state = TransferState::from_record(&record);
        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(state.fraction, 1.0);
        assert_eq!(state.local_path.as_deref(), Some(record.local_path.as_path()));
        assert_eq!(state.ended_at, Some(record.completed_at));
        assert!(state.started_at < record.completed_at);
    }

    #[test]
    fn test_policy_permits() {
        let metered_blocked = NetworkPolicy { path: NetworkPathState::METERED, cellular_allowed: false };
        assert!(!metered_blocked.permits(None));
        assert!(metered_blocked.permits(Some(true)));

        let offline = NetworkPolicy { path: NetworkPathState::OFFLINE, cellular_allowed: true };
        assert!(!offline.permits(Some(true)));

        let wifi = NetworkPolicy { path: NetworkPathState::UNMETERED, cellular_allowed: false };
        assert!(wifi.permits(None));
        assert!(wifi.permits(Some(false)));
    }

    #[test]
    fn test_eta_string() {
        let mut state = TransferState::pending(&request());
        state.eta_seconds = Some(3725);
        assert_eq!(state.eta_string().as_deref(), Some("1h 2m"));
        state.eta_seconds = Some(75);
        assert_eq!(state.eta_string().as_deref(), Some("1m 15s"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(10_485_760), "10.0 MB");
    }
}
