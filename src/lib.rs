// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! tapedeck - network-aware background media downloader
//!
//! Fetches remote media to local storage under a concurrency cap, pauses and
//! resumes with the network, and keeps durable records of what is on disk.
//!
//! # Core Modules
//!
//! - [`download`] - Scheduler, transport, records and progress broadcasting
//! - [`config`] - JSON configuration under the platform config directory
//! - [`error`] - The download error type
//! - [`sync`] - Poison-tolerant lock helpers

pub mod config;
pub mod download;
pub mod error;
pub mod sync;

pub use config::{load_config, Config, NetworkConfig};
pub use download::{
    DownloadManager, HttpTransport, NetworkObserver, NetworkPathState, Phase, TransferHandle,
    TransferId, TransferRecord, TransferRequest, TransferState,
};
pub use error::{DownloadError, Result};
