// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background Download System for tapedeck
//!
//! This module fetches remote media into a local storage directory with:
//! - A concurrency cap and a FIFO pending queue
//! - Pause, resume and cancel, with byte-range resume where the server allows it
//! - Automatic pausing when the network drops or turns metered
//! - Durable records of completed files that survive restarts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ commands ┌─────────────────┐  start/pause  ┌───────────────┐
//! │ DownloadManager │─────────▶│ SchedulerCore   │──────────────▶│ Transport     │
//! │ (handle, Clone) │          │ (one tokio task)│◀──────────────│ (HttpTransport)│
//! └─────────────────┘          └───┬─────┬───────┘   callbacks   └───────────────┘
//!          ▲                       │     │            ▲
//!          │ snapshots             │     │            │ edges
//! ┌────────┴────────┐     ┌────────▼──┐  │   ┌────────┴────────┐
//! │ProgressBroadcast│◀────│ publish   │  │   │ NetworkObserver │
//! └─────────────────┘     └───────────┘  │   └─────────────────┘
//!                               ┌────────▼────────┐
//!                               │ RecordStore     │
//!                               │ (records.json)  │
//!                               └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tapedeck::download::{
//!     DownloadManager, HttpTransport, NetworkObserver, SchedulerConfig, StaticProbe, Storage,
//!     NetworkPathState, TransferRequest,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let storage = Storage::open("/var/lib/tapedeck")?;
//! let transport = Arc::new(HttpTransport::new(Duration::from_millis(100))?);
//! let (_observer, network) =
//!     NetworkObserver::spawn(StaticProbe(NetworkPathState::UNMETERED), Duration::from_secs(15));
//! let manager = DownloadManager::start(
//!     storage,
//!     SchedulerConfig::default(),
//!     transport,
//!     NetworkPathState::UNMETERED,
//!     network,
//! );
//!
//! let url = url::Url::parse("https://media.example/episode-1.mp3")?;
//! let mut handle = manager.enqueue(TransferRequest::new(url)).await?;
//! while let Some(state) = handle.next().await {
//!     println!("{} {:.0}%", state.phase.label(), state.fraction * 100.0);
//! }
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod manager;
pub mod network;
pub mod progress;
pub mod record;
pub mod scheduler;
pub mod storage;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use manager::DownloadManager;
pub use network::{EdgeDetector, HttpProbe, NetworkObserver, NetworkProbe, StaticProbe};
pub use progress::{ProgressBroadcaster, ProgressReceiver, ProgressSnapshot};
pub use record::RecordStore;
pub use scheduler::{SchedulerConfig, SchedulerCore, TransferHandle, DEFAULT_MAX_CONCURRENT};
pub use storage::{destination_name, Storage};
pub use transport::{
    HttpTransport, Transport, TransportEvent, TransportEventKind, TransportHandle, TransportJob,
    TransportSink,
};
pub use types::{
    format_bytes, NetworkPathState, NetworkPolicy, PauseReason, Phase, TransferId, TransferRecord,
    TransferRequest, TransferState,
};
