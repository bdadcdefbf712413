// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: the public face of the scheduler.
//!
//! All state lives in a [`SchedulerCore`] owned by one background task. The
//! task drains three inputs with a fixed priority: network edges, then
//! transport callbacks, then caller commands. A caller command therefore
//! observes every callback that was queued before it.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use super::progress::ProgressReceiver;
use super::scheduler::{SchedulerConfig, SchedulerCore, TransferHandle};
use super::storage::Storage;
use super::transport::{Transport, TransportEvent};
use super::types::{NetworkPathState, NetworkPolicy, TransferId, TransferRecord, TransferRequest, TransferState};
use crate::error::{DownloadError, Result};

/// Capacity of the command mailbox.
const COMMAND_BUFFER: usize = 100;

/// Commands that can be sent to the download worker.
#[derive(Debug)]
enum DownloadCommand {
    Enqueue { request: TransferRequest, reply: oneshot::Sender<Result<TransferHandle>> },
    Cancel { id: TransferId, reply: oneshot::Sender<()> },
    Pause { id: TransferId, reply: oneshot::Sender<Result<()>> },
    Resume { id: TransferId, reply: oneshot::Sender<Result<TransferHandle>> },
    SetCellularPolicy { allowed: bool, reply: oneshot::Sender<()> },
    LocalPath { source: Url, reply: oneshot::Sender<Option<PathBuf>> },
    DeleteRecord { path: PathBuf, reply: oneshot::Sender<Result<TransferRecord>> },
    Records { reply: oneshot::Sender<Vec<TransferRecord>> },
    TotalStoredBytes { reply: oneshot::Sender<u64> },
    Snapshot { id: TransferId, reply: oneshot::Sender<Option<TransferState>> },
    Transfers { reply: oneshot::Sender<Vec<TransferState>> },
    /// Pause everything in flight and stop the worker
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to the background download scheduler.
///
/// Cheap to clone; every clone talks to the same worker.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    /// Channel to send commands to the worker
    command_tx: mpsc::Sender<DownloadCommand>,
    progress: ProgressReceiver,
    policy: watch::Receiver<NetworkPolicy>,
}

impl DownloadManager {
    /// Start the scheduler over `storage`.
    ///
    /// Loads durable records, clears stale partial files and spawns the
    /// worker. `network` delivers path changes; `initial_path` is assumed
    /// until the first one arrives. Must be called inside a Tokio runtime.
    pub fn start(
        storage: Storage,
        config: SchedulerConfig,
        transport: Arc<dyn Transport>,
        initial_path: NetworkPathState,
        network: mpsc::Receiver<NetworkPathState>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let core = SchedulerCore::new(config, transport, storage, initial_path, events_tx);
        let progress = core.subscribe_progress();
        let policy = core.subscribe_policy();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(Self::worker_loop(core, command_rx, events_rx, network));

        Self { command_tx, progress, policy }
    }

    /// Queue a transfer. Returns a stream of its state snapshots.
    pub async fn enqueue(&self, request: TransferRequest) -> Result<TransferHandle> {
        self.call(|reply| DownloadCommand::Enqueue { request, reply }).await?
    }

    /// Cancel a transfer. Unknown or finished ids are ignored.
    pub async fn cancel(&self, id: TransferId) -> Result<()> {
        self.call(|reply| DownloadCommand::Cancel { id, reply }).await
    }

    pub async fn pause(&self, id: TransferId) -> Result<()> {
        self.call(|reply| DownloadCommand::Pause { id, reply }).await?
    }

    /// Resume a paused transfer. Returns a fresh state stream.
    pub async fn resume(&self, id: TransferId) -> Result<TransferHandle> {
        self.call(|reply| DownloadCommand::Resume { id, reply }).await?
    }

    /// Allow or forbid downloads on metered connections.
    pub async fn set_cellular_policy(&self, allowed: bool) -> Result<()> {
        self.call(|reply| DownloadCommand::SetCellularPolicy { allowed, reply }).await
    }

    /// Local file for a completed source, if one is recorded.
    pub async fn local_path(&self, source: &Url) -> Result<Option<PathBuf>> {
        let source = source.clone();
        self.call(|reply| DownloadCommand::LocalPath { source, reply }).await
    }

    /// Delete a completed file and its record.
    pub async fn delete_record(&self, path: impl Into<PathBuf>) -> Result<TransferRecord> {
        let path = path.into();
        self.call(|reply| DownloadCommand::DeleteRecord { path, reply }).await?
    }

    pub async fn all_records(&self) -> Result<Vec<TransferRecord>> {
        self.call(|reply| DownloadCommand::Records { reply }).await
    }

    /// Sum of all recorded file sizes.
    pub async fn total_stored_bytes(&self) -> Result<u64> {
        self.call(|reply| DownloadCommand::TotalStoredBytes { reply }).await
    }

    /// Current state of one transfer.
    pub async fn snapshot(&self, id: TransferId) -> Result<Option<TransferState>> {
        self.call(|reply| DownloadCommand::Snapshot { id, reply }).await
    }

    /// Current state of every tracked transfer, ordered by id.
    pub async fn transfers(&self) -> Result<Vec<TransferState>> {
        self.call(|reply| DownloadCommand::Transfers { reply }).await
    }

    /// Subscribe to whole-map progress snapshots.
    pub fn progress(&self) -> ProgressReceiver {
        self.progress.clone()
    }

    /// Subscribe to network path and cellular policy changes.
    pub fn policy(&self) -> watch::Receiver<NetworkPolicy> {
        self.policy.clone()
    }

    /// Pause in-flight transfers and stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| DownloadCommand::Shutdown { reply }).await
    }

    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> DownloadCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| DownloadError::SchedulerClosed)?;
        rx.await.map_err(|_| DownloadError::SchedulerClosed)
    }

    /// Background worker loop that serializes every state change.
    async fn worker_loop(
        mut core: SchedulerCore,
        mut command_rx: mpsc::Receiver<DownloadCommand>,
        mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut network: mpsc::Receiver<NetworkPathState>,
    ) {
        let mut network_open = true;

        loop {
            tokio::select! {
                biased;

                path = network.recv(), if network_open => match path {
                    Some(path) => core.network_changed(path),
                    None => {
                        tracing::debug!("Network observer stopped; keeping last known path");
                        network_open = false;
                    }
                },

                Some(event) = events_rx.recv() => core.on_transport(event),

                command = command_rx.recv() => match command {
                    Some(DownloadCommand::Shutdown { reply }) => {
                        core.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => Self::handle(&mut core, command),
                    None => {
                        core.shutdown();
                        break;
                    }
                },
            }
        }
    }

    fn handle(core: &mut SchedulerCore, command: DownloadCommand) {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            DownloadCommand::Enqueue { request, reply } => {
                let _ = reply.send(core.enqueue(request));
            }
            DownloadCommand::Cancel { id, reply } => {
                core.cancel(id);
                let _ = reply.send(());
            }
            DownloadCommand::Pause { id, reply } => {
                let _ = reply.send(core.pause(id));
            }
            DownloadCommand::Resume { id, reply } => {
                let _ = reply.send(core.resume(id));
            }
            DownloadCommand::SetCellularPolicy { allowed, reply } => {
                core.set_cellular_policy(allowed);
                let _ = reply.send(());
            }
            DownloadCommand::LocalPath { source, reply } => {
                let _ = reply.send(core.local_path(&source));
            }
            DownloadCommand::DeleteRecord { path, reply } => {
                let _ = reply.send(core.delete_record(&path));
            }
            DownloadCommand::Records { reply } => {
                let _ = reply.send(core.records());
            }
            DownloadCommand::TotalStoredBytes { reply } => {
                let _ = reply.send(core.total_stored_bytes());
            }
            DownloadCommand::Snapshot { id, reply } => {
                let _ = reply.send(core.snapshot(id));
            }
            DownloadCommand::Transfers { reply } => {
                let _ = reply.send(core.transfers());
            }
            DownloadCommand::Shutdown { reply } => {
                core.shutdown();
                let _ = reply.send(());
            }
        }
    }
}
