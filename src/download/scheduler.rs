// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scheduling state and transitions.
//!
//! [`SchedulerCore`] owns the transfer map, the pending queue, the active set
//! and the network policy. It is only ever driven from the manager's mailbox
//! loop, one message at a time, so none of its methods need locking.
//!
//! Queue discipline: FIFO, except that resumed and system-paused transfers
//! go to the front. When a slot frees, entries are popped from the front;
//! an entry blocked by network policy is re-queued at the back and the scan
//! continues until a slot is filled or every entry has been looked at once.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use url::Url;

use super::progress::{ProgressBroadcaster, ProgressReceiver};
use super::record::RecordStore;
use super::storage::{destination_name, Storage};
use super::transport::{
    Transport, TransportEvent, TransportEventKind, TransportHandle, TransportJob, TransportSink,
};
use super::types::{
    NetworkPathState, NetworkPolicy, PauseReason, Phase, TransferId, TransferRecord,
    TransferRequest, TransferState,
};
use crate::error::{DownloadError, Result};

/// Default number of simultaneous downloads.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cap on simultaneously downloading transfers
    pub max_concurrent: usize,
    /// Initial cellular policy
    pub cellular_allowed: bool,
    /// Free space to keep on the storage volume
    pub min_free_space: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            cellular_allowed: true,
            min_free_space: 0,
        }
    }
}

/// Per-transfer stream of state snapshots.
///
/// Yields the state at subscription time, then every change, and ends after
/// the terminal snapshot.
#[derive(Debug)]
pub struct TransferHandle {
    /// Transfer this handle follows
    pub id: TransferId,
    rx: mpsc::UnboundedReceiver<TransferState>,
    last: Option<TransferState>,
}

impl TransferHandle {
    /// Next snapshot, or `None` once the transfer has ended (or the scheduler stopped).
    pub async fn next(&mut self) -> Option<TransferState> {
        let state = self.rx.recv().await?;
        self.last = Some(state.clone());
        Some(state)
    }

    /// The most recent snapshot received through [`next`](Self::next) or [`wait`](Self::wait).
    pub fn last(&self) -> Option<&TransferState> {
        self.last.as_ref()
    }

    /// Drain the stream and return the final snapshot.
    pub async fn wait(&mut self) -> Option<TransferState> {
        while self.next().await.is_some() {}
        self.last.clone()
    }

    /// Convert into a `Stream` of the remaining snapshots.
    pub fn into_stream(self) -> tokio_stream::wrappers::UnboundedReceiverStream<TransferState> {
        tokio_stream::wrappers::UnboundedReceiverStream::new(self.rx)
    }
}

/// Scheduler-side bookkeeping for one transfer.
#[derive(Debug)]
struct Entry {
    request: TransferRequest,
    state: TransferState,
    /// Current transport attempt, if downloading
    handle: Option<TransportHandle>,
    /// Monotonic start of the current attempt, for speed and duration
    attempt_started: Option<Instant>,
    /// Byte count at the start of the current attempt
    attempt_offset: u64,
    subscribers: Vec<mpsc::UnboundedSender<TransferState>>,
}

impl Entry {
    fn notify(&mut self) {
        let state = &self.state;
        self.subscribers.retain(|tx| tx.send(state.clone()).is_ok());
    }
}

/// The serialized owner of all download state.
pub struct SchedulerCore {
    config: SchedulerConfig,
    transport: Arc<dyn Transport>,
    storage: Storage,
    records: RecordStore,
    events: mpsc::UnboundedSender<TransportEvent>,
    transfers: HashMap<TransferId, Entry>,
    by_source: HashMap<Url, TransferId>,
    queue: VecDeque<TransferId>,
    active: HashMap<TransportHandle, TransferId>,
    next_handle: u64,
    policy: NetworkPolicy,
    policy_tx: watch::Sender<NetworkPolicy>,
    progress: ProgressBroadcaster,
    dirty: bool,
}

impl SchedulerCore {
    /// Build the core. Loads durable records and clears stale partial files.
    pub fn new(
        mut config: SchedulerConfig,
        transport: Arc<dyn Transport>,
        storage: Storage,
        initial_path: NetworkPathState,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        if config.max_concurrent == 0 {
            tracing::warn!("max_concurrent of 0 would stall every transfer; using 1");
            config.max_concurrent = 1;
        }
        let mut records = RecordStore::new(storage.record_file());
        let loaded = records.load();
        match storage.clear_partials() {
            Ok(0) => {}
            Ok(n) => tracing::debug!(removed = n, "Cleared stale partial files"),
            Err(e) => tracing::warn!("Could not clear partial files: {}", e),
        }
        tracing::info!(records = loaded.len(), root = %storage.root().display(), "Download scheduler ready");

        let policy = NetworkPolicy {
            path: initial_path,
            cellular_allowed: config.cellular_allowed,
        };
        let (policy_tx, _) = watch::channel(policy);

        Self {
            config,
            transport,
            storage,
            records,
            events,
            transfers: HashMap::new(),
            by_source: HashMap::new(),
            queue: VecDeque::new(),
            active: HashMap::new(),
            next_handle: 0,
            policy,
            policy_tx,
            progress: ProgressBroadcaster::new(),
            dirty: false,
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub fn enqueue(&mut self, request: TransferRequest) -> Result<TransferHandle> {
        if self.by_source.contains_key(&request.source_url) {
            return Err(DownloadError::DuplicateTransfer { url: request.source_url });
        }
        if let Some(record) = self.records.find_by_source(&request.source_url) {
            return Err(DownloadError::AlreadyPresent(Box::new(TransferState::from_record(record))));
        }

        let id = request.id;
        tracing::debug!(id = %id, source = %request.source_url, "Enqueued transfer");
        self.by_source.insert(request.source_url.clone(), id);
        self.transfers.insert(
            id,
            Entry {
                state: TransferState::pending(&request),
                request,
                handle: None,
                attempt_started: None,
                attempt_offset: 0,
                subscribers: Vec::new(),
            },
        );
        self.queue.push_back(id);
        self.touch(id);
        self.promote();

        let handle = self.subscribe(id).ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        self.publish();
        Ok(handle)
    }

    /// Cancel a transfer. Unknown or already-terminal ids are a no-op.
    pub fn cancel(&mut self, id: TransferId) {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return;
        };
        if entry.state.is_terminal() {
            return;
        }

        if let Some(handle) = entry.handle.take() {
            self.transport.cancel(handle);
            self.active.remove(&handle);
        }
        self.queue.retain(|queued| *queued != id);
        self.discard_partial(id);

        tracing::info!(id = %id, "Transfer cancelled");
        self.finish(id, Phase::Cancelled, None);
        self.promote();
        self.publish();
    }

    pub fn pause(&mut self, id: TransferId) -> Result<()> {
        let entry = self
            .transfers
            .get_mut(&id)
            .filter(|entry| entry.state.phase == Phase::Downloading)
            .ok_or(DownloadError::NotActive(id))?;

        if let Some(handle) = entry.handle.take() {
            self.transport.pause(handle);
            self.active.remove(&handle);
        }
        Self::suspend(entry, PauseReason::User);
        self.touch(id);

        tracing::info!(id = %id, "Transfer paused");
        self.promote();
        self.publish();
        Ok(())
    }

    pub fn resume(&mut self, id: TransferId) -> Result<TransferHandle> {
        let paused = self
            .transfers
            .get(&id)
            .is_some_and(|entry| entry.state.phase.is_paused());
        if !paused {
            return Err(DownloadError::NotPaused(id));
        }

        self.queue.retain(|queued| *queued != id);
        if self.has_free_slot() && self.is_eligible(id) {
            self.start_attempt(id);
        } else {
            self.queue.push_front(id);
            if let Some(entry) = self.transfers.get_mut(&id) {
                entry.state.phase = Phase::Pending;
            }
            self.touch(id);
        }
        tracing::info!(id = %id, "Transfer resumed");

        let handle = self.subscribe(id).ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        self.publish();
        Ok(handle)
    }

    pub fn set_cellular_policy(&mut self, allowed: bool) {
        if self.policy.cellular_allowed == allowed {
            return;
        }
        self.policy.cellular_allowed = allowed;
        self.policy_tx.send_replace(self.policy);
        tracing::info!(allowed, metered = self.policy.path.metered, "Cellular policy changed");

        if self.policy.path.metered {
            if allowed {
                self.promote();
            } else {
                self.park_active(PauseReason::Metered);
            }
        }
        self.publish();
    }

    /// Apply a network sample. Only edges have any effect.
    pub fn network_changed(&mut self, path: NetworkPathState) {
        let previous = self.policy.path;
        if previous == path {
            return;
        }
        self.policy.path = path;
        self.policy_tx.send_replace(self.policy);

        if !path.reachable {
            self.park_active(PauseReason::Offline);
        } else {
            if path.metered && !self.policy.cellular_allowed {
                self.park_active(PauseReason::Metered);
            }
            self.promote();
        }
        self.publish();
    }

    pub fn local_path(&self, source: &Url) -> Option<PathBuf> {
        self.records.find_by_source(source).map(|r| r.local_path.clone())
    }

    pub fn delete_record(&mut self, local_path: &Path) -> Result<TransferRecord> {
        if self.records.find_by_local_path(local_path).is_none() {
            return Err(DownloadError::NotFound(local_path.display().to_string()));
        }
        self.storage.delete(local_path)?;
        let record = self.records.remove(local_path)?;
        tracing::info!(path = %local_path.display(), "Deleted download");
        Ok(record)
    }

    pub fn records(&self) -> Vec<TransferRecord> {
        self.records.records().to_vec()
    }

    pub fn total_stored_bytes(&self) -> u64 {
        self.records.total_bytes()
    }

    pub fn snapshot(&self, id: TransferId) -> Option<TransferState> {
        self.transfers.get(&id).map(|entry| entry.state.clone())
    }

    pub fn transfers(&self) -> Vec<TransferState> {
        self.snapshot_map().into_values().collect()
    }

    pub fn subscribe_progress(&self) -> ProgressReceiver {
        self.progress.subscribe()
    }

    pub fn subscribe_policy(&self) -> watch::Receiver<NetworkPolicy> {
        self.policy_tx.subscribe()
    }

    pub fn downloading(&self) -> usize {
        self.active.len()
    }

    /// Suspend everything in flight before the mailbox stops.
    pub fn shutdown(&mut self) {
        let running: Vec<(TransportHandle, TransferId)> = self.active.drain().collect();
        for (handle, id) in running {
            self.transport.pause(handle);
            if let Some(entry) = self.transfers.get_mut(&id) {
                entry.handle = None;
                Self::suspend(entry, PauseReason::Shutdown);
            }
            self.touch(id);
        }
        self.publish();
        tracing::info!("Download scheduler stopped");
    }

    // ------------------------------------------------------------------
    // Transport callbacks
    // ------------------------------------------------------------------

    pub fn on_transport(&mut self, event: TransportEvent) {
        let Some(&id) = self.active.get(&event.handle) else {
            tracing::debug!(handle = %event.handle, "Discarding callback for inactive attempt");
            return;
        };

        match event.kind {
            TransportEventKind::Started { offset } => self.on_started(id, offset),
            TransportEventKind::Progress { downloaded, total } => self.on_progress(id, downloaded, total),
            TransportEventKind::Complete { temporary_path } => {
                self.active.remove(&event.handle);
                self.on_complete(id, &temporary_path);
                self.promote();
            }
            TransportEventKind::Failure { error } => {
                self.active.remove(&event.handle);
                self.discard_partial(id);
                tracing::warn!(id = %id, "Transfer failed: {}", error);
                self.finish(id, Phase::Failed(error.to_string()), Some(error));
                self.promote();
            }
        }
        self.publish();
    }

    fn on_started(&mut self, id: TransferId, offset: u64) {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return;
        };
        if offset != entry.state.downloaded_bytes {
            // The transport counts from what is actually on disk: less when a
            // resume was refused, more when bytes landed after the last report.
            tracing::debug!(id = %id, offset, had = entry.state.downloaded_bytes, "Attempt offset adjusted");
            entry.state.downloaded_bytes = offset;
            entry.state.fraction = match entry.state.total_bytes {
                Some(total) if total > 0 => (offset as f64 / total as f64).min(1.0),
                _ => 0.0,
            };
        }
        entry.attempt_offset = entry.state.downloaded_bytes;
        self.touch(id);
    }

    fn on_progress(&mut self, id: TransferId, downloaded: u64, total: Option<u64>) {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return;
        };
        let newly_sized = entry.state.total_bytes.is_none() && total.is_some();

        let state = &mut entry.state;
        if total.is_some() {
            state.total_bytes = total;
        }
        let mut downloaded = downloaded.max(state.downloaded_bytes);
        if let Some(total) = state.total_bytes {
            downloaded = downloaded.min(total);
        }
        state.downloaded_bytes = downloaded;
        if let Some(total) = state.total_bytes.filter(|t| *t > 0) {
            state.fraction = state.fraction.max((downloaded as f64 / total as f64).min(1.0));
        }

        if let Some(started) = entry.attempt_started {
            let elapsed = started.elapsed().as_secs_f64();
            let moved = downloaded.saturating_sub(entry.attempt_offset);
            if elapsed > 0.0 {
                let speed = (moved as f64 / elapsed) as u64;
                state.speed_bps = Some(speed);
                state.eta_seconds = state
                    .total_bytes
                    .filter(|_| speed > 0)
                    .map(|total| total.saturating_sub(downloaded) / speed);
            }
        }

        let remaining = state.total_bytes.map(|t| t.saturating_sub(downloaded));
        self.touch(id);

        if newly_sized {
            if let Some(remaining) = remaining {
                self.check_free_space(id, remaining);
            }
        }
    }

    fn check_free_space(&mut self, id: TransferId, remaining: u64) {
        let needed = remaining.saturating_add(self.config.min_free_space);
        let available = match self.storage.available_space() {
            Ok(available) => available,
            Err(e) => {
                tracing::warn!("Could not query free space: {}", e);
                return;
            }
        };
        if available >= needed {
            return;
        }

        let error = DownloadError::Storage(format!(
            "insufficient free space: need {needed} bytes, {available} available"
        ));
        if let Some(handle) = self.transfers.get_mut(&id).and_then(|entry| entry.handle.take()) {
            self.transport.cancel(handle);
            self.active.remove(&handle);
        }
        self.discard_partial(id);
        tracing::warn!(id = %id, "Transfer failed: {}", error);
        self.finish(id, Phase::Failed(error.to_string()), Some(error));
        self.promote();
    }

    fn on_complete(&mut self, id: TransferId, temporary_path: &Path) {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return;
        };
        entry.handle = None;
        let name = destination_name(entry.request.destination_hint.as_deref(), &entry.request.source_url, id);
        let duration_ms = entry.attempt_started.map(|t| t.elapsed().as_millis() as u64);

        let (local_path, size) = match self.storage.adopt(temporary_path, &name, id) {
            Ok(adopted) => adopted,
            Err(error) => {
                self.discard_partial(id);
                tracing::warn!(id = %id, "Could not store finished download: {}", error);
                self.finish(id, Phase::Failed(error.to_string()), Some(error));
                return;
            }
        };

        let record = TransferRecord {
            id,
            source_url: entry.request.source_url.clone(),
            local_path: local_path.clone(),
            completed_at: Utc::now(),
            file_size: size,
            metadata: entry.request.metadata.clone(),
            attempt_duration_ms: duration_ms,
        };
        if let Err(error) = self.records.append(record) {
            if let Err(e) = self.storage.delete(&local_path) {
                tracing::warn!(path = %local_path.display(), "Could not remove unrecorded file: {}", e);
            }
            tracing::warn!(id = %id, "Could not record finished download: {}", error);
            self.finish(id, Phase::Failed(error.to_string()), Some(error));
            return;
        }

        if let Some(entry) = self.transfers.get_mut(&id) {
            let state = &mut entry.state;
            state.local_path = Some(local_path);
            state.total_bytes = Some(size);
            state.downloaded_bytes = size;
            state.fraction = 1.0;
            state.last_error = None;
        }
        tracing::info!(id = %id, bytes = size, "Transfer completed");
        self.finish(id, Phase::Completed, None);
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn has_free_slot(&self) -> bool {
        self.active.len() < self.config.max_concurrent
    }

    fn is_eligible(&self, id: TransferId) -> bool {
        self.transfers
            .get(&id)
            .is_some_and(|entry| self.policy.permits(entry.request.allows_metered))
    }

    /// Fill free slots from the queue.
    fn promote(&mut self) {
        if !self.policy.path.reachable {
            return;
        }

        let mut remaining = self.queue.len();
        while self.has_free_slot() && remaining > 0 {
            remaining -= 1;
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            if !self.transfers.contains_key(&id) {
                continue;
            }
            if self.is_eligible(id) {
                self.start_attempt(id);
            } else {
                self.hold_for_policy(id);
                self.queue.push_back(id);
            }
        }
    }

    fn hold_for_policy(&mut self, id: TransferId) {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return;
        };
        if entry.state.last_error.is_none() {
            entry.state.last_error = Some(DownloadError::PolicyRejected {
                url: entry.request.source_url.clone(),
            });
            self.touch(id);
        }
    }

    fn start_attempt(&mut self, id: TransferId) {
        let handle = TransportHandle(self.next_handle);
        self.next_handle += 1;

        let Some(entry) = self.transfers.get_mut(&id) else {
            return;
        };
        let offset = entry.state.downloaded_bytes;
        let job = TransportJob {
            handle,
            transfer_id: id,
            url: entry.request.source_url.clone(),
            resume_offset: (entry.state.attempt > 0).then_some(offset),
            partial_path: self.storage.partial_path(id),
        };
        let sink = TransportSink::new(handle, self.events.clone());

        match self.transport.start(job, sink) {
            Ok(()) => {
                entry.handle = Some(handle);
                entry.attempt_started = Some(Instant::now());
                entry.attempt_offset = offset;
                entry.state.phase = Phase::Downloading;
                entry.state.attempt += 1;
                entry.state.last_error = None;
                self.active.insert(handle, id);
                tracing::debug!(id = %id, handle = %handle, "Transfer started");
                self.touch(id);
            }
            Err(error) => {
                tracing::warn!(id = %id, "Transport refused to start: {}", error);
                self.finish(id, Phase::Failed(error.to_string()), Some(error));
            }
        }
    }

    /// Pause downloading transfers the current policy no longer permits and put
    /// them at the front of the queue, keeping their start order.
    fn park_active(&mut self, reason: PauseReason) {
        let mut parked: Vec<(Instant, TransportHandle, TransferId)> = self
            .active
            .iter()
            .filter(|(_, id)| !self.is_eligible(**id))
            .filter_map(|(handle, id)| {
                let started = self.transfers.get(id)?.attempt_started?;
                Some((started, *handle, *id))
            })
            .collect();
        parked.sort();

        for (_, handle, id) in parked.into_iter().rev() {
            self.transport.pause(handle);
            self.active.remove(&handle);
            if let Some(entry) = self.transfers.get_mut(&id) {
                entry.handle = None;
                Self::suspend(entry, reason);
                if reason == PauseReason::Metered {
                    entry.state.last_error = Some(DownloadError::PolicyRejected {
                        url: entry.request.source_url.clone(),
                    });
                }
            }
            self.queue.push_front(id);
            tracing::info!(id = %id, ?reason, "Transfer paused by network policy");
            self.touch(id);
        }
    }

    fn suspend(entry: &mut Entry, reason: PauseReason) {
        entry.state.phase = Phase::Paused(reason);
        entry.state.speed_bps = None;
        entry.state.eta_seconds = None;
        entry.attempt_started = None;
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn finish(&mut self, id: TransferId, phase: Phase, error: Option<DownloadError>) {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return;
        };
        entry.handle = None;
        entry.state.phase = phase;
        entry.state.ended_at = Some(Utc::now());
        entry.state.speed_bps = None;
        entry.state.eta_seconds = None;
        if error.is_some() {
            entry.state.last_error = error;
        }
        self.touch(id);
    }

    fn discard_partial(&self, id: TransferId) {
        let partial = self.storage.partial_path(id);
        if let Err(e) = self.storage.delete(&partial) {
            tracing::warn!(id = %id, "Could not remove partial file: {}", e);
        }
    }

    fn subscribe(&mut self, id: TransferId) -> Option<TransferHandle> {
        let entry = self.transfers.get_mut(&id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(entry.state.clone());
        if !entry.state.is_terminal() {
            entry.subscribers.push(tx);
        }
        Some(TransferHandle { id, rx, last: None })
    }

    /// Forward the entry's state to its subscribers and mark the map dirty.
    fn touch(&mut self, id: TransferId) {
        if let Some(entry) = self.transfers.get_mut(&id) {
            entry.notify();
            self.dirty = true;
        }
    }

    fn snapshot_map(&self) -> BTreeMap<TransferId, TransferState> {
        self.transfers
            .iter()
            .map(|(id, entry)| (*id, entry.state.clone()))
            .collect()
    }

    /// Broadcast the whole map, then forget transfers whose terminal state
    /// has now been delivered.
    fn publish(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.progress.publish(self.snapshot_map());

        let ended: Vec<TransferId> = self
            .transfers
            .iter()
            .filter(|(_, entry)| entry.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in ended {
            if let Some(entry) = self.transfers.remove(&id) {
                self.by_source.remove(&entry.request.source_url);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    use tempfile::TempDir;

    use crate::sync::resilient_lock;

    /// Records every call; bytes are moved by the test through the sink.
    #[derive(Default)]
    struct ScriptedTransport {
        started: Mutex<Vec<(TransportJob, TransportSink)>>,
        paused: Mutex<Vec<TransportHandle>>,
        cancelled: Mutex<Vec<TransportHandle>>,
        refuse: Mutex<bool>,
    }

    impl Transport for ScriptedTransport {
        fn start(&self, job: TransportJob, sink: TransportSink) -> Result<()> {
            if *resilient_lock(&self.refuse) {
                return Err(DownloadError::Transport("refused".into()));
            }
            resilient_lock(&self.started).push((job, sink));
            Ok(())
        }

        fn pause(&self, handle: TransportHandle) {
            resilient_lock(&self.paused).push(handle);
        }

        fn cancel(&self, handle: TransportHandle) {
            resilient_lock(&self.cancelled).push(handle);
        }
    }

    struct Harness {
        core: SchedulerCore,
        transport: Arc<ScriptedTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        storage: Storage,
        _dir: TempDir,
    }

    impl Harness {
        fn new(config: SchedulerConfig, path: NetworkPathState) -> Self {
            let dir = TempDir::new().unwrap();
            let storage = Storage::open(dir.path().join("downloads")).unwrap();
            let transport = Arc::new(ScriptedTransport::default());
            let (tx, events) = mpsc::unbounded_channel();
            let core = SchedulerCore::new(config, transport.clone(), storage.clone(), path, tx);
            Self { core, transport, events, storage, _dir: dir }
        }

        fn with_slots(max_concurrent: usize) -> Self {
            Self::new(
                SchedulerConfig { max_concurrent, ..SchedulerConfig::default() },
                NetworkPathState::UNMETERED,
            )
        }

        fn enqueue(&mut self, name: &str) -> TransferHandle {
            self.core.enqueue(request(name)).unwrap()
        }

        /// Latest job started for a transfer.
        fn job(&self, id: TransferId) -> (TransportJob, TransportSink) {
            resilient_lock(&self.transport.started)
                .iter()
                .rev()
                .find(|(job, _)| job.transfer_id == id)
                .cloned()
                .expect("transfer was never started")
        }

        fn starts(&self) -> usize {
            resilient_lock(&self.transport.started).len()
        }

        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.core.on_transport(event);
            }
        }

        fn phase(&self, id: TransferId) -> Option<Phase> {
            self.core.snapshot(id).map(|s| s.phase)
        }

        fn complete(&mut self, id: TransferId, len: u64) {
            let (job, sink) = self.job(id);
            let file = fs::File::create(&job.partial_path).unwrap();
            file.set_len(len).unwrap();
            sink.started(0);
            sink.progress(len, Some(len));
            sink.complete(job.partial_path.clone());
            self.pump();
        }
    }

    fn request(name: &str) -> TransferRequest {
        TransferRequest::new(Url::parse(&format!("https://media.example/{name}")).unwrap())
    }

    fn drain(handle: &mut TransferHandle) -> Vec<TransferState> {
        let mut seen = Vec::new();
        while let Ok(state) = handle.rx.try_recv() {
            seen.push(state);
        }
        seen
    }

    #[test]
    fn test_concurrency_cap_and_fifo_promotion() {
        let mut h = Harness::with_slots(2);
        let ids: Vec<TransferId> = ["a.mp3", "b.mp3", "c.mp3", "d.mp3"]
            .iter()
            .map(|name| h.enqueue(name).id)
            .collect();

        assert_eq!(h.core.downloading(), 2);
        assert_eq!(h.phase(ids[0]), Some(Phase::Downloading));
        assert_eq!(h.phase(ids[1]), Some(Phase::Downloading));
        assert_eq!(h.phase(ids[2]), Some(Phase::Pending));
        assert_eq!(h.phase(ids[3]), Some(Phase::Pending));

        h.complete(ids[1], 10);
        assert_eq!(h.core.downloading(), 2);
        assert_eq!(h.phase(ids[2]), Some(Phase::Downloading));
        assert_eq!(h.phase(ids[3]), Some(Phase::Pending));
    }

    #[test]
    fn test_completion_records_file_and_ends_stream() {
        let mut h = Harness::with_slots(3);
        let req = request("episode.mp3").with_metadata(serde_json::json!({"show": "Demo"}));
        let source = req.source_url.clone();
        let mut handle = h.core.enqueue(req).unwrap();
        let id = handle.id;

        h.complete(id, 10_000_000);

        let states = drain(&mut handle);
        let last = states.last().unwrap();
        assert_eq!(last.phase, Phase::Completed);
        assert_eq!(last.fraction, 1.0);
        assert_eq!(last.downloaded_bytes, 10_000_000);
        assert!(last.ended_at.is_some());
        assert!(states.iter().any(|s| s.phase == Phase::Downloading));

        // Terminal entries are dropped after publication, closing the stream.
        assert!(h.core.snapshot(id).is_none());
        assert!(matches!(handle.rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));

        let local = h.core.local_path(&source).unwrap();
        assert_eq!(local, h.storage.media_dir().join("episode.mp3"));
        assert_eq!(fs::metadata(&local).unwrap().len(), 10_000_000);
        assert_eq!(h.core.total_stored_bytes(), 10_000_000);

        let records = h.core.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metadata, Some(serde_json::json!({"show": "Demo"})));
        assert!(records[0].attempt_duration_ms.is_some());
    }

    #[test]
    fn test_media_named_like_record_files_survives() {
        let mut h = Harness::with_slots(2);
        let tmp = h.enqueue("records.tmp").id;
        let json = h.enqueue("records.json").id;
        h.complete(tmp, 4096);
        h.complete(json, 2048);

        for (name, len) in [("records.tmp", 4096), ("records.json", 2048)] {
            let source = request(name).source_url;
            let local = h.core.local_path(&source).unwrap();
            assert_eq!(fs::metadata(&local).unwrap().len(), len);
        }

        let mut reloaded = RecordStore::new(h.storage.record_file());
        assert_eq!(reloaded.load().len(), 2);
        assert_eq!(reloaded.total_bytes(), 4096 + 2048);
    }

    #[test]
    fn test_duplicate_and_already_present() {
        let mut h = Harness::with_slots(1);
        let first = h.enqueue("a.mp3");

        let duplicate = h.core.enqueue(request("a.mp3"));
        assert!(matches!(duplicate, Err(DownloadError::DuplicateTransfer { .. })));
        assert_eq!(h.core.transfers().len(), 1);

        h.complete(first.id, 4);
        match h.core.enqueue(request("a.mp3")) {
            Err(DownloadError::AlreadyPresent(state)) => {
                assert_eq!(state.phase, Phase::Completed);
                assert_eq!(state.total_bytes, Some(4));
                assert!(state.local_path.is_some());
            }
            other => panic!("expected AlreadyPresent, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_then_late_completion_is_discarded() {
        let mut h = Harness::with_slots(1);
        let mut handle = h.enqueue("a.mp3");
        let id = handle.id;
        let waiting = h.enqueue("b.mp3").id;
        let (job, sink) = h.job(id);
        fs::write(&job.partial_path, b"half").unwrap();

        h.core.cancel(id);
        assert_eq!(resilient_lock(&h.transport.cancelled).as_slice(), &[job.handle]);
        assert!(!job.partial_path.exists());
        assert_eq!(h.phase(waiting), Some(Phase::Downloading));

        // The transport finishes anyway.
        fs::write(&job.partial_path, b"full").unwrap();
        sink.complete(job.partial_path.clone());
        h.pump();

        assert!(h.core.records().is_empty());
        let states = drain(&mut handle);
        assert_eq!(states.last().unwrap().phase, Phase::Cancelled);
        assert!(states.iter().all(|s| s.phase != Phase::Completed));

        // Cancelling again, or an unknown id, is a no-op.
        h.core.cancel(id);
        h.core.cancel(TransferId::new());
    }

    #[test]
    fn test_cancel_pending_transfer() {
        let mut h = Harness::with_slots(1);
        let _running = h.enqueue("a.mp3");
        let mut queued = h.enqueue("b.mp3");
        h.core.cancel(queued.id);

        assert_eq!(drain(&mut queued).last().unwrap().phase, Phase::Cancelled);
        assert_eq!(h.starts(), 1);
        assert!(h.core.snapshot(queued.id).is_none());
    }

    #[test]
    fn test_pause_and_resume_with_offset() {
        let mut h = Harness::with_slots(1);
        let id = h.enqueue("a.mp3").id;
        let queued = h.enqueue("b.mp3").id;
        let (job, sink) = h.job(id);
        sink.started(0);
        sink.progress(400, Some(1000));
        h.pump();

        h.core.pause(id).unwrap();
        assert_eq!(h.phase(id), Some(Phase::Paused(PauseReason::User)));
        assert_eq!(resilient_lock(&h.transport.paused).as_slice(), &[job.handle]);
        // The freed slot goes to the queue.
        assert_eq!(h.phase(queued), Some(Phase::Downloading));

        // No slot: resume waits at the front of the queue.
        h.core.resume(id).unwrap();
        assert_eq!(h.phase(id), Some(Phase::Pending));
        h.complete(queued, 8);

        let (resumed, _) = h.job(id);
        assert_ne!(resumed.handle, job.handle);
        assert_eq!(resumed.resume_offset, Some(400));
        let state = h.core.snapshot(id).unwrap();
        assert_eq!(state.phase, Phase::Downloading);
        assert_eq!(state.attempt, 2);
        assert_eq!(state.downloaded_bytes, 400);
    }

    #[test]
    fn test_structural_errors_leave_state_alone() {
        let mut h = Harness::with_slots(1);
        let running = h.enqueue("a.mp3").id;
        let pending = h.enqueue("b.mp3").id;

        assert!(matches!(h.core.pause(pending), Err(DownloadError::NotActive(_))));
        assert!(matches!(h.core.resume(running), Err(DownloadError::NotPaused(_))));
        assert!(matches!(h.core.pause(TransferId::new()), Err(DownloadError::NotActive(_))));
        assert_eq!(h.phase(running), Some(Phase::Downloading));
        assert_eq!(h.phase(pending), Some(Phase::Pending));
    }

    #[test]
    fn test_progress_is_monotonic_within_attempt() {
        let mut h = Harness::with_slots(1);
        let mut handle = h.enqueue("a.mp3");
        let (_, sink) = h.job(handle.id);
        sink.started(0);
        sink.progress(500, Some(1000));
        sink.progress(300, Some(1000));
        sink.progress(2000, Some(1000));
        h.pump();

        let states = drain(&mut handle);
        let mut last_fraction = 0.0;
        for state in &states {
            assert!(state.fraction >= last_fraction);
            assert!(state.fraction <= 1.0);
            last_fraction = state.fraction;
        }
        let state = h.core.snapshot(handle.id).unwrap();
        assert_eq!(state.downloaded_bytes, 1000);
        assert_eq!(state.fraction, 1.0);
    }

    #[test]
    fn test_restart_when_resume_not_honoured() {
        let mut h = Harness::with_slots(1);
        let id = h.enqueue("a.mp3").id;
        let (_, sink) = h.job(id);
        sink.progress(600, Some(1000));
        h.pump();
        h.core.pause(id).unwrap();
        h.core.resume(id).unwrap();

        let (job, sink) = h.job(id);
        assert_eq!(job.resume_offset, Some(600));
        sink.started(0);
        sink.progress(100, Some(1000));
        h.pump();

        let state = h.core.snapshot(id).unwrap();
        assert_eq!(state.attempt, 2);
        assert_eq!(state.downloaded_bytes, 100);
        assert!((state.fraction - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resume_counts_bytes_already_on_disk() {
        let mut h = Harness::with_slots(1);
        let id = h.enqueue("a.mp3").id;
        let (_, sink) = h.job(id);
        sink.started(0);
        sink.progress(400, Some(1000));
        h.pump();
        h.core.pause(id).unwrap();
        h.core.resume(id).unwrap();

        // More bytes reached the partial file than were reported before the pause.
        let (job, sink) = h.job(id);
        assert_eq!(job.resume_offset, Some(400));
        sink.started(600);
        h.pump();

        let state = h.core.snapshot(id).unwrap();
        assert_eq!(state.downloaded_bytes, 600);
        assert!((state.fraction - 0.6).abs() < f64::EPSILON);

        sink.progress(700, Some(1000));
        h.pump();
        assert_eq!(h.core.snapshot(id).unwrap().downloaded_bytes, 700);
    }

    #[test]
    fn test_zero_concurrency_still_downloads() {
        let mut h = Harness::with_slots(0);
        let first = h.enqueue("a.mp3").id;
        let second = h.enqueue("b.mp3").id;
        assert_eq!(h.phase(first), Some(Phase::Downloading));
        assert_eq!(h.phase(second), Some(Phase::Pending));
    }

    #[test]
    fn test_failure_frees_slot_and_removes_partial() {
        let mut h = Harness::with_slots(1);
        let mut failing = h.enqueue("a.mp3");
        let next = h.enqueue("b.mp3").id;
        let (job, sink) = h.job(failing.id);
        fs::write(&job.partial_path, b"junk").unwrap();

        sink.fail(DownloadError::Transport("connection reset".into()));
        h.pump();

        let last = drain(&mut failing).pop().unwrap();
        assert!(matches!(last.phase, Phase::Failed(ref msg) if msg.contains("connection reset")));
        assert!(matches!(last.last_error, Some(DownloadError::Transport(_))));
        assert!(!job.partial_path.exists());
        assert_eq!(h.phase(next), Some(Phase::Downloading));
        assert!(h.core.records().is_empty());
    }

    #[test]
    fn test_transport_refusal_fails_transfer() {
        let mut h = Harness::with_slots(1);
        *resilient_lock(&h.transport.refuse) = true;
        let mut handle = h.enqueue("a.mp3");
        let last = drain(&mut handle).pop().unwrap();
        assert!(matches!(last.phase, Phase::Failed(_)));
        assert_eq!(h.core.downloading(), 0);
    }

    #[test]
    fn test_offline_parks_and_online_restarts_in_order() {
        let mut h = Harness::with_slots(2);
        let a = h.enqueue("a.mp3").id;
        let b = h.enqueue("b.mp3").id;
        let c = h.enqueue("c.mp3").id;

        h.core.network_changed(NetworkPathState::OFFLINE);
        assert_eq!(h.core.downloading(), 0);
        assert_eq!(h.phase(a), Some(Phase::Paused(PauseReason::Offline)));
        assert_eq!(h.phase(b), Some(Phase::Paused(PauseReason::Offline)));
        assert_eq!(h.phase(c), Some(Phase::Pending));
        assert_eq!(resilient_lock(&h.transport.paused).len(), 2);

        // Nothing is promoted while offline.
        h.core.cancel(c);
        assert_eq!(h.core.downloading(), 0);

        let before = h.starts();
        h.core.network_changed(NetworkPathState::UNMETERED);
        assert_eq!(h.phase(a), Some(Phase::Downloading));
        assert_eq!(h.phase(b), Some(Phase::Downloading));
        let restarted: Vec<TransferId> = resilient_lock(&h.transport.started)[before..]
            .iter()
            .map(|(job, _)| job.transfer_id)
            .collect();
        assert_eq!(restarted, vec![a, b]);
    }

    #[test]
    fn test_user_pause_survives_network_recovery() {
        let mut h = Harness::with_slots(2);
        let id = h.enqueue("a.mp3").id;
        h.core.pause(id).unwrap();

        h.core.network_changed(NetworkPathState::OFFLINE);
        h.core.network_changed(NetworkPathState::UNMETERED);
        assert_eq!(h.phase(id), Some(Phase::Paused(PauseReason::User)));
    }

    #[test]
    fn test_metered_policy_gates_promotion() {
        let mut h = Harness::new(
            SchedulerConfig { max_concurrent: 2, cellular_allowed: false, min_free_space: 0 },
            NetworkPathState::METERED,
        );
        let blocked = h.enqueue("a.mp3").id;
        let overridden = h.core.enqueue(request("b.mp3").allow_metered(true)).unwrap().id;

        assert_eq!(h.phase(overridden), Some(Phase::Downloading));
        let held = h.core.snapshot(blocked).unwrap();
        assert_eq!(held.phase, Phase::Pending);
        assert!(matches!(held.last_error, Some(DownloadError::PolicyRejected { .. })));

        h.core.set_cellular_policy(true);
        let started = h.core.snapshot(blocked).unwrap();
        assert_eq!(started.phase, Phase::Downloading);
        assert!(started.last_error.is_none());
        assert!(h.core.subscribe_policy().borrow().cellular_allowed);
    }

    #[test]
    fn test_metered_edge_pauses_disallowed_transfers() {
        let mut h = Harness::new(
            SchedulerConfig { max_concurrent: 2, cellular_allowed: false, min_free_space: 0 },
            NetworkPathState::UNMETERED,
        );
        let normal = h.enqueue("a.mp3").id;
        let exempt = h.core.enqueue(request("b.mp3").allow_metered(true)).unwrap().id;

        h.core.network_changed(NetworkPathState::METERED);
        assert_eq!(h.phase(normal), Some(Phase::Paused(PauseReason::Metered)));
        assert_eq!(h.phase(exempt), Some(Phase::Downloading));

        h.core.network_changed(NetworkPathState::UNMETERED);
        assert_eq!(h.phase(normal), Some(Phase::Downloading));
    }

    #[test]
    fn test_disallowing_cellular_on_metered_path_pauses() {
        let mut h = Harness::new(SchedulerConfig::default(), NetworkPathState::METERED);
        let id = h.enqueue("a.mp3").id;
        assert_eq!(h.phase(id), Some(Phase::Downloading));

        h.core.set_cellular_policy(false);
        assert_eq!(h.phase(id), Some(Phase::Paused(PauseReason::Metered)));
    }

    #[test]
    fn test_insufficient_space_fails_transfer() {
        let mut h = Harness::new(
            SchedulerConfig { max_concurrent: 1, cellular_allowed: true, min_free_space: u64::MAX / 2 },
            NetworkPathState::UNMETERED,
        );
        let mut handle = h.enqueue("big.iso");
        let (job, sink) = h.job(handle.id);
        sink.started(0);
        sink.progress(0, Some(1024));
        h.pump();

        let last = drain(&mut handle).pop().unwrap();
        assert!(matches!(last.last_error, Some(DownloadError::Storage(ref msg)) if msg.contains("free space")));
        assert_eq!(resilient_lock(&h.transport.cancelled).as_slice(), &[job.handle]);
        assert_eq!(h.core.downloading(), 0);
    }

    #[test]
    fn test_progress_snapshots_carry_whole_map() {
        let mut h = Harness::with_slots(1);
        let progress = h.core.subscribe_progress();
        let a = h.enqueue("a.mp3").id;
        let b = h.enqueue("b.mp3").id;

        let snapshot = progress.current();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&a).unwrap().phase, Phase::Downloading);
        assert_eq!(snapshot.get(&b).unwrap().phase, Phase::Pending);

        h.complete(a, 3);
        let snapshot = progress.current();
        assert_eq!(snapshot.get(&a).unwrap().phase, Phase::Completed);

        // The completed entry is gone from the next publication.
        h.core.cancel(b);
        let snapshot = progress.current();
        assert!(snapshot.get(&a).is_none());
        assert_eq!(snapshot.get(&b).unwrap().phase, Phase::Cancelled);
    }

    #[test]
    fn test_delete_record_removes_file() {
        let mut h = Harness::with_slots(1);
        let id = h.enqueue("a.mp3").id;
        h.complete(id, 16);
        let path = h.core.records()[0].local_path.clone();

        let removed = h.core.delete_record(&path).unwrap();
        assert_eq!(removed.id, id);
        assert!(!path.exists());
        assert!(h.core.records().is_empty());
        assert!(matches!(h.core.delete_record(&path), Err(DownloadError::NotFound(_))));

        // The source can be fetched again.
        assert!(h.core.enqueue(request("a.mp3")).is_ok());
    }

    #[test]
    fn test_shutdown_pauses_running_transfers() {
        let mut h = Harness::with_slots(2);
        let running = h.enqueue("a.mp3").id;
        h.core.shutdown();
        assert_eq!(h.phase(running), Some(Phase::Paused(PauseReason::Shutdown)));
        assert_eq!(h.core.downloading(), 0);
    }
}
