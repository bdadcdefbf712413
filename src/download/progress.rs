// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fan-out of whole-map progress snapshots.
//!
//! Backed by a `watch` channel: a new subscriber sees the latest snapshot at
//! once, and a slow subscriber only ever holds the newest value, so it cannot
//! hold back the scheduler or other subscribers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::types::{TransferId, TransferState};

/// Immutable copy of every transfer the scheduler currently tracks.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    /// Increases by one per published snapshot
    pub sequence: u64,
    /// State of every tracked transfer
    pub transfers: Arc<BTreeMap<TransferId, TransferState>>,
}

impl ProgressSnapshot {
    pub fn get(&self, id: &TransferId) -> Option<&TransferState> {
        self.transfers.get(id)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Publisher side, owned by the scheduler.
#[derive(Debug)]
pub struct ProgressBroadcaster {
    tx: watch::Sender<ProgressSnapshot>,
    sequence: u64,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot::default());
        Self { tx, sequence: 0 }
    }

    /// Publish a new snapshot. Works with zero subscribers.
    pub fn publish(&mut self, transfers: BTreeMap<TransferId, TransferState>) {
        self.sequence += 1;
        let snapshot = ProgressSnapshot {
            sequence: self.sequence,
            transfers: Arc::new(transfers),
        };
        self.tx.send_replace(snapshot);
    }

    pub fn subscribe(&self) -> ProgressReceiver {
        ProgressReceiver { rx: self.tx.subscribe() }
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side of the progress stream.
#[derive(Debug, Clone)]
pub struct ProgressReceiver {
    rx: watch::Receiver<ProgressSnapshot>,
}

impl ProgressReceiver {
    /// The latest snapshot, without waiting.
    pub fn current(&self) -> ProgressSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next snapshot. `None` once the scheduler is gone.
    pub async fn changed(&mut self) -> Option<ProgressSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Stream that yields the current snapshot first, then every update.
    pub fn into_stream(self) -> WatchStream<ProgressSnapshot> {
        WatchStream::new(self.rx)
    }
}
