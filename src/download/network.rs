// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Network reachability watcher.
//!
//! A background task samples a [`NetworkProbe`] on an interval and sends a
//! [`NetworkPathState`] down a single channel whenever the sampled value
//! differs from the previous one. Identical consecutive samples are
//! swallowed, so the consumer only ever sees edges.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;

use super::types::NetworkPathState;

/// Capacity of the event channel; the consumer drains it continuously.
const EVENT_BUFFER: usize = 16;

/// Source of network samples.
pub trait NetworkProbe: Send + Sync + 'static {
    fn sample(&self) -> impl Future<Output = NetworkPathState> + Send;
}

/// Always reports the same state. Used when no probe URL is configured.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub NetworkPathState);

impl NetworkProbe for StaticProbe {
    async fn sample(&self) -> NetworkPathState {
        self.0
    }
}

/// Reachability by issuing a HEAD request; any HTTP response counts as reachable.
///
/// Metering cannot be read portably, so it comes from configuration.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
    metered: bool,
}

impl HttpProbe {
    pub fn new(url: Url, timeout: Duration, metered: bool) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, metered })
    }
}

impl NetworkProbe for HttpProbe {
    async fn sample(&self) -> NetworkPathState {
        let reachable = match self.client.head(self.url.clone()).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(url = %self.url, "Network probe failed: {}", e);
                false
            }
        };
        NetworkPathState { reachable, metered: self.metered }
    }
}

/// Collapses repeated samples into edges.
#[derive(Debug, Default, Clone, Copy)]
pub struct EdgeDetector {
    last: Option<NetworkPathState>,
}

impl EdgeDetector {
    /// Returns the sample if it differs from the previous one.
    pub fn observe(&mut self, sample: NetworkPathState) -> Option<NetworkPathState> {
        if self.last == Some(sample) {
            return None;
        }
        self.last = Some(sample);
        Some(sample)
    }
}

/// Running observer task.
#[derive(Debug)]
pub struct NetworkObserver {
    task: JoinHandle<()>,
}

impl NetworkObserver {
    /// Start sampling `probe` every `interval`. The first sample is always
    /// delivered. The task stops when the receiver is dropped.
    pub fn spawn<P: NetworkProbe>(probe: P, interval: Duration) -> (Self, mpsc::Receiver<NetworkPathState>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut edges = EdgeDetector::default();

            loop {
                ticker.tick().await;
                let sample = probe.sample().await;
                if let Some(state) = edges.observe(sample) {
                    tracing::info!(reachable = state.reachable, metered = state.metered, "Network path changed");
                    if tx.send(state).await.is_err() {
                        break;
                    }
                }
            }
        });
        (Self { task }, rx)
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for NetworkObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}
