// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Byte transfer contract consumed by the scheduler, plus the HTTP implementation.
//!
//! A transport never touches scheduler state. Each job gets a
//! [`TransportSink`] that queues callbacks onto the scheduler mailbox, where
//! they are applied in order with every other operation.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use url::Url;

use super::types::TransferId;
use crate::error::{DownloadError, Result};
use crate::sync::resilient_lock;

/// Identifies one transport attempt. A new handle is issued on every start,
/// so callbacks from an abandoned attempt can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportHandle(pub u64);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything a transport needs to run one attempt.
#[derive(Debug, Clone)]
pub struct TransportJob {
    pub handle: TransportHandle,
    pub transfer_id: TransferId,
    pub url: Url,
    /// Bytes reported by an earlier attempt. `Some` asks the transport to
    /// resume; it continues from the partial file's actual length.
    pub resume_offset: Option<u64>,
    /// File the transport writes into
    pub partial_path: PathBuf,
}

/// Callback payloads.
#[derive(Debug, Clone)]
pub enum TransportEventKind {
    /// Bytes will be counted from `offset` (0 when a resume could not be honoured).
    Started { offset: u64 },
    Progress { downloaded: u64, total: Option<u64> },
    Complete { temporary_path: PathBuf },
    Failure { error: DownloadError },
}

/// A callback tagged with the attempt it belongs to.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub handle: TransportHandle,
    pub kind: TransportEventKind,
}

/// Per-job callback channel into the scheduler.
#[derive(Debug, Clone)]
pub struct TransportSink {
    handle: TransportHandle,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportSink {
    pub(crate) fn new(handle: TransportHandle, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle
    }

    fn emit(&self, kind: TransportEventKind) {
        // A closed mailbox means the scheduler shut down; nothing is listening.
        let _ = self.tx.send(TransportEvent { handle: self.handle, kind });
    }

    pub fn started(&self, offset: u64) {
        self.emit(TransportEventKind::Started { offset });
    }

    pub fn progress(&self, downloaded: u64, total: Option<u64>) {
        self.emit(TransportEventKind::Progress { downloaded, total });
    }

    pub fn complete(&self, temporary_path: PathBuf) {
        self.emit(TransportEventKind::Complete { temporary_path });
    }

    pub fn fail(&self, error: DownloadError) {
        self.emit(TransportEventKind::Failure { error });
    }
}

/// The byte-moving collaborator.
///
/// `start` must not block: it launches the attempt and returns. `pause` and
/// `cancel` are best effort; the scheduler discards any callback that arrives
/// for a handle it no longer tracks.
pub trait Transport: Send + Sync + 'static {
    fn start(&self, job: TransportJob, sink: TransportSink) -> Result<()>;
    fn pause(&self, handle: TransportHandle);
    fn cancel(&self, handle: TransportHandle);
}

/// HTTP(S) transport over reqwest with `Range` resume.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    progress_interval: Duration,
    jobs: Arc<Mutex<HashMap<TransportHandle, AbortHandle>>>,
}

impl HttpTransport {
    pub fn new(progress_interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self::with_client(client, progress_interval))
    }

    pub fn with_client(client: reqwest::Client, progress_interval: Duration) -> Self {
        Self {
            client,
            progress_interval,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn abort(&self, handle: TransportHandle) {
        if let Some(task) = resilient_lock(&self.jobs).remove(&handle) {
            task.abort();
        }
    }

    /// Number of attempts currently running.
    pub fn running(&self) -> usize {
        resilient_lock(&self.jobs).len()
    }
}

impl Transport for HttpTransport {
    fn start(&self, job: TransportJob, sink: TransportSink) -> Result<()> {
        let handle = job.handle;
        let client = self.client.clone();
        let interval = self.progress_interval;
        let jobs = Arc::clone(&self.jobs);

        // Hold the table lock across spawn so the task's own removal cannot
        // run before its insertion.
        let mut table = resilient_lock(&self.jobs);
        let task = tokio::spawn(async move {
            if let Err(error) = fetch(&client, &job, &sink, interval).await {
                tracing::debug!(handle = %job.handle, "HTTP attempt failed: {}", error);
                sink.fail(error);
            }
            resilient_lock(&jobs).remove(&job.handle);
        });
        table.insert(handle, task.abort_handle());
        Ok(())
    }

    fn pause(&self, handle: TransportHandle) {
        // The partial file stays on disk; the next start resumes with a Range request.
        self.abort(handle);
    }

    fn cancel(&self, handle: TransportHandle) {
        self.abort(handle);
    }
}

async fn fetch(
    client: &reqwest::Client,
    job: &TransportJob,
    sink: &TransportSink,
    interval: Duration,
) -> Result<()> {
    let on_disk = match tokio::fs::metadata(&job.partial_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    // Writes can land after the last throttled report, so the file may hold
    // more than `resume_offset`.
    let offset = if job.resume_offset.is_some() { on_disk } else { 0 };
    if let Some(reported) = job.resume_offset.filter(|reported| *reported != on_disk) {
        tracing::debug!(handle = %job.handle, reported, on_disk, "Resuming from partial file length");
    }

    let mut request = client.get(job.url.clone());
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
    }
    let response = request.send().await?.error_for_status()?;

    let resumed = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    let start = if resumed { offset } else { 0 };
    let total = response.content_length().map(|len| len + start);
    sink.started(start);

    if let Some(parent) = job.partial_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = if resumed {
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&job.partial_path).await?;
        file.set_len(start).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        file
    } else {
        tokio::fs::File::create(&job.partial_path).await?
    };

    let mut downloaded = start;
    let mut last_report = Instant::now();
    sink.progress(downloaded, total);

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if last_report.elapsed() >= interval {
            sink.progress(downloaded, total);
            last_report = Instant::now();
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = total {
        if downloaded < expected {
            return Err(DownloadError::Transport(format!(
                "connection closed after {downloaded} of {expected} bytes"
            )));
        }
    }

    sink.progress(downloaded, total.or(Some(downloaded)));
    sink.complete(job.partial_path.clone());
    Ok(())
}
