//! Serial download queue.
//!
//! Files are processed strictly one at a time by a single background loop;
//! parallelism only happens between the segments of the active file. A
//! failed file halts the queue: the remaining items stay pending until the
//! caller either [`resume`](DownloadQueue::resume)s or
//! [`clear`](DownloadQueue::clear)s it.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::downloader::{DownloadRequest, Downloader};
use crate::error::DownloadError;
use crate::manifest::UpdateFile;
use crate::progress::{file_progress_channel, FileProgress, QueueProgress, SharedProgress};

pub struct QueueItem {
    pub id: Uuid,
    pub file: UpdateFile,
    progress: Option<SharedProgress>,
    completion: oneshot::Sender<bool>,
}

/// Resolves to the outcome of one enqueued file; `Err(Cancelled)` when the
/// item was dropped from the queue before it ran.
pub struct Completion {
    id: Uuid,
    rx: oneshot::Receiver<bool>,
}

impl Completion {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for Completion {
    type Output = Result<bool, DownloadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| DownloadError::Cancelled))
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueItem>,
    current: Option<(Uuid, UpdateFile)>,
    halted: bool,
    progress: QueueProgress,
}

struct QueueInner {
    downloader: Downloader,
    data_dir: PathBuf,
    state: Mutex<QueueState>,
    wake: Notify,
    shutdown: CancellationToken,
    progress: watch::Sender<QueueProgress>,
}

pub struct DownloadQueue {
    inner: Arc<QueueInner>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadQueue {
    /// Spawns the consumer loop. Files are written below `data_dir`.
    pub fn start(downloader: Downloader, data_dir: impl Into<PathBuf>) -> Self {
        let (progress, _) = watch::channel(QueueProgress::default());
        let inner = Arc::new(QueueInner {
            downloader,
            data_dir: data_dir.into(),
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            progress,
        });
        let consumer = tokio::spawn(consume(inner.clone()));
        Self {
            inner,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    pub fn enqueue(&self, file: UpdateFile, progress: Option<SharedProgress>) -> Completion {
        self.push(file, progress, false)
    }

    /// Resubmits a file whose earlier submission failed. The file keeps its
    /// single slot in the aggregate counts and leaves the failed tally.
    pub fn requeue(&self, file: UpdateFile, progress: Option<SharedProgress>) -> Completion {
        self.push(file, progress, true)
    }

    fn push(&self, file: UpdateFile, progress: Option<SharedProgress>, resubmitted: bool) -> Completion {
        let id = Uuid::new_v4();
        let (completion, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock_state();
            debug!(%id, path = %file.local_path, resubmitted, "enqueued");
            state.pending.push_back(QueueItem {
                id,
                file,
                progress,
                completion,
            });
            if resubmitted {
                state.progress.failed_files = state.progress.failed_files.saturating_sub(1);
            } else {
                state.progress.total_files += 1;
            }
            self.inner.progress.send_replace(state.progress.clone());
        }
        self.inner.wake.notify_one();
        Completion { id, rx }
    }

    /// Continues processing after a failure halted the queue.
    pub fn resume(&self) {
        self.inner.lock_state().halted = false;
        self.inner.wake.notify_one();
    }

    /// Drops every pending item; their completions resolve as cancelled.
    /// Returns how many items were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.lock_state();
        let dropped = state.pending.len();
        state.pending.clear();
        state.progress.total_files = state.progress.total_files.saturating_sub(dropped);
        state.halted = false;
        self.inner.progress.send_replace(state.progress.clone());
        if dropped > 0 {
            info!(dropped, "cleared download queue");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_halted(&self) -> bool {
        self.inner.lock_state().halted
    }

    /// File currently being downloaded.
    pub fn current(&self) -> Option<UpdateFile> {
        self.inner.lock_state().current.as_ref().map(|(_, f)| f.clone())
    }

    pub fn progress(&self) -> watch::Receiver<QueueProgress> {
        self.inner.progress.subscribe()
    }

    pub fn downloader(&self) -> &Downloader {
        &self.inner.downloader
    }

    /// Stops the consumer after the active file and cancels what is pending.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.wake.notify_one();
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }
        self.clear();
    }
}

impl Drop for DownloadQueue {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.wake.notify_one();
    }
}

impl QueueInner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_item(&self) -> Option<QueueItem> {
        let mut state = self.lock_state();
        if state.halted {
            return None;
        }
        let item = state.pending.pop_front()?;
        state.current = Some((item.id, item.file.clone()));
        state.progress.current_file = Some(item.file.local_path.clone());
        state.progress.current = FileProgress::new(0, item.file.size);
        self.progress.send_replace(state.progress.clone());
        Some(item)
    }

    async fn process(self: &Arc<Self>, item: QueueItem) {
        let QueueItem {
            id,
            file,
            progress: caller_progress,
            completion,
        } = item;
        info!(%id, path = %file.local_path, size = file.size, "starting download");

        let (tx, mut rx) = file_progress_channel(file.size);
        let forward = {
            let inner = self.clone();
            let caller_progress = caller_progress.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let snapshot = rx.borrow_and_update().clone();
                    inner.forward(&snapshot, caller_progress.as_ref());
                }
            })
        };

        let mut request = DownloadRequest::new(
            file.remote_url.clone(),
            file.full_local_path(&self.data_dir),
            file.size,
        )
        .with_state_key(file.local_path.clone());
        if let Some(hash) = file.expected_hash() {
            request = request.with_hash(hash);
        }

        let success = self.downloader.download_file(request, Some(tx.clone())).await;
        forward.abort();
        let last = tx.borrow().clone();
        self.forward(&last, caller_progress.as_ref());

        {
            let mut state = self.lock_state();
            state.current = None;
            state.progress.current_file = None;
            state.progress.current = FileProgress::default();
            if success {
                state.progress.completed_files += 1;
            } else {
                state.progress.failed_files += 1;
                state.halted = true;
                error!(%id, path = %file.local_path, pending = state.pending.len(), "download failed, queue halted");
            }
            self.progress.send_replace(state.progress.clone());
        }
        let _ = completion.send(success);
    }

    fn forward(&self, snapshot: &FileProgress, caller: Option<&SharedProgress>) {
        if let Some(caller) = caller {
            caller.send_replace(snapshot.clone());
        }
        self.progress.send_modify(|p| {
            if p.current_file.is_some() {
                p.current = snapshot.clone();
            }
        });
    }
}

async fn consume(inner: Arc<QueueInner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        match inner.next_item() {
            Some(item) => inner.process(item).await,
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.wake.notified() => {}
                }
            }
        }
    }
    debug!("download queue consumer stopped");
}
