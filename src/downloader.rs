//! Transfer coordinator: plans a file, fans its segments out to workers,
//! merges the results in order and verifies the hash.

use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::VerifyMode;
use crate::config::DownloadConfig;
use crate::error::{DownloadError, Result};
use crate::hashing::{self, HashAlgorithm};
use crate::planner::SegmentPlanner;
use crate::progress::{FileProgress, SharedProgress};
use crate::segment::{DownloadSegment, SegmentSidecar};
use crate::state::VersionStateStore;
use crate::transport::Transport;
use crate::utils::{merge_path_for, remove_temp_artifacts, sidecar_path_for, temp_dir_for};
use crate::worker::{self, TransferContext};

/// What to fetch and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub dest: PathBuf,
    pub size: u64,
    pub expected_hash: Option<String>,
    /// Key recorded in the version state store; defaults to `dest`.
    pub state_key: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            size,
            expected_hash: None,
            state_key: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        let hash = hash.into();
        self.expected_hash = if hash.trim().is_empty() { None } else { Some(hash) };
        self
    }

    pub fn with_state_key(mut self, key: impl Into<String>) -> Self {
        self.state_key = Some(key.into());
        self
    }

    pub fn key(&self) -> String {
        self.state_key
            .clone()
            .unwrap_or_else(|| self.dest.to_string_lossy().into_owned())
    }
}

/// One file's transfer, shared by its segment workers.
pub struct FileDownloadTask {
    pub url: String,
    pub dest: PathBuf,
    pub size: u64,
    state_key: String,
    paused: Arc<AtomicBool>,
    segments: Mutex<Vec<DownloadSegment>>,
    bounds: Vec<(u64, u64)>,
    live: Vec<AtomicU64>,
    progress: Option<SharedProgress>,
    store: Option<Arc<VersionStateStore>>,
    sidecar_path: PathBuf,
}

impl FileDownloadTask {
    fn new(
        request: &DownloadRequest,
        segments: Vec<DownloadSegment>,
        paused: Arc<AtomicBool>,
        progress: Option<SharedProgress>,
        store: Option<Arc<VersionStateStore>>,
    ) -> Self {
        Self {
            url: request.url.clone(),
            dest: request.dest.clone(),
            size: request.size,
            state_key: request.key(),
            paused,
            bounds: segments.iter().map(|s| (s.start, s.end)).collect(),
            live: segments.iter().map(|s| AtomicU64::new(s.current)).collect(),
            segments: Mutex::new(segments),
            progress,
            store,
            sidecar_path: sidecar_path_for(&request.dest),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn bounds(&self, index: usize) -> (u64, u64) {
        self.bounds[index]
    }

    pub async fn segment(&self, index: usize) -> DownloadSegment {
        self.segments.lock().await[index].clone()
    }

    pub async fn segments(&self) -> Vec<DownloadSegment> {
        self.segments.lock().await.clone()
    }

    pub async fn is_completed(&self) -> bool {
        self.segments.lock().await.iter().all(DownloadSegment::is_completed)
    }

    /// In-flight offset of a segment, used for live progress only.
    pub fn set_live(&self, index: usize, current: u64) {
        self.live[index].store(current, Ordering::Relaxed);
        self.publish(self.live_downloaded());
    }

    fn live_downloaded(&self) -> u64 {
        self.bounds
            .iter()
            .zip(&self.live)
            .map(|((start, _), current)| current.load(Ordering::Relaxed).saturating_sub(*start))
            .sum()
    }

    fn publish(&self, downloaded: u64) {
        if let Some(progress) = &self.progress {
            progress.send_replace(FileProgress::new(downloaded, self.size));
        }
    }

    /// Commits a segment offset after an attempt: recomputes the aggregate,
    /// publishes it and persists both the sidecar and the partial count.
    pub async fn checkpoint(&self, index: usize, current: u64) -> Result<()> {
        let mut segments = self.segments.lock().await;
        segments[index].current = current;
        self.live[index].store(current, Ordering::Relaxed);

        let downloaded: u64 = segments.iter().map(DownloadSegment::downloaded).sum();
        self.publish(downloaded);

        SegmentSidecar::from_segments(&segments)
            .save(&self.sidecar_path)
            .await?;
        if let Some(store) = &self.store {
            store.update_partial_download(&self.state_key, downloaded).await?;
        }
        Ok(())
    }
}

struct TaskControl {
    request: DownloadRequest,
    paused: Arc<AtomicBool>,
    running: AtomicBool,
    progress: Option<SharedProgress>,
}

struct Inner {
    config: DownloadConfig,
    transport: Arc<dyn Transport>,
    store: Option<Arc<VersionStateStore>>,
    planner: SegmentPlanner,
    context: TransferContext,
    tasks: std::sync::Mutex<HashMap<String, Arc<TaskControl>>>,
}

/// Cheap to clone; all clones share the transfer slots and the task registry.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

impl Downloader {
    pub fn new(
        config: DownloadConfig,
        transport: Arc<dyn Transport>,
        store: Option<Arc<VersionStateStore>>,
    ) -> Self {
        let rate_limiter = config.rate_limit.and_then(NonZeroU32::new).map(|limit| {
            let limiter = RateLimiter::direct(Quota::per_second(limit));
            (Arc::new(limiter), limit.get())
        });
        let context = TransferContext {
            transport: transport.clone(),
            slots: Arc::new(Semaphore::new(config.max_concurrent_segments.max(1))),
            rate_limiter,
            max_retries: config.segment_retries,
            retry_base: config.segment_retry_base,
        };

        Self {
            inner: Arc::new(Inner {
                planner: SegmentPlanner::new(config.segment_len),
                config,
                transport,
                store,
                context,
                tasks: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    pub fn state_store(&self) -> Option<Arc<VersionStateStore>> {
        self.inner.store.clone()
    }

    /// Downloads `request` to completion. Returns `false` on failure or when
    /// the download was paused; partial state stays on disk for a resume.
    pub async fn download_file(&self, request: DownloadRequest, progress: Option<SharedProgress>) -> bool {
        let control = match self.register(request, progress) {
            Ok(control) => control,
            Err(e) => {
                warn!(error = %e, "download rejected");
                return false;
            }
        };

        let result = loop {
            let result = self.run(&control).await;
            // A resume that lands while the workers wind down restarts here.
            if matches!(result, Ok(false)) && !control.paused.load(Ordering::SeqCst) {
                debug!(url = %control.request.url, "resumed while stopping, restarting transfer");
                continue;
            }
            break result;
        };
        control.running.store(false, Ordering::SeqCst);

        let url = &control.request.url;
        match result {
            Ok(true) => {
                self.forget(url, &control);
                info!(url = %url, dest = %control.request.dest.display(), "download complete");
                true
            }
            Ok(false) => {
                info!(url = %url, "download paused");
                false
            }
            Err(e) => {
                error!(url = %url, error = %e, "download failed");
                false
            }
        }
    }

    pub fn pause(&self, url: &str) -> bool {
        match self.lookup(url) {
            Some(control) => {
                control.paused.store(true, Ordering::SeqCst);
                info!(url, "pausing download");
                true
            }
            None => false,
        }
    }

    /// Clears the pause flag and restarts a stopped download in the
    /// background. Returns the handle of the restarted transfer, or `None`
    /// when the URL is unknown or its transfer is still running.
    pub fn resume(&self, url: &str) -> Option<JoinHandle<bool>> {
        let control = self.lookup(url)?;
        control.paused.store(false, Ordering::SeqCst);
        if control.running.load(Ordering::SeqCst) {
            return None;
        }

        info!(url, "resuming download");
        let downloader = self.clone();
        let request = control.request.clone();
        let progress = control.progress.clone();
        Some(tokio::spawn(async move { downloader.download_file(request, progress).await }))
    }

    /// Stops the download and removes its temp state.
    pub async fn cancel(&self, url: &str) -> bool {
        let control = {
            let mut tasks = self.lock_tasks();
            tasks.remove(url)
        };
        let Some(control) = control else {
            return false;
        };

        control.paused.store(true, Ordering::SeqCst);
        info!(url, "cancelling download");
        if let Err(e) = remove_temp_artifacts(&control.request.dest).await {
            warn!(url, error = %e, "failed to remove temp files of cancelled download");
        }
        true
    }

    pub fn is_running(&self, url: &str) -> bool {
        self.lookup(url)
            .map(|c| c.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn register(&self, request: DownloadRequest, progress: Option<SharedProgress>) -> Result<Arc<TaskControl>> {
        let mut tasks = self.lock_tasks();
        let progress = match tasks.get(&request.url) {
            Some(existing) if existing.running.load(Ordering::SeqCst) => {
                return Err(DownloadError::AlreadyRunning(request.url));
            }
            Some(existing) => progress.or_else(|| existing.progress.clone()),
            None => progress,
        };

        let control = Arc::new(TaskControl {
            request,
            paused: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(true),
            progress,
        });
        tasks.insert(control.request.url.clone(), control.clone());
        Ok(control)
    }

    fn forget(&self, url: &str, control: &Arc<TaskControl>) {
        let mut tasks = self.lock_tasks();
        if tasks.get(url).is_some_and(|c| Arc::ptr_eq(c, control)) {
            tasks.remove(url);
        }
    }

    fn lookup(&self, url: &str) -> Option<Arc<TaskControl>> {
        self.lock_tasks().get(url).cloned()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TaskControl>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(&self, control: &TaskControl) -> Result<bool> {
        let request = &control.request;
        let verify = self.inner.config.verify_mode;
        if verify == VerifyMode::On && request.expected_hash.is_none() {
            return Err(DownloadError::MissingHash(request.url.clone()));
        }
        if let (Some(expected), true) = (&request.expected_hash, verify != VerifyMode::Off) {
            HashAlgorithm::from_hex(expected)?;
        }

        fs::create_dir_all(temp_dir_for(&request.dest)).await?;

        let ranged = match self.inner.transport.probe_ranges(&request.url).await {
            Ok(ranged) => ranged,
            Err(e) => {
                warn!(url = %request.url, error = %e, "range probe failed, using a single segment");
                false
            }
        };
        if !ranged {
            debug!(url = %request.url, "range requests unsupported");
        }

        let segments = self
            .inner
            .planner
            .plan(request.size, &request.dest, ranged)
            .await?;
        let task = Arc::new(FileDownloadTask::new(
            request,
            segments,
            control.paused.clone(),
            control.progress.clone(),
            self.inner.store.clone(),
        ));
        task.publish(task.live_downloaded());

        let pending: Vec<usize> = task
            .segments()
            .await
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_completed())
            .map(|(i, _)| i)
            .collect();
        info!(
            url = %request.url,
            size = request.size,
            segments = task.bounds.len(),
            pending = pending.len(),
            "starting transfer"
        );

        let handles: Vec<_> = pending
            .into_iter()
            .map(|index| {
                let ctx = self.inner.context.clone();
                let task = task.clone();
                tokio::spawn(worker::run_segment(ctx, task, index))
            })
            .collect();

        let mut first_error = None;
        for handle in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(DownloadError::Worker(e.to_string())),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if !task.is_completed().await {
            return Ok(false);
        }

        merge_segments(&request.dest, &task.segments().await).await?;

        if let (Some(expected), true) = (&request.expected_hash, verify != VerifyMode::Off) {
            if let Err(e) = hashing::verify_file(&request.dest, expected).await {
                error!(url = %request.url, error = %e, "verification failed, discarding file");
                let _ = fs::remove_file(&request.dest).await;
                let _ = remove_temp_artifacts(&request.dest).await;
                return Err(e);
            }
            debug!(url = %request.url, "hash verified");
        }

        remove_temp_artifacts(&request.dest).await?;
        if let Some(store) = &self.inner.store {
            store.mark_file_as_downloaded(&request.key()).await?;
        }
        task.publish(request.size);
        Ok(true)
    }
}

/// Concatenates the segment files by ascending start offset into a scratch
/// file, then moves it over `dest`.
async fn merge_segments(dest: &Path, segments: &[DownloadSegment]) -> Result<()> {
    let merged = merge_path_for(dest);
    let mut ordered: Vec<&DownloadSegment> = segments.iter().collect();
    ordered.sort_by_key(|s| s.start);

    let result: Result<()> = async {
        let mut output = File::create(&merged).await?;
        for segment in ordered {
            let mut input = File::open(&segment.temp_file).await?;
            let copied = tokio::io::copy(&mut input, &mut output).await?;
            if copied != segment.len() {
                return Err(DownloadError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "segment {}-{} holds {} bytes, expected {}",
                        segment.start,
                        segment.end,
                        copied,
                        segment.len()
                    ),
                )));
            }
        }
        output.flush().await?;
        output.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        error!(dest = %dest.display(), error = %e, "failed to merge segments");
        let _ = fs::remove_file(&merged).await;
        return Err(e);
    }

    fs::rename(&merged, dest).await?;
    Ok(())
}
