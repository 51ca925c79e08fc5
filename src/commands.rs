use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::VerifyMode;
use crate::config::DownloadConfig;
use crate::downloader::{DownloadRequest, Downloader};
use crate::error::DownloadError;
use crate::hashing::HashAlgorithm;
use crate::manifest::{version_of, Manifest, DEFAULT_VERSION};
use crate::progress::{file_progress_channel, ProgressReceiver};
use crate::queue::DownloadQueue;
use crate::retry::{download_with_retry, RetryPolicy};
use crate::segment::SegmentSidecar;
use crate::state::VersionStateStore;
use crate::transport::Transport;
use crate::utils::{get_filename_from_url, sanitize_filename, SIDECAR_SUFFIX, TEMP_DIR_NAME};

#[derive(Debug, Clone)]
pub enum ManifestSource {
    Url(String),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate { version: String },
    Updated { version: String, files: usize, bytes: u64 },
}

/// One hot-update pass: compare versions, fetch what is missing, record the
/// new version once everything landed.
pub struct UpdateSession {
    config: DownloadConfig,
    transport: Arc<dyn Transport>,
    store: Arc<VersionStateStore>,
    show_progress: bool,
}

impl UpdateSession {
    pub fn new(config: DownloadConfig, transport: Arc<dyn Transport>) -> Self {
        let store = Arc::new(VersionStateStore::open(config.state_file()));
        Self {
            config,
            transport,
            store,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn state_store(&self) -> Arc<VersionStateStore> {
        self.store.clone()
    }

    pub async fn local_version(&self) -> String {
        match fs::read_to_string(self.config.version_file()).await {
            Ok(content) => version_of(&content),
            Err(_) => {
                warn!(path = %self.config.version_file().display(), "no local version file, assuming {}", DEFAULT_VERSION);
                DEFAULT_VERSION.to_string()
            }
        }
    }

    async fn fetch_manifest(&self, source: &ManifestSource) -> Result<String> {
        match source {
            ManifestSource::Url(url) => {
                let separator = if url.contains('?') { '&' } else { '?' };
                let busted = format!("{}{}t={}", url, separator, Utc::now().timestamp_millis());
                self.transport
                    .get_text(&busted)
                    .await
                    .with_context(|| format!("Failed to fetch version manifest from {}", url))
            }
            ManifestSource::File(path) => fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read version manifest: {:?}", path)),
        }
    }

    pub async fn run(&self, source: ManifestSource) -> Result<UpdateOutcome> {
        let local_version = self.local_version().await;
        let content = self.fetch_manifest(&source).await?;
        let manifest = Manifest::parse(&content, self.config.default_base_url.as_deref())
            .context("Failed to parse version manifest")?;
        info!(local = %local_version, remote = %manifest.version, files = manifest.files.len(), "checked versions");

        if local_version == manifest.version {
            self.store.clear_state().await?;
            return Ok(UpdateOutcome::UpToDate {
                version: manifest.version,
            });
        }

        self.store.initialize_for_version(&manifest.version).await?;
        let pending = self.store.filter_pending_downloads(&manifest.files);
        if self.config.verify_mode == VerifyMode::On {
            let missing: Vec<&str> = pending
                .iter()
                .filter(|f| f.expected_hash().is_none())
                .map(|f| f.local_path.as_str())
                .collect();
            if !missing.is_empty() {
                bail!("Hash verification is on but these entries have no hash: {:?}", missing);
            }
        }
        if self.config.verify_mode != VerifyMode::Off {
            let unusable: Vec<&str> = pending
                .iter()
                .filter(|f| f.expected_hash().is_some_and(|h| HashAlgorithm::from_hex(h).is_err()))
                .map(|f| f.local_path.as_str())
                .collect();
            if !unusable.is_empty() {
                bail!("These entries carry a hash that is neither MD5 nor SHA-256: {:?}", unusable);
            }
        }

        let pending_bytes: u64 = pending.iter().map(|f| f.size).sum();
        info!(
            pending = pending.len(),
            already_done = manifest.files.len() - pending.len(),
            bytes = %HumanBytes(pending_bytes),
            "starting update"
        );
        for file in &pending {
            if let Some(parent) = file.full_local_path(&self.config.data_dir).parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let downloader = Downloader::new(
            self.config.clone(),
            self.transport.clone(),
            Some(self.store.clone()),
        );
        let queue = DownloadQueue::start(downloader, &self.config.data_dir);
        let done_bytes = Arc::new(AtomicU64::new(0));
        let renderer = self
            .show_progress
            .then(|| render_queue(&queue, pending_bytes, done_bytes.clone()));

        let policy = RetryPolicy::from_config(&self.config);
        let queue_ref = &queue;
        let mut downloads: FuturesUnordered<_> = pending
            .iter()
            .cloned()
            .map(|file| async move {
                let result = download_with_retry(queue_ref, &file, None, policy).await;
                (file, result)
            })
            .collect();

        let mut failed = Vec::new();
        while let Some((file, result)) = downloads.next().await {
            match result {
                Ok(true) => {
                    done_bytes.fetch_add(file.size, Ordering::Relaxed);
                    self.store.mark_file_as_downloaded(&file.local_path).await?;
                }
                Ok(false) => {
                    failed.push(file.local_path);
                    queue.clear();
                }
                Err(DownloadError::Cancelled) => failed.push(file.local_path),
                Err(e) => {
                    warn!(path = %file.local_path, error = %e, "download ended with an error");
                    failed.push(file.local_path);
                    queue.clear();
                }
            }
        }
        drop(downloads);
        queue.shutdown().await;
        if let Some(renderer) = renderer {
            renderer.abort();
        }

        if !failed.is_empty() {
            bail!("Failed to download {} file(s): {:?}", failed.len(), failed);
        }

        fs::write(self.config.version_file(), &content)
            .await
            .context("Failed to write local version file")?;
        self.store.clear_state().await?;
        info!(version = %manifest.version, "update complete");

        Ok(UpdateOutcome::Updated {
            version: manifest.version,
            files: pending.len(),
            bytes: pending_bytes,
        })
    }
}

pub async fn run_update(
    config: DownloadConfig,
    transport: Arc<dyn Transport>,
    source: ManifestSource,
    show_progress: bool,
) -> Result<UpdateOutcome> {
    UpdateSession::new(config, transport)
        .with_progress(show_progress)
        .run(source)
        .await
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn render_queue(queue: &DownloadQueue, total_bytes: u64, done_bytes: Arc<AtomicU64>) -> JoinHandle<()> {
    let multi_progress = MultiProgress::new();
    multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    let total_pb = multi_progress.add(ProgressBar::new(total_bytes));
    total_pb.set_style(bar_style());
    total_pb.set_message("Total");
    let file_pb = multi_progress.add(ProgressBar::new(0));
    file_pb.set_style(bar_style());

    let mut rx = queue.progress();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            let done = done_bytes.load(Ordering::Relaxed);
            total_pb.set_position(done + snapshot.current.downloaded);
            file_pb.set_length(snapshot.current.total);
            file_pb.set_position(snapshot.current.downloaded);
            file_pb.set_message(format!(
                "{} ({}/{}, {} queued)",
                snapshot.current_file.as_deref().unwrap_or("-"),
                snapshot.completed_files,
                snapshot.total_files,
                snapshot.remaining_files()
            ));
        }
        file_pb.finish_and_clear();
        total_pb.finish();
    })
}

fn render_file(name: String, mut rx: ProgressReceiver) -> JoinHandle<()> {
    let pb = ProgressBar::with_draw_target(Some(rx.borrow().total), ProgressDrawTarget::stderr_with_hz(5));
    pb.set_style(bar_style());
    pb.set_message(format!("Downloading {}", name));
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            pb.set_position(snapshot.downloaded);
        }
        pb.finish_with_message(format!("Completed   {}", name));
    })
}

pub async fn run_single_download(
    config: DownloadConfig,
    transport: Arc<dyn Transport>,
    url: String,
    output: Option<PathBuf>,
    size: Option<u64>,
    hash: Option<String>,
    show_progress: bool,
) -> Result<PathBuf> {
    let size = match size {
        Some(size) => size,
        None => transport
            .content_length(&url)
            .await
            .with_context(|| format!("Failed to query size of {}", url))?
            .with_context(|| format!("Server did not report a size for {}, pass --size", url))?,
    };
    let dest = match output {
        Some(path) => path,
        None => config
            .data_dir
            .join(sanitize_filename(&get_filename_from_url(&url)?)),
    };
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.context("Failed to create output directory")?;
        }
    }

    let mut request = DownloadRequest::new(url.clone(), dest.clone(), size);
    if let Some(hash) = hash {
        request = request.with_hash(hash);
    }

    let (progress, rx) = file_progress_channel(size);
    let renderer = show_progress.then(|| {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.clone());
        render_file(name, rx)
    });

    let downloader = Downloader::new(config, transport, None);
    let ok = downloader.download_file(request, Some(progress)).await;
    if let Some(renderer) = renderer {
        renderer.abort();
    }
    if !ok {
        bail!("Failed to download {}", url);
    }
    Ok(dest)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDownload {
    pub file_name: String,
    pub directory: PathBuf,
    pub downloaded: u64,
    pub total: u64,
}

/// Finds every segment sidecar below `root`.
pub async fn collect_partial_downloads(root: &Path) -> Vec<PartialDownload> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            let in_temp = dir.file_name().is_some_and(|n| n == TEMP_DIR_NAME);
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(file_name) = name.strip_suffix(SIDECAR_SUFFIX) else {
                continue;
            };
            if !in_temp {
                continue;
            }
            let Some(sidecar) = SegmentSidecar::load(&path).await else {
                continue;
            };
            let Some(total) = sidecar.total_len() else {
                debug!(path = %path.display(), "skipping sidecar with malformed ranges");
                continue;
            };
            found.push(PartialDownload {
                file_name: file_name.to_string(),
                directory: dir.parent().unwrap_or(&dir).to_path_buf(),
                downloaded: sidecar
                    .segments
                    .iter()
                    .fold(0u64, |sum, s| sum.saturating_add(s.downloaded_bytes)),
                total,
            });
        }
    }
    found.sort_by(|a, b| (&a.directory, &a.file_name).cmp(&(&b.directory, &b.file_name)));
    found
}

pub async fn list_downloads(config: &DownloadConfig) -> Result<()> {
    if !config.data_dir.exists() {
        println!("Data directory '{:?}' does not exist.", config.data_dir);
        println!("Tip: If you used a custom data directory, please specify it with --data-dir");
        return Ok(());
    }

    let store = VersionStateStore::open(config.state_file());
    let state = store.snapshot();
    let partial_bytes: u64 = state.partial_downloads.values().sum();
    println!(
        "Local version: {} | Target version: {} | Completed: {} | In progress: {} ({})",
        version_of(&fs::read_to_string(config.version_file()).await.unwrap_or_default()),
        state.target_version.as_deref().unwrap_or("-"),
        state.completed_files.len(),
        state.partial_downloads.len(),
        HumanBytes(partial_bytes)
    );
    if let Some(updated_at) = state.updated_at {
        println!("State last updated: {}", updated_at.format("%Y-%m-%d %H:%M"));
    }
    println!();

    println!("{:<50} {:<15} {:<15} {:<15}", "Filename", "Status", "Progress", "Size");
    println!("{:-<50} {:-<15} {:-<15} {:-<15}", "", "", "", "");

    let partial = collect_partial_downloads(&config.data_dir).await;
    for entry in &partial {
        let progress = if entry.total > 0 {
            (entry.downloaded as f64 / entry.total as f64) * 100.0
        } else {
            0.0
        };
        let relative = entry
            .directory
            .strip_prefix(&config.data_dir)
            .unwrap_or(&entry.directory)
            .join(&entry.file_name);
        println!(
            "{:<50} {:<15} {:<15} {:<15}",
            relative.display(),
            "Downloading",
            format!("{:.2}%", progress),
            format!("{}", HumanBytes(entry.total))
        );
    }
    for path in &state.completed_files {
        println!("{:<50} {:<15} {:<15} {:<15}", path, "Completed", "100.00%", "");
    }

    if partial.is_empty() && state.completed_files.is_empty() {
        println!("No active or completed downloads found in '{:?}'.", config.data_dir);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{SegmentRecord, SegmentSidecar};
    use crate::utils::sidecar_path_for;

    #[tokio::test]
    async fn finds_sidecars_in_nested_temp_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("scenes").join("main.ab");
        fs::create_dir_all(dest.parent().unwrap().join(TEMP_DIR_NAME)).await.unwrap();
        SegmentSidecar {
            segments: vec![
                SegmentRecord { start: 0, end: 9, completed: true, downloaded_bytes: 10 },
                SegmentRecord { start: 10, end: 19, completed: false, downloaded_bytes: 3 },
            ],
        }
        .save(&sidecar_path_for(&dest))
        .await
        .unwrap();
        fs::write(dir.path().join("stray.segments.json"), "{}").await.unwrap();

        let found = collect_partial_downloads(dir.path()).await;
        assert_eq!(
            found,
            vec![PartialDownload {
                file_name: "main.ab".into(),
                directory: dir.path().join("scenes"),
                downloaded: 13,
                total: 20,
            }]
        );
    }
}
