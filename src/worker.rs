//! Drives one segment of a file to completion.

use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::RateLimiter;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::downloader::FileDownloadTask;
use crate::error::{DownloadError, Result, TransportError};
use crate::retry::retry_delay;
use crate::transport::Transport;

pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Everything a segment worker borrows from its coordinator.
#[derive(Clone)]
pub struct TransferContext {
    pub transport: Arc<dyn Transport>,
    pub slots: Arc<Semaphore>,
    /// Shared limiter and its burst size in bytes.
    pub rate_limiter: Option<(Arc<Limiter>, u32)>,
    pub max_retries: u32,
    pub retry_base: Duration,
}

/// Runs segment `index` of `task` until it completes, the task is paused, or
/// it has made no progress for more than `max_retries` attempts.
pub async fn run_segment(ctx: TransferContext, task: Arc<FileDownloadTask>, index: usize) -> Result<()> {
    let _permit = ctx
        .slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| DownloadError::Worker(e.to_string()))?;

    let segment = task.segment(index).await;
    let (start, end) = (segment.start, segment.end);
    let mut current = segment.current;
    let mut failures = 0u32;

    while current <= end && !task.is_paused() {
        let before = current;
        let outcome = transfer_once(&ctx, &task, index, &mut current, &segment.temp_file).await;
        task.checkpoint(index, current).await?;

        match outcome {
            Ok(()) => {}
            Err(DownloadError::Io(e)) => return Err(DownloadError::Io(e)),
            Err(e) => warn!(url = %task.url, start, end, error = %e, "segment attempt failed"),
        }

        if current > before {
            failures = 0;
            continue;
        }
        failures += 1;
        if failures > ctx.max_retries {
            return Err(DownloadError::SegmentExhausted {
                start,
                end,
                attempts: failures,
            });
        }
        let delay = retry_delay(failures - 1, ctx.retry_base);
        debug!(url = %task.url, start, attempt = failures, ?delay, "retrying segment");
        tokio::time::sleep(delay).await;
    }

    Ok(())
}

/// One ranged request for `[current, end]`, appended to `temp_file`.
/// `current` advances with every byte written, even when the attempt fails.
async fn transfer_once(
    ctx: &TransferContext,
    task: &FileDownloadTask,
    index: usize,
    current: &mut u64,
    temp_file: &std::path::Path,
) -> Result<()> {
    let (start, end) = task.bounds(index);
    let body = ctx.transport.get_range(&task.url, *current, end).await?;

    if body.offset != *current {
        if body.offset != start {
            return Err(TransportError::RangeIgnored { requested: *current }.into());
        }
        debug!(url = %task.url, start, "server ignored the range, restarting segment");
        *current = start;
        task.set_live(index, start);
    }

    let mut file = if *current == start {
        File::create(temp_file).await?
    } else {
        OpenOptions::new().append(true).open(temp_file).await?
    };

    let mut stream = body.stream;
    let mut result = Ok(());
    while let Some(item) = stream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                result = Err(e.into());
                break;
            }
        };
        let allowed = end + 1 - *current;
        let take = (chunk.len() as u64).min(allowed) as usize;
        if take == 0 {
            break;
        }

        if let Some((limiter, burst)) = &ctx.rate_limiter {
            throttle(limiter, take, *burst).await;
        }
        file.write_all(&chunk[..take]).await?;
        *current += take as u64;
        task.set_live(index, *current);

        if *current > end {
            break;
        }
    }

    file.flush().await?;
    result
}

async fn throttle(limiter: &Limiter, len: usize, burst: u32) {
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(burst.max(1) as usize);
        if let Some(cells) = NonZeroU32::new(n as u32) {
            if limiter.until_n_ready(cells).await.is_err() {
                return;
            }
        }
        remaining -= n;
    }
}
