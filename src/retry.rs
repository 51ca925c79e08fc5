//! Backoff helpers and the whole-file retry wrapper.

use std::time::Duration;
use tracing::{info, warn};

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::manifest::UpdateFile;
use crate::progress::SharedProgress;
use crate::queue::DownloadQueue;

/// Exponential backoff: `base * 2^retry_count`, saturating.
pub fn retry_delay(retry_count: u32, base: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(retry_count);
    base.saturating_mul(multiplier)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: config.file_retries.max(1),
            base_delay: config.file_retry_base,
        }
    }

    /// Linear backoff after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

/// Submits `file` to `queue` until it succeeds or `policy.max_attempts` is
/// used up. A failure halts the queue, so the queue is resumed before each
/// resubmission. Resubmissions count as the same file in the queue's
/// aggregate progress. A cancelled item stops retrying.
pub async fn download_with_retry(
    queue: &DownloadQueue,
    file: &UpdateFile,
    progress: Option<SharedProgress>,
    policy: RetryPolicy,
) -> Result<bool, DownloadError> {
    for attempt in 1..=policy.max_attempts {
        let completion = if attempt == 1 {
            queue.enqueue(file.clone(), progress.clone())
        } else {
            queue.requeue(file.clone(), progress.clone())
        };
        if completion.await? {
            return Ok(true);
        }
        if attempt == policy.max_attempts {
            break;
        }

        let delay = policy.delay_after(attempt);
        warn!(
            path = %file.local_path,
            attempt,
            max_attempts = policy.max_attempts,
            ?delay,
            "download attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        queue.resume();
    }

    info!(path = %file.local_path, attempts = policy.max_attempts, "giving up on file");
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_delay(0, base), Duration::from_millis(100));
        assert_eq!(retry_delay(1, base), Duration::from_millis(200));
        assert_eq!(retry_delay(3, base), Duration::from_millis(800));
        assert_eq!(retry_delay(5, Duration::ZERO), Duration::ZERO);
        assert!(retry_delay(40, Duration::from_secs(u64::MAX / 2)) > Duration::ZERO);
    }

    #[test]
    fn linear_file_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(RetryPolicy::default().max_attempts, 3);
    }
}
