//! Immutable progress snapshots published over `watch` channels.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileProgress {
    pub downloaded: u64,
    pub total: u64,
}

impl FileProgress {
    pub fn new(downloaded: u64, total: u64) -> Self {
        Self { downloaded, total }
    }

    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64) as f32
        }
    }
}

pub type ProgressSender = watch::Sender<FileProgress>;
pub type ProgressReceiver = watch::Receiver<FileProgress>;
/// Progress senders are shared between a caller, the queue and retries.
pub type SharedProgress = Arc<ProgressSender>;

pub fn file_progress_channel(total: u64) -> (SharedProgress, ProgressReceiver) {
    let (tx, rx) = watch::channel(FileProgress::new(0, total));
    (Arc::new(tx), rx)
}

/// Aggregate view over everything the queue has accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueProgress {
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub current_file: Option<String>,
    pub current: FileProgress,
}

impl QueueProgress {
    pub fn current_fraction(&self) -> f32 {
        if self.current_file.is_some() {
            self.current.fraction()
        } else {
            0.0
        }
    }

    pub fn total_fraction(&self) -> f32 {
        if self.total_files == 0 {
            return 0.0;
        }
        (self.completed_files as f32 + self.current_fraction()) / self.total_files as f32
    }

    pub fn remaining_files(&self) -> usize {
        self.total_files
            .saturating_sub(self.completed_files + self.failed_files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractions() {
        assert_eq!(FileProgress::new(5, 0).fraction(), 0.0);
        assert_eq!(FileProgress::new(25, 100).fraction(), 0.25);

        let queue = QueueProgress {
            total_files: 4,
            completed_files: 1,
            failed_files: 0,
            current_file: Some("a".into()),
            current: FileProgress::new(50, 100),
        };
        assert_eq!(queue.total_fraction(), 0.375);
        assert_eq!(queue.remaining_files(), 3);
        assert_eq!(QueueProgress::default().total_fraction(), 0.0);
    }
}
