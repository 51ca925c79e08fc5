//! Decides segment boundaries and restores them from a previous run.

use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::error::Result;
use crate::segment::{DownloadSegment, SegmentRecord, SegmentSidecar};
use crate::utils::{segment_path_for, sidecar_path_for};

#[derive(Debug, Clone, Copy)]
pub struct SegmentPlanner {
    segment_len: u64,
}

impl SegmentPlanner {
    pub fn new(segment_len: u64) -> Self {
        Self {
            segment_len: segment_len.max(1),
        }
    }

    pub fn segment_len(&self) -> u64 {
        self.segment_len
    }

    /// Contiguous fixed-length segments covering `[0, size - 1]`, the last one
    /// clipped to the file size.
    pub fn split(&self, size: u64, dest: &Path) -> Vec<DownloadSegment> {
        let count = size.div_ceil(self.segment_len);
        (0..count)
            .map(|i| {
                let start = i * self.segment_len;
                let end = ((i + 1) * self.segment_len - 1).min(size - 1);
                DownloadSegment::new(start, end, segment_path_for(dest, i as usize))
            })
            .collect()
    }

    /// Whole-file plan for servers without range support.
    pub fn single(&self, size: u64, dest: &Path) -> Vec<DownloadSegment> {
        if size == 0 {
            return Vec::new();
        }
        vec![DownloadSegment::new(0, size - 1, segment_path_for(dest, 0))]
    }

    /// Restores the previous plan when the sidecar still matches the temp
    /// files on disk, otherwise starts over. The chosen plan is persisted
    /// before returning.
    pub async fn plan(&self, size: u64, dest: &Path, ranged: bool) -> Result<Vec<DownloadSegment>> {
        let sidecar_path = sidecar_path_for(dest);
        let saved = SegmentSidecar::load(&sidecar_path).await;

        let restored = match &saved {
            Some(sidecar) if ranged || sidecar.segments.len() == 1 => {
                restore(sidecar, size, dest).await
            }
            _ => None,
        };

        let segments = match restored {
            Some(segments) => {
                let done: u64 = segments.iter().map(DownloadSegment::downloaded).sum();
                info!(dest = %dest.display(), segments = segments.len(), resumed_bytes = done, "resuming from saved segments");
                segments
            }
            None => {
                let stale = saved.map(|s| s.segments.len()).unwrap_or(0);
                let fresh = if ranged {
                    self.split(size, dest)
                } else {
                    self.single(size, dest)
                };
                discard_segment_files(dest, stale.max(fresh.len())).await?;
                debug!(dest = %dest.display(), segments = fresh.len(), "created fresh segment plan");
                fresh
            }
        };

        SegmentSidecar::from_segments(&segments)
            .save(&sidecar_path)
            .await?;
        Ok(segments)
    }
}

/// Rebuilds segments from `sidecar` when it covers exactly `size` bytes in
/// order and every temp file holds exactly the recorded byte count.
async fn restore(sidecar: &SegmentSidecar, size: u64, dest: &Path) -> Option<Vec<DownloadSegment>> {
    if sidecar.segments.is_empty() || sidecar.total_len() != Some(size) {
        return None;
    }

    let mut expected_start = 0;
    let mut segments = Vec::with_capacity(sidecar.segments.len());
    for (index, record) in sidecar.segments.iter().enumerate() {
        let len = record.len()?;
        if record.start != expected_start
            || record.downloaded_bytes > len
            || (record.completed && record.downloaded_bytes != len)
        {
            return None;
        }
        expected_start = record.end + 1;

        let temp_file = segment_path_for(dest, index);
        // Segments that never started have no temp file yet.
        let on_disk = match fs::metadata(&temp_file).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(_) => return None,
        };
        if on_disk != record.downloaded_bytes {
            return None;
        }
        segments.push(rehydrate(record, on_disk, temp_file));
    }
    Some(segments)
}

fn rehydrate(record: &SegmentRecord, on_disk: u64, temp_file: std::path::PathBuf) -> DownloadSegment {
    let current = if record.completed {
        record.end + 1
    } else {
        record.start + on_disk
    };
    DownloadSegment {
        start: record.start,
        end: record.end,
        current,
        temp_file,
    }
}

async fn discard_segment_files(dest: &Path, count: usize) -> Result<()> {
    for index in 0..count {
        match fs::remove_file(segment_path_for(dest, index)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
