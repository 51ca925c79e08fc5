//! Byte-range segments and their on-disk sidecar.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::Result;

/// One byte range of a file being transferred into its own temp file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSegment {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    /// Next offset to write; `end + 1` once complete.
    pub current: u64,
    pub temp_file: PathBuf,
}

impl DownloadSegment {
    pub fn new(start: u64, end: u64, temp_file: PathBuf) -> Self {
        Self {
            start,
            end,
            current: start,
            temp_file,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn downloaded(&self) -> u64 {
        self.current - self.start
    }

    pub fn remaining(&self) -> u64 {
        self.end + 1 - self.current
    }

    pub fn is_completed(&self) -> bool {
        self.current == self.end + 1
    }

    pub fn to_record(&self) -> SegmentRecord {
        SegmentRecord {
            start: self.start,
            end: self.end,
            completed: self.is_completed(),
            downloaded_bytes: self.downloaded(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub start: u64,
    pub end: u64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub downloaded_bytes: u64,
}

impl SegmentRecord {
    /// Byte count of the range, `None` for ranges no file can have.
    pub fn len(&self) -> Option<u64> {
        if self.end < self.start || self.end == u64::MAX {
            return None;
        }
        (self.end - self.start).checked_add(1)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentSidecar {
    #[serde(default)]
    pub segments: Vec<SegmentRecord>,
}

impl SegmentSidecar {
    pub fn from_segments(segments: &[DownloadSegment]) -> Self {
        Self {
            segments: segments.iter().map(DownloadSegment::to_record).collect(),
        }
    }

    /// Sum of all record lengths; `None` when a record is malformed or the
    /// sum does not fit in a `u64`.
    pub fn total_len(&self) -> Option<u64> {
        self.segments
            .iter()
            .try_fold(0u64, |total, record| total.checked_add(record.len()?))
    }

    /// Missing or unreadable sidecars yield `None`; callers treat that as
    /// "no resume data".
    pub async fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "discarding unreadable segment sidecar");
                None
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string(self)?;
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}
