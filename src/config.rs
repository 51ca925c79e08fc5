//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::VerifyMode;
use crate::error::Result;

pub const DEFAULT_SEGMENT_LEN: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT_SEGMENTS: usize = 4;
pub const STATE_FILE_NAME: &str = "download_state.json";
pub const VERSION_FILE_NAME: &str = "version.txt";

/// Knobs shared by the downloader, the queue and the update session.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DownloadConfig {
    /// Fixed length of one segment in bytes.
    pub segment_len: u64,
    /// Upper bound on in-flight segment transfers.
    pub max_concurrent_segments: usize,
    /// Attempts without progress a segment may make before it fails.
    pub segment_retries: u32,
    #[serde(with = "millis")]
    pub segment_retry_base: Duration,
    /// Whole-file attempts made by the retry wrapper.
    pub file_retries: u32,
    #[serde(with = "millis")]
    pub file_retry_base: Duration,
    /// Global bandwidth cap in bytes per second.
    pub rate_limit: Option<u32>,
    pub verify_mode: VerifyMode,
    pub user_agent: String,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Root for downloaded files, the version file and the state file.
    pub data_dir: PathBuf,
    /// Used when a manifest has no base URL line.
    pub default_base_url: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            segment_len: DEFAULT_SEGMENT_LEN,
            max_concurrent_segments: DEFAULT_MAX_CONCURRENT_SEGMENTS,
            segment_retries: 5,
            segment_retry_base: Duration::from_millis(500),
            file_retries: 3,
            file_retry_base: Duration::from_secs(1),
            rate_limit: None,
            verify_mode: VerifyMode::Auto,
            user_agent: concat!("hotdl/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
            data_dir: PathBuf::from("data"),
            default_base_url: None,
        }
    }
}

impl DownloadConfig {
    /// Reads a JSON config file; keys it omits keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE_NAME)
    }

    pub fn version_file(&self) -> PathBuf {
        self.data_dir.join(VERSION_FILE_NAME)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
