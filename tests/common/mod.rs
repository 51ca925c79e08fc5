#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use hotdl::error::TransportError;
use hotdl::transport::{RangeBody, Transport};
use hotdl::DownloadConfig;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub url: String,
    pub start: u64,
    pub end: u64,
}

#[derive(Default)]
struct Faults {
    /// Requests to fail outright, per URL.
    fail: HashMap<String, u32>,
    /// Responses to cut short after this many bytes, per URL.
    truncate: HashMap<String, Vec<usize>>,
}

/// In-memory server. Records every ranged request and counts the bytes it
/// actually hands out.
pub struct MockTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    texts: Mutex<HashMap<String, String>>,
    ranges: bool,
    /// Advertises range support but answers every GET with the whole body.
    ignore_ranges: bool,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    faults: Mutex<Faults>,
    log: Mutex<Vec<RangeRequest>>,
    served: Arc<AtomicU64>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            texts: Mutex::new(HashMap::new()),
            ranges: true,
            ignore_ranges: false,
            chunk_size: 256,
            chunk_delay: None,
            faults: Mutex::new(Faults::default()),
            log: Mutex::new(Vec::new()),
            served: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    pub fn ignoring_range_requests(mut self) -> Self {
        self.ignore_ranges = true;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn with_file(self, url: &str, body: Vec<u8>) -> Self {
        self.files.lock().unwrap().insert(url.to_string(), body);
        self
    }

    pub fn with_text(self, url: &str, text: &str) -> Self {
        self.texts.lock().unwrap().insert(url.to_string(), text.to_string());
        self
    }

    pub fn fail_next(&self, url: &str, count: u32) {
        self.faults.lock().unwrap().fail.insert(url.to_string(), count);
    }

    pub fn truncate_next(&self, url: &str, after: usize) {
        self.faults
            .lock()
            .unwrap()
            .truncate
            .entry(url.to_string())
            .or_default()
            .push(after);
    }

    pub fn requests(&self) -> Vec<RangeRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests_for(&self, url: &str) -> Vec<RangeRequest> {
        self.requests().into_iter().filter(|r| r.url == url).collect()
    }

    pub fn bytes_served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn probe_ranges(&self, url: &str) -> Result<bool, TransportError> {
        if !self.files.lock().unwrap().contains_key(url) {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: 404,
            });
        }
        Ok(self.ranges)
    }

    async fn get_range(&self, url: &str, start: u64, end: u64) -> Result<RangeBody, TransportError> {
        self.log.lock().unwrap().push(RangeRequest {
            url: url.to_string(),
            start,
            end,
        });

        let truncate_after = {
            let mut faults = self.faults.lock().unwrap();
            if let Some(remaining) = faults.fail.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Status {
                        url: url.to_string(),
                        status: 503,
                    });
                }
            }
            faults.truncate.get_mut(url).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
        };

        let body = self.files.lock().unwrap().get(url).cloned().ok_or_else(|| {
            TransportError::Status {
                url: url.to_string(),
                status: 404,
            }
        })?;

        let partial = self.ranges && !self.ignore_ranges;
        let offset = if partial { start } else { 0 };
        let last = if partial {
            end.min(body.len() as u64 - 1)
        } else {
            body.len() as u64 - 1
        };
        let mut slice = body[offset as usize..=last as usize].to_vec();
        let cut = truncate_after.is_some_and(|after| after < slice.len());
        if let Some(after) = truncate_after {
            slice.truncate(after);
        }

        let chunks: Vec<Result<Bytes, TransportError>> = slice
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .chain(cut.then(|| Err(TransportError::Other("connection reset".into()))))
            .collect();

        let delay = self.chunk_delay;
        let served = self.served.clone();
        let stream = stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                chunk
            })
            .inspect(move |chunk| {
                if let Ok(bytes) = chunk {
                    served.fetch_add(bytes.len() as u64, Ordering::SeqCst);
                }
            })
            .boxed();
        Ok(RangeBody { offset, stream })
    }

    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        let bare = url.split('?').next().unwrap_or(url);
        self.texts
            .lock()
            .unwrap()
            .get(bare)
            .cloned()
            .ok_or_else(|| TransportError::Status {
                url: url.to_string(),
                status: 404,
            })
    }

    async fn content_length(&self, url: &str) -> Result<Option<u64>, TransportError> {
        Ok(self.files.lock().unwrap().get(url).map(|b| b.len() as u64))
    }
}

/// Deterministic, non-repeating-ish test payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Small segments and near-instant backoff so tests stay fast.
pub fn test_config(data_dir: &Path) -> DownloadConfig {
    DownloadConfig {
        segment_len: 1024,
        segment_retries: 2,
        segment_retry_base: Duration::from_millis(1),
        file_retries: 3,
        file_retry_base: Duration::from_millis(1),
        data_dir: data_dir.to_path_buf(),
        ..Default::default()
    }
}
