use md5::Md5;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{DownloadError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
}

impl HashAlgorithm {
    /// Picks the algorithm from the length of a hex digest.
    pub fn from_hex(expected: &str) -> Result<Self> {
        match expected.trim().len() {
            32 => Ok(HashAlgorithm::Md5),
            64 => Ok(HashAlgorithm::Sha256),
            n => Err(DownloadError::UnsupportedHash(n)),
        }
    }
}

pub async fn calculate_hash(filepath: &Path, algorithm: HashAlgorithm) -> Result<String> {
    match algorithm {
        HashAlgorithm::Md5 => digest_file::<Md5>(filepath).await,
        HashAlgorithm::Sha256 => digest_file::<Sha256>(filepath).await,
    }
}

async fn digest_file<D: Digest>(filepath: &Path) -> Result<String> {
    let mut file = File::open(filepath).await?;
    let mut hasher = D::new();
    let mut buffer = vec![0; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hashes `filepath` and compares against `expected` case-insensitively.
pub async fn verify_file(filepath: &Path, expected: &str) -> Result<()> {
    let expected = expected.trim();
    let actual = calculate_hash(filepath, HashAlgorithm::from_hex(expected)?).await?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(DownloadError::HashMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}
