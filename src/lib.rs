//! Segmented, resumable file downloader for versioned content updates.

pub mod cli;
pub mod commands;
pub mod config;
pub mod downloader;
pub mod error;
pub mod hashing;
pub mod manifest;
pub mod planner;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod segment;
pub mod state;
pub mod transport;
pub mod utils;
pub mod worker;

pub use config::DownloadConfig;
pub use downloader::{DownloadRequest, Downloader};
pub use error::{DownloadError, ManifestError, TransportError};
pub use manifest::{Manifest, UpdateFile};
pub use queue::DownloadQueue;
pub use state::VersionStateStore;
pub use transport::{ReqwestTransport, Transport};
