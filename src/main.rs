use anyhow::{bail, Context, Result};
use clap::Parser;
use hotdl::cli::VerifyMode;
use hotdl::commands::{self, ManifestSource, UpdateOutcome};
use hotdl::{DownloadConfig, ReqwestTransport, Transport, VersionStateStore};
use indicatif::HumanBytes;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Single URL to download (optional, if provided, the manifest is ignored)
    #[arg(index = 1)]
    url: Option<String>,

    /// URL of the version manifest to update from
    #[arg(short = 'm', long)]
    manifest: Option<String>,

    /// Local version manifest to update from
    #[arg(long = "manifest-file", conflicts_with = "manifest")]
    manifest_file: Option<PathBuf>,

    /// Directory holding the installed content, version.txt and the download state
    #[arg(short = 'd', long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Output path for a single URL download
    #[arg(short = 'o', long, requires = "url")]
    output: Option<PathBuf>,

    /// Expected size in bytes for a single URL download (queried from the server if omitted)
    #[arg(long, requires = "url")]
    size: Option<u64>,

    /// Expected MD5 or SHA-256 hex digest for a single URL download
    #[arg(long, requires = "url")]
    hash: Option<String>,

    /// Maximum number of segments transferred at once
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Segment size in MiB
    #[arg(short = 's', long = "segment-size")]
    segment_size: Option<u64>,

    /// Whole-file attempts before giving up on a file
    #[arg(long)]
    retries: Option<u32>,

    /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
    #[arg(long = "verify-hash", value_enum)]
    verify_hash: Option<VerifyMode>,

    /// JSON file with engine settings; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// List all downloads and their status
    #[arg(short = 'l', long)]
    list: bool,

    /// Forget the recorded download state for the data directory
    #[arg(long)]
    reset: bool,

    /// Disable progress bars
    #[arg(short = 'q', long)]
    quiet: bool,
}

impl Args {
    fn build_config(&self) -> Result<DownloadConfig> {
        let mut config = match &self.config {
            Some(path) => DownloadConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config file: {:?}", path))?,
            None => DownloadConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(concurrency) = self.concurrency {
            if concurrency == 0 {
                bail!("--concurrency must be at least 1");
            }
            config.max_concurrent_segments = concurrency;
        }
        if let Some(limit) = self.rate_limit {
            config.rate_limit = Some(limit);
        }
        if let Some(mib) = self.segment_size {
            if mib == 0 {
                bail!("--segment-size must be at least 1 MiB");
            }
            config.segment_len = mib * 1024 * 1024;
        }
        if let Some(retries) = self.retries {
            config.file_retries = retries;
        }
        if let Some(mode) = self.verify_hash {
            config.verify_mode = mode;
        }

        // Output dir might not exist yet, so we resolve it relative to current dir
        if config.data_dir.is_relative() {
            if let Ok(cwd) = std::env::current_dir() {
                config.data_dir = cwd.join(&config.data_dir);
            }
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hotdl=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.build_config()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args, config))
}

async fn run(args: Args, config: DownloadConfig) -> Result<()> {
    if args.list {
        return commands::list_downloads(&config).await;
    }

    if args.reset {
        VersionStateStore::open(config.state_file()).clear_state().await?;
        println!("Cleared download state in {:?}", config.data_dir);
        return Ok(());
    }

    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&config));
    let show_progress = !args.quiet;

    if let Some(url) = args.url {
        let dest = commands::run_single_download(
            config,
            transport,
            url,
            args.output,
            args.size,
            args.hash,
            show_progress,
        )
        .await?;
        println!("Saved to {}", dest.display());
        return Ok(());
    }

    let source = match (args.manifest, args.manifest_file) {
        (Some(url), _) => ManifestSource::Url(url),
        (None, Some(path)) => ManifestSource::File(path),
        (None, None) => bail!("Nothing to do: pass a URL, --manifest or --manifest-file"),
    };

    match commands::run_update(config, transport, source, show_progress).await? {
        UpdateOutcome::UpToDate { version } => println!("Already up to date (version {})", version),
        UpdateOutcome::Updated { version, files, bytes } => println!(
            "Updated to version {}: {} file(s), {}",
            version,
            files,
            HumanBytes(bytes)
        ),
    }
    Ok(())
}
