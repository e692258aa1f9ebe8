use crate::services::{
    block_splitter::MIN_DECLARED_BLOCK_SIZE,
    digest_service::DigestAlgorithm,
    retry::RetryPolicy,
    upload_pipeline::PipelineSettings,
    work_queue::{NetworkClass, QueueSettings},
};
use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub cache_dir: PathBuf,
    pub permanent_dir: PathBuf,
    /// Directory backing the filesystem drive.
    pub remote_dir: PathBuf,
    pub key_file: PathBuf,
    pub workers: usize,
    pub max_block_size: u64,
    pub page_size: usize,
    pub transfer_concurrency: usize,
    pub backlog_threshold: i64,
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub digest_algorithm: DigestAlgorithm,
    pub network: NetworkClass,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Encrypted media backup and resumable upload daemon")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_BACKUP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_BACKUP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides MEDIA_BACKUP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Staging area for encrypted blocks (overrides MEDIA_BACKUP_CACHE_DIR)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Offline copies of uploaded revisions (overrides MEDIA_BACKUP_PERMANENT_DIR)
    #[arg(long)]
    pub permanent_dir: Option<PathBuf>,

    /// Directory of the filesystem drive (overrides MEDIA_BACKUP_REMOTE_DIR)
    #[arg(long)]
    pub remote_dir: Option<PathBuf>,

    /// Master key file, created on first start (overrides MEDIA_BACKUP_KEY_FILE)
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Concurrent work items (overrides MEDIA_BACKUP_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Largest block the remote accepts, in bytes (overrides MEDIA_BACKUP_MAX_BLOCK_SIZE)
    #[arg(long)]
    pub max_block_size: Option<u64>,

    /// Blocks per transfer slot request (overrides MEDIA_BACKUP_PAGE_SIZE)
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Blocks of one upload in flight (overrides MEDIA_BACKUP_TRANSFER_CONCURRENCY)
    #[arg(long)]
    pub transfer_concurrency: Option<usize>,

    /// Pending uploads that pause backup admission (overrides MEDIA_BACKUP_BACKLOG_THRESHOLD)
    #[arg(long)]
    pub backlog_threshold: Option<i64>,

    /// Attempts per work item (overrides MEDIA_BACKUP_RETRY_ATTEMPTS)
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// Initial retry delay in ms (overrides MEDIA_BACKUP_RETRY_INITIAL_MS)
    #[arg(long)]
    pub retry_initial_ms: Option<u64>,

    /// Longest retry delay in ms (overrides MEDIA_BACKUP_RETRY_MAX_MS)
    #[arg(long)]
    pub retry_max_ms: Option<u64>,

    /// Local digest algorithm: md5 or blake2b (overrides MEDIA_BACKUP_DIGEST)
    #[arg(long)]
    pub digest: Option<String>,

    /// Initial network class: offline, metered or unmetered (overrides MEDIA_BACKUP_NETWORK)
    #[arg(long)]
    pub network: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Parse `MEDIA_BACKUP_{name}` if set, else `default`.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let var = format!("MEDIA_BACKUP_{name}");
    match env::var(&var) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("parsing {var} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {var}")),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let defaults = RetryPolicy::uploads();

        let network = match args.network {
            Some(value) => value.parse::<NetworkClass>().map_err(|e| anyhow!(e))?,
            None => env_or("NETWORK", NetworkClass::Unmetered)?,
        };
        let digest_algorithm = match args.digest {
            Some(value) => value.parse::<DigestAlgorithm>()?,
            None => env_or("DIGEST", DigestAlgorithm::Md5)?,
        };

        let cfg = Self {
            host: args.host.map_or_else(|| env_or("HOST", "0.0.0.0".to_string()), Ok)?,
            port: args.port.map_or_else(|| env_or("PORT", 3000), Ok)?,
            database_url: args.database_url.map_or_else(
                || env_or("DATABASE_URL", "sqlite://./data/meta/media_backup.db".to_string()),
                Ok,
            )?,
            cache_dir: args
                .cache_dir
                .map_or_else(|| env_or("CACHE_DIR", PathBuf::from("./data/cache")), Ok)?,
            permanent_dir: args
                .permanent_dir
                .map_or_else(|| env_or("PERMANENT_DIR", PathBuf::from("./data/permanent")), Ok)?,
            remote_dir: args
                .remote_dir
                .map_or_else(|| env_or("REMOTE_DIR", PathBuf::from("./data/remote")), Ok)?,
            key_file: args
                .key_file
                .map_or_else(|| env_or("KEY_FILE", PathBuf::from("./data/master.key")), Ok)?,
            workers: args.workers.map_or_else(|| env_or("WORKERS", 4), Ok)?,
            max_block_size: args
                .max_block_size
                .map_or_else(|| env_or("MAX_BLOCK_SIZE", 4 * 1024 * 1024), Ok)?,
            page_size: args.page_size.map_or_else(|| env_or("PAGE_SIZE", 16), Ok)?,
            transfer_concurrency: args
                .transfer_concurrency
                .map_or_else(|| env_or("TRANSFER_CONCURRENCY", 4), Ok)?,
            backlog_threshold: args
                .backlog_threshold
                .map_or_else(|| env_or("BACKLOG_THRESHOLD", 500), Ok)?,
            retry_attempts: args
                .retry_attempts
                .map_or_else(|| env_or("RETRY_ATTEMPTS", defaults.max_attempts), Ok)?,
            retry_initial_ms: args.retry_initial_ms.map_or_else(
                || env_or("RETRY_INITIAL_MS", defaults.initial_delay.as_millis() as u64),
                Ok,
            )?,
            retry_max_ms: args.retry_max_ms.map_or_else(
                || env_or("RETRY_MAX_MS", defaults.max_delay.as_millis() as u64),
                Ok,
            )?,
            digest_algorithm,
            network,
        };
        cfg.validate()?;

        Ok((cfg, args.migrate))
    }

    /// Reject settings the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_block_size < MIN_DECLARED_BLOCK_SIZE {
            bail!(
                "max block size {} is below {MIN_DECLARED_BLOCK_SIZE} bytes; \
                 encrypted blocks would not fit",
                self.max_block_size
            );
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_ms.max(self.retry_initial_ms)),
            max_attempts: self.retry_attempts.max(1),
            ..RetryPolicy::uploads()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            cache_dir: self.cache_dir.clone(),
            permanent_dir: self.permanent_dir.clone(),
            declared_max_block_size: self.max_block_size,
            transfer_page_size: self.page_size.max(1),
            transfer_concurrency: self.transfer_concurrency.max(1),
            digest_algorithm: self.digest_algorithm,
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            workers: self.workers.max(1),
            backlog_threshold: self.backlog_threshold,
            retry: self.retry_policy(),
            ..QueueSettings::default()
        }
    }
}
