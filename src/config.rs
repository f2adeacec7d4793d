use crate::PipelineVersion;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Args, Clone, Debug, PartialEq)]
pub struct VersionArgs {
    #[arg(
        long = "renderer-version",
        env = "POSTER_RENDERER_VERSION",
        default_value = "maptoposter-vendor",
        help = "Renderer version tag mixed into every fingerprint"
    )]
    pub renderer: String,

    #[arg(
        long = "service-version",
        env = "POSTER_SERVICE_VERSION",
        default_value = "1",
        help = "Service version tag mixed into every fingerprint"
    )]
    pub service: String,
}

impl From<VersionArgs> for PipelineVersion {
    fn from(args: VersionArgs) -> Self {
        PipelineVersion {
            renderer: args.renderer,
            service: args.service,
        }
    }
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct CoordinatorArgs {
    #[arg(
        long = "active-ttl",
        env = "POSTER_ACTIVE_JOB_TTL_SECONDS",
        default_value = "3600",
        help = "Seconds an in-flight job stays eligible for deduplication"
    )]
    pub active_ttl_secs: u64,
}

impl CoordinatorArgs {
    pub fn active_ttl(&self) -> Duration {
        Duration::from_secs(self.active_ttl_secs)
    }
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct RendererArgs {
    #[arg(
        long = "renderer",
        env = "POSTER_RENDERER_BIN",
        default_value = "create_map_poster",
        help = "Program invoked once per render"
    )]
    pub program: PathBuf,

    #[arg(
        long = "themes-dir",
        env = "POSTER_THEMES_DIR",
        default_value = "./themes",
        help = "Directory of <theme>.json files"
    )]
    pub themes_dir: PathBuf,

    #[arg(
        long = "cache-dir",
        env = "LOCAL_POSTER_CACHE_DIR",
        default_value = "/tmp/poster-cache",
        help = "Where published assets are stored"
    )]
    pub cache_dir: PathBuf,

    #[arg(
        long = "asset-url-prefix",
        env = "POSTER_ASSET_URL_PREFIX",
        default_value = "/v1/assets",
        help = "URL prefix under which the cache directory is served"
    )]
    pub url_prefix: String,
}

/// S3-compatible object storage for published assets (Cloudflare R2 in
/// production). Blank values count as unset.
#[derive(Args, Clone, Debug, Default, PartialEq)]
pub struct StorageArgs {
    #[arg(long = "r2-endpoint", env = "R2_ENDPOINT", help = "S3-compatible endpoint URL")]
    pub endpoint: Option<String>,

    #[arg(long = "r2-access-key-id", env = "R2_ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key_id: Option<String>,

    #[arg(long = "r2-secret-access-key", env = "R2_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: Option<String>,

    #[arg(long = "r2-region", env = "R2_REGION", default_value = "auto")]
    pub region: String,

    #[arg(long = "r2-bucket", env = "R2_BUCKET")]
    pub bucket: Option<String>,

    #[arg(
        long = "r2-public-base-url",
        env = "R2_PUBLIC_BASE_URL",
        help = "Public URL of the bucket; without it assets are also served locally"
    )]
    pub public_base_url: Option<String>,

    #[arg(
        long = "object-prefix",
        env = "POSTER_OBJECT_PREFIX",
        default_value = "posters",
        help = "Key prefix for uploaded assets"
    )]
    pub object_prefix: String,
}

/// Connection details for a fully configured bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig<'a> {
    pub endpoint: &'a str,
    pub region: &'a str,
    pub name: &'a str,
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
}

impl StorageArgs {
    /// `None` unless endpoint, credentials and bucket are all set.
    pub fn bucket(&self) -> Option<BucketConfig<'_>> {
        fn set(value: &Option<String>) -> Option<&str> {
            value.as_deref().map(str::trim).filter(|v| !v.is_empty())
        }
        Some(BucketConfig {
            endpoint: set(&self.endpoint)?,
            region: match self.region.trim() {
                "" => "auto",
                region => region,
            },
            name: set(&self.bucket)?,
            access_key_id: set(&self.access_key_id)?,
            secret_access_key: set(&self.secret_access_key)?,
        })
    }
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct WorkerArgs {
    #[arg(
        short = 'n',
        long = "workers",
        help = "Number of worker loops in this process",
        default_value = "1"
    )]
    pub workers: u16,

    #[arg(
        long = "poll-timeout",
        env = "WORKER_POLL_TIMEOUT_SECONDS",
        default_value = "5",
        help = "Seconds a queue pop waits before re-checking for shutdown"
    )]
    pub poll_timeout_secs: u64,

    #[arg(
        long = "lock-wait",
        env = "WORKER_LOCK_WAIT_SECONDS",
        default_value = "2",
        help = "Seconds between asset checks while another worker holds the render lock"
    )]
    pub lock_wait_secs: u64,

    #[arg(
        long = "lock-wait-retries",
        env = "WORKER_LOCK_WAIT_RETRIES",
        default_value = "180",
        help = "Asset checks before a waiting job fails with a timeout"
    )]
    pub lock_wait_retries: u32,

    #[arg(
        long = "lock-ttl",
        env = "WORKER_RENDER_LOCK_TTL_SECONDS",
        default_value = "900",
        help = "Seconds before an abandoned render lock expires"
    )]
    pub lock_ttl_secs: u64,

    #[arg(
        long = "work-dir",
        env = "WORKER_SCRATCH_DIR",
        default_value = "/tmp/poster-jobs",
        help = "Scratch directory for rendered files"
    )]
    pub work_dir: PathBuf,
}

/// Timing and placement knobs for one worker loop.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSettings {
    pub poll_timeout: Duration,
    pub lock_wait_interval: Duration,
    pub lock_wait_retries: u32,
    pub lock_ttl: Duration,
    pub work_dir: PathBuf,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            poll_timeout: Duration::from_secs(5),
            lock_wait_interval: Duration::from_secs(2),
            lock_wait_retries: 180,
            lock_ttl: Duration::from_secs(900),
            work_dir: PathBuf::from("/tmp/poster-jobs"),
        }
    }
}

impl From<&WorkerArgs> for WorkerSettings {
    fn from(args: &WorkerArgs) -> Self {
        WorkerSettings {
            poll_timeout: Duration::from_secs(args.poll_timeout_secs.max(1)),
            lock_wait_interval: Duration::from_secs(args.lock_wait_secs),
            lock_wait_retries: args.lock_wait_retries,
            lock_ttl: Duration::from_secs(args.lock_ttl_secs.max(1)),
            work_dir: args.work_dir.clone(),
        }
    }
}
