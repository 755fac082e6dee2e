use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{FarmError, Result};

pub const DEFAULT_FARM_PORT: u16 = 5580;
pub const MAX_CONCURRENT_LIMIT: usize = 16;

/// How to launch the external renderer and watch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Renderer executable.
    pub executable: PathBuf,
    /// Arguments placed before the render arguments, for launching the
    /// renderer through a wrapper.
    pub prefix_args: Vec<String>,
    /// Directory for per-job render logs. Defaults to `<config dir>/logs`.
    pub log_dir: Option<PathBuf>,
    /// Output folder poll interval for frame counting and status checks.
    pub poll_interval_ms: u64,
    /// Progress older than this gets a synthetic status message.
    pub stale_after_ms: u64,
    /// Kill a render that neither progresses nor exits for this long.
    /// `None` disables the watchdog.
    pub watchdog_timeout_ms: Option<u64>,
    /// Time between asking the renderer to stop and killing it.
    pub kill_grace_ms: u64,
    /// Initial total-time guess for video outputs, refined by frame lines.
    pub video_estimate_secs: u64,
    /// Output prefixes to drop on top of the built-in noise table.
    pub extra_noise_prefixes: Vec<String>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        let executable = if cfg!(windows) {
            PathBuf::from(r"C:\Program Files\Moho 14\Moho.exe")
        } else {
            PathBuf::from("moho")
        };
        Self {
            executable,
            prefix_args: Vec::new(),
            log_dir: None,
            poll_interval_ms: 500,
            stale_after_ms: 20_000,
            watchdog_timeout_ms: Some(2 * 60 * 60 * 1000),
            kill_grace_ms: 5_000,
            video_estimate_secs: 120,
            extra_noise_prefixes: Vec::new(),
        }
    }
}

impl RendererConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn with_prefix_arg(mut self, arg: impl Into<String>) -> Self {
        self.prefix_args.push(arg.into());
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn watchdog_timeout(&self) -> Option<Duration> {
        self.watchdog_timeout_ms.map(Duration::from_millis)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Local queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Renders running at the same time on this machine (1-16).
    pub max_concurrent: usize,
    /// Queue snapshot, rewritten on every change.
    pub snapshot_path: Option<PathBuf>,
    /// Program that merges finished layer comps, for jobs that ask for it.
    pub compositor: Option<PathBuf>,
    pub compositor_args: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            snapshot_path: None,
            compositor: None,
            compositor_args: Vec::new(),
        }
    }
}

/// Retry policy for farm requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Consecutive failures before the master is considered offline.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Master/slave timings and addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    pub port: u16,
    pub master_host: String,
    pub heartbeat_interval_ms: u64,
    /// A node with no heartbeat for this long is offline.
    pub liveness_timeout_ms: u64,
    /// A reservation not confirmed by heartbeat within this long is released.
    pub reservation_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Idle wait between job requests when the pool is empty.
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub transfer_timeout_ms: u64,
    /// Where the master keeps uploaded project bundles.
    pub transfer_dir: Option<PathBuf>,
    /// Where a render node unpacks downloaded bundles.
    pub work_dir: Option<PathBuf>,
    /// Bundle the whole project folder, not just the project file.
    pub include_sibling_assets: bool,
    pub max_bundle_bytes: usize,
    pub discovery_timeout_ms: u64,
    pub discovery_concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_FARM_PORT,
            master_host: "localhost".to_string(),
            heartbeat_interval_ms: 10_000,
            liveness_timeout_ms: 30_000,
            reservation_timeout_ms: 30_000,
            sweep_interval_ms: 10_000,
            poll_interval_ms: 3_000,
            request_timeout_ms: 10_000,
            transfer_timeout_ms: 300_000,
            transfer_dir: None,
            work_dir: None,
            include_sibling_assets: true,
            max_bundle_bytes: 2 * 1024 * 1024 * 1024,
            discovery_timeout_ms: 500,
            discovery_concurrency: 64,
            retry: RetryConfig::default(),
        }
    }
}

impl FarmConfig {
    pub fn master_url(&self) -> String {
        format!("http://{}:{}", self.master_host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.reservation_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub renderer: RendererConfig,
    pub queue: QueueConfig,
    pub farm: FarmConfig,
}

impl AppConfig {
    /// Per-user directory for config, snapshots, logs and bundles:
    /// `$RENDER_FARM_HOME` if set, else the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        resolve_config_dir(std::env::var_os("RENDER_FARM_HOME"))
    }

    /// Load the config file, or defaults when it does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_dir()?.join("config.json"),
        };
        let config = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                FarmError::Validation(format!("config {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent == 0 || self.queue.max_concurrent > MAX_CONCURRENT_LIMIT {
            return Err(FarmError::Validation(format!(
                "max_concurrent must be 1-{}, got {}",
                MAX_CONCURRENT_LIMIT, self.queue.max_concurrent
            )));
        }
        let intervals = [
            ("renderer.poll_interval_ms", self.renderer.poll_interval_ms),
            ("farm.heartbeat_interval_ms", self.farm.heartbeat_interval_ms),
            ("farm.liveness_timeout_ms", self.farm.liveness_timeout_ms),
            ("farm.reservation_timeout_ms", self.farm.reservation_timeout_ms),
            ("farm.sweep_interval_ms", self.farm.sweep_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(FarmError::Validation(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn snapshot_path(&self) -> Result<PathBuf> {
        self.dir_or_default(self.queue.snapshot_path.as_ref(), "autosave_queue.json")
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.renderer.log_dir.as_ref(), "logs")
    }

    pub fn transfer_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.farm.transfer_dir.as_ref(), "transfers")
    }

    /// Where a render node unpacks project bundles.
    pub fn work_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.farm.work_dir.as_ref(), "work")
    }

    fn dir_or_default(&self, configured: Option<&PathBuf>, name: &str) -> Result<PathBuf> {
        match configured {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join(name)),
        }
    }
}

fn resolve_config_dir(home_override: Option<std::ffi::OsString>) -> Result<PathBuf> {
    if let Some(dir) = home_override {
        return Ok(PathBuf::from(dir));
    }
    ProjectDirs::from("", "", "render-farm")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| {
            FarmError::Validation(
                "no home directory to keep render-farm state in; set RENDER_FARM_HOME".to_string(),
            )
        })
}
