//! Orchestrator configuration with builder-style setters
//!
//! Loaded from a JSON file and/or `MVKUBE_*` environment variables. Durations
//! are written as milliseconds in JSON.

use crate::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "MVKUBE_";

/// Slack on top of the remote budget before the blocking call is abandoned
pub const PROVISION_GRACE: Duration = Duration::from_millis(250);

/// Retry delays are spread by this fraction either way
const RETRY_JITTER: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file
    pub db_path: PathBuf,
    /// Pool used when a create request names none
    pub default_pool: String,
    /// Hypervisor host used when a create request names none
    pub default_host: Option<String>,
    pub provisioner: ProvisionerConfig,
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("mvkube.db"),
            default_pool: "default".to_string(),
            default_host: None,
            provisioner: ProvisionerConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// External provisioning tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Executable to run, `ansible-playbook` unless overridden
    pub program: PathBuf,
    /// Directory holding the lifecycle playbooks
    pub deploy_path: PathBuf,
    /// Inventory file, relative to `deploy_path` unless absolute
    pub inventory: PathBuf,
    /// Hard ceiling for a single tool run
    #[serde(with = "millis")]
    pub tool_timeout: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ansible-playbook"),
            deploy_path: PathBuf::from("deploy"),
            inventory: PathBuf::from("inventory.ini"),
            tool_timeout: Duration::from_secs(120),
        }
    }
}

impl ProvisionerConfig {
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn deploy_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.deploy_path = path.into();
        self
    }

    pub fn inventory(mut self, path: impl Into<PathBuf>) -> Self {
        self.inventory = path.into();
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }
}

/// Worker pool and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of workers claiming tasks
    pub concurrency: usize,
    /// Attempts per task, including the first
    pub max_attempts: u32,
    /// Delay before the first retry, doubled per attempt with jitter
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
    /// Handler deadline; caps the remote call budget
    #[serde(with = "millis")]
    pub soft_time_limit: Duration,
    /// Handler is aborted and compensated past this
    #[serde(with = "millis")]
    pub hard_time_limit: Duration,
    /// Sleep between empty queue polls
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// How often a worker process sweeps work left behind by dead workers
    #[serde(with = "millis")]
    pub janitor_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            soft_time_limit: Duration::from_secs(280),
            hard_time_limit: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            janitor_interval: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn soft_time_limit(mut self, limit: Duration) -> Self {
        self.soft_time_limit = limit;
        self
    }

    pub fn hard_time_limit(mut self, limit: Duration) -> Self {
        self.hard_time_limit = limit;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = interval;
        self
    }

    /// Randomized exponential backoff before attempt `attempt + 1`, capped at
    /// the larger of `retry_backoff` and the hard limit
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let ceiling = self.retry_backoff.max(self.hard_time_limit);
        let mut policy = ExponentialBackoff {
            current_interval: self.retry_backoff,
            initial_interval: self.retry_backoff,
            randomization_factor: RETRY_JITTER,
            multiplier: 2.0,
            max_interval: ceiling,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        let mut delay = self.retry_backoff;
        for _ in 0..attempt.clamp(1, 32) {
            delay = policy.next_backoff().unwrap_or(ceiling);
        }
        delay.min(ceiling)
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON config file; missing keys take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Defaults overridden by `MVKUBE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an environment lookup
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("DB_PATH") {
            self.db_path = v.into();
        }
        if let Some(v) = get("DEFAULT_POOL") {
            self.default_pool = v;
        }
        if let Some(v) = get("DEFAULT_HOST") {
            self.default_host = Some(v).filter(|h| !h.is_empty());
        }
        if let Some(v) = get("PROVISIONER") {
            self.provisioner.program = v.into();
        }
        if let Some(v) = get("DEPLOY_PATH") {
            self.provisioner.deploy_path = v.into();
        }
        if let Some(v) = get("INVENTORY") {
            self.provisioner.inventory = v.into();
        }
        if let Some(v) = get("TOOL_TIMEOUT_MS") {
            self.provisioner.tool_timeout = parse_millis("TOOL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("CONCURRENCY") {
            self.queue.concurrency = parse_num("CONCURRENCY", &v)?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            self.queue.max_attempts = parse_num("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("RETRY_BACKOFF_MS") {
            self.queue.retry_backoff = parse_millis("RETRY_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("SOFT_TIME_LIMIT_MS") {
            self.queue.soft_time_limit = parse_millis("SOFT_TIME_LIMIT_MS", &v)?;
        }
        if let Some(v) = get("HARD_TIME_LIMIT_MS") {
            self.queue.hard_time_limit = parse_millis("HARD_TIME_LIMIT_MS", &v)?;
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            self.queue.poll_interval = parse_millis("POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("JANITOR_INTERVAL_MS") {
            self.queue.janitor_interval = parse_millis("JANITOR_INTERVAL_MS", &v)?;
        }
        Ok(self)
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn default_pool(mut self, name: impl Into<String>) -> Self {
        self.default_pool = name.into();
        self
    }

    pub fn default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = Some(host.into());
        self
    }

    pub fn provisioner(mut self, provisioner: ProvisionerConfig) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_pool.is_empty() {
            return Err(Error::Config("default_pool cannot be empty".into()));
        }
        if self.queue.concurrency == 0 {
            return Err(Error::Config("queue.concurrency must be at least 1".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(Error::Config("queue.max_attempts must be at least 1".into()));
        }
        if self.queue.poll_interval.is_zero() {
            return Err(Error::Config("queue.poll_interval must be positive".into()));
        }
        if self.queue.janitor_interval.is_zero() {
            return Err(Error::Config("queue.janitor_interval must be positive".into()));
        }
        let tool = self.provisioner.tool_timeout;
        let soft = self.queue.soft_time_limit;
        let hard = self.queue.hard_time_limit;
        if tool.is_zero() || !(tool < soft && soft < hard) {
            return Err(Error::Config(format!(
                "timeouts must satisfy 0 < tool_timeout ({:?}) < soft_time_limit ({:?}) < hard_time_limit ({:?})",
                tool, soft, hard
            )));
        }
        if soft + PROVISION_GRACE >= hard {
            return Err(Error::Config(format!(
                "hard_time_limit ({:?}) must exceed soft_time_limit ({:?}) by more than {:?}",
                hard, soft, PROVISION_GRACE
            )));
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{}{} must be a number, got '{}'", ENV_PREFIX, name, value)))
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    parse_num::<u64>(name, value).map(Duration::from_millis)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
