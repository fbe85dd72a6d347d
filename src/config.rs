use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the serialized configuration into a worker process
pub const WORKER_CONFIG_ENV: &str = "FORKGATE_WORKER_CONFIG";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Listener, worker pool and routing table
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control, cache and timeout tunables
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Public listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub listen: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Number of worker processes (default: logical CPU count)
    pub workers: Option<usize>,

    /// Directory that rule `static_file` entries are resolved against
    #[serde(default = "default_static_root")]
    pub static_root: PathBuf,

    /// Named upstream origins
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Ordered routing rules; the first match wins
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Headers injected into every gateway response
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct UpstreamConfig {
    /// Unique identifier referenced by rules
    pub id: String,
    /// Origin base URL, e.g. `http://127.0.0.1:9000`
    pub url: String,
    /// Bearer credential sent as the Authorization header (optional)
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RuleConfig {
    /// Regular expression matched against the request path (unanchored)
    pub path: String,
    /// Upstream ids; only the first one is used for dispatch
    #[serde(default)]
    pub upstream: Vec<String>,
    /// File under `static_root` served directly by the coordinator
    pub static_file: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Limits {
    /// Requests per window above which a client is rejected with 429
    #[serde(default = "default_rate_limit_threshold")]
    pub rate_limit_threshold: u64,

    /// Requests per window above which a client is delayed
    #[serde(default = "default_throttle_threshold")]
    pub throttle_threshold: u64,

    /// Delay applied to throttled requests in milliseconds
    #[serde(default = "default_throttle_delay")]
    pub throttle_delay_ms: u64,

    /// Length of the fixed rate limit window in seconds
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Lifetime of cached upstream responses in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// How often expired cache entries and rate windows are swept
    #[serde(default = "default_sweep_interval")]
    pub cache_sweep_interval_secs: u64,

    /// How long the coordinator waits for a worker reply
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,

    /// How long a worker waits for the upstream response
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Delay before restarting a worker that exited before becoming ready
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_ms: u64,

    /// Largest request body the coordinator reads before answering 413
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_port(),
            bind: default_bind_address(),
            workers: None,
            static_root: default_static_root(),
            upstreams: Vec::new(),
            rules: Vec::new(),
            headers: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Effective worker count, falling back to the host's logical CPU count
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Look up an upstream by id
    pub fn upstream(&self, id: &str) -> Option<&UpstreamConfig> {
        self.upstreams.iter().find(|u| u.id == id)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            rate_limit_threshold: default_rate_limit_threshold(),
            throttle_threshold: default_throttle_threshold(),
            throttle_delay_ms: default_throttle_delay(),
            window_secs: default_window(),
            cache_ttl_secs: default_cache_ttl(),
            cache_sweep_interval_secs: default_sweep_interval(),
            reply_timeout_secs: default_reply_timeout(),
            upstream_timeout_secs: default_upstream_timeout(),
            restart_backoff_ms: default_restart_backoff(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Limits {
    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs.max(1))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_static_root() -> PathBuf {
    PathBuf::from("public")
}

fn default_rate_limit_threshold() -> u64 {
    100
}

fn default_throttle_threshold() -> u64 {
    50
}

fn default_throttle_delay() -> u64 {
    1000
}

fn default_window() -> u64 {
    60
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_reply_timeout() -> u64 {
    30
}

fn default_upstream_timeout() -> u64 {
    25
}

fn default_restart_backoff() -> u64 {
    500
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Decode the startup context handed to a worker process
    pub fn from_worker_context(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Encode this configuration as a worker startup context
    pub fn to_worker_context(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validate all configuration
    ///
    /// Rules referencing unknown upstream ids are accepted here; they surface
    /// as routing failures inside the worker.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        for upstream in &self.server.upstreams {
            if !seen.insert(upstream.id.as_str()) {
                errors.push(format!("duplicate upstream id '{}'", upstream.id));
            }
            if upstream.url.trim().is_empty() {
                errors.push(format!("upstream '{}' has an empty url", upstream.id));
            }
        }

        for (index, rule) in self.server.rules.iter().enumerate() {
            if let Err(e) = regex::Regex::new(&rule.path) {
                errors.push(format!("rule {} has an invalid path pattern: {}", index, e));
            }
            if rule.upstream.is_empty() && rule.static_file.is_none() {
                // Allowed, but the worker will answer "No upstream found"
                tracing::warn!(rule = index, path = %rule.path, "Rule has neither upstream nor static_file");
            }
        }

        if self.limits.throttle_threshold > self.limits.rate_limit_threshold {
            errors.push(format!(
                "throttle_threshold ({}) must not exceed rate_limit_threshold ({})",
                self.limits.throttle_threshold, self.limits.rate_limit_threshold
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
