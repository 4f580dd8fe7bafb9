use crate::dispatch::Destination;
use crate::gate::GateOptions;
use crate::webspace::Identity;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener and forwarding configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Webspace identity and control-plane settings
    pub webspace: WebspaceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Raw TCP port (default: 0, disabled)
    #[serde(default)]
    pub tcp_port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for the webspace to answer a forwarded request (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Servers the dispatch table starts with, as handed over by service discovery.
    /// They are replaced by the webspace address on the first successful request.
    #[serde(default)]
    pub seed_backends: Vec<String>,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            tcp_port: 0,
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            seed_backends: Vec::new(),
        }
    }
}

/// Identity of the webspace to boot plus tuning of the boot round trip.
///
/// Field names also accept the camelCase spelling used by the control plane's
/// own configuration (`iamToken`, `userID`).
#[derive(Debug, Deserialize, Clone)]
pub struct WebspaceConfig {
    /// Control-plane base URL
    #[serde(default)]
    pub url: String,

    /// Bearer token for the control plane
    #[serde(default, alias = "iamToken")]
    pub iam_token: String,

    /// Numeric user id that owns the webspace
    #[serde(default, alias = "userID")]
    pub user_id: u64,

    /// Timeout for each control-plane call in seconds, 0 leaves calls bounded
    /// only by `boot_timeout_secs` (default: 10)
    #[serde(default = "default_control_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upper bound for a whole boot round trip in seconds (default: 60)
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,

    /// Timeout for dialing the webspace in the TCP variant in seconds (default: 10)
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// How long a resolved address may be reused, 0 disables caching (default: 0)
    #[serde(default)]
    pub cache_ttl_secs: u64,

    /// Max wait for the dispatch table write lock in milliseconds (default: 1000)
    #[serde(default = "default_dispatch_lock_timeout")]
    pub dispatch_lock_timeout_ms: u64,
}

impl WebspaceConfig {
    pub fn identity(&self) -> Identity {
        Identity::new(self.url.clone(), self.iam_token.clone(), self.user_id)
    }

    pub fn gate_options(&self) -> GateOptions {
        GateOptions {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            boot_timeout: Duration::from_secs(self.boot_timeout_secs),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn dispatch_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_lock_timeout_ms)
    }
}

// Default value functions
fn default_http_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_control_request_timeout() -> u64 {
    10
}

fn default_boot_timeout() -> u64 {
    60
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_dispatch_lock_timeout() -> u64 {
    1000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.webspace.identity().validate() {
            errors.push(e.to_string());
        }

        if self.server.http_port == 0 && self.server.tcp_port == 0 {
            errors.push("at least one of 'http_port' and 'tcp_port' must be enabled".to_string());
        }

        if self.webspace.boot_timeout_secs == 0 {
            errors.push("'boot_timeout_secs' must be greater than 0".to_string());
        }

        if self.server.request_timeout_secs == 0 {
            errors.push("'request_timeout_secs' of [server] must be greater than 0".to_string());
        }

        if self.webspace.dial_timeout_secs == 0 {
            errors.push("'dial_timeout_secs' must be greater than 0".to_string());
        }

        for seed in &self.server.seed_backends {
            if let Err(e) = Destination::parse_url(seed) {
                errors.push(format!("seed backend '{}': {}", seed, e));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
