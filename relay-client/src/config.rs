use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;

use crate::retry::RetryPolicy;
use crate::substrate::SharedSigner;

pub const DEFAULT_IDENTITY: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Owner address used for reads when the caller supplies none.
    pub identity: String,
    /// Process-wide signing credential for writes.
    pub signer: Option<SharedSigner>,
    /// Message submission endpoint.
    pub submit_url: String,
    /// Evaluation/result endpoint.
    pub compute_url: String,
    /// Cached snapshot read path.
    pub cache_url: String,
    /// Default scheduler for spawns.
    pub scheduler: Option<String>,
    /// Default module for spawns.
    pub module: Option<String>,
    /// Attempts per remote primitive when a request does not override it.
    pub retry_attempts: u32,
    /// First backoff step; doubles per failed attempt.
    pub backoff_base: Duration,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            signer: None,
            submit_url: "http://127.0.0.1:3004".to_string(),
            compute_url: "http://127.0.0.1:6363".to_string(),
            cache_url: "http://127.0.0.1:3005".to_string(),
            scheduler: None,
            module: None,
            retry_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
            backoff_base: crate::retry::DEFAULT_BACKOFF_BASE,
            http_timeout: Duration::from_secs(30),
        }
    }
}

/// TOML overlay; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    identity: Option<String>,
    submit_url: Option<String>,
    compute_url: Option<String>,
    cache_url: Option<String>,
    scheduler: Option<String>,
    module: Option<String>,
    retry_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    http_timeout_secs: Option<u64>,
}

impl ClientConfig {
    /// Defaults, then the `RELAY_CONFIG` TOML file if set, then `RELAY_*`
    /// environment variables. The signer is never read from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let base = match std::env::var("RELAY_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("Failed to read RELAY_CONFIG={path}: {e}"))?;
                Self::from_toml_str(&raw)?
            }
            Err(_) => Self::default(),
        };

        Ok(Self {
            identity: env_str("RELAY_OWNER", &base.identity),
            signer: None,
            submit_url: env_str("RELAY_SUBMIT_URL", &base.submit_url),
            compute_url: env_str("RELAY_COMPUTE_URL", &base.compute_url),
            cache_url: env_str("RELAY_CACHE_URL", &base.cache_url),
            scheduler: env_opt("RELAY_SCHEDULER").or(base.scheduler),
            module: env_opt("RELAY_MODULE").or(base.module),
            retry_attempts: env_parse("RELAY_RETRY_ATTEMPTS", base.retry_attempts)?.max(1),
            backoff_base: Duration::from_millis(env_parse(
                "RELAY_BACKOFF_BASE_MS",
                base.backoff_base.as_millis() as u64,
            )?),
            http_timeout: Duration::from_secs(env_parse(
                "RELAY_HTTP_TIMEOUT_SECS",
                base.http_timeout.as_secs(),
            )?),
        })
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let file: ConfigFile =
            toml::from_str(raw).map_err(|e| anyhow::anyhow!("Invalid relay config: {e}"))?;
        let defaults = Self::default();

        Ok(Self {
            identity: file.identity.unwrap_or(defaults.identity),
            signer: None,
            submit_url: file.submit_url.unwrap_or(defaults.submit_url),
            compute_url: file.compute_url.unwrap_or(defaults.compute_url),
            cache_url: file.cache_url.unwrap_or(defaults.cache_url),
            scheduler: file.scheduler,
            module: file.module,
            retry_attempts: file
                .retry_attempts
                .unwrap_or(defaults.retry_attempts)
                .max(1),
            backoff_base: file
                .backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            http_timeout: file
                .http_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
        })
    }

    pub fn with_signer(mut self, signer: SharedSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Backoff curve for `attempts` tries, using the configured base.
    pub fn retry_policy(&self, attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts).with_base_delay(self.backoff_base)
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Process-wide configuration with atomic hot swap.
///
/// Calls take an `Arc` snapshot at entry and keep it for their whole
/// duration; reconfiguration installs a new `Arc` and never mutates a
/// snapshot someone else holds.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<ClientConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: ClientConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Arc<ClientConfig> {
        self.tx.borrow().clone()
    }

    /// Install `config`; returns the snapshot it replaced.
    pub fn replace(&self, config: ClientConfig) -> Arc<ClientConfig> {
        tracing::info!(identity = %config.identity, "relay configuration replaced");
        self.tx.send_replace(Arc::new(config))
    }

    /// Copy-on-write edit of the current configuration.
    pub fn update(&self, edit: impl FnOnce(&mut ClientConfig)) {
        self.tx.send_modify(|current| {
            let mut next = ClientConfig::clone(current);
            edit(&mut next);
            *current = Arc::new(next);
        });
        tracing::debug!("relay configuration updated");
    }

    /// Observe reconfigurations.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClientConfig>> {
        self.tx.subscribe()
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}
