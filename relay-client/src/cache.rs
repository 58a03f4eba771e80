//! Cache-backed read path.
//!
//! Denormalized JSON snapshots are served from a content-addressed cache that
//! is updated independently of process evaluation. Reads are idempotent and
//! every failure is treated as transient.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, ConfigHandle};
use crate::error::RelayError;
use crate::http::{join_url, read_json};
use crate::poller::Probe;
use crate::retry::RetryError;
use crate::substrate::SubstrateError;

#[derive(Debug, Clone)]
pub struct CacheReader {
    http: reqwest::Client,
}

impl CacheReader {
    pub fn new() -> Result<Self, SubstrateError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SubstrateError::Transport("http_client".to_string(), e.to_string()))?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch `path` under the configured retry budget.
    pub async fn fetch(
        &self,
        config: &ClientConfig,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, RelayError> {
        let reader = self;
        let policy = config.retry_policy(config.retry_attempts);
        policy
            .execute("cache.fetch", cancel, move |_| reader.fetch_once(config, path))
            .await
            .map_err(|err| match err {
                RetryError::Exhausted { attempts, last } => RelayError::CacheReadFailed {
                    path: path.to_string(),
                    attempts,
                    source: last,
                },
                RetryError::Cancelled { .. } => RelayError::Cancelled { context: None },
            })
    }

    /// Single GET, no retry.
    pub async fn fetch_once(&self, config: &ClientConfig, path: &str) -> Result<Value, SubstrateError> {
        let url = join_url(&config.cache_url, path);
        let response = self
            .http
            .get(&url)
            .timeout(config.http_timeout)
            .send()
            .await
            .map_err(|e| SubstrateError::Transport(url.clone(), e.to_string()))?;
        read_json(&url, response).await
    }

    /// Convergence source reading `path` and mapping the snapshot with
    /// `extract`. Each invocation reads the current configuration snapshot;
    /// retries are left to the poller.
    pub fn probe<T, F>(&self, config: ConfigHandle, path: impl Into<String>, extract: F) -> Probe<T>
    where
        T: Send + 'static,
        F: Fn(&Value) -> T + Send + Sync + 'static,
    {
        let reader = self.clone();
        let path = path.into();
        let extract = Arc::new(extract);
        Probe::new(path.clone(), move || {
            let reader = reader.clone();
            let config = config.snapshot();
            let path = path.clone();
            let extract = Arc::clone(&extract);
            async move {
                let value = reader
                    .fetch_once(&config, &path)
                    .await
                    .map_err(|source| RelayError::CacheReadFailed {
                        path: path.clone(),
                        attempts: 1,
                        source,
                    })?;
                Ok(extract(&value))
            }
        })
    }
}
