//! HTTP page fetching against the source.
//!
//! A [`PageFetcher`] is cheap to clone (the `reqwest::Client` is reference
//! counted) and is shared by discovery, entry inspection, and the unit pool.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;
use url::Url;

use storysync_shared::{Result, StorySyncError, SyncConfig};

use crate::retry::RetryPolicy;

/// GETs source pages with a per-request timeout and the shared retry policy.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: Client,
    retry: RetryPolicy,
}

impl PageFetcher {
    /// Build a fetcher from the runtime config.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        Self::with_options(
            &config.user_agent,
            config.timeout,
            RetryPolicy::from_config(config),
        )
    }

    pub fn with_options(user_agent: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| StorySyncError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, retry })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetch `url` once, without retrying.
    pub async fn get_once(&self, url: &Url) -> Result<String> {
        debug!(%url, "fetching page");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| StorySyncError::transport(url.as_str(), describe(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorySyncError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|e| StorySyncError::transport(url.as_str(), format!("body read failed: {e}")))
    }

    /// Fetch `url`, retrying transient failures per the policy.
    pub async fn get(&self, url: &Url) -> Result<String> {
        self.retry.run(|| self.get_once(url)).await
    }
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}
