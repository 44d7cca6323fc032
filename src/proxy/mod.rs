//! Registration proxy selection
//!
//! Runs before any identity-bearing request, so failures here are
//! [`Error::NoProxyAvailable`] and never registration errors.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::api::{ProxyDirectory, ProxyEndpoint, RemoteError};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Picks a reachable registration proxy from the directory service
#[derive(Clone)]
pub struct ProxySelector {
    directory: Arc<dyn ProxyDirectory>,
    retry: RetryConfig,
    timeout: Duration,
}

impl ProxySelector {
    /// Create a selector over `directory`
    pub fn new(directory: Arc<dyn ProxyDirectory>, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            directory,
            retry,
            timeout,
        }
    }

    /// Query `directory_endpoint` and return the first viable candidate
    ///
    /// The query is retried with backoff since nothing has been sent on
    /// anyone's behalf yet.
    pub async fn select_best_proxy(&self, directory_endpoint: &str) -> Result<ProxyEndpoint> {
        let candidates = retry_with_backoff(
            &self.retry,
            "proxy directory query",
            |_: &RemoteError| true,
            move || async move {
                match tokio::time::timeout(self.timeout, self.directory.candidates(directory_endpoint))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::new(
                        None,
                        format!("timed out after {:?}", self.timeout),
                    )),
                }
            },
        )
        .await
        .map_err(|e| {
            warn!(endpoint = %directory_endpoint, error = %e, "Proxy directory query failed");
            Error::no_proxy(directory_endpoint, e.to_string())
        })?;

        debug!(endpoint = %directory_endpoint, count = candidates.len(), "Directory returned candidates");

        let proxy = candidates
            .into_iter()
            .find(|c| !c.endpoint.trim().is_empty())
            .ok_or_else(|| Error::no_proxy(directory_endpoint, "directory returned no candidates"))?;

        info!(proxy = %proxy.endpoint, "Selected registration proxy");
        Ok(proxy)
    }
}
