//! HTTP Receivers
//!
//! Forwards the raw bytes of every first-seen transaction to the configured
//! receiver URLs. Each POST runs on its own task so a slow receiver never
//! holds up the processor. Every receiver has a cap on in-flight POSTs; once a
//! stalled receiver hits it, further transactions for that receiver are
//! dropped until a slot frees up. Failures are logged and not retried.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Default per-request timeout for receiver POSTs
pub const DEFAULT_RECEIVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on concurrent POSTs per receiver
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Errors that can occur while forwarding to a receiver
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Receiver {url} answered {status}")]
    Status { url: String, status: u16 },
}

/// The set of receivers plus the source filter applied before forwarding
#[derive(Debug, Clone)]
pub struct ReceiverPool {
    client: Client,
    urls: Vec<String>,
    /// One permit pool per entry in `urls`
    in_flight: Vec<Arc<Semaphore>>,
    allowed: HashSet<String>,
}

impl ReceiverPool {
    /// Create a pool
    ///
    /// # Arguments
    /// * `urls` - Receiver URLs
    /// * `allowed_sources` - Source tags to forward; empty forwards every source
    /// * `timeout` - Per-request timeout
    pub fn new(
        urls: Vec<String>,
        allowed_sources: impl IntoIterator<Item = String>,
        timeout: Duration,
    ) -> Result<Self, ReceiverError> {
        let client = Client::builder().timeout(timeout).build()?;
        let in_flight = permit_pools(urls.len(), DEFAULT_MAX_IN_FLIGHT);
        Ok(Self {
            client,
            urls,
            in_flight,
            allowed: allowed_sources.into_iter().collect(),
        })
    }

    /// Override the per-receiver in-flight cap (at least one)
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.in_flight = permit_pools(self.urls.len(), max.max(1));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Whether observations from `source` are forwarded
    pub fn allows(&self, source: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(source)
    }

    /// Spawn one POST per receiver if `source` is allowed
    ///
    /// Receivers already at their in-flight cap are skipped.
    ///
    /// # Returns
    /// Number of POSTs spawned
    pub fn dispatch(&self, source: &str, raw: Bytes) -> usize {
        if self.is_empty() || !self.allows(source) {
            return 0;
        }

        let mut spawned = 0;
        for (url, permits) in self.urls.iter().zip(&self.in_flight) {
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                warn!(receiver = %url, "receiver saturated, transaction not forwarded");
                continue;
            };
            let client = self.client.clone();
            let url = url.clone();
            let body = raw.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match post(&client, &url, body).await {
                    Ok(()) => debug!(receiver = %url, "forwarded transaction"),
                    Err(e) => warn!(receiver = %url, error = %e, "receiver POST failed"),
                }
            });
            spawned += 1;
        }
        spawned
    }
}

fn permit_pools(receivers: usize, max: usize) -> Vec<Arc<Semaphore>> {
    (0..receivers).map(|_| Arc::new(Semaphore::new(max))).collect()
}

/// POST raw envelope bytes to one receiver
pub async fn post(client: &Client, url: &str, raw: Bytes) -> Result<(), ReceiverError> {
    let response = client
        .post(url)
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(raw.0)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(ReceiverError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(())
}
