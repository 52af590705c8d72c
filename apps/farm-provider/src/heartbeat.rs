//! Pushes the provider's device snapshot to the hub every second.

use std::time::Duration;

use farm_proto::ProviderUpdate;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("hub unreachable after {failures} consecutive attempts: {last_error}")]
    HubLost { failures: u32, last_error: String },
}

#[derive(Debug, Clone)]
pub struct HeartbeatPublisher {
    http: reqwest::Client,
    url: String,
    period: Duration,
    timeout: Duration,
    max_failures: u32,
}

impl HeartbeatPublisher {
    pub fn new(http: reqwest::Client, hub_url: &str) -> Self {
        Self {
            http,
            url: format!("{}/provider-update", hub_url.trim_end_matches('/')),
            period: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            max_failures: 30,
        }
    }

    pub fn with_timing(mut self, period: Duration, timeout: Duration, max_failures: u32) -> Self {
        self.period = period;
        self.timeout = timeout;
        self.max_failures = max_failures;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn publish(&self, update: &ProviderUpdate) -> Result<(), String> {
        let response = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(update)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("hub answered {}", response.status()))
        }
    }

    /// Publishes `snapshot()` until `shutdown`. Returns an error once the hub
    /// has failed `max_failures` times in a row; any success resets the count.
    pub async fn run<F>(self, snapshot: F, shutdown: CancellationToken) -> Result<(), HeartbeatError>
    where
        F: Fn() -> ProviderUpdate,
    {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let update = snapshot();
            match self.publish(&update).await {
                Ok(()) => {
                    if failures > 0 {
                        debug!(failures, "hub reachable again");
                    }
                    failures = 0;
                }
                Err(last_error) => {
                    failures += 1;
                    warn!(url = %self.url, failures, error = %last_error, "heartbeat failed");
                    if failures >= self.max_failures {
                        return Err(HeartbeatError::HubLost {
                            failures,
                            last_error,
                        });
                    }
                }
            }
        }
    }
}
