//! Readiness and liveness polling of the local automation agents.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::platform::SetupError;

#[derive(Debug, Clone, Copy)]
pub struct ProbePolicy {
    pub interval: Duration,
    pub attempts: u32,
    pub request_timeout: Duration,
}

impl ProbePolicy {
    /// Automation server: 1 s apart, 30 tries.
    pub const AUTOMATION: Self = Self {
        interval: Duration::from_secs(1),
        attempts: 30,
        request_timeout: Duration::from_secs(30),
    };

    /// WebDriverAgent: same cadence for 60 s.
    pub const WDA: Self = Self {
        interval: Duration::from_secs(1),
        attempts: 60,
        request_timeout: Duration::from_secs(30),
    };
}

pub const AUTOMATION_DEADLINE: Duration = Duration::from_secs(30);
pub const WDA_DEADLINE: Duration = Duration::from_secs(60);

/// Polls `url` until it answers `200`, then fires the returned channel.
/// The sender is dropped without firing when attempts run out or the scope ends.
pub fn spawn_readiness_probe(
    http: reqwest::Client,
    url: String,
    policy: ProbePolicy,
    scope: CancellationToken,
) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        for attempt in 1..=policy.attempts {
            let ok = tokio::select! {
                _ = scope.cancelled() => return,
                ok = check(&http, &url, policy.request_timeout) => ok,
            };
            if ok {
                debug!(%url, attempt, "agent ready");
                let _ = tx.send(());
                return;
            }
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
        debug!(%url, "readiness probe gave up");
    });
    rx
}

/// Waits for a readiness signal within `deadline`.
pub async fn await_ready(
    ready: oneshot::Receiver<()>,
    what: &'static str,
    deadline: Duration,
    scope: &CancellationToken,
) -> Result<(), SetupError> {
    tokio::select! {
        _ = scope.cancelled() => Err(SetupError::Cancelled),
        outcome = tokio::time::timeout(deadline, ready) => match outcome {
            Ok(Ok(())) => Ok(()),
            _ => Err(SetupError::NotReady { what, deadline }),
        },
    }
}

/// One `GET`; true on `200`.
pub async fn check(http: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match http.get(url).timeout(timeout).send().await {
        Ok(response) => response.status() == reqwest::StatusCode::OK,
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    pub period: Duration,
    pub max_failures: u32,
    pub request_timeout: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            max_failures: 3,
            request_timeout: Duration::from_secs(3),
        }
    }
}

/// Polls a live agent until the scope ends; `on_failure` fires once after
/// `max_failures` consecutive misses.
pub fn spawn_liveness_monitor<F>(
    http: reqwest::Client,
    url: String,
    policy: LivenessPolicy,
    scope: CancellationToken,
    on_failure: F,
) where
    F: FnOnce(String) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if check(&http, &url, policy.request_timeout).await {
                failures = 0;
                continue;
            }
            failures += 1;
            warn!(%url, failures, "liveness check failed");
            if failures >= policy.max_failures {
                on_failure(format!("{url} failed {failures} liveness checks"));
                return;
            }
        }
    });
}
