//! Post-start health gate: polls an HTTP endpoint on the slot's port.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::Instant;

use crate::config::InfraConfig;
use crate::registry::SlotInfo;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Builds `http://localhost:<port>/<endpoint>`.
pub fn health_url(port: u16, endpoint: &str) -> String {
    format!("http://localhost:{}/{}", port, endpoint.trim_start_matches('/'))
}

/// Polls until the endpoint answers 200 or the timeout elapses.
#[derive(Debug, Clone)]
pub struct HealthGate {
    interval: Duration,
    request_timeout: Duration,
}

impl Default for HealthGate {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthGate {
    pub fn new() -> Self {
        Self {
            interval: POLL_INTERVAL,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Sets the delay between probes.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Returns true when the slot is healthy or no endpoint is configured.
    ///
    /// An endpoint whose port variable is not among the slot's ports cannot
    /// be probed and counts as unhealthy.
    pub async fn wait(&self, config: &InfraConfig, slot: &SlotInfo) -> bool {
        let Some(endpoint) = config.health_endpoint.as_deref() else {
            return true;
        };
        let port = config
            .health_port_var
            .as_ref()
            .and_then(|var| slot.ports.get(var));
        let Some(&port) = port else {
            tracing::warn!(
                slot = slot.slot_id,
                port_var = ?config.health_port_var,
                "health port variable not assigned to slot, skipping probe"
            );
            return false;
        };

        let timeout = Duration::from_secs(config.health_timeout);
        self.poll(&health_url(port, endpoint), timeout).await
    }

    /// Polls `url` until it answers 200 or `timeout` elapses.
    pub async fn poll(&self, url: &str, timeout: Duration) -> bool {
        let client = match reqwest::Client::builder()
            .no_proxy()
            .timeout(self.request_timeout.min(timeout.max(Duration::from_millis(100))))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "failed to build health check client");
                return false;
            }
        };

        // A timeout too large to represent means no deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match client.get(url).send().await {
                Ok(resp) if resp.status() == StatusCode::OK => {
                    tracing::info!(url = %url, attempts, "health check passed");
                    return true;
                }
                Ok(resp) => tracing::debug!(url = %url, status = %resp.status(), "not healthy yet"),
                Err(e) => tracing::debug!(url = %url, error = %e, "health probe failed"),
            }

            let now = Instant::now();
            let wait = match deadline {
                Some(deadline) if now >= deadline => break,
                Some(deadline) => self.interval.min(deadline - now),
                None => self.interval,
            };
            tokio::time::sleep(wait).await;
        }

        tracing::warn!(url = %url, attempts, timeout_secs = timeout.as_secs(), "health check timed out");
        false
    }
}

/// Runs the default health gate for a slot.
pub async fn run_health_gate(config: &InfraConfig, slot: &SlotInfo) -> bool {
    HealthGate::new().wait(config, slot).await
}
