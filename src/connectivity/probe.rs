//! Network probe
//!
//! Periodically issues a `HEAD` request against a configured URL and feeds
//! the outcome into a [`ConnectivityMonitor`]. Any HTTP response counts as
//! online; only transport failures count as offline.

use super::monitor::ConnectivityMonitor;
use reqwest::Client;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Periodic reachability check
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    client: Client,
    url: String,
    interval: Duration,
}

impl NetworkProbe {
    pub fn new(url: impl Into<String>, interval: Duration, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            interval,
        })
    }

    /// Probe once
    pub async fn check(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(response) => {
                tracing::trace!("[Probe] {} -> {}", self.url, response.status());
                true
            }
            Err(e) => {
                tracing::debug!("[Probe] {} unreachable: {}", self.url, e);
                false
            }
        }
    }

    /// Probe on every tick until the returned task is aborted
    pub fn spawn(self, monitor: ConnectivityMonitor) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = self.check().await;
                monitor.report(online);
            }
        })
    }
}
