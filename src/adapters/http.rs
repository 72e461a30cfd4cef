//! HTTP adapters: health probe and webhook notifications.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{HealthProbe, HealthStatus, NotificationSink};
use crate::domain::NotificationEvent;

/// Probes `scheme://host:port/path`; any 2xx response is healthy
pub struct HttpProbe {
    scheme: String,
    port: u16,
    path: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(scheme: impl Into<String>, port: u16, path: impl Into<String>, timeout: Duration) -> Result<Self> {
        let scheme = scheme.into();
        if scheme != "http" && scheme != "https" {
            anyhow::bail!("Unsupported health probe scheme '{}'", scheme);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for health probe")?;

        Ok(Self {
            scheme,
            port,
            path: path.into(),
            client,
        })
    }

    /// Build the URL probed for a host
    fn url_for(&self, host: &str) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", self.scheme, host, self.port, path)
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    fn name(&self) -> &str {
        "http"
    }

    async fn probe(&self, host: &str) -> Result<HealthStatus> {
        let url = self.url_for(host);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Health request to {} failed", url))?;

        let status = response.status();
        if status.is_success() {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy {
                reason: format!("{} returned {}", url, status),
            })
        }
    }
}

/// Posts notification events as JSON
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        &self.url
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("Failed to post notification to {}", self.url))?;

        if !response.status().is_success() {
            anyhow::bail!("Webhook {} returned {}", self.url, response.status());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_url() {
        let probe = HttpProbe::new("http", 8080, "health", Duration::from_secs(2)).unwrap();
        assert_eq!(probe.url_for("10.0.0.5"), "http://10.0.0.5:8080/health");

        let probe = HttpProbe::new("https", 443, "/status", Duration::from_secs(2)).unwrap();
        assert_eq!(probe.url_for("app.internal"), "https://app.internal:443/status");
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        assert!(HttpProbe::new("ftp", 21, "/health", Duration::from_secs(2)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_an_error() {
        let probe = HttpProbe::new("http", 1, "/health", Duration::from_millis(200)).unwrap();
        assert!(probe.probe("127.0.0.1").await.is_err());
    }
}
