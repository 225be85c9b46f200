//! Startup-time config resolution over HTTP

use crate::{ConfigDocument, ConfigError, ConfigSource};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side resolver a service calls exactly once at its own startup.
///
/// Any failure — unreachable server, non-success status, undecodable body —
/// is `ConfigError::Unavailable` and must abort that startup. There is no
/// background re-polling and no fallback document.
pub struct HttpResolver {
    base_url: String,
    client: reqwest::Client,
}

impl HttpResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn resolve(
        &self,
        service: &str,
        profile: &str,
    ) -> Result<ConfigDocument, ConfigError> {
        let url = format!("{}/config/{}/{}", self.base_url, service, profile);

        let response = self
            .client
            .get(&url)
            .timeout(RESOLVE_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                ConfigError::unavailable(format!("config source unreachable at {}: {}", url, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ConfigError::unavailable(format!(
                "config source returned {} for {}: {}",
                status,
                url,
                detail.trim()
            )));
        }

        let document: ConfigDocument = response.json().await.map_err(|e| {
            ConfigError::unavailable(format!("malformed config document from {}: {}", url, e))
        })?;

        info!(
            service,
            profile,
            version = %document.version,
            properties = document.len(),
            "configuration resolved"
        );
        Ok(document)
    }
}

#[async_trait]
impl ConfigSource for HttpResolver {
    async fn fetch(&self, service: &str, profile: &str) -> Result<ConfigDocument, ConfigError> {
        self.resolve(service, profile).await
    }

    fn describe(&self) -> String {
        format!("config server at {}", self.base_url)
    }
}
