use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sluice_core::error::AppError;
use sluice_core::proxy::{Proxy, ProxyType, parse_proxy_list};
use sluice_core::traits::ProxySource;

use crate::transport_error;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Reads one proxy per line from a local file.
#[derive(Debug, Clone)]
pub struct FileProxySource {
    path: PathBuf,
    default_type: ProxyType,
}

impl FileProxySource {
    pub fn new(path: impl AsRef<Path>, default_type: ProxyType) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            default_type,
        }
    }
}

#[async_trait]
impl ProxySource for FileProxySource {
    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn fetch(&self) -> Result<Vec<Proxy>, AppError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AppError::ProxySourceError {
                source_name: self.name(),
                message: e.to_string(),
            })?;
        let (proxies, invalid) = parse_proxy_list(&text, self.default_type);
        if invalid > 0 {
            tracing::warn!(source = %self.name(), invalid, "Skipped invalid proxy lines");
        }
        Ok(proxies)
    }
}

/// Downloads a plain-text proxy list, one proxy per line.
#[derive(Clone)]
pub struct RemoteProxySource {
    client: Client,
    url: String,
    default_type: ProxyType,
    timeout_secs: u64,
}

impl RemoteProxySource {
    pub fn new(url: &str, default_type: ProxyType) -> Result<Self, AppError> {
        Self::with_timeout(url, default_type, DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(url: &str, default_type: ProxyType, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            default_type,
            timeout_secs: timeout.as_secs(),
        })
    }

    async fn download(&self) -> Result<String, AppError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| transport_error(&e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                self.url
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))
    }
}

#[async_trait]
impl ProxySource for RemoteProxySource {
    fn name(&self) -> String {
        format!("remote:{}", self.url)
    }

    async fn fetch(&self) -> Result<Vec<Proxy>, AppError> {
        let text = self.download().await.map_err(|e| AppError::ProxySourceError {
            source_name: self.name(),
            message: e.to_string(),
        })?;
        let (proxies, invalid) = parse_proxy_list(&text, self.default_type);
        if invalid > 0 {
            tracing::warn!(source = %self.name(), invalid, "Skipped invalid proxy lines");
        }
        Ok(proxies)
    }
}
