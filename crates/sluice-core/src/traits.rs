use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{BotOutcome, Hit};
use crate::proxy::Proxy;

/// Performs one check for one record.
///
/// Implementations should observe `cancel` promptly; the job still waits
/// for the returned future to finish before it reports completion. An
/// `Err` is treated as an unexpected failure of this record only.
pub trait Bot: Send + Sync + 'static {
    fn check(
        &self,
        data: &str,
        proxy: Option<&Proxy>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<BotOutcome, AppError>> + Send;

    /// Whether the bot wants proxies when the job's proxy mode is `Default`.
    fn needs_proxies(&self) -> bool {
        false
    }
}

/// Produces a list of proxies, e.g. from a file, a remote URL or a named group.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> String;

    async fn fetch(&self) -> Result<Vec<Proxy>, AppError>;
}

/// Persists hits. Failures are logged by the job and never abort the run.
#[async_trait]
pub trait HitSink: Send + Sync {
    fn name(&self) -> String;

    async fn store(&self, hit: &Hit) -> Result<(), AppError>;
}

/// A named, in-memory group of proxies.
#[derive(Debug, Clone)]
pub struct GroupProxySource {
    name: String,
    proxies: Vec<Proxy>,
}

impl GroupProxySource {
    pub fn new(name: impl Into<String>, proxies: Vec<Proxy>) -> Self {
        Self {
            name: name.into(),
            proxies,
        }
    }
}

#[async_trait]
impl ProxySource for GroupProxySource {
    fn name(&self) -> String {
        format!("group:{}", self.name)
    }

    async fn fetch(&self) -> Result<Vec<Proxy>, AppError> {
        Ok(self.proxies.clone())
    }
}

/// A hit sink that only logs, for dry runs.
#[derive(Debug, Clone, Default)]
pub struct LogHitSink;

#[async_trait]
impl HitSink for LogHitSink {
    fn name(&self) -> String {
        "log".to_string()
    }

    async fn store(&self, hit: &Hit) -> Result<(), AppError> {
        tracing::info!(kind = %hit.kind, data = %hit.capture_line(), "Hit");
        Ok(())
    }
}
