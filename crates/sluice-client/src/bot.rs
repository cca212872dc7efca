//! A configurable HTTP keycheck bot.
//!
//! For each record the bot requests `url` with every `<DATA>` placeholder
//! replaced by the percent-encoded record, through the lent proxy if any, and
//! derives a [`BotStatus`] from the response status code and body keywords.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::{Client, Method, Response};
use serde::{Deserialize, Serialize};
use sluice_core::error::AppError;
use sluice_core::models::{BotOutcome, BotStatus};
use sluice_core::proxy::Proxy;
use sluice_core::traits::Bot;
use tokio_util::sync::CancellationToken;

use crate::transport_error;

/// Placeholder replaced by the record in the URL and body templates.
pub const DATA_PLACEHOLDER: &str = "<DATA>";

/// Keywords that turn a response into a custom status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomKeycheck {
    pub name: String,
    pub keys: Vec<String>,
}

/// Bot settings, read from the `bot` section of the job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeycheckSettings {
    pub url: String,
    /// `GET` or `POST`.
    pub method: String,
    /// Request body template for `POST`.
    pub body: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout_secs: u64,
    pub use_proxies: bool,
    pub success_keys: Vec<String>,
    pub fail_keys: Vec<String>,
    pub ban_keys: Vec<String>,
    pub retry_keys: Vec<String>,
    pub custom: Vec<CustomKeycheck>,
    /// Status codes that mean the proxy was blocked.
    pub ban_status_codes: Vec<u16>,
}

impl Default for KeycheckSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            body: None,
            headers: HashMap::new(),
            timeout_secs: 10,
            use_proxies: true,
            success_keys: Vec::new(),
            fail_keys: Vec::new(),
            ban_keys: Vec::new(),
            retry_keys: Vec::new(),
            custom: Vec::new(),
            ban_status_codes: vec![403, 429],
        }
    }
}

impl KeycheckSettings {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, AppError> {
        let settings: KeycheckSettings = serde_json::from_value(value.clone())?;
        if settings.url.is_empty() {
            return Err(AppError::ConfigError("bot.url is required".into()));
        }
        parse_method(&settings.method)?;
        Ok(settings)
    }

    /// Classify a response.
    ///
    /// Ban status codes win, then 5xx means retry. Body keywords are checked
    /// in the order fail, ban, retry, success, custom. With no match the
    /// record needs a manual check.
    pub fn classify(&self, status_code: u16, body: &str) -> BotStatus {
        if self.ban_status_codes.contains(&status_code) {
            return BotStatus::Ban;
        }
        if status_code >= 500 {
            return BotStatus::Retry;
        }

        let any = |keys: &[String]| keys.iter().any(|k| body.contains(k.as_str()));
        if any(&self.fail_keys) {
            BotStatus::Fail
        } else if any(&self.ban_keys) {
            BotStatus::Ban
        } else if any(&self.retry_keys) {
            BotStatus::Retry
        } else if any(&self.success_keys) {
            BotStatus::Success
        } else if let Some(custom) = self.custom.iter().find(|c| any(&c.keys)) {
            BotStatus::Custom(custom.name.clone())
        } else {
            BotStatus::None
        }
    }
}

fn parse_method(method: &str) -> Result<Method, AppError> {
    method
        .to_ascii_uppercase()
        .parse::<Method>()
        .map_err(|_| AppError::ConfigError(format!("invalid bot.method '{method}'")))
}

fn substitute(template: &str, data: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(data.as_bytes()).collect();
    template.replace(DATA_PLACEHOLDER, &encoded)
}

/// HTTP keycheck bot with one reqwest client per proxy.
pub struct HttpKeycheckBot {
    settings: KeycheckSettings,
    method: Method,
    direct: Client,
    proxied: Mutex<HashMap<Proxy, Client>>,
}

impl HttpKeycheckBot {
    pub fn new(settings: KeycheckSettings) -> Result<Self, AppError> {
        let method = parse_method(&settings.method)?;
        let direct = build_client(&settings, None)?;
        Ok(Self {
            settings,
            method,
            direct,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, AppError> {
        Self::new(KeycheckSettings::from_value(value)?)
    }

    pub fn settings(&self) -> &KeycheckSettings {
        &self.settings
    }

    fn client_for(&self, proxy: Option<&Proxy>) -> Result<Client, AppError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };

        let mut clients = self.proxied.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Bot client cache mutex was poisoned, recovering");
            PoisonError::into_inner(poisoned)
        });
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.settings, Some(proxy))?;
        clients.insert(proxy.clone(), client.clone());
        Ok(client)
    }

    async fn request(&self, client: Client, data: &str) -> Result<Response, reqwest::Error> {
        let mut request = client.request(self.method.clone(), substitute(&self.settings.url, data));
        for (name, value) in &self.settings.headers {
            request = request.header(name, value.replace(DATA_PLACEHOLDER, data));
        }
        if let Some(body) = &self.settings.body {
            request = request.body(body.replace(DATA_PLACEHOLDER, data));
        }
        request.send().await
    }

    async fn run(&self, data: &str, proxy: Option<&Proxy>) -> Result<BotOutcome, AppError> {
        let client = self.client_for(proxy)?;
        let timeout_secs = self.settings.timeout_secs;

        let response = match self.request(client, data).await {
            Ok(response) => response,
            Err(e) => return transport_outcome(transport_error(&e, timeout_secs)),
        };

        let status_code = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return transport_outcome(transport_error(&e, timeout_secs)),
        };

        Ok(BotOutcome::new(self.settings.classify(status_code, &body))
            .with_capture("status_code", status_code))
    }
}

/// Transient transport failures become an `ERROR` outcome so the job can
/// retry the record; anything else fails the record.
fn transport_outcome(error: AppError) -> Result<BotOutcome, AppError> {
    if error.is_retryable() {
        tracing::debug!(error = %error, "Transport error");
        Ok(BotOutcome::new(BotStatus::Error).with_capture("error", error.to_string()))
    } else {
        Err(error)
    }
}

fn build_client(settings: &KeycheckSettings, proxy: Option<&Proxy>) -> Result<Client, AppError> {
    let mut builder = Client::builder()
        .user_agent(crate::USER_AGENT)
        .timeout(Duration::from_secs(settings.timeout_secs));
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy.to_url())
            .map_err(|e| AppError::ProxyParseError {
                input: proxy.to_string(),
                reason: e.to_string(),
            })?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|e| AppError::HttpError(e.to_string()))
}

impl Bot for HttpKeycheckBot {
    async fn check(
        &self,
        data: &str,
        proxy: Option<&Proxy>,
        cancel: CancellationToken,
    ) -> Result<BotOutcome, AppError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AppError::Cancelled),
            outcome = self.run(data, proxy) => outcome,
        }
    }

    fn needs_proxies(&self) -> bool {
        self.settings.use_proxies
    }
}
