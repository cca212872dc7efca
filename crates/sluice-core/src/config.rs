//! Job configuration, loaded from JSON and passed explicitly to every
//! constructor.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::models::BotStatus;
use crate::proxy::ProxyType;
use crate::proxy_pool::ProxyPoolOptions;

/// Whether checks go through the proxy pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Follow the bot's preference.
    #[default]
    Default,
    On,
    Off,
}

/// Where input records come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataPoolDescriptor {
    /// One record per non-blank line of a file.
    Wordlist { path: PathBuf },
    /// Records given inline.
    Lines { lines: Vec<String> },
    /// `amount` numbers starting at `start`, zero-padded to `pad` digits.
    Range {
        start: i64,
        amount: u64,
        #[serde(default = "default_step")]
        step: i64,
        #[serde(default)]
        pad: usize,
    },
    /// Every string of `length` characters drawn from `charset`.
    Combinations { charset: String, length: u32 },
    /// 0, 1, 2, ... without end.
    Infinite,
}

fn default_step() -> i64 {
    1
}

impl Default for DataPoolDescriptor {
    fn default() -> Self {
        DataPoolDescriptor::Lines { lines: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxySourceDescriptor {
    File {
        path: PathBuf,
        #[serde(default)]
        default_type: ProxyType,
    },
    Remote {
        url: String,
        #[serde(default)]
        default_type: ProxyType,
    },
    Group {
        name: String,
        proxies: Vec<String>,
        #[serde(default)]
        default_type: ProxyType,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HitSinkDescriptor {
    /// Append hits as JSON lines.
    File {
        path: PathBuf,
        #[serde(default = "default_true")]
        dedupe: bool,
    },
    /// POST each hit as JSON.
    Webhook {
        url: String,
        #[serde(default = "default_webhook_timeout")]
        timeout_secs: u64,
    },
    Log,
}

fn default_true() -> bool {
    true
}

fn default_webhook_timeout() -> u64 {
    10
}

/// Immutable configuration snapshot for one run. Only the bot count may
/// change while the job is running, through `Job::change_bots`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub name: String,
    /// Degree of parallelism.
    pub bots: usize,
    /// Leading records to skip, e.g. when resuming a previous run.
    pub skip: u64,
    pub proxy_mode: ProxyMode,
    pub proxy_pool: ProxyPoolOptions,
    /// Per-record retry cap.
    pub ban_loop_evasion: u32,
    pub retry_statuses: Vec<BotStatus>,
    pub mark_as_to_check_on_abort: bool,
    pub data_pool: DataPoolDescriptor,
    pub proxy_sources: Vec<ProxySourceDescriptor>,
    pub hit_sinks: Vec<HitSinkDescriptor>,
    /// Settings for the bot, opaque to the engine.
    pub bot: serde_json::Value,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            name: "job".to_string(),
            bots: 1,
            skip: 0,
            proxy_mode: ProxyMode::Default,
            proxy_pool: ProxyPoolOptions::default(),
            ban_loop_evasion: 100,
            retry_statuses: vec![BotStatus::Retry, BotStatus::Ban, BotStatus::Error],
            mark_as_to_check_on_abort: false,
            data_pool: DataPoolDescriptor::default(),
            proxy_sources: Vec::new(),
            hit_sinks: Vec::new(),
            bot: serde_json::Value::Null,
        }
    }
}

impl JobOptions {
    pub fn from_json_str(json: &str) -> Result<Self, AppError> {
        let options: JobOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, AppError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |msg: String| Err(AppError::ConfigError(msg));

        if self.bots == 0 {
            return invalid("bots must be at least 1".into());
        }
        if self.retry_statuses.contains(&BotStatus::Success) {
            return invalid("SUCCESS cannot be a retry status".into());
        }

        match &self.data_pool {
            DataPoolDescriptor::Range { step: 0, .. } => {
                return invalid("range step cannot be 0".into());
            }
            DataPoolDescriptor::Combinations { charset, length } => {
                if charset.is_empty() {
                    return invalid("combinations charset cannot be empty".into());
                }
                if *length == 0 {
                    return invalid("combinations length must be at least 1".into());
                }
            }
            _ => {}
        }

        for source in &self.proxy_sources {
            if let ProxySourceDescriptor::Remote { url, .. } = source {
                Url::parse(url)
                    .map_err(|e| AppError::ConfigError(format!("invalid proxy source URL '{url}': {e}")))?;
            }
        }
        for sink in &self.hit_sinks {
            if let HitSinkDescriptor::Webhook { url, .. } = sink {
                Url::parse(url)
                    .map_err(|e| AppError::ConfigError(format!("invalid webhook URL '{url}': {e}")))?;
            }
        }

        Ok(())
    }
}
