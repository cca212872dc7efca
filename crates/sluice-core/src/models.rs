use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Status tag returned by a bot for one check.
///
/// The built-in tags mirror the classic checker vocabulary; any other
/// string is a user-defined custom status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BotStatus {
    Success,
    Fail,
    Retry,
    Ban,
    Error,
    None,
    Custom(String),
}

impl BotStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BotStatus::Success => "SUCCESS",
            BotStatus::Fail => "FAIL",
            BotStatus::Retry => "RETRY",
            BotStatus::Ban => "BAN",
            BotStatus::Error => "ERROR",
            BotStatus::None => "NONE",
            BotStatus::Custom(name) => name,
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("Bot status cannot be empty".to_string());
        }
        Ok(match trimmed.to_uppercase().as_str() {
            "SUCCESS" => BotStatus::Success,
            "FAIL" => BotStatus::Fail,
            "RETRY" => BotStatus::Retry,
            "BAN" => BotStatus::Ban,
            "ERROR" => BotStatus::Error,
            "NONE" => BotStatus::None,
            _ => BotStatus::Custom(trimmed.to_string()),
        })
    }
}

impl TryFrom<String> for BotStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

impl From<BotStatus> for String {
    fn from(status: BotStatus) -> Self {
        status.as_str().to_string()
    }
}

/// What a bot produced for one record: a status plus captured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotOutcome {
    pub status: BotStatus,
    #[serde(default)]
    pub captured: serde_json::Map<String, serde_json::Value>,
}

impl BotOutcome {
    pub fn new(status: BotStatus) -> Self {
        Self {
            status,
            captured: serde_json::Map::new(),
        }
    }

    pub fn with_capture(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.captured.insert(key.into(), value.into());
        self
    }
}

/// Category of a stored hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitKind {
    Success,
    Custom(String),
    /// Records that could not be classified with confidence.
    ToCheck,
}

impl fmt::Display for HitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HitKind::Success => write!(f, "SUCCESS"),
            HitKind::Custom(name) => write!(f, "{name}"),
            HitKind::ToCheck => write!(f, "TOCHECK"),
        }
    }
}

/// An outcome worth persisting, handed to every configured hit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub id: Uuid,
    pub job_id: Uuid,
    pub data: String,
    pub kind: HitKind,
    pub captured: serde_json::Map<String, serde_json::Value>,
    /// Proxy the record was checked through, rendered as a URL.
    pub proxy: Option<String>,
    pub date: DateTime<Utc>,
}

impl Hit {
    /// SHA-256 of the data line and hit kind, used to drop duplicate hits.
    pub fn fingerprint(&self) -> String {
        compute_hash(&format!("{}\u{1f}{}", self.kind, self.data))
    }

    /// Single-line `data | key = value | ...` rendering used by text sinks.
    pub fn capture_line(&self) -> String {
        let mut line = self.data.clone();
        for (key, value) in &self.captured {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            line.push_str(&format!(" | {key} = {value}"));
        }
        line
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_status_parse_builtin_and_custom() {
        assert_eq!("success".parse::<BotStatus>().unwrap(), BotStatus::Success);
        assert_eq!("BAN".parse::<BotStatus>().unwrap(), BotStatus::Ban);
        assert_eq!(
            "2FA".parse::<BotStatus>().unwrap(),
            BotStatus::Custom("2FA".to_string())
        );
        assert!("  ".parse::<BotStatus>().is_err());
    }

    #[test]
    fn test_bot_status_serde_as_string() {
        let json = serde_json::to_string(&vec![BotStatus::Retry, BotStatus::Custom("FREE".into())])
            .unwrap();
        assert_eq!(json, r#"["RETRY","FREE"]"#);

        let parsed: Vec<BotStatus> = serde_json::from_str(r#"["ban","error"]"#).unwrap();
        assert_eq!(parsed, vec![BotStatus::Ban, BotStatus::Error]);
    }

    #[test]
    fn test_capture_line() {
        let hit = Hit {
            id: Uuid::nil(),
            job_id: Uuid::nil(),
            data: "user:pass".to_string(),
            kind: HitKind::Success,
            captured: BotOutcome::new(BotStatus::Success)
                .with_capture("plan", "pro")
                .with_capture("credits", 12)
                .captured,
            proxy: None,
            date: Utc::now(),
        };
        assert_eq!(hit.capture_line(), "user:pass | credits = 12 | plan = pro");
    }

    #[test]
    fn test_fingerprint_depends_on_kind() {
        let mut hit = Hit {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            data: "line".to_string(),
            kind: HitKind::Success,
            captured: serde_json::Map::new(),
            proxy: None,
            date: Utc::now(),
        };
        let success = hit.fingerprint();
        hit.kind = HitKind::ToCheck;
        assert_ne!(success, hit.fingerprint());
        assert_eq!(success.len(), 64);
    }

    #[test]
    fn test_compute_hash_consistency() {
        assert_eq!(compute_hash("hello world"), compute_hash("hello world"));
        assert_ne!(compute_hash("hello"), compute_hash("world"));
    }
}
