use serde::Serialize;

use crate::models::{BotStatus, HitKind};

/// How a bot status is treated by the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Terminal and worth storing.
    Hit(HitKind),
    /// Terminal, nothing to store.
    Fail,
    /// Check the record again.
    Retry,
}

/// Terminal bucket a record ended up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Success,
    Custom,
    Fail,
    /// Needs manual check.
    ToCheck,
    /// Dropped by an abort without being marked for manual check.
    Abandoned,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Success => "success",
            Resolution::Custom => "custom",
            Resolution::Fail => "fail",
            Resolution::ToCheck => "to_check",
            Resolution::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Retry and give-up rules for one job.
#[derive(Debug, Clone)]
pub struct OutcomePolicy {
    retry_statuses: Vec<BotStatus>,
    ban_loop_evasion: u32,
}

impl OutcomePolicy {
    pub fn new(retry_statuses: Vec<BotStatus>, ban_loop_evasion: u32) -> Self {
        Self {
            retry_statuses,
            ban_loop_evasion,
        }
    }

    /// Statuses in the retry set take precedence; a built-in retryable
    /// status that was left out of the set is not confidently classified.
    pub fn classify(&self, status: &BotStatus) -> Verdict {
        if self.retry_statuses.contains(status) {
            return Verdict::Retry;
        }
        match status {
            BotStatus::Success => Verdict::Hit(HitKind::Success),
            BotStatus::Custom(name) => Verdict::Hit(HitKind::Custom(name.clone())),
            BotStatus::Fail => Verdict::Fail,
            BotStatus::None | BotStatus::Retry | BotStatus::Ban | BotStatus::Error => {
                Verdict::Hit(HitKind::ToCheck)
            }
        }
    }

    /// Whether a record that has already been retried `retries` times may
    /// be checked again. A cap of zero never retries.
    pub fn allows_retry(&self, retries: u32) -> bool {
        self.ban_loop_evasion > 0 && retries < self.ban_loop_evasion
    }
}

impl From<&HitKind> for Resolution {
    fn from(kind: &HitKind) -> Self {
        match kind {
            HitKind::Success => Resolution::Success,
            HitKind::Custom(_) => Resolution::Custom,
            HitKind::ToCheck => Resolution::ToCheck,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_policy() -> OutcomePolicy {
        OutcomePolicy::new(vec![BotStatus::Retry, BotStatus::Ban, BotStatus::Error], 3)
    }

    #[test]
    fn test_classifies_builtin_statuses() {
        let policy = default_policy();
        assert_eq!(
            policy.classify(&BotStatus::Success),
            Verdict::Hit(HitKind::Success)
        );
        assert_eq!(policy.classify(&BotStatus::Fail), Verdict::Fail);
        assert_eq!(
            policy.classify(&BotStatus::None),
            Verdict::Hit(HitKind::ToCheck)
        );
        assert_eq!(policy.classify(&BotStatus::Ban), Verdict::Retry);
        assert_eq!(
            policy.classify(&BotStatus::Custom("2FA".into())),
            Verdict::Hit(HitKind::Custom("2FA".into()))
        );
    }

    #[test]
    fn test_retry_set_overrides_builtin_meaning() {
        let policy = OutcomePolicy::new(vec![BotStatus::Custom("LOCKED".into())], 3);
        assert_eq!(
            policy.classify(&BotStatus::Custom("LOCKED".into())),
            Verdict::Retry
        );
        assert_eq!(
            policy.classify(&BotStatus::Ban),
            Verdict::Hit(HitKind::ToCheck)
        );
    }

    #[test]
    fn test_retry_cap() {
        let policy = default_policy();
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));

        let never = OutcomePolicy::new(vec![BotStatus::Retry], 0);
        assert!(!never.allows_retry(0));
    }
}
