use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_VERSION: &str = "v1";
const DEFAULT_SUCCEEDED_EXPIRES_AFTER_SECS: u64 = 3600;
const DEFAULT_FAILED_EXPIRES_AFTER_SECS: u64 = 86400;

/// Protocol version and retention settings shared by storage and broker.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutboxOptions {
    pub version: String,
    /// Seconds a `Succeeded` row is kept before it becomes eligible for cleanup.
    pub succeeded_expires_after: u64,
    /// Seconds a `Failed` row is kept before it becomes eligible for cleanup.
    pub failed_expires_after: u64,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            succeeded_expires_after: DEFAULT_SUCCEEDED_EXPIRES_AFTER_SECS,
            failed_expires_after: DEFAULT_FAILED_EXPIRES_AFTER_SECS,
        }
    }
}

impl OutboxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_succeeded_expires_after(mut self, retention: Duration) -> Self {
        self.succeeded_expires_after = retention.as_secs();
        self
    }

    pub fn with_failed_expires_after(mut self, retention: Duration) -> Self {
        self.failed_expires_after = retention.as_secs();
        self
    }

    pub fn is_default_version(&self) -> bool {
        self.version == DEFAULT_VERSION
    }

    /// Retention applied when a row reaches `status`, if any.
    pub fn retention_for(&self, status: super::MessageStatus) -> Option<chrono::Duration> {
        let secs = match status {
            super::MessageStatus::Scheduled => return None,
            super::MessageStatus::Succeeded => self.succeeded_expires_after,
            super::MessageStatus::Failed => self.failed_expires_after,
        };
        i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
    }
}
