use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Result;

/// How unicast records are removed once read
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeMode {
    /// Delete each record only if it still has the revision that was read.
    /// A record is handed out by at most one reader and a newer write is
    /// never removed unread.
    #[default]
    Conditional,
    /// One prefix delete after reading. A record written between the read
    /// and the delete is lost.
    Prefix,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default)]
    pub consume: ConsumeMode,

    /// Reconnect policy when a watch stream fails. Each reconnect resumes
    /// from the in-memory cursor. `max_retries = 0` retries forever.
    /// `timeout_ms` bounds each attempt to open the watch; an open that
    /// takes longer counts as a failed attempt.
    #[serde(default = "default_reconnect")]
    pub reconnect: BackoffPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            consume: ConsumeMode::default(),
            reconnect: default_reconnect(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        self.reconnect.validate("watch.reconnect")
    }
}

fn default_reconnect() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 10,
        timeout_ms: 5000,
        base_delay_ms: 200,
        max_delay_ms: 10_000,
    }
}
