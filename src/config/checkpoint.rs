use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Result;

/// What to do when the stored checkpoint is not a decimal revision
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MalformedCheckpointPolicy {
    /// Resume from `current revision + 1`, skipping history
    #[default]
    ResumeFromNow,
    /// Return [`crate::Error::Checkpoint`] and do not start watching
    FailFast,
    /// Watch from revision 0, replaying whatever history the store retains
    ReplayFromOrigin,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub malformed: MalformedCheckpointPolicy,

    /// Persist the checkpoint with a compare-and-swap on the checkpoint key's
    /// own `mod_revision`, so a stale dispatcher never moves the cursor back.
    /// `false` falls back to an unconditional overwrite.
    #[serde(default = "default_compare_and_swap")]
    pub compare_and_swap: bool,

    /// Retry policy for persisting the checkpoint inside a watch loop
    #[serde(default = "default_persist_retry")]
    pub persist_retry: BackoffPolicy,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            malformed: MalformedCheckpointPolicy::default(),
            compare_and_swap: default_compare_and_swap(),
            persist_retry: default_persist_retry(),
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        self.persist_retry.validate("checkpoint.persist_retry")
    }
}

fn default_compare_and_swap() -> bool {
    true
}

fn default_persist_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        timeout_ms: 1000,
        base_delay_ms: 50,
        max_delay_ms: 500,
    }
}
