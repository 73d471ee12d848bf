//! Revision checkpoint of a namespace root.
//!
//! The checkpoint key holds the *next* revision a dispatcher should watch
//! from, decimal encoded. Persisting `mod_revision + 1` after each handled
//! event means a restarted dispatcher neither replays a handled event nor
//! skips an unhandled one.
//!
//! A missing checkpoint resolves to `current revision + 1`, so a first run
//! only observes writes made after it started.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::CheckpointConfig;
use crate::Error;
use crate::KvStore;
use crate::MalformedCheckpointPolicy;
use crate::Result;

/// Conflicting writers are re-read and retried at most this many times
const MAX_CAS_ATTEMPTS: usize = 5;

pub struct RevisionCheckpoint<S: KvStore + ?Sized> {
    store: Arc<S>,
    key: String,
    config: CheckpointConfig,
    /// `mod_revision` of the checkpoint key as last seen by this instance (0: absent)
    observed_mod_revision: AtomicI64,
}

impl<S: KvStore + ?Sized> std::fmt::Debug for RevisionCheckpoint<S> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RevisionCheckpoint")
            .field("key", &self.key)
            .field("observed_mod_revision", &self.observed_mod_revision)
            .finish()
    }
}

fn parse_revision(raw: &str) -> std::result::Result<i64, std::num::ParseIntError> {
    raw.trim().parse::<i64>()
}

impl<S: KvStore + ?Sized> RevisionCheckpoint<S> {
    pub fn new(
        store: Arc<S>,
        key: String,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            store,
            key,
            config,
            observed_mod_revision: AtomicI64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Revision a watch should start from.
    ///
    /// # Errors
    /// - store errors from the read
    /// - [`Error::Checkpoint`] for a malformed value under
    ///   [`MalformedCheckpointPolicy::FailFast`]
    pub async fn get_revision(&self) -> Result<i64> {
        let resp = self.store.get(&self.key).await?;
        let Some(kv) = resp.kvs.into_iter().next() else {
            self.observed_mod_revision.store(0, Ordering::SeqCst);
            debug!(key = %self.key, "no checkpoint, resuming from {}", resp.revision + 1);
            return Ok(resp.revision + 1);
        };
        self.observed_mod_revision.store(kv.mod_revision, Ordering::SeqCst);

        match parse_revision(&kv.value) {
            Ok(next) => Ok(next),
            Err(e) => match self.config.malformed {
                MalformedCheckpointPolicy::ResumeFromNow => {
                    warn!(
                        key = %self.key,
                        "malformed checkpoint {:?} ({}), resuming from {}",
                        kv.value,
                        e,
                        resp.revision + 1
                    );
                    Ok(resp.revision + 1)
                }
                MalformedCheckpointPolicy::ReplayFromOrigin => {
                    warn!(key = %self.key, "malformed checkpoint {:?} ({}), replaying from 0", kv.value, e);
                    Ok(0)
                }
                MalformedCheckpointPolicy::FailFast => Err(Error::Checkpoint(format!(
                    "{} holds {:?}: {}",
                    self.key, kv.value, e
                ))),
            },
        }
    }

    /// Persists `next` as the revision to resume from.
    ///
    /// With compare-and-swap enabled a concurrent writer that already stored
    /// a revision `>= next` wins and this call returns `Ok` without writing.
    pub async fn set_revision(
        &self,
        next: i64,
    ) -> Result<()> {
        let value = next.to_string();
        if !self.config.compare_and_swap {
            let revision = self.store.put(&self.key, &value, None).await?;
            self.observed_mod_revision.store(revision, Ordering::SeqCst);
            return Ok(());
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let expected = self.observed_mod_revision.load(Ordering::SeqCst);
            if let Some(revision) = self.store.put_if_mod_revision(&self.key, &value, expected).await? {
                self.observed_mod_revision.store(revision, Ordering::SeqCst);
                return Ok(());
            }

            // Someone else wrote the checkpoint since we last looked
            let resp = self.store.get(&self.key).await?;
            match resp.kvs.into_iter().next() {
                Some(kv) => {
                    self.observed_mod_revision.store(kv.mod_revision, Ordering::SeqCst);
                    if let Ok(stored) = parse_revision(&kv.value) {
                        if stored >= next {
                            debug!(key = %self.key, stored, next, "checkpoint already ahead, skipping write");
                            return Ok(());
                        }
                    }
                }
                None => self.observed_mod_revision.store(0, Ordering::SeqCst),
            }
        }

        Err(Error::Write(format!(
            "checkpoint {} still contended after {} attempts",
            self.key, MAX_CAS_ATTEMPTS
        )))
    }
}
