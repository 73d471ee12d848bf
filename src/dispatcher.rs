//! Long-lived watch loop shared by unicast and broadcast receivers
//!
//! ```text
//! Idle --(checkpoint read, watch opened)--> Watching
//!
//! Watching, per event:
//!   next = max(next, mod_revision + 1) -> persist checkpoint (retried)
//!   unicast Put   -> cleanup delete -> handler(value)
//!   unicast Delete-> (cursor only)
//!   broadcast *   -> handler(event)
//!
//! Watching ends on: token cancelled | stream closed by store | fatal error
//! Transient stream errors reopen the watch from the in-memory cursor.
//! ```

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::metrics::CHECKPOINT_PERSIST_FAILURES;
use crate::metrics::CLEANUP_FAILURES;
use crate::metrics::COMMANDS_DELIVERED;
use crate::metrics::KIND_BROADCAST;
use crate::metrics::KIND_UNICAST;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::ConsumeMode;
use crate::Error;
use crate::KvStore;
use crate::Result;
use crate::RevisionCheckpoint;
use crate::WatchEvent;
use crate::WatchEventType;
use crate::WatchScope;

/// Receives errors a dispatcher survived: failed checkpoint writes,
/// failed cleanup deletes and watch reconnects.
pub type ErrorSink = tokio::sync::mpsc::UnboundedSender<Error>;

/// Why a dispatcher returned normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    /// The caller's token was cancelled
    Cancelled,
    /// The store ended the watch stream
    StreamClosed,
}

/// Outcome of a finished dispatcher run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub exit: DispatchExit,
    /// Events observed, including deletes
    pub events: u64,
    /// Handler invocations
    pub delivered: u64,
    /// Revision a later run resumes from
    pub next_revision: i64,
    /// Watch streams reopened after transient failures
    pub reconnects: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchMode {
    /// Consume-once: delete the record, then hand it out. Delete events
    /// only move the cursor.
    Unicast(ConsumeMode),
    /// Fan-out: every event is handed out, nothing is deleted
    Broadcast,
}

impl DispatchMode {
    fn kind(self) -> &'static str {
        match self {
            DispatchMode::Unicast(_) => KIND_UNICAST,
            DispatchMode::Broadcast => KIND_BROADCAST,
        }
    }
}

pub(crate) struct Dispatcher<'a, S: KvStore + ?Sized> {
    pub(crate) store: &'a Arc<S>,
    pub(crate) checkpoint: &'a RevisionCheckpoint<S>,
    pub(crate) root: &'a str,
    pub(crate) key: String,
    pub(crate) scope: WatchScope,
    pub(crate) mode: DispatchMode,
    pub(crate) reconnect: BackoffPolicy,
    pub(crate) persist_retry: BackoffPolicy,
    pub(crate) errors: Option<&'a ErrorSink>,
}

impl<S: KvStore + ?Sized> Dispatcher<'_, S> {
    pub(crate) async fn run<F>(
        &self,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<DispatchSummary>
    where
        F: FnMut(WatchEvent),
    {
        let mut summary = DispatchSummary {
            exit: DispatchExit::Cancelled,
            events: 0,
            delivered: 0,
            next_revision: 0,
            reconnects: 0,
        };

        summary.next_revision = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(summary),
            next = self.checkpoint.get_revision() => next?,
        };
        info!(key = %self.key, from = summary.next_revision, mode = ?self.mode, "watching");

        let mut attempt = 0usize;
        loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(summary),
                opened = tokio::time::timeout(
                    self.reconnect.timeout(),
                    self.store.watch(&self.key, self.scope, summary.next_revision),
                ) => opened.unwrap_or_else(|_| Err(Error::RetryTimeout(self.reconnect.timeout()))),
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) if e.is_retryable() => {
                    if self.backoff(&mut attempt, e, cancel).await? {
                        return Ok(summary);
                    }
                    summary.reconnects += 1;
                    continue;
                }
                Err(e) => {
                    error!(key = %self.key, "watch failed: {:?}", e);
                    return Err(e);
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(key = %self.key, next = summary.next_revision, "dispatcher cancelled");
                        summary.exit = DispatchExit::Cancelled;
                        return Ok(summary);
                    }
                    batch = stream.next() => match batch {
                        Some(Ok(events)) => {
                            attempt = 0;
                            for event in events {
                                self.handle(event, &mut summary, &mut on_event).await;
                            }
                        }
                        Some(Err(e)) if e.is_retryable() => {
                            if self.backoff(&mut attempt, e, cancel).await? {
                                return Ok(summary);
                            }
                            summary.reconnects += 1;
                            break;
                        }
                        Some(Err(e)) => {
                            error!(key = %self.key, "watch stream failed: {:?}", e);
                            self.report(e.clone());
                            return Err(e);
                        }
                        None => {
                            info!(key = %self.key, next = summary.next_revision, "watch stream closed by store");
                            summary.exit = DispatchExit::StreamClosed;
                            return Ok(summary);
                        }
                    }
                }
            }
        }
    }

    async fn handle<F>(
        &self,
        event: WatchEvent,
        summary: &mut DispatchSummary,
        on_event: &mut F,
    ) where
        F: FnMut(WatchEvent),
    {
        // Already handled before a reconnect
        if event.mod_revision < summary.next_revision {
            debug!(key = %event.key, revision = event.mod_revision, "skipping replayed event");
            return;
        }
        summary.events += 1;
        summary.next_revision = event.mod_revision + 1;

        let next = summary.next_revision;
        if let Err(e) =
            task_with_timeout_and_exponential_backoff(|| self.checkpoint.set_revision(next), self.persist_retry)
                .await
        {
            error!(key = %self.checkpoint.key(), next, "persist checkpoint failed: {:?}", e);
            CHECKPOINT_PERSIST_FAILURES.with_label_values(&[self.root]).inc();
            self.report(e);
        }

        match self.mode {
            DispatchMode::Unicast(consume) => {
                if event.event_type != WatchEventType::Put {
                    return;
                }
                self.cleanup(&event, consume).await;
            }
            DispatchMode::Broadcast => {}
        }

        debug!(key = %event.key, revision = event.mod_revision, "dispatching {:?}", event.event_type);
        COMMANDS_DELIVERED.with_label_values(&[self.mode.kind()]).inc();
        summary.delivered += 1;
        on_event(event);
    }

    async fn cleanup(
        &self,
        event: &WatchEvent,
        consume: ConsumeMode,
    ) {
        let result = match consume {
            ConsumeMode::Conditional => self
                .store
                .delete_if_mod_revision(&event.key, event.mod_revision)
                .await
                .map(|deleted| {
                    if !deleted {
                        debug!(key = %event.key, revision = event.mod_revision, "record already consumed or replaced");
                    }
                }),
            ConsumeMode::Prefix => self.store.delete_prefix(&self.key).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!(key = %event.key, "cleanup delete failed: {:?}", e);
            CLEANUP_FAILURES.with_label_values(&[KIND_UNICAST]).inc();
            self.report(e);
        }
    }

    /// Waits before reopening a failed watch.
    /// Returns `Ok(true)` if the token was cancelled while waiting.
    async fn backoff(
        &self,
        attempt: &mut usize,
        cause: Error,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        *attempt += 1;
        if self.reconnect.max_retries != 0 && *attempt > self.reconnect.max_retries {
            error!(key = %self.key, "giving up after {} reconnect attempts: {:?}", attempt, cause);
            return Err(Error::RetryTaskFailed(format!(
                "watch {} failed after {} reconnect attempts: {}",
                self.key, attempt, cause
            )));
        }

        let delay = self.reconnect.delay_for(*attempt - 1);
        warn!(key = %self.key, "watch interrupted ({:?}), reconnecting in {:?}", cause, delay);
        self.report(cause);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(true),
            _ = tokio::time::sleep(delay) => Ok(false),
        }
    }

    fn report(
        &self,
        e: Error,
    ) {
        if let Some(sink) = self.errors {
            // A dropped receiver only means nobody is listening
            let _ = sink.send(e);
        }
    }
}
