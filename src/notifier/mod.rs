//! Command notification over a revisioned key-value store
//!
//! [`Notifier`] is the entry point for both sides of the protocol:
//! - writers: [`send_to`](Notifier::send_to),
//!   [`send_to_with_ttl`](Notifier::send_to_with_ttl),
//!   [`send_broadcast`](Notifier::send_broadcast)
//! - one-shot reader: [`recv_from`](Notifier::recv_from)
//! - long-lived dispatchers: [`recv_from_loop`](Notifier::recv_from_loop),
//!   [`recv_broadcast`](Notifier::recv_broadcast)
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//!
//! use etcd_notify::MemoryStore;
//! use etcd_notify::Notifier;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let notifier = Notifier::new("hids", Arc::new(MemoryStore::new()));
//!
//!     notifier.send_to("agent-1", "upgrade", "v2").await.unwrap();
//!     let pending = notifier.recv_from("agent-1", "upgrade").await.unwrap();
//!     assert_eq!(pending, vec!["v2".to_string()]);
//!
//!     let cancel = CancellationToken::new();
//!     let summary = notifier
//!         .recv_from_loop("agent-1", "upgrade", &cancel, |data| println!("got {data}"))
//!         .await
//!         .unwrap();
//!     println!("stopped at revision {}", summary.next_revision);
//! }
//! ```

mod builder;

pub use builder::*;


use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::dispatcher::DispatchMode;
use crate::dispatcher::Dispatcher;
use crate::metrics::CLEANUP_FAILURES;
use crate::metrics::COMMANDS_DELIVERED;
use crate::metrics::COMMANDS_SENT;
use crate::metrics::KIND_BROADCAST;
use crate::metrics::KIND_UNICAST;
use crate::BackoffPolicy;
use crate::ConsumeMode;
use crate::DispatchSummary;
use crate::ErrorSink;
use crate::KvStore;
use crate::LeaseId;
use crate::LeaseManager;
use crate::NotifyConfig;
use crate::NotifyPaths;
use crate::Result;
use crate::RevisionCheckpoint;
use crate::WatchConfig;
use crate::WatchEvent;
use crate::WatchScope;

/// Whether [`Notifier::send_to_with_ttl`] renews the lease it granted
#[derive(Debug, Clone)]
pub enum KeepAlive {
    /// Return right after the write; the command expires after its TTL
    No,
    /// Renew until the token is cancelled or the store drops the lease.
    /// The call blocks for that long.
    Until(CancellationToken),
}

/// Sends and receives commands under one namespace root
pub struct Notifier<S: KvStore + ?Sized> {
    pub(super) store: Arc<S>,
    pub(super) paths: NotifyPaths,
    pub(super) checkpoint: RevisionCheckpoint<S>,
    pub(super) lease: LeaseManager<S>,
    pub(super) watch: WatchConfig,
    pub(super) persist_retry: BackoffPolicy,
    pub(super) errors: Option<ErrorSink>,
}

impl<S: KvStore + ?Sized> Notifier<S> {
    /// Notifier with default checkpoint and watch settings
    pub fn new(
        root: impl Into<String>,
        store: Arc<S>,
    ) -> Self {
        NotifierBuilder::new(root, store).build()
    }

    pub fn builder(
        root: impl Into<String>,
        store: Arc<S>,
    ) -> NotifierBuilder<S> {
        NotifierBuilder::new(root, store)
    }

    pub fn from_config(
        config: &NotifyConfig,
        store: Arc<S>,
    ) -> Self {
        NotifierBuilder::new(config.root.clone(), store).config(config).build()
    }

    pub fn paths(&self) -> &NotifyPaths {
        &self.paths
    }

    pub fn checkpoint(&self) -> &RevisionCheckpoint<S> {
        &self.checkpoint
    }

    pub fn lease(&self) -> &LeaseManager<S> {
        &self.lease
    }

    /// Writes `data` for `recipient`. The command stays until consumed.
    ///
    /// A later write for the same recipient and command replaces an
    /// unconsumed one.
    pub async fn send_to(
        &self,
        recipient: &str,
        command: &str,
        data: &str,
    ) -> Result<()> {
        let key = self.paths.unicast(command, recipient);
        let revision = self.store.put(&key, data, None).await?;
        debug!(%key, revision, "command sent");
        COMMANDS_SENT.with_label_values(&[KIND_UNICAST]).inc();
        Ok(())
    }

    /// Writes `data` for `recipient` under a fresh lease of `ttl_secs`.
    ///
    /// With [`KeepAlive::Until`] this call only returns once the token is
    /// cancelled or the lease is gone; the command then lives at most one
    /// more TTL.
    ///
    /// # Errors
    /// - [`crate::Error::InvalidArgument`] if `ttl_secs <= 0`
    /// - [`crate::Error::Lease`] / [`crate::Error::StoreUnavailable`] from the grant
    /// - [`crate::Error::Write`] from the put. The granted lease is left to expire.
    pub async fn send_to_with_ttl(
        &self,
        recipient: &str,
        command: &str,
        data: &str,
        ttl_secs: i64,
        keep_alive: KeepAlive,
    ) -> Result<LeaseId> {
        let key = self.paths.unicast(command, recipient);
        let lease = self.put_leased(&key, data, ttl_secs, KIND_UNICAST).await?;

        if let KeepAlive::Until(cancel) = keep_alive {
            let exit = self.lease.keep_alive(lease, &cancel).await?;
            info!(%key, lease_id = %lease, "keep-alive ended: {:?}", exit);
        }
        Ok(lease)
    }

    /// Writes `data` to every watcher of `command`; the entry expires after
    /// `ttl_secs` and is never consumed by readers.
    pub async fn send_broadcast(
        &self,
        command: &str,
        data: &str,
        ttl_secs: i64,
    ) -> Result<LeaseId> {
        let key = self.paths.broadcast(command);
        self.put_leased(&key, data, ttl_secs, KIND_BROADCAST).await
    }

    async fn put_leased(
        &self,
        key: &str,
        data: &str,
        ttl_secs: i64,
        kind: &str,
    ) -> Result<LeaseId> {
        let lease = self.lease.grant(ttl_secs).await?;
        match self.store.put(key, data, Some(lease)).await {
            Ok(revision) => {
                debug!(%key, revision, lease_id = %lease, ttl_secs, "leased command sent");
                COMMANDS_SENT.with_label_values(&[kind]).inc();
                Ok(lease)
            }
            Err(e) => {
                warn!(%key, lease_id = %lease, "write failed, lease left to expire: {:?}", e);
                Err(e)
            }
        }
    }

    /// Reads and consumes every pending command for `recipient`.
    ///
    /// Values come back in key order. Cleanup never fails the call: a
    /// failed delete is logged and the value is still returned.
    /// Under [`ConsumeMode::Conditional`] a record already consumed by a
    /// concurrent reader, or replaced since the scan, is left out.
    ///
    /// Records are found by the prefix `{root}/notify/command/{command}/{recipient}`,
    /// so a recipient id that is a prefix of another one (`agent-1` and
    /// `agent-10`) also consumes the other's commands.
    pub async fn recv_from(
        &self,
        recipient: &str,
        command: &str,
    ) -> Result<Vec<String>> {
        let prefix = self.paths.unicast(command, recipient);
        let resp = self.store.get_prefix(&prefix).await?;
        if resp.kvs.is_empty() {
            return Ok(Vec::new());
        }

        let mut values = Vec::with_capacity(resp.kvs.len());
        match self.watch.consume {
            ConsumeMode::Conditional => {
                for kv in resp.kvs {
                    match self.store.delete_if_mod_revision(&kv.key, kv.mod_revision).await {
                        Ok(true) => values.push(kv.value),
                        Ok(false) => {
                            debug!(key = %kv.key, revision = kv.mod_revision, "record consumed or replaced concurrently");
                        }
                        Err(e) => {
                            warn!(key = %kv.key, "cleanup delete failed: {:?}", e);
                            CLEANUP_FAILURES.with_label_values(&[KIND_UNICAST]).inc();
                            values.push(kv.value);
                        }
                    }
                }
            }
            ConsumeMode::Prefix => {
                values.extend(resp.kvs.into_iter().map(|kv| kv.value));
                if let Err(e) = self.store.delete_prefix(&prefix).await {
                    warn!(%prefix, "cleanup delete failed: {:?}", e);
                    CLEANUP_FAILURES.with_label_values(&[KIND_UNICAST]).inc();
                }
            }
        }

        COMMANDS_DELIVERED
            .with_label_values(&[KIND_UNICAST])
            .inc_by(values.len() as u64);
        Ok(values)
    }

    /// Pins the root's checkpoint to the current position if none is stored
    /// yet, and returns the revision dispatchers will start from.
    ///
    /// Without a stored checkpoint a dispatcher starts from whatever the
    /// store's revision is when its watch opens, so commands written between
    /// spawning it and that moment are missed. Seeding first makes them
    /// part of its replay.
    pub async fn seed_checkpoint(&self) -> Result<i64> {
        let from = self.checkpoint.get_revision().await?;
        if self.store.get(self.checkpoint.key()).await?.kvs.is_empty() {
            self.checkpoint.set_revision(from).await?;
            info!(key = %self.checkpoint.key(), "checkpoint seeded at {}", from);
        }
        Ok(from)
    }

    /// Watches commands for `recipient` until `cancel` fires or the store
    /// ends the watch, calling `handler` with each value.
    ///
    /// Watching starts from the root's checkpoint, which is advanced past
    /// every observed event. Each delivered command is deleted first.
    ///
    /// Matching is by key prefix, as in [`recv_from`](Self::recv_from): a
    /// recipient id that is a prefix of another (`agent-1` and `agent-10`)
    /// also receives the other's commands. Use fixed-length ids, such as
    /// hex digests, when that matters.
    pub async fn recv_from_loop<F>(
        &self,
        recipient: &str,
        command: &str,
        cancel: &CancellationToken,
        mut handler: F,
    ) -> Result<DispatchSummary>
    where
        F: FnMut(String),
    {
        let dispatcher = self.dispatcher(
            self.paths.unicast(command, recipient),
            WatchScope::Prefix,
            DispatchMode::Unicast(self.watch.consume),
        );
        dispatcher.run(cancel, move |event| handler(event.value)).await
    }

    /// Watches the broadcast entry of `command`, calling `handler` with each
    /// put or delete. Entries are left for other watchers and their lease.
    pub async fn recv_broadcast<F>(
        &self,
        command: &str,
        cancel: &CancellationToken,
        handler: F,
    ) -> Result<DispatchSummary>
    where
        F: FnMut(WatchEvent),
    {
        let dispatcher = self.dispatcher(self.paths.broadcast(command), WatchScope::Key, DispatchMode::Broadcast);
        dispatcher.run(cancel, handler).await
    }

    fn dispatcher(
        &self,
        key: String,
        scope: WatchScope,
        mode: DispatchMode,
    ) -> Dispatcher<'_, S> {
        Dispatcher {
            store: &self.store,
            checkpoint: &self.checkpoint,
            root: self.paths.root(),
            key,
            scope,
            mode,
            reconnect: self.watch.reconnect,
            persist_retry: self.persist_retry,
            errors: self.errors.as_ref(),
        }
    }
}
