//! Key-value store seam used by the notification protocol
//!
//! The protocol only needs a small slice of a revisioned store:
//! - [`KvStore::put`] / [`KvStore::get`] / [`KvStore::get_prefix`] / [`KvStore::delete_prefix`]
//! - conditional writes keyed on a key's `mod_revision`
//! - leases ([`KvStore::grant`], [`KvStore::keep_alive`], [`KvStore::revoke`])
//! - a watch stream starting at a given revision
//!
//! Two implementations ship with the crate:
//! - [`EtcdStore`] - remote access through `etcd-client`
//! - [`MemoryStore`] - in-process store with the same revision/lease semantics,
//!   used by tests and single-process deployments; its replay history is
//!   bounded by [`DEFAULT_HISTORY_LIMIT`]

mod etcd;
mod memory;

pub use etcd::*;
pub use memory::*;


use std::time::Duration;

use futures::stream::BoxStream;

use crate::Result;

/// Stream of watch batches. Every batch holds the events of one or more
/// store revisions, ordered by `mod_revision`.
pub type WatchStream = BoxStream<'static, Result<Vec<WatchEvent>>>;

/// Stream of lease renewals. Each item is the remaining TTL in seconds
/// after a renewal; a TTL `<= 0` means the lease no longer exists.
pub type KeepAliveStream = BoxStream<'static, Result<i64>>;

/// Store assigned lease identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl std::fmt::Display for LeaseId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub lease: Option<LeaseId>,
}

/// Result of a range read together with the store revision it was served at
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// Whether a watch covers a single key or every key under a prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    Key,
    Prefix,
}

impl WatchScope {
    pub fn matches(
        self,
        watched: &str,
        key: &str,
    ) -> bool {
        match self {
            WatchScope::Key => watched == key,
            WatchScope::Prefix => key.starts_with(watched),
        }
    }
}

/// Event type for watch notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    /// Key was inserted or updated
    Put,
    /// Key was deleted, explicitly or by lease expiry
    Delete,
}

/// Watch event containing key change information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub key: String,
    /// The new value (empty for DELETE events)
    pub value: String,
    pub mod_revision: i64,
}

/// Revisioned key-value store interface.
///
/// All implementations must be `Send + Sync`, safe for concurrent access.
/// Transport failures map to [`crate::Error::StoreUnavailable`]; rejected
/// requests map to [`crate::Error::Write`], [`crate::Error::Read`] or
/// [`crate::Error::Lease`].
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Stores `value` at `key`, optionally attached to a lease.
    /// Returns the store revision of the write.
    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<i64>;

    /// Reads a single key
    async fn get(
        &self,
        key: &str,
    ) -> Result<GetResponse>;

    /// Reads every key starting with `prefix`, in key order
    async fn get_prefix(
        &self,
        prefix: &str,
    ) -> Result<GetResponse>;

    /// Deletes every key starting with `prefix`. Returns the number of deleted keys.
    async fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Result<i64>;

    /// Deletes `key` only if its current `mod_revision` equals `mod_revision`.
    /// Returns whether the delete happened.
    async fn delete_if_mod_revision(
        &self,
        key: &str,
        mod_revision: i64,
    ) -> Result<bool>;

    /// Stores `value` only if the current `mod_revision` of `key` equals
    /// `mod_revision` (`0` means the key must not exist).
    /// Returns the revision of the write, or `None` if the comparison failed.
    async fn put_if_mod_revision(
        &self,
        key: &str,
        value: &str,
        mod_revision: i64,
    ) -> Result<Option<i64>>;

    /// Current global revision of the store
    async fn current_revision(&self) -> Result<i64>;

    async fn grant(
        &self,
        ttl_secs: i64,
    ) -> Result<LeaseId>;

    async fn revoke(
        &self,
        lease: LeaseId,
    ) -> Result<()>;

    /// Opens a renewal stream for `lease`. Renewals happen while the stream
    /// is polled; dropping the stream stops renewing.
    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<KeepAliveStream>;

    /// Watches `key` (or every key under it) for events with
    /// `mod_revision >= from_revision`.
    async fn watch(
        &self,
        key: &str,
        scope: WatchScope,
        from_revision: i64,
    ) -> Result<WatchStream>;
}

/// Renew a lease three times per TTL period
pub(crate) fn renew_interval(ttl_secs: i64) -> Duration {
    let millis = (ttl_secs.max(0) as u64).saturating_mul(1000) / 3;
    Duration::from_millis(millis.max(100))
}
