//! In-process revisioned store
//!
//! Mirrors the etcd semantics the notification protocol relies on:
//! - every mutation bumps one global revision; a multi-key delete is one revision
//! - watches replay retained history from the requested revision, then go live
//! - leases expire on a background task and delete their keys
//!
//! A watch starting at revision `<= 0` replays the whole retained history.
//!
//! History is bounded: once it holds more than `history_limit` events the
//! oldest revisions are compacted away, as etcd's auto-compaction does.
//! Watches starting below the compacted revision fail with
//! [`Error::Compacted`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use tracing::trace;

use super::renew_interval;
use super::GetResponse;
use super::KeepAliveStream;
use super::KeyValue;
use super::KvStore;
use super::LeaseId;
use super::WatchEvent;
use super::WatchEventType;
use super::WatchScope;
use super::WatchStream;
use crate::Error;
use crate::Result;

type BatchSender = mpsc::UnboundedSender<Result<Vec<WatchEvent>>>;

/// Watch events retained for replay by default
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// Cloneable handle to a shared in-process store
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("MemoryStore")
            .field("revision", &state.revision)
            .field("keys", &state.kvs.len())
            .field("leases", &state.leases.len())
            .field("watchers", &state.watchers.len())
            .finish()
    }
}

struct LeaseState {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    key: String,
    scope: WatchScope,
    sender: BatchSender,
}

struct State {
    revision: i64,
    compacted: i64,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<i64, LeaseState>,
    next_lease_id: i64,
    history: Vec<WatchEvent>,
    history_limit: usize,
    watchers: Vec<Watcher>,
    closed: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            // etcd starts counting at 1
            revision: 1,
            compacted: 0,
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease_id: 1,
            history: Vec::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            watchers: Vec::new(),
            closed: false,
        }
    }
}

impl State {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::StoreUnavailable("memory store is closed".to_string()));
        }
        Ok(())
    }

    fn put(
        &mut self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<i64> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id.0) {
                return Err(Error::Write(format!("lease {id} not found")));
            }
        }

        self.revision += 1;
        let revision = self.revision;

        let create_revision = match self.kvs.get(key) {
            Some(old) => {
                if let Some(old_lease) = old.lease {
                    if let Some(l) = self.leases.get_mut(&old_lease.0) {
                        l.keys.remove(key);
                    }
                }
                old.create_revision
            }
            None => revision,
        };
        if let Some(id) = lease {
            if let Some(l) = self.leases.get_mut(&id.0) {
                l.keys.insert(key.to_string());
            }
        }

        self.kvs.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.to_string(),
                create_revision,
                mod_revision: revision,
                lease,
            },
        );
        self.publish(vec![WatchEvent {
            event_type: WatchEventType::Put,
            key: key.to_string(),
            value: value.to_string(),
            mod_revision: revision,
        }]);
        Ok(revision)
    }

    /// Removes `keys` under a single new revision
    fn delete(
        &mut self,
        keys: Vec<String>,
    ) -> i64 {
        let keys: Vec<String> = keys.into_iter().filter(|k| self.kvs.contains_key(k)).collect();
        if keys.is_empty() {
            return 0;
        }

        self.revision += 1;
        let revision = self.revision;
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(old) = self.kvs.remove(&key) {
                if let Some(lease) = old.lease {
                    if let Some(l) = self.leases.get_mut(&lease.0) {
                        l.keys.remove(&key);
                    }
                }
                events.push(WatchEvent {
                    event_type: WatchEventType::Delete,
                    key,
                    value: String::new(),
                    mod_revision: revision,
                });
            }
        }
        let deleted = events.len() as i64;
        self.publish(events);
        deleted
    }

    fn prefix_keys(
        &self,
        prefix: &str,
    ) -> Vec<String> {
        self.kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn expire_lease(
        &mut self,
        id: i64,
    ) {
        if let Some(lease) = self.leases.remove(&id) {
            debug!("lease {:x} expired, deleting {} key(s)", id, lease.keys.len());
            self.delete(lease.keys.into_iter().collect());
        }
    }

    /// Drops whole revisions from the front until at most `history_limit`
    /// events remain
    fn trim_history(&mut self) {
        if self.history.len() <= self.history_limit {
            return;
        }
        let cut = self.history[self.history.len() - self.history_limit].mod_revision;
        let keep_from = self.history.partition_point(|e| e.mod_revision < cut);
        self.history.drain(..keep_from);
        self.compacted = self.compacted.max(cut);
        trace!("history compacted below revision {cut}");
    }

    fn publish(
        &mut self,
        events: Vec<WatchEvent>,
    ) {
        self.history.extend(events.iter().cloned());
        self.trim_history();
        self.watchers.retain(|w| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|e| w.scope.matches(&w.key, &e.key))
                .cloned()
                .collect();
            if batch.is_empty() {
                return !w.sender.is_closed();
            }
            w.sender.send(Ok(batch)).is_ok()
        });
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that retains at most `limit` watch events for replay
    pub fn with_history_limit(limit: usize) -> Self {
        let store = Self::default();
        store.inner.lock().history_limit = limit.max(1);
        store
    }

    /// Stops the store: live watch streams end and every later request
    /// fails with [`Error::StoreUnavailable`].
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.watchers.clear();
    }

    /// Fails every live watch stream with [`Error::StoreUnavailable`]
    /// without closing the store, as a dropped connection would.
    pub fn disconnect_watchers(&self) {
        let mut state = self.inner.lock();
        for w in state.watchers.drain(..) {
            let _ = w
                .sender
                .send(Err(Error::StoreUnavailable("watch connection lost".to_string())));
        }
    }

    /// Discards history older than `revision`
    pub fn compact(
        &self,
        revision: i64,
    ) {
        let mut state = self.inner.lock();
        state.history.retain(|e| e.mod_revision >= revision);
        state.compacted = state.compacted.max(revision);
    }

    pub fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }

    /// Oldest revision a watch can still start from
    pub fn compacted_revision(&self) -> i64 {
        self.inner.lock().compacted
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    pub fn lease_count(&self) -> usize {
        self.inner.lock().leases.len()
    }

    fn spawn_reaper(
        weak: Weak<Mutex<State>>,
        id: i64,
    ) {
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(inner) = weak.upgrade() else { return };
                    let state = inner.lock();
                    match state.leases.get(&id) {
                        Some(l) => l.deadline,
                        None => return,
                    }
                };
                tokio::time::sleep_until(deadline).await;

                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.lock();
                let expired = state.leases.get(&id).map(|l| l.deadline <= Instant::now());
                match expired {
                    Some(true) => {
                        state.expire_lease(id);
                        return;
                    }
                    // Renewed in the meantime
                    Some(false) => continue,
                    None => return,
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<i64> {
        let mut state = self.inner.lock();
        state.ensure_open()?;
        state.put(key, value, lease)
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<GetResponse> {
        let state = self.inner.lock();
        state.ensure_open()?;
        Ok(GetResponse {
            kvs: state.kvs.get(key).cloned().into_iter().collect(),
            revision: state.revision,
        })
    }

    async fn get_prefix(
        &self,
        prefix: &str,
    ) -> Result<GetResponse> {
        let state = self.inner.lock();
        state.ensure_open()?;
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect();
        Ok(GetResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Result<i64> {
        let mut state = self.inner.lock();
        state.ensure_open()?;
        let keys = state.prefix_keys(prefix);
        Ok(state.delete(keys))
    }

    async fn delete_if_mod_revision(
        &self,
        key: &str,
        mod_revision: i64,
    ) -> Result<bool> {
        let mut state = self.inner.lock();
        state.ensure_open()?;
        let current = state.kvs.get(key).map(|kv| kv.mod_revision).unwrap_or(0);
        if current != mod_revision || current == 0 {
            return Ok(false);
        }
        state.delete(vec![key.to_string()]);
        Ok(true)
    }

    async fn put_if_mod_revision(
        &self,
        key: &str,
        value: &str,
        mod_revision: i64,
    ) -> Result<Option<i64>> {
        let mut state = self.inner.lock();
        state.ensure_open()?;
        let current = state.kvs.get(key).map(|kv| kv.mod_revision).unwrap_or(0);
        if current != mod_revision {
            return Ok(None);
        }
        state.put(key, value, None).map(Some)
    }

    async fn current_revision(&self) -> Result<i64> {
        let state = self.inner.lock();
        state.ensure_open()?;
        Ok(state.revision)
    }

    async fn grant(
        &self,
        ttl_secs: i64,
    ) -> Result<LeaseId> {
        let id = {
            let mut state = self.inner.lock();
            state.ensure_open()?;
            if ttl_secs <= 0 {
                return Err(Error::Lease(format!("invalid ttl: {ttl_secs}")));
            }
            let id = state.next_lease_id;
            state.next_lease_id += 1;
            state.leases.insert(
                id,
                LeaseState {
                    ttl: ttl_secs,
                    deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                    keys: BTreeSet::new(),
                },
            );
            id
        };
        Self::spawn_reaper(Arc::downgrade(&self.inner), id);
        trace!("granted lease {:x} ttl={}", id, ttl_secs);
        Ok(LeaseId(id))
    }

    async fn revoke(
        &self,
        lease: LeaseId,
    ) -> Result<()> {
        let mut state = self.inner.lock();
        state.ensure_open()?;
        if !state.leases.contains_key(&lease.0) {
            return Err(Error::Lease(format!("lease {lease} not found")));
        }
        state.expire_lease(lease.0);
        Ok(())
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<KeepAliveStream> {
        {
            let state = self.inner.lock();
            state.ensure_open()?;
            if !state.leases.contains_key(&lease.0) {
                return Err(Error::Lease(format!("lease {lease} not found")));
            }
        }

        let state = Some((Arc::downgrade(&self.inner), Duration::ZERO));
        let renewals = futures::stream::unfold(state, move |state| async move {
            let (weak, delay) = state?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let inner = weak.upgrade()?;
            let mut guard = inner.lock();
            if guard.closed {
                return None;
            }
            match guard.leases.get_mut(&lease.0) {
                Some(l) => {
                    l.deadline = Instant::now() + Duration::from_secs(l.ttl as u64);
                    let ttl = l.ttl;
                    drop(guard);
                    Some((Ok(ttl), Some((weak, renew_interval(ttl)))))
                }
                None => Some((Ok(0), None)),
            }
        });
        Ok(renewals.boxed())
    }

    async fn watch(
        &self,
        key: &str,
        scope: WatchScope,
        from_revision: i64,
    ) -> Result<WatchStream> {
        let mut state = self.inner.lock();
        state.ensure_open()?;
        if from_revision > 0 && from_revision < state.compacted {
            return Err(Error::Compacted {
                requested: from_revision,
                compact_revision: state.compacted,
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();

        // Replay retained history, one batch per revision
        let mut batch: Vec<WatchEvent> = Vec::new();
        for event in state
            .history
            .iter()
            .filter(|e| e.mod_revision >= from_revision && scope.matches(key, &e.key))
        {
            if batch.last().is_some_and(|last| last.mod_revision != event.mod_revision) {
                let _ = sender.send(Ok(std::mem::take(&mut batch)));
            }
            batch.push(event.clone());
        }
        if !batch.is_empty() {
            let _ = sender.send(Ok(batch));
        }

        state.watchers.push(Watcher {
            key: key.to_string(),
            scope,
            sender,
        });
        debug!("[:MemoryStore:watch] key={key} scope={scope:?} from={from_revision}");

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}
