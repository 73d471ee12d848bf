use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use crate::dispatcher::DispatchMode;
use crate::dispatcher::Dispatcher;
use crate::BackoffPolicy;
use crate::CheckpointConfig;
use crate::ConsumeMode;
use crate::DispatchExit;
use crate::Error;
use crate::KvStore;
use crate::MemoryStore;
use crate::MockKvStore;
use crate::RevisionCheckpoint;
use crate::WatchEvent;
use crate::WatchEventType;
use crate::WatchScope;

const ROOT: &str = "hids";
const CHECKPOINT: &str = "hids/notify/revision";
const UNICAST: &str = "hids/notify/command/upgrade/a21527cb7ea88402a7ec796447d9faa9";
const BROADCAST: &str = "hids/notify/command/upgrade";

fn fast_policy(max_retries: usize) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        timeout_ms: 100,
        base_delay_ms: 10,
        max_delay_ms: 40,
    }
}

fn checkpoint<S: KvStore + ?Sized>(store: &Arc<S>) -> RevisionCheckpoint<S> {
    RevisionCheckpoint::new(store.clone(), CHECKPOINT.to_string(), CheckpointConfig::default())
}

fn dispatcher<'a, S: KvStore + ?Sized>(
    store: &'a Arc<S>,
    checkpoint: &'a RevisionCheckpoint<S>,
    mode: DispatchMode,
) -> Dispatcher<'a, S> {
    let (key, scope) = match mode {
        DispatchMode::Unicast(_) => (UNICAST, WatchScope::Prefix),
        DispatchMode::Broadcast => (BROADCAST, WatchScope::Key),
    };
    Dispatcher {
        store,
        checkpoint,
        root: ROOT,
        key: key.to_string(),
        scope,
        mode,
        reconnect: fast_policy(3),
        persist_retry: fast_policy(2),
        errors: None,
    }
}

/// Handler that records events and cancels `cancel` once `stop_after` arrived
fn collect<'a>(
    seen: &'a mut Vec<WatchEvent>,
    cancel: &CancellationToken,
    stop_after: usize,
) -> impl FnMut(WatchEvent) + 'a {
    let cancel = cancel.clone();
    move |event| {
        seen.push(event);
        if seen.len() >= stop_after {
            cancel.cancel();
        }
    }
}

#[tokio::test]
async fn test_unicast_delivers_in_revision_order_and_consumes() {
    let store = Arc::new(MemoryStore::new());
    let cp = checkpoint(&store);
    cp.set_revision(1).await.unwrap();
    store.put(UNICAST, "first", None).await.unwrap();
    store.put(UNICAST, "second", None).await.unwrap();
    let last = store.put(UNICAST, "third", None).await.unwrap();

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    let summary = dispatcher(&store, &cp, DispatchMode::Unicast(ConsumeMode::Conditional))
        .run(&cancel, collect(&mut seen, &cancel, 3))
        .await
        .unwrap();

    let values: Vec<_> = seen.iter().map(|e| e.value.as_str()).collect();
    assert_eq!(values, vec!["first", "second", "third"]);
    assert!(seen.windows(2).all(|w| w[0].mod_revision < w[1].mod_revision));

    assert_eq!(summary.exit, DispatchExit::Cancelled);
    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.next_revision, last + 1);

    // The last record was consumed; overwritten ones lost their conditional delete
    assert!(store.get_prefix(UNICAST).await.unwrap().kvs.is_empty());
    assert_eq!(checkpoint(&store).get_revision().await.unwrap(), last + 1);
}

#[tokio::test]
async fn test_unicast_delete_events_only_move_cursor() {
    let store = Arc::new(MemoryStore::new());
    let cp = checkpoint(&store);
    cp.set_revision(1).await.unwrap();
    store.put(UNICAST, "cmd", None).await.unwrap();
    let deleted_at = store.delete_prefix(UNICAST).await.unwrap();
    let follow_up = store.put(UNICAST, "again", None).await.unwrap();

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    let summary = dispatcher(&store, &cp, DispatchMode::Unicast(ConsumeMode::Conditional))
        .run(&cancel, collect(&mut seen, &cancel, 2))
        .await
        .unwrap();

    assert!(deleted_at < follow_up);
    assert!(seen.iter().all(|e| e.event_type == WatchEventType::Put));
    assert_eq!(summary.delivered, 2);
    assert!(summary.events >= 3);
}

#[tokio::test]
async fn test_unicast_prefix_mode_clears_prefix() {
    let store = Arc::new(MemoryStore::new());
    let cp = checkpoint(&store);
    cp.set_revision(1).await.unwrap();
    store.put(UNICAST, "cmd", None).await.unwrap();

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    dispatcher(&store, &cp, DispatchMode::Unicast(ConsumeMode::Prefix))
        .run(&cancel, collect(&mut seen, &cancel, 1))
        .await
        .unwrap();

    assert_eq!(seen.len(), 1);
    assert!(store.get_prefix(UNICAST).await.unwrap().kvs.is_empty());
}

#[tokio::test]
async fn test_broadcast_ignores_unicast_traffic_and_never_deletes() {
    let store = Arc::new(MemoryStore::new());
    let cp = checkpoint(&store);
    cp.set_revision(1).await.unwrap();
    store.put(BROADCAST, "all", None).await.unwrap();
    // Unicast traffic shares the broadcast key as a string prefix
    store.put(UNICAST, "only-one", None).await.unwrap();
    store.put(BROADCAST, "all-again", None).await.unwrap();

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    let summary = dispatcher(&store, &cp, DispatchMode::Broadcast)
        .run(&cancel, collect(&mut seen, &cancel, 2))
        .await
        .unwrap();

    assert!(seen.iter().all(|e| e.key == BROADCAST));
    assert_eq!(seen[1].value, "all-again");
    assert_eq!(summary.delivered, 2);
    assert_eq!(store.get(BROADCAST).await.unwrap().kvs[0].value, "all-again");
    assert_eq!(store.get(UNICAST).await.unwrap().kvs.len(), 1);
}

#[tokio::test]
async fn test_broadcast_handler_receives_delete() {
    let store = Arc::new(MemoryStore::new());
    let cp = checkpoint(&store);
    cp.set_revision(1).await.unwrap();
    store.put(BROADCAST, "all", None).await.unwrap();
    store.delete_prefix(BROADCAST).await.unwrap();

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    dispatcher(&store, &cp, DispatchMode::Broadcast)
        .run(&cancel, collect(&mut seen, &cancel, 2))
        .await
        .unwrap();

    assert_eq!(seen[0].event_type, WatchEventType::Put);
    assert_eq!(seen[1].event_type, WatchEventType::Delete);
}

#[tokio::test]
async fn test_absent_checkpoint_skips_history() {
    let store = Arc::new(MemoryStore::new());
    store.put(UNICAST, "old", None).await.unwrap();

    let cp = checkpoint(&store);
    let cancel = CancellationToken::new();
    let mut seen = Vec::new();

    let writer = {
        let store = store.clone();
        async move {
            // Lets the dispatcher open its watch first
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.put(UNICAST, "new", None).await.unwrap();
        }
    };
    let d = dispatcher(&store, &cp, DispatchMode::Unicast(ConsumeMode::Conditional));
    let (summary, _) = tokio::join!(d.run(&cancel, collect(&mut seen, &cancel, 1)), writer);

    summary.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].value, "new");
}

#[tokio::test]
async fn test_restart_resumes_after_last_handled_event() {
    let store = Arc::new(MemoryStore::new());
    let cp = checkpoint(&store);
    cp.set_revision(1).await.unwrap();
    store.put(UNICAST, "a", None).await.unwrap();

    let cancel = CancellationToken::new();
    let mut first = Vec::new();
    dispatcher(&store, &cp, DispatchMode::Unicast(ConsumeMode::Conditional))
        .run(&cancel, collect(&mut first, &cancel, 1))
        .await
        .unwrap();

    store.put(UNICAST, "b", None).await.unwrap();

    let restarted = checkpoint(&store);
    let cancel = CancellationToken::new();
    let mut second = Vec::new();
    dispatcher(&store, &restarted, DispatchMode::Unicast(ConsumeMode::Conditional))
        .run(&cancel, collect(&mut second, &cancel, 1))
        .await
        .unwrap();

    assert_eq!(first[0].value, "a");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].value, "b");
}

#[tokio::test]
async fn test_pre_cancelled_token_returns_without_reading() {
    let mut mock = MockKvStore::new();
    mock.expect_get().never();
    mock.expect_watch().never();
    let store = Arc::new(mock);
    let cp = checkpoint(&store);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = dispatcher(&store, &cp, DispatchMode::Broadcast)
        .run(&cancel, |_| panic!("no event expected"))
        .await
        .unwrap();
    assert_eq!(summary.exit, DispatchExit::Cancelled);
    assert_eq!(summary.events, 0);
}

#[tokio::test]
async fn test_store_closing_stream_ends_dispatcher() {
    let store = Arc::new(MemoryStore::new());
    let cp = checkpoint(&store);
    let closer = {
        let store = store.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.close();
        }
    };

    let cancel = CancellationToken::new();
    let d = dispatcher(&store, &cp, DispatchMode::Broadcast);
    let (summary, _) = tokio::join!(d.run(&cancel, |_| {}), closer);
    assert_eq!(summary.unwrap().exit, DispatchExit::StreamClosed);
}

#[tokio::test]
#[traced_test]
async fn test_reconnects_from_cursor_after_disconnect() {
    let store = Arc::new(MemoryStore::new());
    let cp = checkpoint(&store);
    cp.set_revision(1).await.unwrap();
    store.put(UNICAST, "before", None).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut d = dispatcher(&store, &cp, DispatchMode::Unicast(ConsumeMode::Conditional));
    d.errors = Some(&tx);

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    let chaos = {
        let store = store.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.disconnect_watchers();
            store.put(UNICAST, "after", None).await.unwrap();
        }
    };
    let (summary, _) = tokio::join!(d.run(&cancel, collect(&mut seen, &cancel, 2)), chaos);

    let summary = summary.unwrap();
    let values: Vec<_> = seen.iter().map(|e| e.value.as_str()).collect();
    assert_eq!(values, vec!["before", "after"]);
    assert_eq!(summary.reconnects, 1);
    assert!(matches!(rx.try_recv(), Ok(Error::StoreUnavailable(_))));
    assert!(logs_contain("reconnecting"));
}

#[tokio::test]
async fn test_compacted_start_revision_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..5 {
        store.put("other", &i.to_string(), None).await.unwrap();
    }
    store.compact(5);
    let cp = checkpoint(&store);
    cp.set_revision(2).await.unwrap();

    let result = dispatcher(&store, &cp, DispatchMode::Broadcast)
        .run(&CancellationToken::new(), |_| {})
        .await;
    assert!(matches!(result, Err(Error::Compacted { requested: 2, .. })));
}

#[tokio::test]
async fn test_gives_up_after_reconnect_budget() {
    let mut mock = MockKvStore::new();
    mock.expect_get().returning(|_| Ok(Default::default()));
    mock.expect_watch()
        .times(4)
        .returning(|_, _, _| Err(Error::StoreUnavailable("connection refused".to_string())));
    let store = Arc::new(mock);
    let cp = checkpoint(&store);

    let result = dispatcher(&store, &cp, DispatchMode::Broadcast)
        .run(&CancellationToken::new(), |_| {})
        .await;
    assert!(matches!(result, Err(Error::RetryTaskFailed(_))));
}

#[tokio::test]
#[traced_test]
async fn test_persist_failure_is_reported_and_loop_continues() {
    let mut mock = MockKvStore::new();
    mock.expect_get().returning(|_| Ok(Default::default()));
    mock.expect_put_if_mod_revision()
        .returning(|_, _, _| Err(Error::StoreUnavailable("no leader".to_string())));
    mock.expect_watch().returning(|key, _, _| {
        let events = (1..=2)
            .map(|rev| WatchEvent {
                event_type: WatchEventType::Put,
                key: key.to_string(),
                value: format!("v{rev}"),
                mod_revision: rev,
            })
            .collect::<Vec<_>>();
        Ok(futures::stream::iter(vec![Ok(events)]).boxed())
    });
    let store = Arc::new(mock);
    let cp = checkpoint(&store);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut d = dispatcher(&store, &cp, DispatchMode::Broadcast);
    d.errors = Some(&tx);

    let mut seen = Vec::new();
    let summary = d
        .run(&CancellationToken::new(), |e| seen.push(e.value))
        .await
        .unwrap();

    assert_eq!(seen, vec!["v1", "v2"]);
    assert_eq!(summary.exit, DispatchExit::StreamClosed);
    assert_eq!(summary.next_revision, 3);
    assert!(matches!(rx.try_recv(), Ok(Error::RetryTaskFailed(_))));
    assert!(matches!(rx.try_recv(), Ok(Error::RetryTaskFailed(_))));
    assert!(logs_contain("persist checkpoint failed"));
}

#[tokio::test]
async fn test_cleanup_failure_still_delivers() {
    let mut mock = MockKvStore::new();
    mock.expect_get().returning(|_| Ok(Default::default()));
    mock.expect_put_if_mod_revision().returning(|_, _, rev| Ok(Some(rev + 1)));
    mock.expect_delete_if_mod_revision()
        .times(1)
        .returning(|_, _| Err(Error::Write("permission denied".to_string())));
    mock.expect_watch().returning(|key, _, _| {
        Ok(futures::stream::iter(vec![Ok(vec![WatchEvent {
            event_type: WatchEventType::Put,
            key: key.to_string(),
            value: "xxx".to_string(),
            mod_revision: 7,
        }])])
        .boxed())
    });
    let store = Arc::new(mock);
    let cp = checkpoint(&store);

    let mut seen = Vec::new();
    let summary = dispatcher(&store, &cp, DispatchMode::Unicast(ConsumeMode::Conditional))
        .run(&CancellationToken::new(), |e| seen.push(e.value))
        .await
        .unwrap();
    assert_eq!(seen, vec!["xxx"]);
    assert_eq!(summary.delivered, 1);
}

/// Store whose first `stalls` watch calls never complete
struct StalledWatchStore {
    inner: MemoryStore,
    stalls: std::sync::atomic::AtomicUsize,
}

impl StalledWatchStore {
    fn new(stalls: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            stalls: std::sync::atomic::AtomicUsize::new(stalls),
        }
    }
}

#[async_trait::async_trait]
impl KvStore for StalledWatchStore {
    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<crate::LeaseId>,
    ) -> crate::Result<i64> {
        self.inner.put(key, value, lease).await
    }

    async fn get(
        &self,
        key: &str,
    ) -> crate::Result<crate::GetResponse> {
        self.inner.get(key).await
    }

    async fn get_prefix(
        &self,
        prefix: &str,
    ) -> crate::Result<crate::GetResponse> {
        self.inner.get_prefix(prefix).await
    }

    async fn delete_prefix(
        &self,
        prefix: &str,
    ) -> crate::Result<i64> {
        self.inner.delete_prefix(prefix).await
    }

    async fn delete_if_mod_revision(
        &self,
        key: &str,
        mod_revision: i64,
    ) -> crate::Result<bool> {
        self.inner.delete_if_mod_revision(key, mod_revision).await
    }

    async fn put_if_mod_revision(
        &self,
        key: &str,
        value: &str,
        mod_revision: i64,
    ) -> crate::Result<Option<i64>> {
        self.inner.put_if_mod_revision(key, value, mod_revision).await
    }

    async fn current_revision(&self) -> crate::Result<i64> {
        self.inner.current_revision().await
    }

    async fn grant(
        &self,
        ttl_secs: i64,
    ) -> crate::Result<crate::LeaseId> {
        self.inner.grant(ttl_secs).await
    }

    async fn revoke(
        &self,
        lease: crate::LeaseId,
    ) -> crate::Result<()> {
        self.inner.revoke(lease).await
    }

    async fn keep_alive(
        &self,
        lease: crate::LeaseId,
    ) -> crate::Result<crate::KeepAliveStream> {
        self.inner.keep_alive(lease).await
    }

    async fn watch(
        &self,
        key: &str,
        scope: WatchScope,
        from_revision: i64,
    ) -> crate::Result<crate::WatchStream> {
        let stalled = self
            .stalls
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok();
        if stalled {
            futures::future::pending::<()>().await;
        }
        self.inner.watch(key, scope, from_revision).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_watch_open_is_retried() {
    let store = Arc::new(StalledWatchStore::new(2));
    let cp = checkpoint(&store);
    store.put(UNICAST, "xxx", None).await.unwrap();
    cp.set_revision(1).await.unwrap();

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    let d = dispatcher(&store, &cp, DispatchMode::Unicast(ConsumeMode::Conditional));
    let summary = d.run(&cancel, collect(&mut seen, &cancel, 1)).await.unwrap();

    assert_eq!(summary.reconnects, 2);
    assert_eq!(summary.delivered, 1);
    assert_eq!(seen[0].value, "xxx");
}

#[tokio::test(start_paused = true)]
async fn test_watch_open_that_never_completes_exhausts_budget() {
    let store = Arc::new(StalledWatchStore::new(usize::MAX));
    let cp = checkpoint(&store);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut d = dispatcher(&store, &cp, DispatchMode::Broadcast);
    d.errors = Some(&tx);

    let result = d.run(&CancellationToken::new(), |_| {}).await;
    assert!(matches!(result, Err(Error::RetryTaskFailed(_))));
    assert!(matches!(rx.try_recv(), Ok(Error::RetryTimeout(_))));
}
