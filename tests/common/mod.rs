use std::sync::Arc;
use std::time::Duration;

use etcd_notify::DispatchSummary;
use etcd_notify::MemoryStore;
use etcd_notify::Notifier;
use etcd_notify::Result;
use etcd_notify::WatchEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const ROOT: &str = "hids";
pub const RECIPIENT: &str = "a21527cb7ea88402a7ec796447d9faa9";
pub const COMMAND: &str = "upgrade";
pub const DATA: &str = "xxx";

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub fn notifier(store: &MemoryStore) -> Arc<Notifier<MemoryStore>> {
    Arc::new(Notifier::new(ROOT, Arc::new(store.clone())))
}

pub fn spawn_unicast(
    notifier: &Arc<Notifier<MemoryStore>>,
    recipient: &'static str,
    cancel: CancellationToken,
) -> (JoinHandle<Result<DispatchSummary>>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let notifier = notifier.clone();
    let handle = tokio::spawn(async move {
        notifier
            .recv_from_loop(recipient, COMMAND, &cancel, move |data| {
                let _ = tx.send(data);
            })
            .await
    });
    (handle, rx)
}

pub fn spawn_broadcast(
    notifier: &Arc<Notifier<MemoryStore>>,
    cancel: CancellationToken,
) -> (JoinHandle<Result<DispatchSummary>>, mpsc::UnboundedReceiver<WatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let notifier = notifier.clone();
    let handle = tokio::spawn(async move {
        notifier
            .recv_broadcast(COMMAND, &cancel, move |event| {
                let _ = tx.send(event);
            })
            .await
    });
    (handle, rx)
}

pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("dispatcher dropped its handler")
}

/// Waits until `store` has at least `count` open watches
pub async fn wait_for_watchers(
    store: &MemoryStore,
    count: usize,
) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while store.watcher_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for watches to open");
}
