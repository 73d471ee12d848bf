use std::sync::Arc;
use std::time::Duration;

use etcd_notify::register_custom_metrics;
use etcd_notify::EtcdStore;
use etcd_notify::KeepAlive;
use etcd_notify::Notifier;
use etcd_notify::NotifyConfig;
use etcd_notify::Result;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

const RECIPIENT: &str = "a21527cb7ea88402a7ec796447d9faa9";
const COMMAND: &str = "upgrade";
const DATA: &str = "xxx";
const TTL_SECS: i64 = 10;
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    init_observability();

    let settings = NotifyConfig::new()?.validate()?;
    if let Err(e) = register_custom_metrics(prometheus::default_registry()) {
        warn!("metrics not registered: {:?}", e);
    }

    let store = EtcdStore::connect(&settings.store).await?;
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let notifier = Arc::new(
        Notifier::builder(settings.root.clone(), Arc::new(store))
            .config(&settings)
            .error_sink(error_tx)
            .build(),
    );

    tokio::spawn(async move {
        while let Some(e) = error_rx.recv().await {
            warn!("dispatcher recovered from: {}", e);
        }
    });

    // One-shot round trip
    notifier.send_to(RECIPIENT, COMMAND, DATA).await?;
    let pending = notifier.recv_from(RECIPIENT, COMMAND).await?;
    info!("recv_from: {:?}", pending);

    // Pin the start position so commands sent right after spawning are replayed
    let from = notifier.seed_checkpoint().await?;
    info!("dispatchers start from revision {}", from);

    let shutdown = CancellationToken::new();

    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
    let unicast = {
        let notifier = notifier.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            notifier
                .recv_from_loop(RECIPIENT, COMMAND, &cancel, move |data| {
                    info!(recipient = RECIPIENT, "unicast command {}: {}", COMMAND, data);
                    let _ = delivered_tx.send(());
                })
                .await
        })
    };
    let broadcast = {
        let notifier = notifier.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            notifier
                .recv_broadcast(COMMAND, &cancel, |event| {
                    info!("broadcast {:?} on {}: {}", event.event_type, event.key, event.value)
                })
                .await
        })
    };

    // Written after the seeded revision, so both dispatchers see them
    notifier.send_to(RECIPIENT, COMMAND, DATA).await?;
    let lease = notifier
        .send_to_with_ttl(RECIPIENT, COMMAND, DATA, TTL_SECS, KeepAlive::No)
        .await?;
    info!(lease_id = %lease, "ttl command sent");

    // The dispatchers share one checkpoint key. Broadcasting only after the
    // unicast commands are delivered keeps the broadcast dispatcher from
    // advancing it past them before the unicast dispatcher has read it.
    let delivered = tokio::time::timeout(DELIVERY_TIMEOUT, async {
        for _ in 0..2 {
            delivered_rx.recv().await;
        }
    })
    .await;
    if delivered.is_err() {
        warn!("unicast commands not delivered within {:?}", DELIVERY_TIMEOUT);
    }

    let lease = notifier.send_broadcast(COMMAND, DATA, TTL_SECS).await?;
    info!(lease_id = %lease, "broadcast sent");

    info!("Application started. Waiting for CTRL+C signal...");
    if let Err(e) = graceful_shutdown().await {
        error!("Failed to listen for shutdown signal: {:?}", e);
    }
    shutdown.cancel();

    for (name, handle) in [("unicast", unicast), ("broadcast", broadcast)] {
        match handle.await {
            Ok(Ok(summary)) => info!("{name} dispatcher stopped: {:?}", summary),
            Ok(Err(e)) => error!("{name} dispatcher failed: {:?}", e),
            Err(e) => error!("{name} dispatcher panicked: {:?}", e),
        }
    }

    println!("Exiting program.");
    Ok(())
}

async fn graceful_shutdown() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }
    Ok(())
}

fn init_observability() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(fmt_layer).init();
}
