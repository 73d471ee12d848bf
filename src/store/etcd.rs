use std::time::Duration;

use etcd_client::Client;
use etcd_client::Compare;
use etcd_client::CompareOp;
use etcd_client::ConnectOptions;
use etcd_client::DeleteOptions;
use etcd_client::EventType;
use etcd_client::GetOptions;
use etcd_client::PutOptions;
use etcd_client::Txn;
use etcd_client::TxnOp;
use etcd_client::WatchOptions;
use futures::StreamExt;
use tracing::debug;
use tracing::error;
use tracing::info;

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
use crate::errors::from_etcd;
use crate::errors::Op;
use crate::utils::scoped_timer::ScopedTimer;
use crate::Error;
use crate::Result;
use crate::StoreConfig;

/// Key used for revision-only reads. It is never written.
const REVISION_PROBE_KEY: &str = "\0";

/// [`KvStore`] backed by an etcd v3 cluster
///
/// Cloning is cheap: all clones share one underlying gRPC channel.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Connects to the endpoints listed in `config`
    ///
    /// # Errors
    /// - [`Error::InvalidConfig`] if the configuration does not validate
    /// - [`Error::StoreUnavailable`] if no endpoint can be reached within
    ///   `connect_timeout_ms`
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let mut options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .with_timeout(Duration::from_millis(config.request_timeout_ms));
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| {
                error!("connect to {:?} failed: {:?}", config.endpoints, e);
                from_etcd(Op::Read, e)
            })?;
        info!("connected to etcd: {:?}", config.endpoints);

        Ok(Self { client })
    }

    /// Wraps an already connected client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> Result<KeyValue> {
    let key = kv.key_str().map_err(|e| Error::Read(e.to_string()))?;
    let value = kv.value_str().map_err(|e| Error::Read(e.to_string()))?;
    Ok(KeyValue {
        key: key.to_string(),
        value: value.to_string(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: (kv.lease() != 0).then_some(LeaseId(kv.lease())),
    })
}

fn convert_get(resp: &etcd_client::GetResponse) -> Result<GetResponse> {
    let kvs = resp.kvs().iter().map(convert_kv).collect::<Result<Vec<_>>>()?;
    Ok(GetResponse {
        kvs,
        revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
    })
}

fn convert_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let event_type = match event.event_type() {
        EventType::Put => WatchEventType::Put,
        EventType::Delete => WatchEventType::Delete,
    };
    Some(WatchEvent {
        event_type,
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: String::from_utf8_lossy(kv.value()).into_owned(),
        mod_revision: kv.mod_revision(),
    })
}

#[async_trait::async_trait]
impl KvStore for EtcdStore {
    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<i64> {
        let _timer = ScopedTimer::new("etcd::put");
        let options = lease.map(|l| PutOptions::new().with_lease(l.0));
        let resp = self
            .client
            .kv_client()
            .put(key, value, options)
            .await
            .map_err(|e| from_etcd(Op::Write, e))?;
        debug!("[:EtcdStore:put] key={key} lease={lease:?}");
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<GetResponse> {
        let _timer = ScopedTimer::new("etcd::get");
        let resp = self
            .client
            .kv_client()
            .get(key, None)
            .await
            .map_err(|e| from_etcd(Op::Read, e))?;
        convert_get(&resp)
    }

    async fn get_prefix(
        &self,
        prefix: &str,
    ) -> Result<GetResponse> {
        let _timer = ScopedTimer::new("etcd::get_prefix");
        let resp = self
            .client
            .kv_client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| from_etcd(Op::Read, e))?;
        convert_get(&resp)
    }

    async fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Result<i64> {
        let _timer = ScopedTimer::new("etcd::delete_prefix");
        let resp = self
            .client
            .kv_client()
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(|e| from_etcd(Op::Write, e))?;
        Ok(resp.deleted())
    }

    async fn delete_if_mod_revision(
        &self,
        key: &str,
        mod_revision: i64,
    ) -> Result<bool> {
        let _timer = ScopedTimer::new("etcd::delete_if_mod_revision");
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(key, CompareOp::Equal, mod_revision)])
            .and_then(vec![TxnOp::delete(key, None)]);
        let resp = self
            .client
            .kv_client()
            .txn(txn)
            .await
            .map_err(|e| from_etcd(Op::Write, e))?;
        Ok(resp.succeeded())
    }

    async fn put_if_mod_revision(
        &self,
        key: &str,
        value: &str,
        mod_revision: i64,
    ) -> Result<Option<i64>> {
        let _timer = ScopedTimer::new("etcd::put_if_mod_revision");
        // A missing key compares as mod_revision 0
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(key, CompareOp::Equal, mod_revision)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = self
            .client
            .kv_client()
            .txn(txn)
            .await
            .map_err(|e| from_etcd(Op::Write, e))?;
        if !resp.succeeded() {
            return Ok(None);
        }
        Ok(Some(resp.header().map(|h| h.revision()).unwrap_or_default()))
    }

    async fn current_revision(&self) -> Result<i64> {
        let resp = self
            .client
            .kv_client()
            .get(REVISION_PROBE_KEY, Some(GetOptions::new().with_count_only()))
            .await
            .map_err(|e| from_etcd(Op::Read, e))?;
        resp.header()
            .map(|h| h.revision())
            .ok_or_else(|| Error::Read("response without header".to_string()))
    }

    async fn grant(
        &self,
        ttl_secs: i64,
    ) -> Result<LeaseId> {
        let _timer = ScopedTimer::new("etcd::grant");
        let resp = self
            .client
            .lease_client()
            .grant(ttl_secs, None)
            .await
            .map_err(|e| from_etcd(Op::Lease, e))?;
        debug!("[:EtcdStore:grant] lease={:x} ttl={}", resp.id(), resp.ttl());
        Ok(LeaseId(resp.id()))
    }

    async fn revoke(
        &self,
        lease: LeaseId,
    ) -> Result<()> {
        self.client
            .lease_client()
            .revoke(lease.0)
            .await
            .map_err(|e| from_etcd(Op::Lease, e))?;
        Ok(())
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
    ) -> Result<KeepAliveStream> {
        let (keeper, stream) = self
            .client
            .lease_client()
            .keep_alive(lease.0)
            .await
            .map_err(|e| from_etcd(Op::Lease, e))?;

        // (keeper, response stream, delay before the next renewal)
        let state = Some((keeper, stream, Duration::ZERO));
        let renewals = futures::stream::unfold(state, |state| async move {
            let (mut keeper, mut stream, delay) = state?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = keeper.keep_alive().await {
                return Some((Err(from_etcd(Op::Lease, e)), None));
            }
            match stream.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    let next = renew_interval(resp.ttl());
                    Some((Ok(resp.ttl()), Some((keeper, stream, next))))
                }
                // Lease expired or revoked
                Ok(Some(_)) => Some((Ok(0), None)),
                Ok(None) => None,
                Err(e) => Some((Err(from_etcd(Op::Lease, e)), None)),
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
        let mut options = WatchOptions::new().with_start_revision(from_revision);
        if scope == WatchScope::Prefix {
            options = options.with_prefix();
        }
        let (watcher, stream) = self
            .client
            .watch_client()
            .watch(key, Some(options))
            .await
            .map_err(|e| from_etcd(Op::Watch, e))?;
        debug!("[:EtcdStore:watch] key={key} scope={scope:?} from={from_revision}");

        // The watcher is carried along so the watch stays registered while
        // the stream is alive.
        let state = Some((watcher, stream));
        let events = futures::stream::unfold(state, move |state| async move {
            let (watcher, mut stream) = state?;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            let err = if resp.compact_revision() > 0 {
                                Error::Compacted {
                                    requested: from_revision,
                                    compact_revision: resp.compact_revision(),
                                }
                            } else {
                                Error::Watch(format!("watch {} canceled by store", watcher.watch_id()))
                            };
                            return Some((Err(err), None));
                        }
                        let batch: Vec<WatchEvent> = resp.events().iter().filter_map(convert_event).collect();
                        // Creation and progress notifications carry no events
                        if batch.is_empty() {
                            continue;
                        }
                        return Some((Ok(batch), Some((watcher, stream))));
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(from_etcd(Op::Watch, e)), None)),
                }
            }
        });

        Ok(events.boxed())
    }
}
