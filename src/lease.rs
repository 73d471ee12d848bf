use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::utils::async_task::spawn_task;
use crate::Error;
use crate::KvStore;
use crate::LeaseId;
use crate::Result;

/// Why a keep-alive loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveExit {
    /// The caller's token was cancelled; the lease now runs out its TTL
    Cancelled,
    /// The store reported the lease as expired or revoked
    LeaseLost,
    /// The store closed the renewal stream
    StreamClosed,
}

/// Grants and renews leases on behalf of command writers
pub struct LeaseManager<S: KvStore + ?Sized> {
    store: Arc<S>,
}

impl<S: KvStore + ?Sized> Clone for LeaseManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: KvStore + ?Sized> LeaseManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Requests a lease that expires `ttl_secs` seconds from now unless renewed
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] if `ttl_secs <= 0`
    /// - [`Error::StoreUnavailable`] / [`Error::Lease`] from the store
    pub async fn grant(
        &self,
        ttl_secs: i64,
    ) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(Error::InvalidArgument(format!("ttl must be positive, got {ttl_secs}")));
        }
        let lease = self.store.grant(ttl_secs).await?;
        debug!(lease_id = %lease, ttl_secs, "lease granted");
        Ok(lease)
    }

    /// Expires `lease` immediately, deleting every key attached to it
    pub async fn revoke(
        &self,
        lease: LeaseId,
    ) -> Result<()> {
        self.store.revoke(lease).await?;
        debug!(lease_id = %lease, "lease revoked");
        Ok(())
    }

    /// Keeps `lease` alive until `cancel` fires or the store ends the
    /// renewal stream.
    ///
    /// This call blocks the current task for as long as the lease is kept
    /// alive; use [`spawn_keep_alive`](Self::spawn_keep_alive) to keep
    /// working meanwhile.
    pub async fn keep_alive(
        &self,
        lease: LeaseId,
        cancel: &CancellationToken,
    ) -> Result<KeepAliveExit> {
        let mut renewals = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(KeepAliveExit::Cancelled),
            renewals = self.store.keep_alive(lease) => renewals?,
        };
        info!(lease_id = %lease, "keep-alive started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(lease_id = %lease, "keep-alive cancelled");
                    return Ok(KeepAliveExit::Cancelled);
                }
                renewal = renewals.next() => match renewal {
                    Some(Ok(ttl)) if ttl > 0 => {
                        trace!(lease_id = %lease, ttl, "lease renewed");
                    }
                    Some(Ok(_)) => {
                        warn!(lease_id = %lease, "lease expired or revoked");
                        return Ok(KeepAliveExit::LeaseLost);
                    }
                    Some(Err(e)) => {
                        warn!(lease_id = %lease, "keep-alive failed: {:?}", e);
                        return Err(e);
                    }
                    None => {
                        info!(lease_id = %lease, "keep-alive stream closed by store");
                        return Ok(KeepAliveExit::StreamClosed);
                    }
                }
            }
        }
    }
}

impl<S: KvStore + ?Sized> LeaseManager<S> {
    /// Runs [`keep_alive`](Self::keep_alive) on its own task.
    ///
    /// The handle resolves to `None` if renewing failed with an error.
    pub fn spawn_keep_alive(
        &self,
        lease: LeaseId,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<KeepAliveExit>> {
        let manager = self.clone();
        spawn_task(&format!("keep-alive-{lease}"), move || async move {
            manager.keep_alive(lease, &cancel).await
        })
    }
}
