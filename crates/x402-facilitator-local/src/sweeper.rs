//! Upto session sweeper (C9): periodically closes sessions whose permit
//! deadline has passed so they stop occupying the session store and can no
//! longer accept a settlement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use x402_types::timestamp::UnixTimestamp;

use crate::session_store::UptoSessionStore;

/// Advisory lock so only one facilitator process runs the sweep at a time
/// when the session store is shared (e.g. backed by a database). The
/// in-memory facilitator uses [`NoopLock`], since there is only ever one
/// process holding that store.
#[async_trait]
pub trait Lock: Send + Sync {
    /// Attempts to acquire the sweep lock, returning `false` if another
    /// holder already has it.
    async fn try_acquire(&self) -> bool;
    async fn release(&self);
}

/// A [`Lock`] that always succeeds, for single-process deployments.
pub struct NoopLock;

#[async_trait]
impl Lock for NoopLock {
    async fn try_acquire(&self) -> bool {
        true
    }

    async fn release(&self) {}
}

/// Periodically closes expired upto sessions in the background.
pub struct UptoSweeper {
    store: Arc<dyn UptoSessionStore>,
    lock: Arc<dyn Lock>,
    interval: Duration,
}

impl UptoSweeper {
    pub fn new(store: Arc<dyn UptoSessionStore>, lock: Arc<dyn Lock>, interval: Duration) -> Self {
        Self {
            store,
            lock,
            interval,
        }
    }

    /// Runs one sweep pass: closes every session the store reports as
    /// expired. Returns the number of sessions closed.
    pub async fn sweep_once(&self) -> usize {
        if !self.lock.try_acquire().await {
            return 0;
        }
        let expired = self.store.expired(UnixTimestamp::now()).await;
        for session in &expired {
            if let Err(err) = self.store.close(&session.id).await {
                #[cfg(feature = "telemetry")]
                tracing::warn!(session_id = %session.id, error = ?err, "failed to close expired upto session");
                #[cfg(not(feature = "telemetry"))]
                let _ = err;
            }
        }
        self.lock.release().await;
        expired.len()
    }

    /// Runs [`Self::sweep_once`] on a fixed interval until `cancellation`
    /// fires. Intended to be spawned as a background task alongside the HTTP
    /// server.
    pub async fn run(self, cancellation: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = ticker.tick() => {
                    let closed = self.sweep_once().await;
                    if closed > 0 {
                        #[cfg(feature = "telemetry")]
                        tracing::info!(closed, "swept expired upto sessions");
                        #[cfg(not(feature = "telemetry"))]
                        let _ = closed;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_store::InMemoryUptoSessionStore;
    use x402_types::chain::ChainId;

    #[tokio::test]
    async fn sweep_closes_sessions_past_their_deadline() {
        let store: Arc<dyn UptoSessionStore> = Arc::new(InMemoryUptoSessionStore::new());
        let network = ChainId::new("eip155", "8453");
        let session = store
            .get_or_create(
                &network,
                "0xasset",
                "0xowner",
                "0xspender",
                100,
                UnixTimestamp::from_secs(1),
                "1",
            )
            .await
            .unwrap();

        let sweeper = UptoSweeper::new(store.clone(), Arc::new(NoopLock), Duration::from_secs(60));
        let closed = sweeper.sweep_once().await;
        assert_eq!(closed, 1);

        let err = store.begin_settlement(&session.id, 1).await.unwrap_err();
        assert_eq!(err, x402_types::proto::ErrorReason::SessionClosed);
    }

    #[tokio::test]
    async fn sweep_leaves_unexpired_sessions_open() {
        let store: Arc<dyn UptoSessionStore> = Arc::new(InMemoryUptoSessionStore::new());
        let network = ChainId::new("eip155", "8453");
        store
            .get_or_create(
                &network,
                "0xasset",
                "0xowner",
                "0xspender",
                100,
                UnixTimestamp::now() + 3600,
                "1",
            )
            .await
            .unwrap();

        let sweeper = UptoSweeper::new(store, Arc::new(NoopLock), Duration::from_secs(60));
        let closed = sweeper.sweep_once().await;
        assert_eq!(closed, 0);
    }
}
