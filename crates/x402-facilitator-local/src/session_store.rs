//! Upto session storage (C6/C7): tracks the running total consumed and
//! tentatively pending against each signed permit's session cap, and
//! serializes settlement attempts for a given session so concurrent requests
//! can't double-spend it.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use x402_types::chain::ChainId;
use x402_types::proto::ErrorReason;
use x402_types::timestamp::UnixTimestamp;

/// Opaque identifier for an upto payment session, derived from the signed
/// permit rather than chosen by the client: repeated verify calls for the
/// same permit resolve to the same session, while distinct permits from the
/// same payer (different cap, deadline, or nonce) never collide onto one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn for_permit(
        network: &ChainId,
        asset: &str,
        payer: &str,
        cap: u128,
        deadline: UnixTimestamp,
        nonce: &str,
    ) -> Self {
        let key = format!("{network}|{asset}|{payer}|{cap}|{deadline}|{nonce}");
        Self(x402_types::util::hash_canonical_json(&serde_json::Value::String(key)))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Accepting settlement attempts.
    Open,
    /// A settlement is in flight; concurrent settlement attempts are rejected.
    Settling,
    /// The session has been swept or explicitly closed; no further
    /// settlements are accepted.
    Closed,
}

#[derive(Debug, Clone)]
pub struct UptoSession {
    pub id: SessionId,
    pub network: ChainId,
    pub payer: String,
    pub pay_to: String,
    pub asset: String,
    /// The signed permit's total authorized value.
    pub cap: u128,
    /// Sum of amounts tracked via [`UptoSessionStore::track_payment`] but not
    /// yet settled — reserved against the cap so concurrent requests can't
    /// overcommit it ahead of settlement.
    pub pending: u128,
    /// Sum of amounts successfully settled so far.
    pub consumed: u128,
    pub status: SessionStatus,
    /// The permit's signature deadline; sessions are swept once this passes.
    pub deadline: UnixTimestamp,
}

impl UptoSession {
    pub fn remaining(&self) -> u128 {
        self.cap.saturating_sub(self.consumed.saturating_add(self.pending))
    }
}

/// Storage for upto sessions (C6). Implementations must make
/// `track_payment`/`begin_settlement` atomic with respect to concurrent
/// callers for the same session.
#[async_trait]
pub trait UptoSessionStore: Send + Sync {
    /// Returns the existing session for this permit, creating one with the
    /// given `cap`/`deadline` if none exists yet.
    #[allow(clippy::too_many_arguments)]
    async fn get_or_create(
        &self,
        network: &ChainId,
        asset: &str,
        payer: &str,
        pay_to: &str,
        cap: u128,
        deadline: UnixTimestamp,
        nonce: &str,
    ) -> Result<UptoSession, ErrorReason>;

    async fn get(&self, id: &SessionId) -> Option<UptoSession>;

    /// Tracks a single request's worth of spend against this permit's
    /// session (original §4.7): creates the session if absent, rejects if it
    /// is settling, closed, past its deadline buffer, or would push
    /// `consumed + pending` over `cap`; otherwise reserves `amount` into
    /// `pending` and returns the updated session.
    #[allow(clippy::too_many_arguments)]
    async fn track_payment(
        &self,
        network: &ChainId,
        asset: &str,
        payer: &str,
        pay_to: &str,
        cap: u128,
        deadline: UnixTimestamp,
        nonce: &str,
        amount: u128,
        deadline_buffer_secs: u64,
    ) -> Result<UptoSession, ErrorReason>;

    /// Reserves `amount` against the session's remaining cap and marks it
    /// `Settling`. Fails if the session is closed, already settling, past
    /// its deadline, or the amount would exceed the cap.
    async fn begin_settlement(&self, id: &SessionId, amount: u128) -> Result<UptoSession, ErrorReason>;

    /// Commits a successful settlement: records `amount` as consumed, clears
    /// it from `pending`, and returns the session to `Open`.
    async fn complete_settlement(&self, id: &SessionId, amount: u128) -> Result<UptoSession, ErrorReason>;

    /// Rolls back a failed settlement attempt without recording consumption.
    async fn fail_settlement(&self, id: &SessionId) -> Result<UptoSession, ErrorReason>;

    /// Marks the session closed; no further settlements are accepted.
    async fn close(&self, id: &SessionId) -> Result<(), ErrorReason>;

    /// Every session still `Open` or `Settling` whose deadline has passed —
    /// consulted by the sweeper (C9) to auto-close abandoned sessions.
    async fn expired(&self, now: UnixTimestamp) -> Vec<UptoSession>;
}

/// In-memory [`UptoSessionStore`], suitable for a single-process facilitator
/// or for tests. Each session is guarded by its own `Mutex` so
/// `begin_settlement` calls for different sessions never contend.
#[derive(Default)]
pub struct InMemoryUptoSessionStore {
    sessions: DashMap<SessionId, Arc<Mutex<UptoSession>>>,
}

impl InMemoryUptoSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_for(
        &self,
        id: &SessionId,
        network: &ChainId,
        asset: &str,
        payer: &str,
        pay_to: &str,
        cap: u128,
        deadline: UnixTimestamp,
    ) -> Arc<Mutex<UptoSession>> {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(UptoSession {
                    id: id.clone(),
                    network: network.clone(),
                    payer: payer.to_string(),
                    pay_to: pay_to.to_string(),
                    asset: asset.to_string(),
                    cap,
                    pending: 0,
                    consumed: 0,
                    status: SessionStatus::Open,
                    deadline,
                }))
            })
            .clone()
    }
}

#[async_trait]
impl UptoSessionStore for InMemoryUptoSessionStore {
    async fn get_or_create(
        &self,
        network: &ChainId,
        asset: &str,
        payer: &str,
        pay_to: &str,
        cap: u128,
        deadline: UnixTimestamp,
        nonce: &str,
    ) -> Result<UptoSession, ErrorReason> {
        let id = SessionId::for_permit(network, asset, payer, cap, deadline, nonce);
        let lock = self.entry_for(&id, network, asset, payer, pay_to, cap, deadline);
        let session = lock.lock().await;
        Ok(session.clone())
    }

    async fn get(&self, id: &SessionId) -> Option<UptoSession> {
        let lock = self.sessions.get(id)?.clone();
        let session = lock.lock().await;
        Some(session.clone())
    }

    async fn track_payment(
        &self,
        network: &ChainId,
        asset: &str,
        payer: &str,
        pay_to: &str,
        cap: u128,
        deadline: UnixTimestamp,
        nonce: &str,
        amount: u128,
        deadline_buffer_secs: u64,
    ) -> Result<UptoSession, ErrorReason> {
        let id = SessionId::for_permit(network, asset, payer, cap, deadline, nonce);
        let lock = self.entry_for(&id, network, asset, payer, pay_to, cap, deadline);
        let mut session = lock.lock().await;
        match session.status {
            SessionStatus::Settling => return Err(ErrorReason::SettlingInProgress),
            SessionStatus::Closed => return Err(ErrorReason::SessionClosed),
            SessionStatus::Open => {}
        }
        let buffered_now = UnixTimestamp::now().as_secs().saturating_add(deadline_buffer_secs);
        if session.deadline.as_secs() <= buffered_now {
            return Err(ErrorReason::DeadlineTooClose);
        }
        let tentative = session
            .consumed
            .saturating_add(session.pending)
            .saturating_add(amount);
        if tentative > session.cap {
            return Err(ErrorReason::CapExhausted);
        }
        session.pending = session.pending.saturating_add(amount);
        Ok(session.clone())
    }

    async fn begin_settlement(&self, id: &SessionId, amount: u128) -> Result<UptoSession, ErrorReason> {
        let lock = self
            .sessions
            .get(id)
            .ok_or(ErrorReason::SessionCreationFailed)?
            .clone();
        let mut session = lock.lock().await;
        match session.status {
            SessionStatus::Closed => return Err(ErrorReason::SessionClosed),
            SessionStatus::Settling => return Err(ErrorReason::SettlingInProgress),
            SessionStatus::Open => {}
        }
        if session.deadline < UnixTimestamp::now() {
            session.status = SessionStatus::Closed;
            return Err(ErrorReason::DeadlineTooClose);
        }
        if amount > session.remaining() {
            return Err(ErrorReason::CapExhausted);
        }
        session.status = SessionStatus::Settling;
        Ok(session.clone())
    }

    async fn complete_settlement(&self, id: &SessionId, amount: u128) -> Result<UptoSession, ErrorReason> {
        let lock = self
            .sessions
            .get(id)
            .ok_or(ErrorReason::SessionCreationFailed)?
            .clone();
        let mut session = lock.lock().await;
        session.consumed = session.consumed.saturating_add(amount);
        session.pending = session.pending.saturating_sub(amount);
        session.status = SessionStatus::Open;
        Ok(session.clone())
    }

    async fn fail_settlement(&self, id: &SessionId) -> Result<UptoSession, ErrorReason> {
        let lock = self
            .sessions
            .get(id)
            .ok_or(ErrorReason::SessionCreationFailed)?
            .clone();
        let mut session = lock.lock().await;
        session.status = SessionStatus::Open;
        Ok(session.clone())
    }

    async fn close(&self, id: &SessionId) -> Result<(), ErrorReason> {
        let lock = self
            .sessions
            .get(id)
            .ok_or(ErrorReason::SessionCreationFailed)?
            .clone();
        let mut session = lock.lock().await;
        session.status = SessionStatus::Closed;
        Ok(())
    }

    async fn expired(&self, now: UnixTimestamp) -> Vec<UptoSession> {
        let mut out = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value().lock().await;
            if session.status != SessionStatus::Closed && session.deadline < now {
                out.push(session.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> ChainId {
        ChainId::new("eip155", "8453")
    }

    #[tokio::test]
    async fn begin_settlement_rejects_amount_above_remaining_cap() {
        let store = InMemoryUptoSessionStore::new();
        let session = store
            .get_or_create(
                &network(),
                "0xasset",
                "0xowner",
                "0xspender",
                100,
                UnixTimestamp::now() + 3600,
                "1",
            )
            .await
            .unwrap();
        let err = store.begin_settlement(&session.id, 200).await.unwrap_err();
        assert_eq!(err, ErrorReason::CapExhausted);
    }

    #[tokio::test]
    async fn concurrent_settlement_is_rejected() {
        let store = InMemoryUptoSessionStore::new();
        let session = store
            .get_or_create(
                &network(),
                "0xasset",
                "0xowner",
                "0xspender",
                100,
                UnixTimestamp::now() + 3600,
                "1",
            )
            .await
            .unwrap();
        store.begin_settlement(&session.id, 50).await.unwrap();
        let err = store.begin_settlement(&session.id, 10).await.unwrap_err();
        assert_eq!(err, ErrorReason::SettlingInProgress);
    }

    #[tokio::test]
    async fn complete_settlement_reduces_remaining_cap() {
        let store = InMemoryUptoSessionStore::new();
        let session = store
            .get_or_create(
                &network(),
                "0xasset",
                "0xowner",
                "0xspender",
                100,
                UnixTimestamp::now() + 3600,
                "1",
            )
            .await
            .unwrap();
        store.begin_settlement(&session.id, 40).await.unwrap();
        let session = store.complete_settlement(&session.id, 40).await.unwrap();
        assert_eq!(session.consumed, 40);
        assert_eq!(session.remaining(), 60);
        assert_eq!(session.status, SessionStatus::Open);
    }

    #[tokio::test]
    async fn closed_session_rejects_settlement() {
        let store = InMemoryUptoSessionStore::new();
        let session = store
            .get_or_create(
                &network(),
                "0xasset",
                "0xowner",
                "0xspender",
                100,
                UnixTimestamp::now() + 3600,
                "1",
            )
            .await
            .unwrap();
        store.close(&session.id).await.unwrap();
        let err = store.begin_settlement(&session.id, 10).await.unwrap_err();
        assert_eq!(err, ErrorReason::SessionClosed);
    }

    #[tokio::test]
    async fn distinct_permits_from_same_payer_get_distinct_sessions() {
        let store = InMemoryUptoSessionStore::new();
        let first = store
            .get_or_create(
                &network(),
                "0xasset",
                "0xowner",
                "0xspender",
                100,
                UnixTimestamp::now() + 3600,
                "1",
            )
            .await
            .unwrap();
        let second = store
            .get_or_create(
                &network(),
                "0xasset",
                "0xowner",
                "0xspender",
                200,
                UnixTimestamp::now() + 3600,
                "2",
            )
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        store.begin_settlement(&first.id, 80).await.unwrap();
        store.complete_settlement(&first.id, 80).await.unwrap();

        // The second permit's session must not have inherited the first's
        // consumed total just because it shares the same payer/spender.
        assert_eq!(second.remaining(), 200);
    }

    #[tokio::test]
    async fn track_payment_accumulates_pending_and_rejects_cap_overrun() {
        let store = InMemoryUptoSessionStore::new();
        let network = network();
        let deadline = UnixTimestamp::now() + 3600;
        let session = store
            .track_payment(&network, "0xasset", "0xowner", "0xspender", 100, deadline, "1", 40, 60)
            .await
            .unwrap();
        assert_eq!(session.pending, 40);
        assert_eq!(session.remaining(), 60);

        let err = store
            .track_payment(&network, "0xasset", "0xowner", "0xspender", 100, deadline, "1", 70, 60)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorReason::CapExhausted);
    }

    #[tokio::test]
    async fn track_payment_rejects_when_within_deadline_buffer() {
        let store = InMemoryUptoSessionStore::new();
        let network = network();
        let deadline = UnixTimestamp::now() + 30;
        let err = store
            .track_payment(&network, "0xasset", "0xowner", "0xspender", 100, deadline, "1", 10, 60)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorReason::DeadlineTooClose);
    }

    #[tokio::test]
    async fn track_payment_rejects_settling_and_closed_sessions() {
        let store = InMemoryUptoSessionStore::new();
        let network = network();
        let deadline = UnixTimestamp::now() + 3600;
        let session = store
            .get_or_create(&network, "0xasset", "0xowner", "0xspender", 100, deadline, "1")
            .await
            .unwrap();

        store.begin_settlement(&session.id, 10).await.unwrap();
        let err = store
            .track_payment(&network, "0xasset", "0xowner", "0xspender", 100, deadline, "1", 5, 60)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorReason::SettlingInProgress);
        store.complete_settlement(&session.id, 10).await.unwrap();

        store.close(&session.id).await.unwrap();
        let err = store
            .track_payment(&network, "0xasset", "0xowner", "0xspender", 100, deadline, "1", 5, 60)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorReason::SessionClosed);
    }
}
