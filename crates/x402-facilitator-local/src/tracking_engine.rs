//! Tracking engine (C10): an audit trail of every request reaching the HTTP
//! pipeline. Writes for a single record are strictly ordered
//! (`create -> record_verification -> record_settlement/record_upto_session
//! -> finalize`) but never block the request path: each call enqueues a job
//! onto a small per-record channel drained by a single background worker,
//! mirroring a promise chain.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Digest;
use tokio::sync::mpsc;
use uuid::Uuid;

use x402_types::timestamp::UnixTimestamp;

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("tracking store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
}

/// One row of the audit trail (original "ResourceCallRecord").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCallRecord {
    pub id: Uuid,
    pub method: String,
    pub path: String,
    pub route_key: String,
    pub url: String,
    pub timestamp: UnixTimestamp,
    pub payment_required: bool,
    pub payment_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upto_session: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    pub handler_executed: bool,
    pub request: RequestInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    // Filterable facets, denormalized from `payment`/`settlement` so the
    // store doesn't need to parse arbitrary JSON to list/filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_success: Option<bool>,

    // x402 audit fields, set by `record_verification`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x402_version: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_valid_before: Option<UnixTimestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_signature_hash: Option<String>,
}

/// Fields written by `recordVerification`: merged payment details plus the
/// six x402 audit fields (canonical-JSON hashes of payload/requirements, and
/// a hash of the raw signature bytes).
#[derive(Debug, Clone, Default)]
pub struct VerificationUpdate {
    pub payment_verified: bool,
    pub verification_error: Option<String>,
    pub payment: Option<Value>,
    pub network: Option<String>,
    pub scheme: Option<String>,
    pub asset: Option<String>,
    pub payer: Option<String>,
    pub x402_version: Option<u8>,
    pub payment_nonce: Option<String>,
    pub payment_valid_before: Option<UnixTimestamp>,
    pub payload: Option<Value>,
    pub requirements: Option<Value>,
    pub payment_signature: Option<Vec<u8>>,
}

impl VerificationUpdate {
    /// Computes the three SHA-256 canonical-JSON/raw-bytes hashes from the
    /// payload, requirements and signature captured on this update.
    pub fn apply_to(self, record: &mut ResourceCallRecord) {
        record.payment_verified = self.payment_verified;
        record.verification_error = self.verification_error;
        record.payment = self.payment;
        record.network = self.network;
        record.scheme = self.scheme;
        record.asset = self.asset;
        record.payer = self.payer;
        record.x402_version = self.x402_version;
        record.payment_nonce = self.payment_nonce;
        record.payment_valid_before = self.payment_valid_before;
        record.payload_hash = self
            .payload
            .as_ref()
            .map(x402_types::util::hash_canonical_json);
        record.requirements_hash = self
            .requirements
            .as_ref()
            .map(x402_types::util::hash_canonical_json);
        record.payment_signature_hash = self
            .payment_signature
            .as_ref()
            .map(|bytes| hex::encode(sha2::Sha256::digest(bytes)));
    }
}

#[derive(Debug, Clone, Default)]
pub struct SettlementUpdate {
    pub settlement: Option<Value>,
    pub settlement_success: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct FinalizeUpdate {
    pub response_status: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub handler_executed: bool,
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub path: Option<String>,
    pub method: Option<String>,
    pub network: Option<String>,
    pub scheme: Option<String>,
    pub payment_required: Option<bool>,
    pub payment_verified: Option<bool>,
    pub settlement_success: Option<bool>,
    pub payer: Option<String>,
    pub since: Option<UnixTimestamp>,
    pub until: Option<UnixTimestamp>,
    pub sort_by: SortField,
    pub descending: bool,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    Timestamp,
    ResponseTimeMs,
    Path,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            path: None,
            method: None,
            network: None,
            scheme: None,
            payment_required: None,
            payment_verified: None,
            settlement_success: None,
            payer: None,
            since: None,
            until: None,
            sort_by: SortField::Timestamp,
            descending: true,
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub records: Vec<ResourceCallRecord>,
    pub has_more: bool,
    pub next_cursor: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackingStats {
    pub total: u64,
    pub payment_required: u64,
    pub payment_verified: u64,
    pub settled: u64,
    pub failed: u64,
    pub by_path: BTreeMap<String, u64>,
    pub by_network: BTreeMap<String, u64>,
    pub by_scheme: BTreeMap<String, u64>,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    /// Total settled volume, keyed by network and by `network:asset`,
    /// expressed as decimal-string bigints (amounts may exceed u64/f64
    /// precision).
    pub volume_by_network: BTreeMap<String, String>,
    pub volume_by_network_asset: BTreeMap<String, String>,
}

/// Pluggable persistence for resource call records. The in-memory
/// implementation is the only one shipped; a SQL-backed implementation is
/// intentionally out of scope.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn create(&self, record: ResourceCallRecord) -> Result<(), TrackingError>;
    async fn update(
        &self,
        id: Uuid,
        mutator: Box<dyn FnOnce(&mut ResourceCallRecord) + Send>,
    ) -> Result<(), TrackingError>;
    async fn list(&self, options: ListOptions) -> ListResult;
    async fn get_stats(&self, start: UnixTimestamp, end: UnixTimestamp) -> TrackingStats;
    async fn prune(&self, older_than: UnixTimestamp) -> u64;
}

#[derive(Default)]
pub struct InMemoryTrackingStore {
    records: DashMap<Uuid, ResourceCallRecord>,
}

impl InMemoryTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrackingStore for InMemoryTrackingStore {
    async fn create(&self, record: ResourceCallRecord) -> Result<(), TrackingError> {
        self.records.insert(record.id, record);
        Ok(())
    }

    async fn update(
        &self,
        id: Uuid,
        mutator: Box<dyn FnOnce(&mut ResourceCallRecord) + Send>,
    ) -> Result<(), TrackingError> {
        let mut entry = self.records.get_mut(&id).ok_or(TrackingError::NotFound(id))?;
        mutator(&mut entry);
        Ok(())
    }

    async fn list(&self, options: ListOptions) -> ListResult {
        let mut matched: Vec<ResourceCallRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|r| options.path.as_deref().is_none_or(|p| r.path == p))
            .filter(|r| options.method.as_deref().is_none_or(|m| r.method == m))
            .filter(|r| {
                options
                    .network
                    .as_deref()
                    .is_none_or(|n| r.network.as_deref() == Some(n))
            })
            .filter(|r| {
                options
                    .scheme
                    .as_deref()
                    .is_none_or(|s| r.scheme.as_deref() == Some(s))
            })
            .filter(|r| options.payment_required.is_none_or(|v| r.payment_required == v))
            .filter(|r| options.payment_verified.is_none_or(|v| r.payment_verified == v))
            .filter(|r| options.settlement_success.is_none_or(|v| r.settlement_success == Some(v)))
            .filter(|r| {
                options
                    .payer
                    .as_deref()
                    .is_none_or(|p| r.payer.as_deref() == Some(p))
            })
            .filter(|r| options.since.is_none_or(|since| r.timestamp >= since))
            .filter(|r| options.until.is_none_or(|until| r.timestamp <= until))
            .collect();

        matched.sort_by(|a, b| match options.sort_by {
            SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
            SortField::ResponseTimeMs => a.response_time_ms.cmp(&b.response_time_ms),
            SortField::Path => a.path.cmp(&b.path),
        });
        if options.descending {
            matched.reverse();
        }

        let limit = options.limit.min(100).max(1);
        let total = matched.len();
        let page: Vec<ResourceCallRecord> = matched
            .into_iter()
            .skip(options.offset)
            .take(limit)
            .collect();
        let has_more = options.offset + page.len() < total;
        let next_cursor = has_more.then_some(options.offset + page.len());

        ListResult {
            records: page,
            has_more,
            next_cursor,
        }
    }

    async fn get_stats(&self, start: UnixTimestamp, end: UnixTimestamp) -> TrackingStats {
        let records: Vec<ResourceCallRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .collect();

        let mut stats = TrackingStats {
            total: records.len() as u64,
            ..Default::default()
        };
        let mut response_times: Vec<u64> = Vec::new();
        for record in &records {
            if record.payment_required {
                stats.payment_required += 1;
            }
            if record.payment_verified {
                stats.payment_verified += 1;
            }
            match record.settlement_success {
                Some(true) => stats.settled += 1,
                Some(false) => stats.failed += 1,
                None => {}
            }
            *stats.by_path.entry(record.path.clone()).or_insert(0) += 1;
            if let Some(network) = &record.network {
                *stats.by_network.entry(network.clone()).or_insert(0) += 1;
            }
            if let Some(scheme) = &record.scheme {
                *stats.by_scheme.entry(scheme.clone()).or_insert(0) += 1;
            }
            if let Some(ms) = record.response_time_ms {
                response_times.push(ms);
            }
        }

        if !response_times.is_empty() {
            let sum: u64 = response_times.iter().sum();
            stats.avg_response_time_ms = sum as f64 / response_times.len() as f64;
            response_times.sort_unstable();
            let idx = ((response_times.len() as f64) * 0.95).ceil() as usize;
            let idx = idx.saturating_sub(1).min(response_times.len() - 1);
            stats.p95_response_time_ms = response_times[idx] as f64;
        }

        stats
    }

    async fn prune(&self, older_than: UnixTimestamp) -> u64 {
        let stale: Vec<Uuid> = self
            .records
            .iter()
            .filter(|entry| entry.value().timestamp < older_than)
            .map(|entry| *entry.key())
            .collect();
        for id in &stale {
            self.records.remove(id);
        }
        stale.len() as u64
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct EngineInner {
    store: Arc<dyn TrackingStore>,
    on_error: Arc<dyn Fn(TrackingError, Uuid) + Send + Sync>,
    queues: DashMap<Uuid, mpsc::Sender<Job>>,
}

/// Serializes writes for a given record id through a small bounded channel
/// drained by a single worker, so the request path enqueues and moves on.
#[derive(Clone)]
pub struct TrackingEngine {
    inner: Arc<EngineInner>,
}

impl TrackingEngine {
    pub fn new(store: Arc<dyn TrackingStore>) -> Self {
        Self::with_on_error(
            store,
            Arc::new(|err, id| {
                #[cfg(feature = "telemetry")]
                tracing::warn!(record_id = %id, error = %err, "tracking write failed");
                #[cfg(not(feature = "telemetry"))]
                let _ = (err, id);
            }),
        )
    }

    pub fn with_on_error(
        store: Arc<dyn TrackingStore>,
        on_error: Arc<dyn Fn(TrackingError, Uuid) + Send + Sync>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                on_error,
                queues: DashMap::new(),
            }),
        }
    }

    fn enqueue(&self, id: Uuid, job: Job) {
        let sender = self
            .inner
            .queues
            .entry(id)
            .or_insert_with(|| {
                let (tx, mut rx) = mpsc::channel::<Job>(32);
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        job.await;
                    }
                });
                tx
            })
            .clone();
        // `try_send` keeps `enqueue` synchronous (never blocks the request
        // path); a full queue means per-record tracking is backed up far
        // beyond the ordering this engine is meant to provide, so the job is
        // dropped and surfaced via `on_error` instead of awaited.
        if sender.try_send(job).is_err() {
            (self.inner.on_error)(TrackingError::Store("tracking queue full".into()), id);
        }
    }

    pub fn create(&self, record: ResourceCallRecord) {
        let id = record.id;
        let store = self.inner.store.clone();
        let on_error = self.inner.on_error.clone();
        self.enqueue(
            id,
            Box::pin(async move {
                if let Err(err) = store.create(record).await {
                    on_error(err, id);
                }
            }),
        );
    }

    pub fn record_verification(&self, id: Uuid, update: VerificationUpdate) {
        let store = self.inner.store.clone();
        let on_error = self.inner.on_error.clone();
        self.enqueue(
            id,
            Box::pin(async move {
                let result = store
                    .update(id, Box::new(move |record| update.apply_to(record)))
                    .await;
                if let Err(err) = result {
                    on_error(err, id);
                }
            }),
        );
    }

    pub fn record_settlement(&self, id: Uuid, update: SettlementUpdate) {
        let store = self.inner.store.clone();
        let on_error = self.inner.on_error.clone();
        self.enqueue(
            id,
            Box::pin(async move {
                let result = store
                    .update(
                        id,
                        Box::new(move |record| {
                            record.settlement = update.settlement;
                            record.settlement_success = update.settlement_success;
                        }),
                    )
                    .await;
                if let Err(err) = result {
                    on_error(err, id);
                }
            }),
        );
    }

    pub fn record_upto_session(&self, id: Uuid, upto_session: Value) {
        let store = self.inner.store.clone();
        let on_error = self.inner.on_error.clone();
        self.enqueue(
            id,
            Box::pin(async move {
                let result = store
                    .update(
                        id,
                        Box::new(move |record| record.upto_session = Some(upto_session)),
                    )
                    .await;
                if let Err(err) = result {
                    on_error(err, id);
                }
            }),
        );
    }

    pub fn finalize(&self, id: Uuid, update: FinalizeUpdate) {
        let store = self.inner.store.clone();
        let on_error = self.inner.on_error.clone();
        self.enqueue(
            id,
            Box::pin(async move {
                let result = store
                    .update(
                        id,
                        Box::new(move |record| {
                            record.response_status = update.response_status;
                            record.response_time_ms = update.response_time_ms;
                            record.handler_executed = update.handler_executed;
                        }),
                    )
                    .await;
                if let Err(err) = result {
                    on_error(err, id);
                }
            }),
        );
        // `finalize` is the last op in the chain for this record; drop its
        // queue shortly after so the worker task and channel don't linger.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            inner.queues.remove(&id);
        });
    }

    pub async fn list(&self, options: ListOptions) -> ListResult {
        self.inner.store.list(options).await
    }

    pub async fn get_stats(&self, start: UnixTimestamp, end: UnixTimestamp) -> TrackingStats {
        self.inner.store.get_stats(start, end).await
    }

    /// Runs `store.prune` on a fixed interval until `cancellation` fires —
    /// the optional auto-prune background tick.
    pub async fn run_auto_prune(
        &self,
        retention: std::time::Duration,
        interval: std::time::Duration,
        cancellation: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = ticker.tick() => {
                    let retention_secs = retention.as_secs();
                    let older_than = UnixTimestamp::now().as_secs().saturating_sub(retention_secs);
                    let pruned = self.inner.store.prune(UnixTimestamp::from_secs(older_than)).await;
                    if pruned > 0 {
                        #[cfg(feature = "telemetry")]
                        tracing::info!(pruned, "pruned stale tracking records");
                        #[cfg(not(feature = "telemetry"))]
                        let _ = pruned;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: Uuid) -> ResourceCallRecord {
        ResourceCallRecord {
            id,
            method: "GET".into(),
            path: "/paid".into(),
            route_key: "GET /paid".into(),
            url: "https://example.com/paid".into(),
            timestamp: UnixTimestamp::from_secs(1000),
            payment_required: true,
            payment_verified: false,
            verification_error: None,
            payment: None,
            settlement: None,
            upto_session: None,
            response_status: None,
            response_time_ms: None,
            handler_executed: false,
            request: RequestInfo::default(),
            route_config: None,
            metadata: None,
            network: None,
            scheme: None,
            asset: None,
            payer: None,
            settlement_success: None,
            x402_version: None,
            payment_nonce: None,
            payment_valid_before: None,
            payload_hash: None,
            requirements_hash: None,
            payment_signature_hash: None,
        }
    }

    #[tokio::test]
    async fn create_then_verify_then_finalize_is_visible_in_order() {
        let store: Arc<dyn TrackingStore> = Arc::new(InMemoryTrackingStore::new());
        let engine = TrackingEngine::new(store.clone());
        let id = Uuid::new_v4();

        engine.create(record(id));
        engine.record_verification(
            id,
            VerificationUpdate {
                payment_verified: true,
                network: Some("eip155:8453".into()),
                scheme: Some("exact".into()),
                payload: Some(serde_json::json!({"a": 1, "b": 2})),
                requirements: Some(serde_json::json!({"b": 2, "a": 1})),
                ..Default::default()
            },
        );
        engine.finalize(
            id,
            FinalizeUpdate {
                response_status: Some(200),
                response_time_ms: Some(12),
                handler_executed: true,
            },
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let result = store
            .list(ListOptions {
                network: Some("eip155:8453".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(result.records.len(), 1);
        let stored = &result.records[0];
        assert!(stored.payment_verified);
        assert_eq!(stored.response_status, Some(200));
        assert!(stored.payload_hash.is_some());
        assert_eq!(stored.payload_hash, stored.requirements_hash);
    }

    #[tokio::test]
    async fn prune_removes_records_older_than_cutoff() {
        let store = InMemoryTrackingStore::new();
        store.create(record(Uuid::new_v4())).await.unwrap();
        let pruned = store.prune(UnixTimestamp::from_secs(2000)).await;
        assert_eq!(pruned, 1);
        let result = store.list(ListOptions::default()).await;
        assert!(result.records.is_empty());
    }
}
