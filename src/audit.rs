//! Append-only audit trail for permission decisions.
//!
//! Events are buffered in memory and drained to an `AuditStorage` backend
//! by a background writer, so a slow or unavailable backend never adds
//! latency to a permission check. Persisted events form a SHA-256 hash
//! chain for tamper evidence. Under sustained backend outage the buffer
//! drops its oldest events and counts the drops; audit completeness is
//! best-effort, never a reason to block a check.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ring::digest;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AuthzConfig;
use crate::errors::AuthzError;
use crate::metrics::METRICS;
use crate::model::{AuditEvent, AuditRecord, Outcome};

/// Hex SHA-256 chain anchor for the first event.
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Durable backend for audit events. Append-only: no implementation may
/// mutate or delete an event after write. No specific engine is mandated;
/// the in-memory implementation below doubles as the test backend.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Persist a chained batch, in order.
    async fn append(&self, events: &[AuditEvent]) -> Result<(), AuthzError>;
    /// Events matching the filter, ordered by sequence number.
    async fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditEvent>, AuthzError>;
}

/// Filters for audit queries. `offset`/`limit` paginate the match set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub outcome: Option<Outcome>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            outcome: None,
            from: None,
            to: None,
            offset: 0,
            limit: 100,
        }
    }
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(user_id) = &self.user_id {
            if &event.decision.user_id != user_id {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if event.decision.outcome != outcome {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.recorded_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.recorded_at > to {
                return false;
            }
        }
        true
    }
}

/// One page of audit query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPage {
    pub events: Vec<AuditEvent>,
    /// Total matches before pagination.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

/// Result of a hash chain verification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub events_checked: u64,
    pub first_broken_sequence: Option<u64>,
}

/// In-memory append-only backend. `set_available(false)` simulates a
/// storage outage for the retry/backoff path.
#[derive(Default)]
pub struct InMemoryAuditStorage {
    events: RwLock<Vec<AuditEvent>>,
    available: AtomicBool,
}

impl InMemoryAuditStorage {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Test hook: corrupt a stored event in place to prove the chain
    /// verification catches tampering. Real backends never mutate.
    #[doc(hidden)]
    pub async fn tamper_with(&self, sequence: u64, reason: &str) {
        let mut events = self.events.write().await;
        if let Some(event) = events.iter_mut().find(|e| e.sequence == sequence) {
            event.decision.reason = reason.to_string();
        }
    }
}

#[async_trait]
impl AuditStorage for InMemoryAuditStorage {
    async fn append(&self, batch: &[AuditEvent]) -> Result<(), AuthzError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AuthzError::StorageUnavailable {
                reason: "in-memory backend marked unavailable".into(),
            });
        }
        self.events.write().await.extend_from_slice(batch);
        Ok(())
    }

    async fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditEvent>, AuthzError> {
        let events = self.events.read().await;
        let mut matched: Vec<AuditEvent> = events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.sequence);
        Ok(matched)
    }
}

struct ChainState {
    next_sequence: u64,
    last_hash: String,
}

/// Append-only, ordered audit log, decoupled from the resolver's hot
/// path by a buffer and a background writer task.
pub struct AuditLog {
    storage: Arc<dyn AuditStorage>,
    buffer: Arc<RwLock<VecDeque<AuditRecord>>>,
    chain: Arc<RwLock<ChainState>>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
    /// Serializes drain→chain→persist→advance so concurrent flushes can
    /// never assign the same sequence number or fork the hash chain.
    flush_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    pub fn new(storage: Arc<dyn AuditStorage>, config: &AuthzConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let log = Arc::new(Self {
            storage,
            buffer: Arc::new(RwLock::new(VecDeque::new())),
            chain: Arc::new(RwLock::new(ChainState {
                next_sequence: 0,
                last_hash: GENESIS_HASH.to_string(),
            })),
            dropped: Arc::new(AtomicU64::new(0)),
            capacity: config.audit_buffer_capacity,
            flush_lock: Mutex::new(()),
            shutdown_tx,
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::writer_loop(
            Arc::clone(&log),
            shutdown_rx,
            config.audit_flush_interval,
            config.audit_retry_base,
            config.audit_retry_max,
        ));
        // Stash the worker handle without blocking: new() runs on the
        // runtime, so try_lock on a fresh mutex always succeeds.
        if let Ok(mut slot) = log.worker.try_lock() {
            *slot = Some(handle);
        }
        log
    }

    /// Fire-and-forget append. Pushes into the buffer; on overflow the
    /// oldest not-yet-persisted record is dropped and counted.
    pub async fn append(&self, record: AuditRecord) {
        let mut buffer = self.buffer.write().await;
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            METRICS.audit_events_dropped_total.inc();
            warn!(dropped_total = total, "audit buffer full; oldest event dropped");
        }
        buffer.push_back(record);
    }

    /// Monotonically increasing count of events dropped on overflow.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain the buffer to storage immediately. Used by the writer task,
    /// by shutdown, and by tests that must not depend on flush timing.
    /// Concurrent calls are serialized; a flush that starts while another
    /// is persisting waits and then picks up whatever arrived meanwhile.
    pub async fn flush(&self) -> Result<usize, AuthzError> {
        let _guard = self.flush_lock.lock().await;
        let batch: Vec<AuditRecord> = {
            let mut buffer = self.buffer.write().await;
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let chained = {
            let chain = self.chain.read().await;
            chain_batch(&batch, chain.next_sequence, &chain.last_hash)
        };

        match self.storage.append(&chained).await {
            Ok(()) => {
                let mut chain = self.chain.write().await;
                if let Some(last) = chained.last() {
                    chain.next_sequence = last.sequence + 1;
                    chain.last_hash = last.event_hash.clone();
                }
                debug!(persisted = chained.len(), "audit batch persisted");
                Ok(chained.len())
            }
            Err(e) => {
                METRICS.audit_write_failures_total.inc();
                // Requeue at the front, unchained, preserving order; the
                // chain only advances on successful persistence.
                let mut buffer = self.buffer.write().await;
                for record in batch.into_iter().rev() {
                    buffer.push_front(record);
                }
                while buffer.len() > self.capacity {
                    buffer.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    METRICS.audit_events_dropped_total.inc();
                }
                Err(e)
            }
        }
    }

    async fn writer_loop(
        log: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
        flush_interval: std::time::Duration,
        retry_base: std::time::Duration,
        retry_max: std::time::Duration,
    ) {
        let mut interval = tokio::time::interval(flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = retry_base;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.changed() => {
                    if let Err(e) = log.flush().await {
                        warn!(error = %e, "final audit flush failed; buffered events lost");
                    }
                    break;
                }
            }
            match log.flush().await {
                Ok(_) => backoff = retry_base,
                Err(e) => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64,
                        "audit storage write failed; backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, retry_max);
                }
            }
        }
        info!("audit writer stopped");
    }

    /// Stop the writer after a final flush.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Paginated query over persisted events.
    pub async fn query(&self, filter: &AuditQuery) -> Result<AuditPage, AuthzError> {
        let matched = self.storage.query(filter).await?;
        let total = matched.len();
        let events: Vec<AuditEvent> = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect();
        Ok(AuditPage {
            events,
            total,
            offset: filter.offset,
            limit: filter.limit,
        })
    }

    /// Export every event matching the filter (pagination ignored).
    pub async fn export(
        &self,
        format: ExportFormat,
        filter: &AuditQuery,
    ) -> Result<String, AuthzError> {
        let mut unpaged = filter.clone();
        unpaged.offset = 0;
        unpaged.limit = usize::MAX;
        let events = self.storage.query(&unpaged).await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&events)?),
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                writer
                    .write_record([
                        "sequence",
                        "id",
                        "recorded_at",
                        "user_id",
                        "resource",
                        "action",
                        "outcome",
                        "reason",
                        "matched_rule",
                        "cache_hit",
                        "latency_micros",
                        "event_hash",
                    ])
                    .map_err(|e| AuthzError::StorageUnavailable {
                        reason: format!("csv export failed: {e}"),
                    })?;
                for event in &events {
                    writer
                        .write_record([
                            event.sequence.to_string(),
                            event.id.to_string(),
                            event.recorded_at.to_rfc3339(),
                            event.decision.user_id.clone(),
                            event.decision.resource.clone(),
                            event.decision.action.to_string(),
                            event.decision.outcome.to_string(),
                            event.decision.reason.clone(),
                            event.decision.matched_rule.clone().unwrap_or_default(),
                            event.cache_hit.to_string(),
                            event.latency_micros.to_string(),
                            event.event_hash.clone(),
                        ])
                        .map_err(|e| AuthzError::StorageUnavailable {
                            reason: format!("csv export failed: {e}"),
                        })?;
                }
                let bytes = writer
                    .into_inner()
                    .map_err(|e| AuthzError::StorageUnavailable {
                        reason: format!("csv export failed: {e}"),
                    })?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }

    /// Heuristic anomaly score for a user over a recent window, bounded
    /// 0–100: deny frequency plus distinct denied-resource diversity.
    pub async fn risk_score(
        &self,
        user_id: &str,
        window: ChronoDuration,
    ) -> Result<u8, AuthzError> {
        let filter = AuditQuery {
            user_id: Some(user_id.to_string()),
            outcome: Some(Outcome::Deny),
            from: Some(Utc::now() - window),
            ..Default::default()
        };
        let denies = self.storage.query(&filter).await?;
        let deny_count = denies.len() as u32;
        let distinct_resources = denies
            .iter()
            .map(|e| e.decision.resource.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len() as u32;

        let frequency = std::cmp::min(60, deny_count * 6);
        let diversity = std::cmp::min(40, distinct_resources * 10);
        Ok(std::cmp::min(100, frequency + diversity) as u8)
    }

    /// Walk the persisted chain and recompute every hash.
    pub async fn verify_chain(&self) -> Result<ChainVerification, AuthzError> {
        let all = AuditQuery {
            limit: usize::MAX,
            ..Default::default()
        };
        let events = self.storage.query(&all).await?;
        let mut previous = GENESIS_HASH.to_string();
        for event in &events {
            let expected = event_hash(event_body(event), &previous);
            if event.previous_hash != previous || event.event_hash != expected {
                return Ok(ChainVerification {
                    valid: false,
                    events_checked: events.len() as u64,
                    first_broken_sequence: Some(event.sequence),
                });
            }
            previous = event.event_hash.clone();
        }
        Ok(ChainVerification {
            valid: true,
            events_checked: events.len() as u64,
            first_broken_sequence: None,
        })
    }
}

/// Canonical hashable body of an event. Field order is fixed by the
/// struct; the attribute map is a BTreeMap, so serialization is stable.
#[derive(Serialize)]
struct EventBody<'a> {
    id: &'a uuid::Uuid,
    sequence: u64,
    decision: &'a crate::model::Decision,
    caller_attributes: &'a std::collections::BTreeMap<String, String>,
    latency_micros: u64,
    cache_hit: bool,
    recorded_at: &'a DateTime<Utc>,
}

fn event_body(event: &AuditEvent) -> EventBody<'_> {
    EventBody {
        id: &event.id,
        sequence: event.sequence,
        decision: &event.decision,
        caller_attributes: &event.caller_attributes,
        latency_micros: event.latency_micros,
        cache_hit: event.cache_hit,
        recorded_at: &event.recorded_at,
    }
}

fn event_hash(body: EventBody<'_>, previous_hash: &str) -> String {
    let mut material = previous_hash.as_bytes().to_vec();
    // Serialization of a struct with a BTreeMap field is deterministic.
    material.extend_from_slice(&serde_json::to_vec(&body).unwrap_or_default());
    hex::encode(digest::digest(&digest::SHA256, &material).as_ref())
}

fn chain_batch(batch: &[AuditRecord], start_sequence: u64, last_hash: &str) -> Vec<AuditEvent> {
    let mut previous = last_hash.to_string();
    let mut chained = Vec::with_capacity(batch.len());
    for (idx, record) in batch.iter().enumerate() {
        let sequence = start_sequence + idx as u64;
        let mut event = AuditEvent {
            id: record.id,
            sequence,
            decision: record.decision.clone(),
            caller_attributes: record.caller_attributes.clone(),
            latency_micros: record.latency_micros,
            cache_hit: record.cache_hit,
            previous_hash: previous.clone(),
            event_hash: String::new(),
            recorded_at: record.recorded_at,
        };
        event.event_hash = event_hash(event_body(&event), &previous);
        previous = event.event_hash.clone();
        chained.push(event);
    }
    chained
}
