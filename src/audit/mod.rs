//! Query observability
//!
//! Observers receive one event per completed query. They are invoked
//! fire-and-forget; nothing they do can change the answer.

use crate::models::{Query, QueryEvent, QueryOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[async_trait]
pub trait QueryObserver: Send + Sync {
    async fn observe(&self, query: &Query, event: &QueryEvent);
}

/// Logs every query event through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

#[async_trait]
impl QueryObserver for TracingObserver {
    async fn observe(&self, _query: &Query, event: &QueryEvent) {
        let tools = event.tool_calls.len();
        let failed_tools = event.tool_calls.iter().filter(|c| !c.succeeded).count();

        match &event.outcome {
            QueryOutcome::Answered { handler, partial } => info!(
                query_id = %event.query_id,
                handler = %handler,
                partial,
                tools,
                failed_tools,
                latency_ms = event.latency_ms,
                "query answered"
            ),
            QueryOutcome::Failed { kind } => warn!(
                query_id = %event.query_id,
                handler_chosen = ?event.handler_chosen,
                kind = %kind,
                tools,
                failed_tools,
                latency_ms = event.latency_ms,
                "query failed"
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub query: Query,
    pub query_hash: String,
    pub event: QueryEvent,
    pub recorded_at: DateTime<Utc>,
}

/// Records kept by `AuditLog::new`.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

#[derive(Default)]
struct AuditStore {
    records: HashMap<Uuid, AuditRecord>,
    /// Record ids, oldest first.
    order: VecDeque<Uuid>,
}

/// In-memory audit trail keyed by query id. Holds at most `capacity`
/// records; inserting past that evicts the oldest.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<RwLock<AuditStore>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(AuditStore::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn record(&self, query: &Query, event: &QueryEvent) -> Uuid {
        let record = AuditRecord {
            query: query.clone(),
            query_hash: compute_query_hash(query),
            event: event.clone(),
            recorded_at: Utc::now(),
        };

        let mut store = self.store.write().await;
        if store.records.insert(query.query_id, record).is_some() {
            store.order.retain(|id| *id != query.query_id);
        }
        store.order.push_back(query.query_id);

        while store.order.len() > self.capacity {
            if let Some(evicted) = store.order.pop_front() {
                store.records.remove(&evicted);
                debug!(query_id = %evicted, "audit record evicted");
            }
        }

        query.query_id
    }

    pub async fn get(&self, query_id: Uuid) -> Option<AuditRecord> {
        let store = self.store.read().await;
        store.records.get(&query_id).cloned()
    }

    /// Queries answered (or last attempted) by `handler`, oldest first.
    pub async fn list_for_handler(&self, handler: &str) -> Vec<Uuid> {
        let store = self.store.read().await;

        store
            .order
            .iter()
            .filter(|id| {
                store
                    .records
                    .get(*id)
                    .is_some_and(|r| r.event.handler_chosen.as_deref() == Some(handler))
            })
            .copied()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.records.len()
    }

    /// Whether the stored query still matches its recorded hash.
    pub async fn verify_integrity(&self, query_id: Uuid) -> bool {
        let store = self.store.read().await;
        store
            .records
            .get(&query_id)
            .map(|r| compute_query_hash(&r.query) == r.query_hash)
            .unwrap_or(false)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryObserver for AuditLog {
    async fn observe(&self, query: &Query, event: &QueryEvent) {
        self.record(query, event).await;
    }
}

/// SHA256 of the query, streamed straight into the hasher
pub fn compute_query_hash(query: &Query) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), query).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::ToolCallSummary;

    fn event(query: &Query, handler: &str) -> QueryEvent {
        QueryEvent {
            query_id: query.query_id,
            handler_chosen: Some(handler.to_string()),
            tool_calls: vec![ToolCallSummary {
                sequence: 0,
                tool: "stock_price".into(),
                succeeded: true,
                error: None,
                execution_time_ms: 12,
            }],
            outcome: QueryOutcome::Answered {
                handler: handler.to_string(),
                partial: false,
            },
            latency_ms: 40,
        }
    }

    #[tokio::test]
    async fn test_record_and_verify() {
        let log = AuditLog::new();
        let query = Query::new("price of XYZ");
        let id = log.record(&query, &event(&query, "analyst")).await;

        assert_eq!(id, query.query_id);
        assert!(log.verify_integrity(id).await);
        assert!(!log.verify_integrity(Uuid::new_v4()).await);

        let record = log.get(id).await.unwrap();
        assert_eq!(record.event.latency_ms, 40);
        assert_eq!(record.query_hash.len(), 64);
    }

    #[tokio::test]
    async fn test_tampered_record_fails_verification() {
        let log = AuditLog::new();
        let query = Query::new("price of XYZ");
        let id = log.record(&query, &event(&query, "analyst")).await;

        log.store.write().await.records.get_mut(&id).unwrap().query.text = "edited".into();
        assert!(!log.verify_integrity(id).await);
    }

    #[tokio::test]
    async fn test_list_for_handler() {
        let log = AuditLog::new();
        let first = Query::new("one");
        let second = Query::new("two");
        let other = Query::new("three");

        log.observe(&first, &event(&first, "analyst")).await;
        log.observe(&second, &event(&second, "analyst")).await;
        let mut failed = event(&other, "researcher");
        failed.outcome = QueryOutcome::Failed {
            kind: ErrorKind::NoHandlerSucceeded,
        };
        log.observe(&other, &failed).await;

        let ids = log.list_for_handler("analyst").await;
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.query_id) && ids.contains(&second.query_id));
        assert_eq!(log.list_for_handler("researcher").await, vec![other.query_id]);
        assert_eq!(log.len().await, 3);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let log = AuditLog::with_capacity(2);
        let queries: Vec<Query> = ["one", "two", "three"].into_iter().map(Query::new).collect();

        for query in &queries {
            log.record(query, &event(query, "analyst")).await;
        }

        assert_eq!(log.len().await, 2);
        assert!(log.get(queries[0].query_id).await.is_none());
        assert!(log.get(queries[2].query_id).await.is_some());
        assert_eq!(
            log.list_for_handler("analyst").await,
            vec![queries[1].query_id, queries[2].query_id]
        );
    }

    #[tokio::test]
    async fn test_rerecording_refreshes_position() {
        let log = AuditLog::with_capacity(2);
        let first = Query::new("one");
        let second = Query::new("two");
        let third = Query::new("three");

        log.record(&first, &event(&first, "analyst")).await;
        log.record(&second, &event(&second, "analyst")).await;
        log.record(&first, &event(&first, "analyst")).await;
        log.record(&third, &event(&third, "analyst")).await;

        assert!(log.get(first.query_id).await.is_some());
        assert!(log.get(second.query_id).await.is_none());
        assert_eq!(log.len().await, 2);
    }

    #[test]
    fn test_hash_is_stable() {
        let query = Query::new("stable");
        assert_eq!(compute_query_hash(&query), compute_query_hash(&query.clone()));
    }
}
