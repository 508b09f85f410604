//! Ingestion pipeline for ledger-anchored events.
//!
//! Events arrive at least once from the ledger sink. Each one moves through
//! `RECEIVED -> DUPLICATE` or `RECEIVED -> VALIDATED -> STORED -> DISPATCHED
//! -> {PROCESSED, SKIPPED, FAILED}`. Redelivering an authoritative hash never
//! mutates the graph a second time.

mod bundle;
mod dedup;
mod dispatch;
mod reconstruct;
mod runtime;

pub use bundle::BundleSummary;
pub use dedup::{IdempotencyStore, InMemoryIdempotencyCache, DEFAULT_CACHE_CAPACITY};
pub use dispatch::{dispatch, Disposition, HandlerContext};
pub use reconstruct::{decode_payload, event_type_for, reconstruct};
pub use runtime::{IngestHandle, IngestRuntime, IngestRuntimeConfig};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PolarisConfig;
use crate::error::{ErrorKind, ErrorReport, PolarisResult, ValidationError};
use crate::event::{AnchorInfo, EventType, StoredEvent, Verification};
use crate::merge::MergeEngine;
use crate::resolution::DEFAULT_MAX_HOPS;
use crate::storage::{EventStore, GraphStore, PutOutcome};

/// Raw action payload as delivered by the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// An event as extracted from the ledger.
///
/// `content_hash` is authoritative; `event_hash` is advisory only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchoredEvent {
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_hash: Option<String>,
    #[serde(default)]
    pub block_num: u64,
    #[serde(default)]
    pub block_id: String,
    #[serde(default)]
    pub trx_id: String,
    #[serde(default)]
    pub action_ordinal: u32,
    /// Block time, Unix seconds.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub contract_account: String,
    #[serde(default)]
    pub action_name: String,
}

impl AnchoredEvent {
    fn anchor(&self) -> AnchorInfo {
        AnchorInfo {
            block_num: self.block_num,
            block_id: self.block_id.clone(),
            trx_id: self.trx_id.clone(),
            action_ordinal: self.action_ordinal,
            timestamp: self.timestamp,
            source: self.source.clone(),
            contract_account: self.contract_account.clone(),
            action_name: self.action_name.clone(),
        }
    }
}

/// Terminal state of one ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Processed,
    Duplicate,
    Skipped,
    Failed,
}

/// Recomputed hash that disagreed with the ledger-supplied one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashMismatch {
    pub computed: String,
    pub supplied: String,
}

/// Result of [`IngestionPipeline::ingest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub status: IngestStatus,
    pub event_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_mismatch: Option<HashMismatch>,
}

impl IngestOutcome {
    fn new(status: IngestStatus, event_hash: &str) -> Self {
        Self {
            status,
            event_hash: event_hash.to_string(),
            event_type: None,
            processing_result: None,
            error: None,
            hash_mismatch: None,
        }
    }
}

/// Per-pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    processed: AtomicU64,
    duplicates: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    hash_mismatches: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub failed: u64,
    pub hash_mismatches: u64,
}

impl PipelineStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            hash_mismatches: self.hash_mismatches.load(Ordering::Relaxed),
        }
    }

    fn record(&self, status: IngestStatus) {
        let counter = match status {
            IngestStatus::Processed => &self.processed,
            IngestStatus::Duplicate => &self.duplicates,
            IngestStatus::Skipped => &self.skipped,
            IngestStatus::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts from [`IngestionPipeline::restore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Receives anchored events and applies them to the registry exactly once.
pub struct IngestionPipeline {
    graph: Arc<dyn GraphStore>,
    events: Arc<dyn EventStore>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    merge: MergeEngine,
    contract_account: Option<String>,
    max_hops: usize,
    stats: PipelineStats,
}

impl IngestionPipeline {
    /// Creates a pipeline with a default in-process idempotency cache and no
    /// contract filter.
    #[must_use]
    pub fn new(graph: Arc<dyn GraphStore>, events: Arc<dyn EventStore>) -> Self {
        Self {
            merge: MergeEngine::new(Arc::clone(&graph)),
            graph,
            events,
            idempotency: Some(Arc::new(InMemoryIdempotencyCache::default())),
            contract_account: None,
            max_hops: DEFAULT_MAX_HOPS,
            stats: PipelineStats::default(),
        }
    }

    /// Builds a pipeline from configuration.
    #[must_use]
    pub fn from_config(
        graph: Arc<dyn GraphStore>,
        events: Arc<dyn EventStore>,
        config: &PolarisConfig,
    ) -> Self {
        let idempotency: Option<Arc<dyn IdempotencyStore>> = match config.ingest.dedup_cache_capacity {
            0 => None,
            capacity => Some(Arc::new(InMemoryIdempotencyCache::new(capacity))),
        };
        let contract = config.ingest.contract_account.trim();
        Self::new(graph, events)
            .with_idempotency_store(idempotency)
            .with_contract_account((!contract.is_empty()).then(|| contract.to_string()))
            .with_max_hops(config.resolution.max_hops)
    }

    /// Replaces the fast-path idempotency store; `None` disables it.
    #[must_use]
    pub fn with_idempotency_store(mut self, store: Option<Arc<dyn IdempotencyStore>>) -> Self {
        self.idempotency = store;
        self
    }

    /// Only events from this contract account are applied.
    #[must_use]
    pub fn with_contract_account(mut self, account: Option<String>) -> Self {
        self.contract_account = account;
        self
    }

    /// Overrides the resolution hop limit (builder style).
    #[must_use]
    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self.merge = self.merge.with_max_hops(max_hops);
        self
    }

    /// Counters for this pipeline instance.
    #[must_use]
    pub const fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Ingests one anchored event.
    ///
    /// Handler failures are reported in the outcome with status `Failed`;
    /// they do not surface as `Err`.
    ///
    /// # Errors
    /// - Validation: missing hash or payload, malformed payload
    /// - Storage: the event store could not be read or written
    pub fn ingest(&self, anchored: &AnchoredEvent) -> PolarisResult<IngestOutcome> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let hash = anchored.content_hash.trim();

        let span = tracing::info_span!(
            "ingest",
            event_hash = hash,
            block_num = anchored.block_num,
            action = %anchored.action_name,
        );
        let _enter = span.enter();

        let result = self.ingest_inner(anchored, hash);
        match &result {
            Ok(outcome) => {
                self.stats.record(outcome.status);
                tracing::debug!(status = ?outcome.status, "ingest finished");
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, kind = %e.kind(), "ingest rejected");
            }
        }
        result
    }

    fn ingest_inner(&self, anchored: &AnchoredEvent, hash: &str) -> PolarisResult<IngestOutcome> {
        if hash.is_empty() {
            return Err(ValidationError::MissingField {
                field: "content_hash".to_string(),
            }
            .into());
        }
        let Some(payload) = &anchored.payload else {
            return Err(ValidationError::MissingField {
                field: "payload".to_string(),
            }
            .into());
        };

        if let Some(expected) = &self.contract_account {
            if !anchored.contract_account.is_empty() && anchored.contract_account != *expected {
                tracing::debug!(contract = %anchored.contract_account, "event from foreign contract");
                return Ok(IngestOutcome::new(IngestStatus::Skipped, hash));
            }
        }

        if self.is_duplicate(hash)? {
            tracing::debug!("duplicate delivery");
            return Ok(IngestOutcome::new(IngestStatus::Duplicate, hash));
        }

        let fields = decode_payload(payload)?;
        let event = reconstruct(anchored, fields)?;

        let computed = event.canonical_hash()?;
        let hash_mismatch = (computed != hash).then(|| {
            self.stats.hash_mismatches.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                computed = %computed,
                supplied = hash,
                advisory = anchored.event_hash.as_deref().unwrap_or(""),
                "reconstructed hash differs from ledger hash; trusting the ledger"
            );
            HashMismatch {
                computed,
                supplied: hash.to_string(),
            }
        });

        let stored = StoredEvent {
            hash: hash.to_string(),
            event: event.clone(),
            verification: Verification::ExternallyVerified {
                anchor: anchored.anchor(),
            },
            stored_at: Utc::now(),
        };
        if self.events.put(stored)? == PutOutcome::AlreadyPresent {
            // Lost a race with a concurrent delivery of the same hash.
            self.remember(hash);
            return Ok(IngestOutcome::new(IngestStatus::Duplicate, hash));
        }

        let ctx = HandlerContext {
            graph: self.graph.as_ref(),
            merge: &self.merge,
            max_hops: self.max_hops,
            event_hash: hash,
        };
        let mut outcome = match dispatch(&ctx, &event) {
            Ok(Disposition::Processed(result)) => IngestOutcome {
                processing_result: Some(result),
                ..IngestOutcome::new(IngestStatus::Processed, hash)
            },
            Ok(Disposition::Skipped(reason)) => {
                tracing::debug!(reason = %reason, "event skipped");
                IngestOutcome {
                    processing_result: Some(serde_json::json!({ "reason": reason })),
                    ..IngestOutcome::new(IngestStatus::Skipped, hash)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, kind = %e.kind(), event_type = %event.event_type, "handler failed");
                IngestOutcome {
                    error: Some(e.report()),
                    ..IngestOutcome::new(IngestStatus::Failed, hash)
                }
            }
        };
        outcome.event_type = Some(event.event_type);
        outcome.hash_mismatch = hash_mismatch;

        self.remember(hash);
        Ok(outcome)
    }

    /// Re-applies already stored events to the graph, in the order given.
    ///
    /// Used at startup when the graph is volatile but the event store is
    /// durable: every stored hash now dedups as `Duplicate`, so the graph has
    /// to be rebuilt before new deliveries arrive. Handlers seed their ids
    /// from the event hash, so the rebuilt graph carries the same ids as
    /// before. Events that failed originally fail again without leaving state.
    /// Nothing is written to the event store and the counters are untouched.
    ///
    /// # Errors
    /// Storage: the graph backend failed; the rebuild stops at that event.
    pub fn restore<I>(&self, stored: I) -> PolarisResult<RestoreSummary>
    where
        I: IntoIterator<Item = StoredEvent>,
    {
        let mut summary = RestoreSummary::default();
        for stored in stored {
            let ctx = HandlerContext {
                graph: self.graph.as_ref(),
                merge: &self.merge,
                max_hops: self.max_hops,
                event_hash: &stored.hash,
            };
            match dispatch(&ctx, &stored.event) {
                Ok(Disposition::Processed(_)) => summary.applied += 1,
                Ok(Disposition::Skipped(_)) => summary.skipped += 1,
                Err(e) if e.kind() == ErrorKind::Storage => {
                    tracing::error!(event_hash = %stored.hash, error = %e, "restore aborted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(event_hash = %stored.hash, error = %e, "stored event failed again");
                    summary.failed += 1;
                }
            }
            self.remember(&stored.hash);
        }
        tracing::info!(
            applied = summary.applied,
            skipped = summary.skipped,
            failed = summary.failed,
            "graph restored from stored events"
        );
        Ok(summary)
    }

    fn is_duplicate(&self, hash: &str) -> PolarisResult<bool> {
        if self.idempotency.as_ref().is_some_and(|c| c.contains(hash)) {
            return Ok(true);
        }
        if self.events.contains(hash)? {
            self.remember(hash);
            return Ok(true);
        }
        Ok(false)
    }

    fn remember(&self, hash: &str) {
        if let Some(cache) = &self.idempotency {
            cache.insert(hash);
        }
    }
}
