//! In-process document store.
//!
//! Backs the service binary when no remote backend is configured and serves as
//! the reference implementation of [`DocumentStore`] semantics in tests.

use async_trait::async_trait;
use dashmap::DashMap;
use docshield_core::{
    apply_constraints, Document, DocumentId, DocumentStore, QueryConstraint, StoreError,
    StoreResult,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Per-operation call counters.
#[derive(Debug, Default)]
struct StoreCounters {
    gets: AtomicU64,
    queries: AtomicU64,
    inserts: AtomicU64,
    patches: AtomicU64,
    removes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub gets: u64,
    pub queries: u64,
    pub inserts: u64,
    pub patches: u64,
    pub removes: u64,
}

impl StoreStats {
    pub fn reads(&self) -> u64 {
        self.gets + self.queries
    }

    pub fn writes(&self) -> u64 {
        self.inserts + self.patches + self.removes
    }
}

/// Document store keeping every collection in memory.
///
/// Documents inside a collection are ordered by id so unordered queries are
/// deterministic.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: DashMap<String, BTreeMap<DocumentId, Value>>,
    counters: StoreCounters,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts documents directly, bypassing counters.
    pub fn seed(&self, collection: &str, documents: impl IntoIterator<Item = Document>) {
        let mut entry = self.collections.entry(collection.to_string()).or_default();
        for doc in documents {
            entry.insert(doc.id, doc.data);
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            gets: self.counters.gets.load(Ordering::Relaxed),
            queries: self.counters.queries.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            patches: self.counters.patches.load(Ordering::Relaxed),
            removes: self.counters.removes.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &DocumentId) -> StoreResult<Option<Document>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id).cloned())
            .map(|data| Document::new(id.clone(), data)))
    }

    async fn query(
        &self,
        collection: &str,
        constraints: &[QueryConstraint],
    ) -> StoreResult<Vec<Document>> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        let documents: Vec<Document> = self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| Document::new(id.clone(), data.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let result = apply_constraints(documents, constraints);
        debug!(collection, matched = result.len(), "Memory store query");
        Ok(result)
    }

    async fn insert(
        &self,
        collection: &str,
        id: Option<&DocumentId>,
        data: Value,
    ) -> StoreResult<DocumentId> {
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        let id = id.cloned().unwrap_or_default();
        let mut docs = self.collections.entry(collection.to_string()).or_default();

        if docs.contains_key(&id) {
            return Err(StoreError::with_code(
                "already-exists",
                format!("Duplicate document id {} in {}", id, collection),
            ));
        }

        docs.insert(id.clone(), data);
        Ok(id)
    }

    async fn patch(&self, collection: &str, id: &DocumentId, partial: Value) -> StoreResult<()> {
        self.counters.patches.fetch_add(1, Ordering::Relaxed);
        let mut docs = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection, id))?;
        let data = docs.get_mut(id).ok_or_else(|| missing(collection, id))?;

        let mut doc = Document::new(id.clone(), std::mem::take(data));
        doc.merge(&partial);
        *data = doc.data;
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &DocumentId) -> StoreResult<()> {
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        if let Some(mut docs) = self.collections.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }
}

fn missing(collection: &str, id: &DocumentId) -> StoreError {
    StoreError::not_found(format!("Document not found: {}/{}", collection, id))
}
