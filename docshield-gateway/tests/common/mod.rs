#![allow(dead_code)]

use async_trait::async_trait;
use docshield_core::{
    Document, DocumentId, DocumentStore, QueryConstraint, StoreError, StoreResult,
};
use docshield_gateway::{DataLayer, DataLayerConfig};
use docshield_storage::MemoryDocumentStore;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Memory store that fails according to a script before delegating.
#[derive(Default)]
pub struct ScriptedStore {
    inner: MemoryDocumentStore,
    script: Mutex<VecDeque<StoreError>>,
    always: Mutex<Option<StoreError>>,
    calls: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `times` calls with `error`.
    pub fn fail_next(&self, times: usize, error: StoreError) {
        let mut script = self.script.lock().unwrap();
        script.extend(std::iter::repeat(error).take(times));
    }

    pub fn fail_always(&self, error: StoreError) {
        *self.always.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.always.lock().unwrap() = None;
        self.script.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryDocumentStore {
        &self.inner
    }

    fn next_outcome(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.always.lock().unwrap().clone() {
            return Err(err);
        }
        match self.script.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    async fn get(&self, collection: &str, id: &DocumentId) -> StoreResult<Option<Document>> {
        self.next_outcome()?;
        self.inner.get(collection, id).await
    }

    async fn query(
        &self,
        collection: &str,
        constraints: &[QueryConstraint],
    ) -> StoreResult<Vec<Document>> {
        self.next_outcome()?;
        self.inner.query(collection, constraints).await
    }

    async fn insert(
        &self,
        collection: &str,
        id: Option<&DocumentId>,
        data: Value,
    ) -> StoreResult<DocumentId> {
        self.next_outcome()?;
        self.inner.insert(collection, id, data).await
    }

    async fn patch(&self, collection: &str, id: &DocumentId, partial: Value) -> StoreResult<()> {
        self.next_outcome()?;
        self.inner.patch(collection, id, partial).await
    }

    async fn remove(&self, collection: &str, id: &DocumentId) -> StoreResult<()> {
        self.next_outcome()?;
        self.inner.remove(collection, id).await
    }
}

/// Fast retries, a low breaker threshold and no background sweep.
pub fn test_config() -> DataLayerConfig {
    let mut config = DataLayerConfig::default();
    config.retry.max_attempts = 3;
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.jitter = docshield_gateway::resilience::JitterStrategy::None;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.reset_timeout = Duration::from_secs(30);
    config.cache.auto_cleanup = false;
    config
}

pub async fn data_layer(store: Arc<ScriptedStore>) -> DataLayer {
    DataLayer::new(store, test_config()).await.unwrap()
}
