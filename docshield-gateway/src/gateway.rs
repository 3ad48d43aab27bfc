//! Resilient CRUD gateway over one collection.
//!
//! Every call is timed by the performance monitor. Reads consult the cache
//! first; misses and writes go to the store through the retry executor. The
//! circuit breaker for `collection:operation` guards the whole retried call,
//! so it sees one outcome per call. Callers always get an [`OperationResult`].

use docshield_core::{
    to_payload, AccessError, CallContext, Document, DocumentId, DocumentStore, QueryConstraint,
    StoreError,
};
use docshield_metrics::{Outcome, PerformanceMonitor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheKey, TtlCache};
use crate::observability::error_tracker::{ErrorContext, ErrorTracker};
use crate::resilience::{CircuitBreakerError, RetryError, RetryExecutor, RetryOptions};

/// Cache lifetimes for gateway reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    #[serde(with = "docshield_core::duration_millis")]
    pub document_ttl: Duration,
    #[serde(with = "docshield_core::duration_millis")]
    pub list_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            document_ttl: Duration::from_secs(120),
            list_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    pub use_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

impl ReadOptions {
    pub fn bypass_cache() -> Self {
        Self { use_cache: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Uniform result of every gateway call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
}

impl<T> OperationResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            cache_hit: None,
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            cache_hit: None,
        }
    }

    fn with_cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = Some(hit);
        self
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    pub fn into_result(self) -> Result<Option<T>, ErrorInfo> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

impl<T> Outcome for OperationResult<T> {
    fn succeeded(&self) -> bool {
        self.success
    }

    fn failure_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.message.clone())
    }

    fn cache_hit(&self) -> Option<bool> {
        self.cache_hit
    }
}

/// A gateway failure plus how many backend attempts it took.
struct Failure {
    error: AccessError,
    attempts: usize,
}

impl From<AccessError> for Failure {
    fn from(error: AccessError) -> Self {
        Self { error, attempts: 0 }
    }
}

impl From<RetryError<CircuitBreakerError<StoreError>>> for Failure {
    fn from(err: RetryError<CircuitBreakerError<StoreError>>) -> Self {
        let error = match err.error {
            CircuitBreakerError::ExecutionFailed(store) => AccessError::Store(store),
            CircuitBreakerError::Open { name } | CircuitBreakerError::Rejected { name } => {
                AccessError::CircuitOpen { name }
            }
        };
        Self {
            error,
            attempts: err.attempts,
        }
    }
}

/// Shared components a gateway composes.
#[derive(Clone)]
pub struct GatewayParts {
    pub store: Arc<dyn DocumentStore>,
    pub cache: TtlCache<CacheKey, Value>,
    pub monitor: Arc<PerformanceMonitor>,
    pub retry: Arc<RetryExecutor>,
    pub tracker: Arc<ErrorTracker>,
    pub retry_options: RetryOptions<StoreError>,
    pub config: GatewayConfig,
}

pub struct Gateway<T> {
    collection: String,
    parts: GatewayParts,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Gateway<T> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            parts: self.parts.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T> Gateway<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(collection: impl Into<String>, parts: GatewayParts) -> Self {
        Self {
            collection: collection.into(),
            parts,
            _entity: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn find_by_id(
        &self,
        id: &DocumentId,
        call: &CallContext,
        options: ReadOptions,
    ) -> OperationResult<T> {
        const OP: &str = "find_by_id";
        self.parts
            .monitor
            .measure(&self.collection, OP, async {
                let key = CacheKey::find_by_id(&self.collection, id.as_str());
                if options.use_cache {
                    if let Some(entity) = self.cached::<T>(&key) {
                        return OperationResult::ok(entity).with_cache_hit(true);
                    }
                }

                let result = self
                    .fetch(id, OP, call)
                    .await
                    .and_then(|doc| self.decode_and_cache(&doc, key));
                self.finish(OP, call, result).with_cache_hit(false)
            })
            .await
    }

    pub async fn find_many(
        &self,
        constraints: &[QueryConstraint],
        call: &CallContext,
        options: ReadOptions,
    ) -> OperationResult<Vec<T>> {
        const OP: &str = "find_many";
        self.parts
            .monitor
            .measure(&self.collection, OP, async {
                let key = CacheKey::find_many(&self.collection, constraints);
                if options.use_cache {
                    if let Some(entities) = self.cached::<Vec<T>>(&key) {
                        return OperationResult::ok(entities).with_cache_hit(true);
                    }
                }

                let result = self.query(constraints, call).await.and_then(|docs| {
                    let values: Vec<Value> = docs.iter().map(Document::entity_value).collect();
                    let list = Value::Array(values);
                    let entities: Vec<T> =
                        serde_json::from_value(list.clone()).map_err(AccessError::from)?;
                    self.parts
                        .cache
                        .set_with_ttl(key, list, self.parts.config.list_ttl);
                    Ok(entities)
                });
                self.finish(OP, call, result).with_cache_hit(false)
            })
            .await
    }

    /// Creates a document with a generated id.
    pub async fn create(&self, entity: &T, call: &CallContext) -> OperationResult<T> {
        self.create_inner(None, entity, call).await
    }

    pub async fn create_with_id(
        &self,
        id: &DocumentId,
        entity: &T,
        call: &CallContext,
    ) -> OperationResult<T> {
        self.create_inner(Some(id), entity, call).await
    }

    async fn create_inner(
        &self,
        id: Option<&DocumentId>,
        entity: &T,
        call: &CallContext,
    ) -> OperationResult<T> {
        const OP: &str = "create";
        self.parts
            .monitor
            .measure(&self.collection, OP, async {
                let result = async {
                    let payload = to_payload(entity)?;
                    let store = &self.parts.store;
                    let collection = self.collection.as_str();
                    let data = &payload;
                    let new_id = self
                        .parts
                        .retry
                        .execute(collection, OP, call, &self.parts.retry_options, move || {
                            store.insert(collection, id, data.clone())
                        })
                        .await?;

                    self.invalidate_collection();
                    let doc = Document::new(new_id, payload);
                    self.decode_and_cache(&doc, CacheKey::find_by_id(collection, doc.id.as_str()))
                }
                .await;
                self.finish(OP, call, result)
            })
            .await
    }

    /// Applies a partial update and returns the fresh document.
    pub async fn update<P>(&self, id: &DocumentId, partial: &P, call: &CallContext) -> OperationResult<T>
    where
        P: Serialize,
    {
        const OP: &str = "update";
        self.parts
            .monitor
            .measure(&self.collection, OP, async {
                let result = async {
                    let payload = to_payload(partial)?;
                    let store = &self.parts.store;
                    let collection = self.collection.as_str();
                    let data = &payload;
                    self.parts
                        .retry
                        .execute(collection, OP, call, &self.parts.retry_options, move || {
                            store.patch(collection, id, data.clone())
                        })
                        .await?;

                    self.invalidate_collection();
                    let doc = self.fetch(id, OP, call).await?;
                    self.decode_and_cache(&doc, CacheKey::find_by_id(collection, id.as_str()))
                }
                .await;
                self.finish(OP, call, result)
            })
            .await
    }

    pub async fn delete(&self, id: &DocumentId, call: &CallContext) -> OperationResult<()> {
        const OP: &str = "delete";
        self.parts
            .monitor
            .measure(&self.collection, OP, async {
                let store = &self.parts.store;
                let collection = self.collection.as_str();
                let result = self
                    .parts
                    .retry
                    .execute(collection, OP, call, &self.parts.retry_options, move || {
                        store.remove(collection, id)
                    })
                    .await
                    .map_err(Failure::from);

                if result.is_ok() {
                    self.invalidate_collection();
                }
                self.finish(OP, call, result)
            })
            .await
    }

    /// Drops every cached entry of this collection.
    pub fn invalidate_collection(&self) -> usize {
        let collection = self.collection.as_str();
        let removed = self
            .parts
            .cache
            .invalidate_matching(|key| key.belongs_to(collection));
        debug!(collection, removed, "Invalidated collection cache");
        removed
    }

    fn cached<V: DeserializeOwned>(&self, key: &CacheKey) -> Option<V> {
        let value = self.parts.cache.get(key)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(key = %key, error = %err, "Dropping undecodable cache entry");
                self.parts.cache.delete(key);
                None
            }
        }
    }

    async fn fetch(
        &self,
        id: &DocumentId,
        operation: &str,
        call: &CallContext,
    ) -> Result<Document, Failure> {
        let store = &self.parts.store;
        let collection = self.collection.as_str();
        let found = self
            .parts
            .retry
            .execute(collection, operation, call, &self.parts.retry_options, move || {
                store.get(collection, id)
            })
            .await?;

        found.ok_or_else(|| {
            Failure::from(AccessError::NotFound {
                collection: self.collection.clone(),
                id: id.to_string(),
            })
        })
    }

    async fn query(
        &self,
        constraints: &[QueryConstraint],
        call: &CallContext,
    ) -> Result<Vec<Document>, Failure> {
        let store = &self.parts.store;
        let collection = self.collection.as_str();
        Ok(self
            .parts
            .retry
            .execute(
                collection,
                "find_many",
                call,
                &self.parts.retry_options,
                move || store.query(collection, constraints),
            )
            .await?)
    }

    fn decode_and_cache(&self, doc: &Document, key: CacheKey) -> Result<T, Failure> {
        let value = doc.entity_value();
        let entity: T = serde_json::from_value(value.clone()).map_err(AccessError::from)?;
        self.parts
            .cache
            .set_with_ttl(key, value, self.parts.config.document_ttl);
        Ok(entity)
    }

    /// Converts the internal result, tracking failures the retry executor
    /// never saw.
    fn finish<V>(
        &self,
        operation: &str,
        call: &CallContext,
        result: Result<V, Failure>,
    ) -> OperationResult<V> {
        let failure = match result {
            Ok(value) => return OperationResult::ok(value),
            Err(failure) => failure,
        };

        if failure.attempts == 0 {
            let context = ErrorContext::new(&self.collection, operation).with_call(call);
            self.parts.tracker.track_error(&failure.error, &context);
        }

        OperationResult::failed(ErrorInfo {
            code: failure.error.code().to_string(),
            message: failure.error.to_string(),
            details: Some(json!({
                "collection": self.collection,
                "operation": operation,
                "kind": failure.error.kind(),
                "attempts": failure.attempts,
            })),
        })
    }
}
