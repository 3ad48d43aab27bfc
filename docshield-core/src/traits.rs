use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Document, DocumentId, QueryConstraint};
use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Contract of the remote document-oriented backend.
///
/// The data layer speaks no wire protocol itself; every backend (hosted
/// document database, in-memory store, test double) plugs in here.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &DocumentId) -> StoreResult<Option<Document>>;

    async fn query(
        &self,
        collection: &str,
        constraints: &[QueryConstraint],
    ) -> StoreResult<Vec<Document>>;

    /// Inserts a document, generating an id when none is given.
    async fn insert(
        &self,
        collection: &str,
        id: Option<&DocumentId>,
        data: Value,
    ) -> StoreResult<DocumentId>;

    async fn patch(&self, collection: &str, id: &DocumentId, partial: Value) -> StoreResult<()>;

    async fn remove(&self, collection: &str, id: &DocumentId) -> StoreResult<()>;
}
