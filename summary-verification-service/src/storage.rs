use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

use crate::{
    error::StoreError,
    models::{Document, DocumentPatch},
};

/// Access to the externally owned article records
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Apply `patch` if the stored version still equals `expected_version`.
    /// Returns the new version.
    async fn update_document(
        &self,
        id: &str,
        expected_version: i64,
        patch: DocumentPatch,
    ) -> Result<i64, StoreError>;
}

pub(crate) fn apply_patch(document: &mut Document, patch: DocumentPatch) {
    if let Some(summary) = patch.summary {
        document.summary = Some(summary);
    }
    if let Some(status) = patch.verification_status {
        document.verification_status = status;
    }
    if let Some(attempt_count) = patch.attempt_count {
        document.attempt_count = attempt_count;
    }
    if let Some(history) = patch.feedback_history {
        document.feedback_history = history;
    }
    document.version += 1;
    document.updated_at = Utc::now();
}

/// In-memory implementation of DocumentStore
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    documents: Arc<DashMap<String, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stand-in for the external ingestion process
    pub fn insert(&self, document: Document) {
        self.documents.insert(document.id.clone(), document);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.documents.get(id).map(|entry| entry.clone()))
    }

    async fn update_document(
        &self,
        id: &str,
        expected_version: i64,
        patch: DocumentPatch,
    ) -> Result<i64, StoreError> {
        let mut entry = self
            .documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if entry.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
            });
        }

        apply_patch(&mut entry, patch);
        Ok(entry.version)
    }
}
