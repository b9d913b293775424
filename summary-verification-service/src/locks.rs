use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type LockMap = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// One async mutex per document id, so runs against the same document serialize.
///
/// Only covers writers inside this process; the storage version check covers the rest.
#[derive(Clone, Default)]
pub struct DocumentLocks {
    locks: LockMap,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, document_id: &str) -> DocumentGuard {
        let mutex = self
            .locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        if mutex.try_lock().is_err() {
            debug!(document_id, "Waiting for in-flight verification of the same document");
        }

        DocumentGuard {
            guard: Some(mutex.lock_owned().await),
            locks: self.locks.clone(),
            document_id: document_id.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct DocumentGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
    document_id: String,
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        self.guard.take();
        // nobody else is holding or waiting once only the map references the mutex
        self.locks
            .remove_if(&self.document_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
