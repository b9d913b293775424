use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::{
    error::StoreError,
    llm::TextGenerator,
    models::{Document, DocumentPatch},
    storage::{DocumentStore, InMemoryDocumentStore},
    tasks::{
        correction::CORRECTION_PREAMBLE, summary_generation::SUMMARY_PREAMBLE,
        verification::VERIFIER_PREAMBLE,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    Summary,
    Verification,
    Correction,
}

type Scripted = Result<String, String>;

/// Text generator that replays queued responses per call kind
#[derive(Default)]
pub(crate) struct ScriptedGenerator {
    summaries: Mutex<VecDeque<Scripted>>,
    verdicts: Mutex<VecDeque<Scripted>>,
    corrections: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<(Call, String)>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_summary(&self, text: &str) {
        self.summaries.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn fail_summary(&self, message: &str) {
        self.summaries.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn push_verdict(&self, raw: &str) {
        self.verdicts.lock().unwrap().push_back(Ok(raw.to_string()));
    }

    pub fn fail_verdict(&self, message: &str) {
        self.verdicts.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn push_correction(&self, text: &str) {
        self.corrections.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn fail_correction(&self, message: &str) {
        self.corrections.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }

    pub fn count(&self, kind: Call) -> usize {
        self.calls().into_iter().filter(|c| *c == kind).count()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, preamble: &str, prompt: &str) -> anyhow::Result<String> {
        let (kind, queue) = match preamble {
            SUMMARY_PREAMBLE => (Call::Summary, &self.summaries),
            VERIFIER_PREAMBLE => (Call::Verification, &self.verdicts),
            CORRECTION_PREAMBLE => (Call::Correction, &self.corrections),
            other => return Err(anyhow!("unexpected preamble: {other}")),
        };
        self.calls.lock().unwrap().push((kind, prompt.to_string()));

        let next = queue.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted response left for {kind:?}")),
        }
    }
}

/// In-memory store that snapshots the document after every successful write
#[derive(Default)]
pub(crate) struct RecordingStore {
    pub inner: InMemoryDocumentStore,
    writes: Mutex<Vec<Document>>,
}

impl RecordingStore {
    pub fn with(document: Document) -> Self {
        let store = Self::default();
        store.inner.insert(document);
        store
    }

    pub fn writes(&self) -> Vec<Document> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get_document(id).await
    }

    async fn update_document(
        &self,
        id: &str,
        expected_version: i64,
        patch: DocumentPatch,
    ) -> Result<i64, StoreError> {
        let version = self.inner.update_document(id, expected_version, patch).await?;
        if let Some(snapshot) = self.inner.get_document(id).await? {
            self.writes.lock().unwrap().push(snapshot);
        }
        Ok(version)
    }
}
