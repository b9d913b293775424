use graph_flow::{Context, GraphError};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    error::{GenerationStage, VerificationError},
    models::{
        Document, DocumentPatch, FeedbackEntry, FeedbackStatus, Verdict, VerificationOutcome,
        VerificationStatus,
    },
    storage::DocumentStore,
};

/// Keys the verification graph keeps in its context
pub mod session_keys {
    /// The [`Document`](crate::models::Document) as loaded when the run started
    pub const DOCUMENT: &str = "document";
    /// The in-flight [`RunState`](super::RunState)
    pub const RUN: &str = "run";
}

/// Where a run enters the verify/correct graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Generate,
    Verify,
    Correct,
    Finish,
}

/// In-flight copy of the mutable part of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub document_id: String,
    pub version: i64,
    pub summary: String,
    pub status: VerificationStatus,
    pub attempt_count: u32,
    pub history: Vec<FeedbackEntry>,
    pub last_verdict: Option<Verdict>,
}

impl RunState {
    /// Continue from whatever the document already holds.
    pub fn resume(document: &Document, summary: String) -> Self {
        Self {
            document_id: document.id.clone(),
            version: document.version,
            summary,
            status: document.verification_status,
            attempt_count: document.attempt_count,
            history: document.feedback_history.clone(),
            last_verdict: None,
        }
    }

    /// Start over with a freshly generated summary and an empty audit trail.
    pub fn restart(document: &Document, summary: String) -> Self {
        Self {
            document_id: document.id.clone(),
            version: document.version,
            summary,
            status: VerificationStatus::Pending,
            attempt_count: 0,
            history: Vec::new(),
            last_verdict: None,
        }
    }

    pub fn first_step(&mut self, max_attempts: u32) -> Step {
        if self.attempt_count >= max_attempts {
            if self.status != VerificationStatus::Verified {
                self.status = VerificationStatus::ManualReview;
            }
            return Step::Finish;
        }

        // A previous run stopped after recording a rejection but before its
        // correction was verified; the stored summary is the rejected one.
        match self.history.last() {
            Some(entry) if entry.status != FeedbackStatus::Verified => Step::Correct,
            _ => Step::Verify,
        }
    }

    /// A rejected attempt with budget left goes to correction
    pub fn needs_correction(&self, max_attempts: u32) -> bool {
        self.status == VerificationStatus::Pending && self.attempt_count < max_attempts
    }

    /// Errors of the most recent attempt, the correction's to-fix list
    pub fn last_errors(&self) -> &[String] {
        self.history
            .last()
            .map(|entry| entry.errors.as_slice())
            .unwrap_or_default()
    }

    /// Every claim the verifier has flagged as fabricated so far, first-seen order
    pub fn suppressed_claims(&self) -> Vec<String> {
        let mut claims: Vec<String> = Vec::new();
        for claim in self.history.iter().flat_map(|e| e.fabricated_claims.iter()) {
            if !claims.contains(claim) {
                claims.push(claim.clone());
            }
        }
        claims
    }

    fn patch(&self) -> DocumentPatch {
        DocumentPatch {
            summary: Some(self.summary.clone()),
            verification_status: Some(self.status),
            attempt_count: Some(self.attempt_count),
            feedback_history: Some(self.history.clone()),
        }
    }

    /// Write the whole run state, guarded by the version last seen.
    pub async fn persist(&mut self, store: &dyn DocumentStore) -> Result<(), VerificationError> {
        self.version = store
            .update_document(&self.document_id, self.version, self.patch())
            .await?;
        Ok(())
    }

    pub fn into_outcome(self) -> VerificationOutcome {
        VerificationOutcome {
            document_id: self.document_id,
            status: self.status,
            attempts: self.attempt_count,
            summary: Some(self.summary),
            feedback_history: self.history,
            last_verdict: self.last_verdict,
            cached: false,
        }
    }
}

pub fn load_document(context: &Context) -> graph_flow::Result<Document> {
    context
        .get_sync(session_keys::DOCUMENT)
        .ok_or_else(|| GraphError::ContextError("document not found in context".into()))
}

pub fn load_run(context: &Context) -> graph_flow::Result<RunState> {
    context
        .get_sync(session_keys::RUN)
        .ok_or_else(|| GraphError::ContextError("run state not found in context".into()))
}

/// Log a failed text-generation call and turn it into the error that aborts the run
pub fn generation_failed(
    document_id: &str,
    stage: GenerationStage,
    attempt: u32,
    source: anyhow::Error,
) -> VerificationError {
    error!(document_id, %stage, attempt, error = %source, "Text generation failed, aborting run");
    VerificationError::generation(stage, attempt, source)
}
