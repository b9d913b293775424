//! The verify/correct retry loop.
//!
//! A run is a small task graph: summary generation, verification, correction
//! and finalization. Verification routes to correction while a rejected
//! attempt has budget left, otherwise to finalization. The graph is stepped
//! one task at a time, and every verification attempt is written to the
//! document store before the next task starts, so an aborted run can be
//! resumed by invoking it again.

use graph_flow::{ExecutionStatus, Graph, GraphBuilder, Session, Task};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    error::{Result, VerificationError},
    llm::TextGenerator,
    locks::DocumentLocks,
    models::{Document, MAX_ATTEMPTS, VerificationOutcome, VerificationStatus},
    storage::DocumentStore,
    tasks::{
        CorrectionTask, FinalizeTask, RunState, Step, SummaryGenerationTask, VerificationTask,
        types::session_keys,
    },
};

/// Stored state returned as-is when there is nothing left to do
fn short_circuit(
    document: &Document,
    force_regenerate: bool,
    max_attempts: u32,
) -> Option<VerificationOutcome> {
    if force_regenerate {
        return None;
    }

    let settled = match document.verification_status {
        VerificationStatus::Verified => true,
        VerificationStatus::ManualReview => document.attempt_count >= max_attempts,
        _ => false,
    };

    settled.then(|| VerificationOutcome {
        document_id: document.id.clone(),
        status: document.verification_status,
        attempts: document.attempt_count,
        summary: document.summary.clone(),
        feedback_history: document.feedback_history.clone(),
        last_verdict: None,
        cached: true,
    })
}

struct TaskIds {
    generate: String,
    verify: String,
    correct: String,
    finish: String,
}

impl TaskIds {
    fn of(&self, step: Step) -> &str {
        match step {
            Step::Generate => &self.generate,
            Step::Verify => &self.verify,
            Step::Correct => &self.correct,
            Step::Finish => &self.finish,
        }
    }
}

/// Drives summary generation, verification and correction for one document
pub struct SummaryVerificationFlow {
    store: Arc<dyn DocumentStore>,
    graph: Arc<Graph>,
    task_ids: TaskIds,
    locks: DocumentLocks,
    max_attempts: u32,
}

impl SummaryVerificationFlow {
    pub fn new(store: Arc<dyn DocumentStore>, generator: Arc<dyn TextGenerator>) -> Self {
        Self::with_locks(store, generator, DocumentLocks::new())
    }

    /// Share `locks` between flows that may touch the same documents.
    pub fn with_locks(
        store: Arc<dyn DocumentStore>,
        generator: Arc<dyn TextGenerator>,
        locks: DocumentLocks,
    ) -> Self {
        let max_attempts = MAX_ATTEMPTS;

        let generate_task: Arc<dyn Task> = Arc::new(SummaryGenerationTask::new(generator.clone()));
        let verify_task: Arc<dyn Task> = Arc::new(VerificationTask::new(
            generator.clone(),
            store.clone(),
            max_attempts,
        ));
        let correct_task: Arc<dyn Task> = Arc::new(CorrectionTask::new(generator));
        let finish_task: Arc<dyn Task> = Arc::new(FinalizeTask::new(store.clone()));

        let task_ids = TaskIds {
            generate: generate_task.id().to_string(),
            verify: verify_task.id().to_string(),
            correct: correct_task.id().to_string(),
            finish: finish_task.id().to_string(),
        };

        let graph = GraphBuilder::new("summary_verification")
            .add_task(generate_task)
            .add_task(verify_task)
            .add_task(correct_task)
            .add_task(finish_task)
            .add_edge(task_ids.generate.clone(), task_ids.verify.clone())
            // rejected with budget left: correct and verify again, otherwise settle
            .add_conditional_edge(
                task_ids.verify.clone(),
                move |ctx| {
                    ctx.get_sync::<RunState>(session_keys::RUN)
                        .is_some_and(|run| run.needs_correction(max_attempts))
                },
                task_ids.correct.clone(),
                task_ids.finish.clone(),
            )
            .add_edge(task_ids.correct.clone(), task_ids.verify.clone())
            .build();

        Self {
            store,
            graph: Arc::new(graph),
            task_ids,
            locks,
            max_attempts,
        }
    }

    pub async fn run(
        &self,
        document_id: &str,
        force_regenerate: bool,
    ) -> Result<VerificationOutcome> {
        let _guard = self.locks.acquire(document_id).await;

        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| VerificationError::DocumentNotFound(document_id.to_string()))?;

        if let Some(outcome) = short_circuit(&document, force_regenerate, self.max_attempts) {
            info!(
                document_id,
                status = outcome.status.as_str(),
                attempts = outcome.attempts,
                "Returning stored verification result"
            );
            return Ok(outcome);
        }

        let existing_summary = document
            .summary
            .clone()
            .filter(|s| !s.trim().is_empty() && !force_regenerate);

        let mut session = Session::new_from_task(document_id, &self.task_ids.generate);
        let start = match existing_summary {
            Some(summary) => {
                let mut run = RunState::resume(&document, summary);
                let step = run.first_step(self.max_attempts);
                session.context.set(session_keys::RUN, run).await?;
                step
            }
            None => {
                info!(document_id, force_regenerate, "Starting run with a new summary");
                Step::Generate
            }
        };
        session.current_task_id = self.task_ids.of(start).to_string();
        session.context.set(session_keys::DOCUMENT, &document).await?;

        loop {
            let result = self.graph.execute_session(&mut session).await?;
            debug!(
                document_id,
                next_task = %session.current_task_id,
                status = session.status_message.as_deref().unwrap_or(""),
                "Workflow step finished"
            );
            if result.status == ExecutionStatus::Completed {
                break;
            }
        }

        let run: RunState = session
            .context
            .get(session_keys::RUN)
            .await
            .ok_or_else(|| VerificationError::Workflow("run state missing after completion".into()))?;
        Ok(run.into_outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GenerationStage, StoreError};
    use crate::models::{DocumentPatch, FeedbackEntry, FeedbackStatus};
    use crate::testing::{Call, RecordingStore, ScriptedGenerator};

    const VALID: &str = r#"{"isValid": true, "errors": [], "claimsChecked": 5, "claimsVerified": 5, "claimsRejected": 0}"#;
    const DIGIT_ERROR: &str = r#"{"isValid": false, "errors": ["Turnout given as 61%, source says 64%"], "claimsChecked": 5, "claimsVerified": 4, "claimsRejected": 1, "fabricatedClaims": []}"#;
    const HALLUCINATION: &str = r#"{"isValid": false, "errors": ["Recount is not mentioned in the source"], "claimsChecked": 5, "claimsVerified": 4, "claimsRejected": 1, "fabricatedClaims": ["A recount was ordered"]}"#;

    fn article() -> Document {
        Document::new(
            "article-1",
            "Election results",
            "Turnout reached 64% in the 2024 municipal election, up from 58% in 2020.",
            Some("politics".to_string()),
        )
    }

    fn setup(document: Document) -> (Arc<RecordingStore>, Arc<ScriptedGenerator>, SummaryVerificationFlow) {
        let store = Arc::new(RecordingStore::with(document));
        let generator = Arc::new(ScriptedGenerator::new());
        let flow = SummaryVerificationFlow::new(store.clone(), generator.clone());
        (store, generator, flow)
    }

    fn assert_history_matches_count(writes: &[Document]) {
        for write in writes {
            assert_eq!(write.feedback_history.len() as u32, write.attempt_count);
            assert!(write.attempt_count <= MAX_ATTEMPTS);
            for (i, entry) in write.feedback_history.iter().enumerate() {
                assert_eq!(entry.attempt, i as u32 + 1);
            }
        }
    }

    #[tokio::test]
    async fn verified_on_first_attempt() {
        let (store, generator, flow) = setup(article());
        generator.push_summary("Turnout reached 64% in the 2024 municipal election.");
        generator.push_verdict(VALID);

        let outcome = flow.run("article-1", false).await.unwrap();

        assert_eq!(outcome.status, VerificationStatus::Verified);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.feedback_history.len(), 1);
        assert_eq!(outcome.feedback_history[0].status, FeedbackStatus::Verified);
        assert!(outcome.last_verdict.unwrap().is_valid);
        assert!(!outcome.cached);
        assert_eq!(generator.count(Call::Correction), 0);

        let stored = store.inner.get_document("article-1").await.unwrap().unwrap();
        assert_eq!(stored.verification_status, VerificationStatus::Verified);
        assert_eq!(
            stored.summary.as_deref(),
            Some("Turnout reached 64% in the 2024 municipal election.")
        );
        assert_history_matches_count(&store.writes());
    }

    #[tokio::test]
    async fn verified_after_two_corrections() {
        let (store, generator, flow) = setup(article());
        generator.push_summary("Turnout reached 61% in the 2024 municipal election.");
        generator.push_verdict(DIGIT_ERROR);
        generator.push_correction("Turnout reached 64%, and a recount was ordered.");
        generator.push_verdict(HALLUCINATION);
        generator.push_correction("Turnout reached 64% in the 2024 municipal election, up from 58% in 2020.");
        generator.push_verdict(VALID);

        let outcome = flow.run("article-1", false).await.unwrap();

        assert_eq!(outcome.status, VerificationStatus::Verified);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.feedback_history.len(), 3);
        assert_eq!(generator.count(Call::Correction), 2);
        assert_eq!(generator.count(Call::Verification), 3);
        assert_eq!(
            generator.calls(),
            vec![
                Call::Summary,
                Call::Verification,
                Call::Correction,
                Call::Verification,
                Call::Correction,
                Call::Verification,
            ]
        );
        assert_eq!(
            outcome.summary.as_deref(),
            Some("Turnout reached 64% in the 2024 municipal election, up from 58% in 2020.")
        );

        // second correction must suppress the claim fabricated on attempt 2
        let prompts = generator.prompts();
        assert!(prompts[4].contains("A recount was ordered"));
        assert!(prompts[4].contains("Recount is not mentioned in the source"));

        let writes = store.writes();
        // one write per attempt plus the final one
        assert_eq!(writes.len(), 4);
        let counts: Vec<u32> = writes.iter().map(|w| w.attempt_count).collect();
        assert_eq!(counts, vec![1, 2, 3, 3]);
        assert_eq!(writes[0].verification_status, VerificationStatus::Pending);
        assert_history_matches_count(&writes);
    }

    #[tokio::test]
    async fn exhausted_attempts_escalate_to_manual_review() {
        let (store, generator, flow) = setup(article());
        generator.push_summary("s1");
        generator.push_verdict(DIGIT_ERROR);
        generator.push_correction("s2");
        generator.push_verdict(DIGIT_ERROR);
        generator.push_correction("s3");
        generator.push_verdict(HALLUCINATION);

        let outcome = flow.run("article-1", false).await.unwrap();

        assert_eq!(outcome.status, VerificationStatus::ManualReview);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.feedback_history.len(), 3);
        assert_eq!(
            outcome.feedback_history.last().unwrap().status,
            FeedbackStatus::Rejected
        );
        // no correction after the last attempt
        assert_eq!(generator.count(Call::Correction), 2);
        assert_eq!(generator.count(Call::Verification), MAX_ATTEMPTS as usize);
        assert_history_matches_count(&store.writes());
    }

    #[tokio::test]
    async fn unparsable_verdict_is_recorded_as_pending_and_loop_continues() {
        let (store, generator, flow) = setup(article());
        generator.push_summary("s1");
        generator.push_verdict("Looks accurate to me.");
        generator.push_correction("s2");
        generator.push_verdict(VALID);

        let outcome = flow.run("article-1", false).await.unwrap();

        assert_eq!(outcome.status, VerificationStatus::Verified);
        assert_eq!(outcome.attempts, 2);
        let first = &outcome.feedback_history[0];
        assert_eq!(first.status, FeedbackStatus::Pending);
        assert_eq!(first.errors.len(), 1);
        assert_eq!(first.claims_checked, 0);
        assert_eq!(generator.count(Call::Correction), 1);
        assert_history_matches_count(&store.writes());
    }

    #[tokio::test]
    async fn verified_document_short_circuits_without_calls() {
        let (store, generator, flow) = setup(article());
        generator.push_summary("s1");
        generator.push_verdict(VALID);

        let first = flow.run("article-1", false).await.unwrap();
        let calls_after_first = generator.calls().len();
        let writes_after_first = store.writes().len();

        let second = flow.run("article-1", false).await.unwrap();
        let third = flow.run("article-1", false).await.unwrap();

        assert_eq!(generator.calls().len(), calls_after_first);
        assert_eq!(store.writes().len(), writes_after_first);
        for repeat in [&second, &third] {
            assert!(repeat.cached);
            assert_eq!(repeat.status, VerificationStatus::Verified);
            assert_eq!(repeat.summary, first.summary);
            assert_eq!(repeat.feedback_history, first.feedback_history);
            assert_eq!(repeat.attempts, 1);
        }
    }

    #[tokio::test]
    async fn manual_review_is_not_retried_without_force() {
        let mut document = article();
        document.summary = Some("s3".to_string());
        document.verification_status = VerificationStatus::ManualReview;
        document.attempt_count = MAX_ATTEMPTS;
        let (store, generator, flow) = setup(document);

        let outcome = flow.run("article-1", false).await.unwrap();

        assert!(outcome.cached);
        assert_eq!(outcome.status, VerificationStatus::ManualReview);
        assert!(generator.calls().is_empty());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn force_regenerate_resets_history_and_count() {
        let (store, generator, flow) = setup(article());
        generator.push_summary("s1");
        generator.push_verdict(DIGIT_ERROR);
        generator.push_correction("s2");
        generator.push_verdict(VALID);
        let first = flow.run("article-1", false).await.unwrap();
        assert_eq!(first.attempts, 2);

        generator.push_summary("fresh summary");
        generator.push_verdict(VALID);
        let forced = flow.run("article-1", true).await.unwrap();

        assert!(!forced.cached);
        assert_eq!(forced.status, VerificationStatus::Verified);
        assert_eq!(forced.attempts, 1);
        assert_eq!(forced.feedback_history.len(), 1);
        assert_eq!(forced.summary.as_deref(), Some("fresh summary"));
        assert_eq!(generator.count(Call::Summary), 2);
        assert_history_matches_count(&store.writes());
    }

    #[tokio::test]
    async fn force_regenerate_reopens_manual_review() {
        let mut document = article();
        document.summary = Some("bad".to_string());
        document.verification_status = VerificationStatus::ManualReview;
        document.attempt_count = MAX_ATTEMPTS;
        let (_store, generator, flow) = setup(document);
        generator.push_summary("good");
        generator.push_verdict(VALID);

        let outcome = flow.run("article-1", true).await.unwrap();
        assert_eq!(outcome.status, VerificationStatus::Verified);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn existing_summary_is_verified_without_generation() {
        let mut document = article();
        document.summary = Some("Turnout reached 64%.".to_string());
        let (_store, generator, flow) = setup(document);
        generator.push_verdict(VALID);

        let outcome = flow.run("article-1", false).await.unwrap();
        assert_eq!(outcome.status, VerificationStatus::Verified);
        assert_eq!(generator.calls(), vec![Call::Verification]);
    }

    #[tokio::test]
    async fn summary_generation_failure_persists_nothing() {
        let (store, generator, flow) = setup(article());
        generator.fail_summary("503 Service Unavailable");

        let err = flow.run("article-1", false).await.unwrap_err();
        assert!(matches!(
            err,
            VerificationError::Generation {
                stage: GenerationStage::Summary,
                ..
            }
        ));
        assert!(store.writes().is_empty());
        let stored = store.inner.get_document("article-1").await.unwrap().unwrap();
        assert_eq!(stored.version, 0);
        assert!(stored.summary.is_none());
        assert_eq!(stored.attempt_count, 0);
    }

    #[tokio::test]
    async fn mid_loop_failure_keeps_completed_attempts_and_resumes() {
        let (store, generator, flow) = setup(article());
        generator.push_summary("s1");
        generator.push_verdict(HALLUCINATION);
        generator.fail_correction("timeout");

        let err = flow.run("article-1", false).await.unwrap_err();
        assert!(matches!(
            err,
            VerificationError::Generation {
                stage: GenerationStage::Correction,
                attempt: 1,
                ..
            }
        ));

        let stored = store.inner.get_document("article-1").await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.feedback_history.len(), 1);
        assert_eq!(stored.verification_status, VerificationStatus::Pending);
        assert_eq!(stored.summary.as_deref(), Some("s1"));

        // the next invocation corrects the rejected summary instead of re-verifying it
        generator.push_correction("s2");
        generator.push_verdict(VALID);
        let outcome = flow.run("article-1", false).await.unwrap();

        assert_eq!(outcome.status, VerificationStatus::Verified);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.summary.as_deref(), Some("s2"));
        assert_eq!(generator.count(Call::Summary), 1);
        let last_correction = generator.prompts()[3].clone();
        assert!(last_correction.contains("A recount was ordered"));
        assert_history_matches_count(&store.writes());
    }

    #[tokio::test]
    async fn verifier_transport_failure_aborts_after_persisted_attempts() {
        let (store, generator, flow) = setup(article());
        generator.push_summary("s1");
        generator.push_verdict(DIGIT_ERROR);
        generator.push_correction("s2");
        generator.fail_verdict("connection reset by peer");

        let err = flow.run("article-1", false).await.unwrap_err();
        assert!(matches!(
            err,
            VerificationError::Generation {
                stage: GenerationStage::Verification,
                attempt: 2,
                ..
            }
        ));
        let stored = store.inner.get_document("article-1").await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.feedback_history.len(), 1);
    }

    #[tokio::test]
    async fn stale_attempt_count_is_settled_to_manual_review() {
        let mut document = article();
        document.summary = Some("s".to_string());
        document.attempt_count = MAX_ATTEMPTS;
        document.feedback_history = (1..=MAX_ATTEMPTS)
            .map(|attempt| FeedbackEntry::from_verdict(attempt, &crate::tasks::verification::unparsable_verdict()))
            .collect();
        let (_store, generator, flow) = setup(document);

        let outcome = flow.run("article-1", false).await.unwrap();
        assert_eq!(outcome.status, VerificationStatus::ManualReview);
        assert_eq!(outcome.attempts, MAX_ATTEMPTS);
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_document() {
        let (_store, generator, flow) = setup(article());
        let err = flow.run("missing", false).await.unwrap_err();
        assert!(matches!(err, VerificationError::DocumentNotFound(id) if id == "missing"));
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn concurrent_writer_causes_version_conflict() {
        struct ConflictingStore(RecordingStore);

        #[async_trait::async_trait]
        impl DocumentStore for ConflictingStore {
            async fn get_document(&self, id: &str) -> std::result::Result<Option<Document>, StoreError> {
                let document = self.0.get_document(id).await?;
                // another writer advances the record right after our read
                self.0
                    .inner
                    .update_document(id, document.as_ref().map_or(0, |d| d.version), DocumentPatch::default())
                    .await?;
                Ok(document)
            }

            async fn update_document(
                &self,
                id: &str,
                expected_version: i64,
                patch: DocumentPatch,
            ) -> std::result::Result<i64, StoreError> {
                self.0.update_document(id, expected_version, patch).await
            }
        }

        let store = Arc::new(ConflictingStore(RecordingStore::with(article())));
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_summary("s1");
        generator.push_verdict(VALID);
        let flow = SummaryVerificationFlow::new(store, generator);

        let err = flow.run("article-1", false).await.unwrap_err();
        assert!(matches!(
            err,
            VerificationError::Storage(StoreError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn loop_terminates_within_ceiling_from_any_resumable_state() {
        for start in 0..MAX_ATTEMPTS {
            let mut document = article();
            document.summary = Some("stored".to_string());
            document.attempt_count = start;
            document.feedback_history = (1..=start)
                .map(|attempt| {
                    FeedbackEntry::from_verdict(attempt, &crate::tasks::parse_verdict(DIGIT_ERROR))
                })
                .collect();
            let (store, generator, flow) = setup(document);
            for _ in 0..MAX_ATTEMPTS {
                generator.push_verdict(DIGIT_ERROR);
                generator.push_correction("again");
            }

            let outcome = flow.run("article-1", false).await.unwrap();
            assert_eq!(outcome.status, VerificationStatus::ManualReview);
            assert_eq!(outcome.attempts, MAX_ATTEMPTS);
            assert_eq!(
                generator.count(Call::Verification) as u32,
                MAX_ATTEMPTS - start
            );
            assert_history_matches_count(&store.writes());

            let counts: Vec<u32> = store.writes().iter().map(|w| w.attempt_count).collect();
            assert!(counts.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
