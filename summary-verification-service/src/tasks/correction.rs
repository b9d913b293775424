use async_trait::async_trait;
use graph_flow::{Context, NextAction, Task, TaskResult};
use std::sync::Arc;
use tracing::info;

use super::summary_generation::FIDELITY_RULES;
use super::types::{generation_failed, load_document, load_run, session_keys};
use super::utils::{SourceText, clean_generated_summary, numbered_list};
use crate::{error::GenerationStage, llm::TextGenerator};

pub(crate) const CORRECTION_PREAMBLE: &str = "You are a news desk editor rewriting a summary that failed fact-checking. \
You write a new summary from the source article alone and never repeat a rejected claim.";

/// Writes a replacement summary after a rejected verdict.
///
/// The rejected summary is not part of the prompt. The new draft is built from
/// the source, with the verifier's findings as constraints.
pub struct CorrectionTask {
    generator: Arc<dyn TextGenerator>,
}

impl CorrectionTask {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    pub async fn rewrite(
        &self,
        source: SourceText<'_>,
        prior_errors: &[String],
        fabricated_claims: &[String],
    ) -> anyhow::Result<String> {
        info!(
            errors = prior_errors.len(),
            fabricated = fabricated_claims.len(),
            "Generating corrected summary"
        );

        let prompt = build_correction_prompt(source, prior_errors, fabricated_claims);
        let raw = self.generator.generate(CORRECTION_PREAMBLE, &prompt).await?;
        clean_generated_summary(&raw)
    }
}

#[async_trait]
impl Task for CorrectionTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let document = load_document(&context)?;
        let mut run = load_run(&context)?;

        let suppressed = run.suppressed_claims();
        info!(
            document_id = %run.document_id,
            after_attempt = run.attempt_count,
            suppressed = suppressed.len(),
            "Correcting rejected summary"
        );

        run.summary = self
            .rewrite(SourceText::from(&document), run.last_errors(), &suppressed)
            .await
            .map_err(|e| {
                generation_failed(
                    &run.document_id,
                    GenerationStage::Correction,
                    run.attempt_count,
                    e,
                )
            })?;

        context.set(session_keys::RUN, run).await?;
        Ok(TaskResult::new(None, NextAction::Continue))
    }
}

fn build_correction_prompt(
    source: SourceText<'_>,
    prior_errors: &[String],
    fabricated_claims: &[String],
) -> String {
    let mut prompt = String::from(
        "A previous summary of this article was rejected by fact-checking. \
         Write a NEW summary from scratch using only the article below.\n\n",
    );
    prompt.push_str(FIDELITY_RULES);

    if !prior_errors.is_empty() {
        prompt.push_str("\n\nThe rejected summary had these errors. Your summary must not repeat any of them:\n");
        prompt.push_str(&numbered_list(prior_errors));
    }

    if !fabricated_claims.is_empty() {
        prompt.push_str(
            "\n\nThese claims are NOT supported by the article. Do not mention them in any form:\n",
        );
        prompt.push_str(&numbered_list(fabricated_claims));
    }

    prompt.push_str(&format!(
        "\n\n{}\n\nARTICLE:\n{}\n\nReturn only the summary text.",
        source.header(),
        source.content
    ));
    prompt
}
