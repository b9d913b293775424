use async_trait::async_trait;
use graph_flow::{Context, NextAction, Task, TaskResult};
use std::sync::Arc;
use tracing::info;

use super::types::{RunState, generation_failed, load_document, session_keys};
use super::utils::{SourceText, clean_generated_summary};
use crate::{error::GenerationStage, llm::TextGenerator};

pub(crate) const SUMMARY_PREAMBLE: &str = "You are a news desk editor who writes strictly factual summaries. \
You never add information that is not written in the source article.";

/// Rules shared by first drafts and corrections
pub(crate) const FIDELITY_RULES: &str = r#"RULES (all mandatory):
1. Copy every number, date, percentage, amount and unit EXACTLY as written in the article. Do not round, convert or paraphrase them.
2. Copy every person, organization and place name character for character as spelled in the article.
3. Every sentence must be directly supported by the article text. No inference, no background knowledge, no added context.
4. When the article attaches a qualifier to a number (a baseline, a time period, a comparison, a scope), keep that qualifier next to the number.
5. Neutral, factual register only. No evaluative or emotional words.
6. Write between 3 and 10 dense sentences of plain prose. No headings, no bullet points, no preamble."#;

/// Writes a first summary and opens a fresh run with an empty audit trail.
///
/// Nothing is persisted here; the reset reaches storage with the first
/// recorded attempt.
pub struct SummaryGenerationTask {
    generator: Arc<dyn TextGenerator>,
}

impl SummaryGenerationTask {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    pub async fn generate(&self, source: SourceText<'_>) -> anyhow::Result<String> {
        info!(title = %source.title, "Generating initial summary");

        let prompt = build_summary_prompt(source);
        let raw = self.generator.generate(SUMMARY_PREAMBLE, &prompt).await?;
        let summary = clean_generated_summary(&raw)?;

        info!(summary_chars = summary.len(), "Initial summary generated");
        Ok(summary)
    }
}

#[async_trait]
impl Task for SummaryGenerationTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let document = load_document(&context)?;

        let summary = self
            .generate(SourceText::from(&document))
            .await
            .map_err(|e| generation_failed(&document.id, GenerationStage::Summary, 0, e))?;

        context
            .set(session_keys::RUN, RunState::restart(&document, summary))
            .await?;
        Ok(TaskResult::new(None, NextAction::Continue))
    }
}

fn build_summary_prompt(source: SourceText<'_>) -> String {
    format!(
        "Summarize the following article.\n\n{rules}\n\n{header}\n\nARTICLE:\n{content}\n\nReturn only the summary text.",
        rules = FIDELITY_RULES,
        header = source.header(),
        content = source.content,
    )
}
