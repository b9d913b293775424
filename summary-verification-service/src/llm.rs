use async_trait::async_trait;
use rig::{
    agent::Agent,
    client::CompletionClient,
    completion::Prompt,
    providers::openrouter,
};
use tracing::debug;

/// Opaque "generate text from a prompt" capability.
///
/// One request, one response. Implementations must not retry: a failed call is
/// surfaced to the caller, which decides whether the whole run aborts.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, preamble: &str, prompt: &str) -> anyhow::Result<String>;
}

/// Text generation through OpenRouter using rig agents
pub struct OpenRouterGenerator {
    client: openrouter::Client,
    model: String,
}

impl OpenRouterGenerator {
    pub fn new(api_key: &str, model: impl Into<String>) -> Self {
        Self {
            client: openrouter::Client::new(api_key),
            model: model.into(),
        }
    }

    fn agent(&self, preamble: &str) -> Agent<openrouter::CompletionModel> {
        self.client
            .agent(&self.model)
            .preamble(preamble)
            .temperature(0.0)
            .build()
    }
}

#[async_trait]
impl TextGenerator for OpenRouterGenerator {
    async fn generate(&self, preamble: &str, prompt: &str) -> anyhow::Result<String> {
        debug!(model = %self.model, prompt_chars = prompt.len(), "Calling text generation");
        let response = self.agent(preamble).prompt(prompt).await?;
        Ok(response)
    }
}
