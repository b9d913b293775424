//! Run the full generate/verify/correct loop on a local text file against the live model.
//!
//! Usage: verify_file <path-to-article.txt> [title] [category]

use std::sync::Arc;
use summary_verification_service::{
    Document, InMemoryDocumentStore, OpenRouterGenerator, ServiceConfig, SummaryVerificationFlow,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        error!("Usage: verify_file <path-to-article.txt> [title] [category]");
        return Ok(());
    };
    let title = args.next().unwrap_or_else(|| path.clone());
    let category = args.next();

    let config = ServiceConfig::from_env()?;
    let Some(api_key) = config.openrouter_api_key.as_deref() else {
        error!("OPENROUTER_API_KEY environment variable not set");
        return Ok(());
    };

    let source_content = tokio::fs::read_to_string(&path).await?;
    info!("Loaded {} characters from {}", source_content.len(), path);

    let store = Arc::new(InMemoryDocumentStore::new());
    store.insert(Document::new("local-file", title, source_content, category));

    let generator = Arc::new(OpenRouterGenerator::new(api_key, &config.model));
    let flow = SummaryVerificationFlow::new(store, generator);

    let outcome = flow.run("local-file", false).await?;
    info!(
        "Finished with status {} after {} attempt(s)",
        outcome.status.as_str(),
        outcome.attempts
    );
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(())
}
