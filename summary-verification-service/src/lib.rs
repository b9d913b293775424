pub mod config;
pub mod error;
pub mod llm;
pub mod locks;
pub mod models;
pub mod service;
pub mod storage;
pub mod storage_postgres;
pub mod tasks;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ServiceConfig;
pub use error::{GenerationStage, StoreError, VerificationError};
pub use llm::{OpenRouterGenerator, TextGenerator};
pub use models::*;
pub use service::{AppState, build_router, create_app};
pub use storage::{DocumentStore, InMemoryDocumentStore};
pub use storage_postgres::PostgresDocumentStore;
pub use workflow::SummaryVerificationFlow;
