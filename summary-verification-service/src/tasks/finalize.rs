use async_trait::async_trait;
use graph_flow::{Context, NextAction, Task, TaskResult};
use std::sync::Arc;
use tracing::info;

use super::types::{load_run, session_keys};
use crate::storage::DocumentStore;

/// Final write of the run, also settling records that arrived with an exhausted count
pub struct FinalizeTask {
    store: Arc<dyn DocumentStore>,
}

impl FinalizeTask {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Task for FinalizeTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let mut run = load_run(&context)?;
        run.persist(self.store.as_ref()).await?;

        info!(
            document_id = %run.document_id,
            status = run.status.as_str(),
            attempts = run.attempt_count,
            "Verification run finished"
        );

        let status = run.status.as_str().to_string();
        context.set(session_keys::RUN, run).await?;
        Ok(TaskResult::new_with_status(None, NextAction::End, Some(status)))
    }
}
