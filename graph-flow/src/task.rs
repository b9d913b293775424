use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{context::Context, error::Result};

/// Result of a task execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Response to hand back to the caller
    pub response: Option<String>,
    pub next_action: NextAction,
    /// Filled in by the graph with the id of the task that produced this result
    pub task_id: String,
    pub status_message: Option<String>,
}

impl TaskResult {
    pub fn new(response: Option<String>, next_action: NextAction) -> Self {
        Self {
            response,
            next_action,
            task_id: String::new(),
            status_message: None,
        }
    }

    pub fn new_with_status(
        response: Option<String>,
        next_action: NextAction,
        status_message: Option<String>,
    ) -> Self {
        Self {
            status_message,
            ..Self::new(response, next_action)
        }
    }
}

/// Defines what should happen after a task completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NextAction {
    /// Move to the next task along the edges and return to the caller
    Continue,
    /// Jump to a specific task by id and return to the caller
    GoTo(String),
    /// The graph run is complete
    End,
}

/// Core trait that all tasks must implement
#[async_trait]
pub trait Task: Send + Sync {
    /// Unique identifier for this task
    fn id(&self) -> &str;

    async fn run(&self, context: Context) -> Result<TaskResult>;
}
