use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::{
    context::Context,
    error::{GraphError, Result},
    task::{NextAction, Task, TaskResult},
};

/// Type alias for edge condition functions
pub type EdgeCondition = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Edge between tasks in the graph
#[derive(Clone)]
enum Edge {
    Direct {
        from: String,
        to: String,
    },
    /// Routes to `yes` when the condition holds, otherwise to `no`
    Conditional {
        from: String,
        condition: EdgeCondition,
        yes: String,
        no: String,
    },
}

impl Edge {
    fn source(&self) -> &str {
        match self {
            Edge::Direct { from, .. } | Edge::Conditional { from, .. } => from,
        }
    }

    fn target(&self, context: &Context) -> &str {
        match self {
            Edge::Direct { to, .. } => to,
            Edge::Conditional {
                condition, yes, no, ..
            } => {
                if condition(context) {
                    yes
                } else {
                    no
                }
            }
        }
    }
}

/// Position of one run inside a graph
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub current_task_id: String,
    pub status_message: Option<String>,
    pub context: Context,
}

impl Session {
    pub fn new_from_task(sid: impl Into<String>, task_name: &str) -> Self {
        Self {
            id: sid.into(),
            current_task_id: task_name.to_string(),
            status_message: None,
            context: Context::new(),
        }
    }
}

/// A graph of tasks that can be executed
pub struct Graph {
    pub id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    edges: Vec<Edge>,
}

impl Graph {
    /// Execute exactly one task of the session and move it to the next task.
    ///
    /// Callers that want to run the whole graph call this until it reports
    /// [`ExecutionStatus::Completed`].
    pub async fn execute_session(&self, session: &mut Session) -> Result<ExecutionResult> {
        let result = self
            .execute_single_task(&session.current_task_id, session.context.clone())
            .await?;
        session.status_message = result.status_message.clone();

        match &result.next_action {
            NextAction::Continue => {
                let next_task_id = self
                    .find_next_task(&result.task_id, &session.context)
                    .ok_or_else(|| {
                        GraphError::TaskExecutionFailed(format!(
                            "task {} continued but has no outgoing edge",
                            result.task_id
                        ))
                    })?;
                debug!(session_id = %session.id, from = %result.task_id, to = %next_task_id, "Advancing session");
                session.current_task_id = next_task_id;
                Ok(ExecutionResult {
                    response: result.response,
                    status: ExecutionStatus::WaitingForInput,
                })
            }
            NextAction::GoTo(target_id) => {
                if !self.tasks.contains_key(target_id) {
                    return Err(GraphError::TaskNotFound(target_id.clone()));
                }
                session.current_task_id = target_id.clone();
                Ok(ExecutionResult {
                    response: result.response,
                    status: ExecutionStatus::WaitingForInput,
                })
            }
            NextAction::End => Ok(ExecutionResult {
                response: result.response,
                status: ExecutionStatus::Completed,
            }),
        }
    }

    async fn execute_single_task(&self, task_id: &str, context: Context) -> Result<TaskResult> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_string()))?;

        let mut result = task.run(context).await?;
        result.task_id = task_id.to_string();
        Ok(result)
    }

    /// First edge leaving `current_task_id` decides the next task
    pub fn find_next_task(&self, current_task_id: &str, context: &Context) -> Option<String> {
        self.edges
            .iter()
            .find(|edge| edge.source() == current_task_id)
            .map(|edge| edge.target(context).to_string())
    }
}

/// Builder for creating graphs
pub struct GraphBuilder {
    id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    edges: Vec<Edge>,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: HashMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_task(mut self, task: Arc<dyn Task>) -> Self {
        self.tasks.insert(task.id().to_string(), task);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::Direct {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn add_conditional_edge<F>(
        mut self,
        from: impl Into<String>,
        condition: F,
        yes: impl Into<String>,
        no: impl Into<String>,
    ) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge::Conditional {
            from: from.into(),
            condition: Arc::new(condition),
            yes: yes.into(),
            no: no.into(),
        });
        self
    }

    pub fn build(self) -> Graph {
        Graph {
            id: self.id,
            tasks: self.tasks,
            edges: self.edges,
        }
    }
}

/// Status of graph execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub response: Option<String>,
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    /// Stopped after one step; execute the session again to continue
    WaitingForInput,
    /// Workflow completed successfully
    Completed,
}
