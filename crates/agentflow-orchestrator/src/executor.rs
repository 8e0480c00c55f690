use crate::types::Task;
use agentflow_core::AgentflowResult;
use async_trait::async_trait;

/// Performs the actual work of a task on behalf of an agent.
///
/// The scheduler treats this as opaque: `Ok` completes the attempt with the
/// returned value, any `Err` consumes one attempt and is retried while the
/// task has attempts left. Implementations are called from the bounded
/// worker pool and must not assume they run on the scheduling loop.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> AgentflowResult<serde_json::Value>;
}
