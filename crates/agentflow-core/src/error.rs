use thiserror::Error;

/// A convenience `Result` alias using [`AgentflowError`].
pub type AgentflowResult<T> = Result<T, AgentflowError>;

/// Top-level error type for the Agentflow engine.
///
/// Soft conditions ([`AgentflowError::DependencyNotSatisfied`],
/// [`AgentflowError::CapacityUnavailable`]) keep a task queued and are never
/// surfaced as failures. Nothing in this taxonomy is fatal to the host process.
#[derive(Error, Debug)]
pub enum AgentflowError {
    /// Malformed or cyclic definition, rejected at submission and never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A state-machine edge that is not allowed.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state name.
        from: String,
        /// Requested state name.
        to: String,
    },

    /// A task was asked to run before all of its dependencies completed.
    #[error("Dependency not satisfied for task {task}: waiting on {dependency}")]
    DependencyNotSatisfied {
        /// Task that cannot start yet.
        task: String,
        /// First dependency found not completed.
        dependency: String,
    },

    /// The target agent has no spare capacity.
    #[error("Capacity unavailable on agent '{agent}'")]
    CapacityUnavailable {
        /// Agent name.
        agent: String,
    },

    /// The agent executor reported a failure for one attempt.
    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    /// A workflow's resource estimate does not fit the free global capacity.
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    /// A barrier or consensus group reached its deadline.
    #[error("Synchronization timeout on '{id}'")]
    SynchronizationTimeout {
        /// Barrier or consensus id.
        id: String,
    },

    /// Cooperative cancellation.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Lookup of an unknown entity.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration parsing or validation failed.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentflowError {
    /// Soft conditions leave the task queued instead of failing it.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            AgentflowError::DependencyNotSatisfied { .. } | AgentflowError::CapacityUnavailable { .. }
        )
    }

    /// Errors that consume one attempt of a task's retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentflowError::TaskExecution(_) | AgentflowError::SynchronizationTimeout { .. }
        )
    }

    /// Shorthand for building an [`AgentflowError::InvalidTransition`].
    pub fn transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        AgentflowError::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_conditions() {
        let dep = AgentflowError::DependencyNotSatisfied {
            task: "b".into(),
            dependency: "a".into(),
        };
        let cap = AgentflowError::CapacityUnavailable {
            agent: "coder".into(),
        };
        assert!(dep.is_soft());
        assert!(cap.is_soft());
        assert!(!AgentflowError::Validation("cycle".into()).is_soft());
    }

    #[test]
    fn test_retryable() {
        assert!(AgentflowError::TaskExecution("boom".into()).is_retryable());
        assert!(!AgentflowError::Cancelled("cancelled".into()).is_retryable());
    }

    #[test]
    fn test_transition_display() {
        #[derive(Debug)]
        enum S {
            Idle,
            Completed,
        }
        let err = AgentflowError::transition(S::Completed, S::Idle);
        assert_eq!(err.to_string(), "Invalid transition from Completed to Idle");
    }
}
