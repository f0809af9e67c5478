//! Error Taxonomy
//!
//! Every failure the engine can surface. Structural and authorization
//! errors fail fast; only [`StepError`]s are retried, and only when the
//! step declares a retry policy.

use thiserror::Error;

/// Structural problems found in a workflow definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("Workflow has no steps")]
    NoSteps,

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStep(String),

    #[error("Step '{step}' references unknown step '{reference}'")]
    DanglingReference { step: String, reference: String },

    #[error("Cycle detected: step '{from}' leads back to '{to}'")]
    CycleDetected { from: String, to: String },

    #[error("Decision step '{step}' has no condition for successor '{successor}'")]
    MissingCondition { step: String, successor: String },

    #[error("Step '{step}' has an invalid expression '{expression}': {reason}")]
    InvalidExpression {
        step: String,
        expression: String,
        reason: String,
    },

    #[error("Duplicate stage ID: '{0}'")]
    DuplicateStage(String),

    #[error("Transition '{action}' references unknown stage '{stage}'")]
    UnknownStage { action: String, stage: String },

    #[error("Stage workflow has no stage of kind 'start'")]
    MissingStartStage,

    #[error("Stage workflow has no stage of kind 'end'")]
    MissingEndStage,

    #[error("Cannot remove '{node}': active instance {instance_id} is positioned on it")]
    InUse { instance_id: String, node: String },
}

impl DefinitionError {
    /// Stable reason code, suitable for history entries and API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSteps => "NoSteps",
            Self::DuplicateStep(_) => "DuplicateStep",
            Self::DanglingReference { .. } => "DanglingReference",
            Self::CycleDetected { .. } => "CycleDetected",
            Self::MissingCondition { .. } => "MissingCondition",
            Self::InvalidExpression { .. } => "InvalidExpression",
            Self::DuplicateStage(_) => "DuplicateStage",
            Self::UnknownStage { .. } => "UnknownStage",
            Self::MissingStartStage => "MissingStartStage",
            Self::MissingEndStage => "MissingEndStage",
            Self::InUse { .. } => "InUse",
        }
    }
}

/// Failure raised while executing a single step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("Task action '{action}' failed: {message}")]
    Task { action: String, message: String },

    #[error("Expression '{expression}' could not be evaluated: {message}")]
    Expression { expression: String, message: String },

    #[error("Parallel branch '{branch}' failed: {message}")]
    Branch { branch: String, message: String },

    #[error("Subprocess instance {instance_id} failed: {message}")]
    Subprocess { instance_id: String, message: String },

    #[error("Invalid step configuration: {0}")]
    Config(String),
}

impl StepError {
    /// Whether a retry policy may re-run the step after this error.
    ///
    /// Expression and configuration errors are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Task { .. } | Self::Branch { .. } | Self::Subprocess { .. }
        )
    }
}

/// Errors reported by a [`DocumentStore`](crate::store::DocumentStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Version conflict on {collection}/{id}: expected {expected}, found {actual}")]
    Conflict {
        collection: String,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Failure reported by an external collaborator (task runner, analytics,
/// suggestion service).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Top-level error returned by the workflow service and runner.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(
        "Invalid transition '{action}' from stage '{stage}' (instance {instance_id}); available: [{}]",
        available.join(", ")
    )]
    InvalidTransition {
        instance_id: String,
        stage: String,
        action: String,
        available: Vec<String>,
    },

    #[error("Concurrent modification of {id}: expected version {expected}, found {actual}")]
    ConcurrentModification { id: String, expected: u64, actual: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Actor '{actor}' is not allowed to {operation}")]
    Forbidden { actor: String, operation: String },

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Collaborator error: {0}")]
    Service(#[from] ServiceError),
}

impl WorkflowError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                id,
                expected,
                actual,
                ..
            } => Self::ConcurrentModification {
                id,
                expected,
                actual,
            },
            StoreError::NotFound { id, .. } => Self::NotFound {
                kind: "Document",
                id,
            },
            other => Self::Store(other),
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(err))
    }
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_concurrent_modification() {
        let err: WorkflowError = StoreError::Conflict {
            collection: "instances".to_string(),
            id: "i-1".to_string(),
            expected: 1,
            actual: 2,
        }
        .into();

        assert!(matches!(
            err,
            WorkflowError::ConcurrentModification { expected: 1, actual: 2, .. }
        ));
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: WorkflowError = StoreError::NotFound {
            collection: "workflows".to_string(),
            id: "missing".to_string(),
        }
        .into();

        assert!(matches!(err, WorkflowError::NotFound { .. }));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_definition_error_codes() {
        assert_eq!(DefinitionError::NoSteps.code(), "NoSteps");
        let cycle = DefinitionError::CycleDetected {
            from: "c".to_string(),
            to: "a".to_string(),
        };
        assert_eq!(cycle.code(), "CycleDetected");
        assert!(cycle.to_string().contains("'c'"));
    }

    #[test]
    fn test_retryable_step_errors() {
        let task = StepError::Task {
            action: "email".to_string(),
            message: "smtp down".to_string(),
        };
        assert!(task.is_retryable());
        assert!(!StepError::Config("bad".to_string()).is_retryable());
    }
}
