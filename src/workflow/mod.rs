//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! validating, and navigating workflows.
//!
//! # Structure
//!
//! - [`model`]: Definition data structures (steps, stages, transitions)
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Structural invariants
//! - [`expression`]: Condition language
//! - [`resolver`]: Successor and transition resolution
//! - [`instance`]: Running instances and their history

pub mod expression;
pub mod instance;
pub mod model;
pub mod parser;
pub mod resolver;
pub mod validator;

pub use expression::Expression;
pub use instance::{HistoryEntry, InstanceStatus, ParentLink, WaitState, WorkflowInstance};
pub use model::{
    ExecutionMode, ParallelBranch, RetryPolicy, Schema, Settings, Stage, StageKind, Step,
    StepKind, SubprocessMode, Transition, WaitConfig, WorkflowDefinition,
};
pub use parser::{load_definition, save_definition};
pub use resolver::{available_actions, resolve_next, resolve_transition, Resolution};
pub use validator::{quick_validate, validate};
