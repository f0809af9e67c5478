//! Workflow Instances
//!
//! One execution of a definition against a subject. The instance carries
//! everything needed to resume after interruption: the current position,
//! the shared variables, and an append-only history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::model::WorkflowDefinition;

/// Failure reason recorded for cancelled instances.
pub const CANCELLED: &str = "Cancelled";

/// Lifecycle status of an instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Running or waiting; see [`WorkflowInstance::waiting`]
    Active,
    Completed,
    Failed,
}

/// Present while an active instance is suspended on a wait.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WaitState {
    pub step_id: String,
    /// Signals must present this id to resume the instance
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

/// Link from a subprocess child back to the step that started it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParentLink {
    pub instance_id: String,
    pub step_id: String,
    /// Set when the parent waits asynchronously for this child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// 1 for a direct child, 2 for a grandchild, ...
    #[serde(default = "default_depth")]
    pub depth: u32,
}

fn default_depth() -> u32 {
    1
}

/// One entry of the append-only execution log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,

    pub timestamp: DateTime<Utc>,

    pub actor: String,

    /// What happened: execute, wait, resume, fail, cancel, or a stage action
    pub action: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl HistoryEntry {
    pub fn for_step(step_id: &str, actor: &str, action: &str, result: Value) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            stage_id: None,
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            result,
            comment: None,
        }
    }

    pub fn for_stage(stage_id: &str, actor: &str, action: &str, comment: Option<String>) -> Self {
        Self {
            step_id: None,
            stage_id: Some(stage_id.to_string()),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            result: Value::Null,
            comment,
        }
    }
}

/// A running, waiting, or finished execution of a workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowInstance {
    pub id: String,

    pub workflow_id: String,

    /// The business object this instance governs
    pub subject_id: String,

    pub initiated_by: String,

    #[serde(default)]
    pub input: Value,

    /// Shared execution state; step results are stored under the step ID
    #[serde(default)]
    pub variables: Value,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,

    pub status: InstanceStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting: Option<WaitState>,

    /// Set once the current step's result is recorded but its successor
    /// has not been resolved yet
    #[serde(default)]
    pub pending_resolution: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output: Value,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowInstance {
    /// Creates an `active/running` instance positioned at the definition's
    /// first step, or at its start stage for stage-graph definitions.
    ///
    /// Object inputs seed the variables so conditions can read them.
    pub fn new(
        definition: &WorkflowDefinition,
        subject_id: impl Into<String>,
        input: Value,
        actor: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let variables = match &input {
            Value::Object(map) => Value::Object(map.clone()),
            _ => Value::Object(Map::new()),
        };

        let (current_step, current_stage) = if definition.is_stage_based() {
            (None, definition.start_stage().map(|s| s.id.clone()))
        } else {
            (definition.first_step().map(|s| s.id.clone()), None)
        };

        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: definition.id.clone(),
            subject_id: subject_id.into(),
            initiated_by: actor.into(),
            input,
            variables,
            history: Vec::new(),
            current_step,
            current_stage,
            status: InstanceStatus::Active,
            waiting: None,
            pending_resolution: false,
            parent: None,
            output: Value::Null,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    /// Active and not suspended.
    pub fn is_running(&self) -> bool {
        self.is_active() && self.waiting.is_none()
    }

    pub fn is_waiting(&self) -> bool {
        self.is_active() && self.waiting.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Appends a history entry.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.updated_at = entry.timestamp;
        self.history.push(entry);
    }

    /// Stores a step result under the step's ID.
    pub fn set_variable(&mut self, key: &str, value: Value) {
        if !self.variables.is_object() {
            self.variables = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.variables {
            map.insert(key.to_string(), value);
        }
        self.updated_at = Utc::now();
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Suspends the instance on a wait.
    pub fn suspend(&mut self, wait: WaitState) {
        self.current_step = Some(wait.step_id.clone());
        self.waiting = Some(wait);
        self.updated_at = Utc::now();
    }

    /// Clears the wait state, returning it.
    pub fn take_wait(&mut self) -> Option<WaitState> {
        self.updated_at = Utc::now();
        self.waiting.take()
    }

    /// Moves the instance to `completed`.
    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.status = InstanceStatus::Completed;
        self.waiting = None;
        self.pending_resolution = false;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.output = self.variables.clone();
    }

    /// Moves the instance to `failed` and records why.
    pub fn mark_failed(&mut self, step_id: Option<&str>, actor: &str, reason: impl Into<String>) {
        self.terminate_failed("fail", step_id, actor, reason.into());
    }

    /// Fails the instance with reason `Cancelled` on behalf of `actor`.
    pub fn mark_cancelled(&mut self, actor: &str) {
        let step_id = self.current_step.clone();
        self.terminate_failed("cancel", step_id.as_deref(), actor, CANCELLED.to_string());
    }

    fn terminate_failed(&mut self, action: &str, step_id: Option<&str>, actor: &str, reason: String) {
        let now = Utc::now();
        let mut entry = match step_id {
            Some(step) => HistoryEntry::for_step(step, actor, action, Value::Null),
            None => HistoryEntry::for_stage(
                self.current_stage.as_deref().unwrap_or_default(),
                actor,
                action,
                None,
            ),
        };
        entry.timestamp = now;
        entry.comment = Some(reason.clone());
        self.record(entry);

        self.status = InstanceStatus::Failed;
        self.waiting = None;
        self.pending_resolution = false;
        self.failed_at = Some(now);
        self.error = Some(reason);
    }

    /// Time elapsed since creation.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// How many subprocess levels sit above this instance.
    pub fn subprocess_depth(&self) -> u32 {
        self.parent.as_ref().map_or(0, |link| link.depth)
    }

    /// When the instance reached a terminal state.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.failed_at)
    }
}
