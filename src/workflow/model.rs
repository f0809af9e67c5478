//! Workflow Data Model
//!
//! Core data structures describing a workflow definition: the step graph,
//! the coarser stage graph, and the contracts and settings around them.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: article-review
//! name: Article review
//! version: 1.0.0
//! steps:
//!   - id: lint
//!     type: task
//!     action: lint_article
//!     next: [score]
//!
//!   - id: score
//!     type: decision
//!     expression: "variables.lint.errors == 0"
//!     next: [publish, reject]
//!     conditions:
//!       reject: "result == false"
//!
//!   - id: publish
//!     type: task
//!     action: publish
//!     retry_policy:
//!       max_retries: 2
//!       retry_delay_seconds: 5
//!
//!   - id: reject
//!     type: task
//!     action: notify_author
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Retry behaviour for a failing step.
///
/// Delays grow linearly: the n-th retry waits `retry_delay_seconds * n`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt
    pub max_retries: u32,

    /// Base delay between attempts, in seconds
    #[serde(default)]
    pub retry_delay_seconds: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay_seconds: u64) -> Self {
        Self {
            max_retries,
            retry_delay_seconds,
        }
    }

    /// Delay to wait before the given retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        Duration::from_secs(self.retry_delay_seconds.saturating_mul(u64::from(retry)))
    }
}

/// Configuration of a `task` step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskConfig {
    /// Name of the external action to invoke (e.g. "send_email")
    pub action: String,

    /// Free-form parameters handed to the action runner
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Configuration of a `decision` step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DecisionConfig {
    /// Boolean expression evaluated against the instance variables
    pub expression: String,
}

/// One named branch of a `parallel` step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParallelBranch {
    pub id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Configuration of a `parallel` step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParallelConfig {
    pub branches: Vec<ParallelBranch>,

    /// Record branch failures in the aggregate instead of failing the step
    #[serde(default)]
    pub best_effort: bool,

    /// Fail on the first observed branch error; in-flight siblings finish
    /// but their results are discarded
    #[serde(default)]
    pub fail_fast: bool,
}

/// Configuration of a `wait` step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WaitConfig {
    /// Resume automatically after this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_seconds: Option<u64>,

    /// Correlation id an external signal must present; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// How a subprocess step relates to its child instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubprocessMode {
    /// Run the child to completion inside the step
    #[default]
    Synchronous,
    /// Start the child and wait for its completion signal
    Asynchronous,
}

/// Configuration of a `subprocess` step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubprocessConfig {
    /// Definition to instantiate (may be the parent's own)
    pub workflow_id: String,

    #[serde(default)]
    pub mode: SubprocessMode,

    /// Input for the child; defaults to the parent's variables
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
}

/// The closed set of step types with their typed configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Task(TaskConfig),
    Decision(DecisionConfig),
    Parallel(ParallelConfig),
    Wait(WaitConfig),
    Subprocess(SubprocessConfig),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Decision(_) => "decision",
            Self::Parallel(_) => "parallel",
            Self::Wait(_) => "wait",
            Self::Subprocess(_) => "subprocess",
        }
    }
}

/// A single step in the step graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier within the definition
    pub id: String,

    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Step type and its configuration
    #[serde(flatten)]
    pub kind: StepKind,

    /// Successor step IDs, in priority order
    #[serde(default)]
    pub next: Vec<String>,

    /// Successor ID -> condition; consulted only with several successors
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub conditions: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl Step {
    /// Creates a step of the given kind with no successors.
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: None,
            kind,
            next: Vec::new(),
            conditions: HashMap::new(),
            retry_policy: None,
        }
    }

    /// Creates a `task` step invoking `action`.
    ///
    /// # Example
    ///
    /// ```
    /// use contentflow::workflow::Step;
    ///
    /// let step = Step::task("notify", "send_email")
    ///     .then("archive")
    ///     .with_retry(2, 5);
    /// assert_eq!(step.next, vec!["archive"]);
    /// ```
    pub fn task(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Task(TaskConfig {
                action: action.into(),
                params: Value::Null,
            }),
        )
    }

    pub fn decision(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Decision(DecisionConfig {
                expression: expression.into(),
            }),
        )
    }

    pub fn parallel(id: impl Into<String>, branches: Vec<ParallelBranch>) -> Self {
        Self::new(
            id,
            StepKind::Parallel(ParallelConfig {
                branches,
                best_effort: false,
                fail_fast: false,
            }),
        )
    }

    pub fn wait(id: impl Into<String>, config: WaitConfig) -> Self {
        Self::new(id, StepKind::Wait(config))
    }

    pub fn subprocess(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        mode: SubprocessMode,
    ) -> Self {
        Self::new(
            id,
            StepKind::Subprocess(SubprocessConfig {
                workflow_id: workflow_id.into(),
                mode,
                input: Value::Null,
            }),
        )
    }

    /// Appends an unconditional successor.
    pub fn then(mut self, step_id: impl Into<String>) -> Self {
        self.next.push(step_id.into());
        self
    }

    /// Appends a successor guarded by `condition`.
    pub fn when(mut self, step_id: impl Into<String>, condition: impl Into<String>) -> Self {
        let step_id = step_id.into();
        self.conditions.insert(step_id.clone(), condition.into());
        self.next.push(step_id);
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay_seconds: u64) -> Self {
        self.retry_policy = Some(RetryPolicy::new(max_retries, retry_delay_seconds));
        self
    }

    /// Sets the parameters of a task step; ignored for other kinds.
    pub fn with_params(mut self, params: Value) -> Self {
        if let StepKind::Task(config) = &mut self.kind {
            config.params = params;
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.next.is_empty()
    }
}

/// Kind of a stage in the stage-graph model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Start,
    Review,
    Approval,
    End,
}

/// A named stage (draft, review, approved, published, ...).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Stage {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: StageKind,
}

impl Stage {
    pub fn new(id: impl Into<String>, kind: StageKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
        }
    }
}

/// A permitted stage move, gated by an action name and roles.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub action: String,
    /// Any one of these roles allows the transition; empty means anyone
    #[serde(default)]
    pub required_roles: Vec<String>,
}

impl Transition {
    pub fn new(from: impl Into<String>, to: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            action: action.into(),
            required_roles: Vec::new(),
        }
    }

    pub fn requires_role(mut self, role: impl Into<String>) -> Self {
        self.required_roles.push(role.into());
        self
    }
}

/// Structural contract for instance input or output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Schema {
    /// Top-level fields that must be present
    #[serde(default)]
    pub required: Vec<String>,
}

impl Schema {
    pub fn requiring<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the required fields absent from `payload`.
    pub fn missing_fields(&self, payload: &Value) -> Vec<String> {
        self.required
            .iter()
            .filter(|field| payload.get(field.as_str()).map_or(true, Value::is_null))
            .cloned()
            .collect()
    }
}

/// Whether `start_instance` runs the instance before returning.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Synchronous,
    Asynchronous,
}

/// Per-definition execution settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Settings {
    /// Instance-wide timeout, checked at step boundaries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_instances: Option<usize>,

    /// How long finished instances are kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,

    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

/// A complete, reusable workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Semantic version string
    #[serde(default = "default_version")]
    pub version: String,

    /// Step graph; the first declared step is the entry point
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Stage graph, used instead of `steps` by approval-style workflows
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Schema>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Schema>,

    #[serde(default)]
    pub settings: Settings,

    /// Cleared on logical deletion
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_active() -> bool {
    true
}

impl WorkflowDefinition {
    /// Creates an empty, active definition.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            steps: Vec::new(),
            stages: Vec::new(),
            transitions: Vec::new(),
            input_schema: None,
            output_schema: None,
            settings: Settings::default(),
            active: true,
        }
    }

    /// Creates a step-graph definition from a list of steps.
    pub fn from_steps(id: impl Into<String>, steps: Vec<Step>) -> Self {
        let id = id.into();
        let mut definition = Self::new(id.clone(), id);
        definition.steps = steps;
        definition
    }

    /// Creates a stage-graph definition.
    pub fn from_stages(
        id: impl Into<String>,
        stages: Vec<Stage>,
        transitions: Vec<Transition>,
    ) -> Self {
        let id = id.into();
        let mut definition = Self::new(id.clone(), id);
        definition.stages = stages;
        definition.transitions = transitions;
        definition
    }

    /// Adds a step, rejecting duplicate IDs.
    pub fn add_step(&mut self, step: Step) -> Result<(), String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn get_step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// The entry point of the step graph.
    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }

    pub fn get_stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// The first declared stage of kind `start`.
    pub fn start_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == StageKind::Start)
    }

    /// True when the definition uses the stage-graph model.
    pub fn is_stage_based(&self) -> bool {
        self.steps.is_empty() && !self.stages.is_empty()
    }

    /// IDs of every step and stage, used when checking edits against live instances.
    pub fn node_ids(&self) -> HashSet<&str> {
        self.steps
            .iter()
            .map(|s| s.id.as_str())
            .chain(self.stages.iter().map(|s| s.id.as_str()))
            .collect()
    }

    /// Returns the number of steps in the definition.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.stages.is_empty()
    }

    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
}
