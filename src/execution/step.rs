//! Individual Step Execution
//!
//! Dispatches a single step on its kind:
//! - task: one call to the task runner
//! - decision: evaluates the step's expression
//! - parallel: bounded fan-out over named branches, joined by branch id
//! - wait: produces a suspension, never blocks
//! - subprocess: starts a child instance
//!
//! Retries and history are the runner's business; this module only runs
//! one attempt.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, error, warn};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::{ServiceError, StepError};
use crate::services::{TaskContext, TaskRunner};
use crate::workflow::expression;
use crate::workflow::model::{
    DecisionConfig, ParallelConfig, SubprocessConfig, SubprocessMode, TaskConfig, WaitConfig,
};
use crate::workflow::{InstanceStatus, Step, StepKind, WaitState, WorkflowInstance};

use super::engine::Engine;

/// Longest deadline a wait step may request (ten years).
const MAX_WAIT_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Result of one step attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step finished; the value becomes `variables[step_id]`
    Completed(Value),
    /// The instance must wait. `launch` names a child instance to run once
    /// the suspension is durable.
    Suspended {
        wait: WaitState,
        launch: Option<String>,
    },
}

/// Builds the context handed to task actions.
pub fn task_context(step: &Step, instance: &WorkflowInstance) -> TaskContext {
    TaskContext {
        instance_id: instance.id.clone(),
        workflow_id: instance.workflow_id.clone(),
        subject_id: instance.subject_id.clone(),
        step_id: step.id.clone(),
        actor: instance.initiated_by.clone(),
        input: instance.input.clone(),
        variables: instance.variables.clone(),
    }
}

/// Executes one attempt of `step` for `instance`.
pub async fn execute_step(
    engine: &Engine,
    step: &Step,
    instance: &WorkflowInstance,
) -> Result<StepOutcome, StepError> {
    debug!(
        "Executing {} step '{}' of instance {}",
        step.kind.name(),
        step.id,
        instance.id
    );

    match &step.kind {
        StepKind::Task(config) => {
            let tasks = Arc::clone(&engine.services().tasks);
            execute_task(tasks.as_ref(), config, &task_context(step, instance))
                .await
                .map(StepOutcome::Completed)
        }
        StepKind::Decision(config) => execute_decision(config, instance).map(StepOutcome::Completed),
        StepKind::Parallel(config) => execute_parallel(
            Arc::clone(&engine.services().tasks),
            config,
            &task_context(step, instance),
            engine.config().max_parallel_branches,
        )
        .await
        .map(StepOutcome::Completed),
        StepKind::Wait(config) => Ok(StepOutcome::Suspended {
            wait: wait_state(&step.id, config),
            launch: None,
        }),
        StepKind::Subprocess(config) => execute_subprocess(engine, step, config, instance).await,
    }
}

async fn execute_task(
    tasks: &dyn TaskRunner,
    config: &TaskConfig,
    context: &TaskContext,
) -> Result<Value, StepError> {
    tasks
        .invoke(&config.action, &config.params, context)
        .await
        .map_err(|e| StepError::Task {
            action: config.action.clone(),
            message: e.to_string(),
        })
}

/// Decisions see `{variables, input}`.
fn execute_decision(
    config: &DecisionConfig,
    instance: &WorkflowInstance,
) -> Result<Value, StepError> {
    let context = json!({
        "variables": instance.variables,
        "input": instance.input,
    });

    expression::evaluate(&config.expression, &context)
        .map(Value::Bool)
        .map_err(|e| StepError::Expression {
            expression: config.expression.clone(),
            message: e.to_string(),
        })
}

/// Runs every branch with at most `limit` in flight and aggregates the
/// results into an object keyed by branch id.
async fn execute_parallel(
    tasks: Arc<dyn TaskRunner>,
    config: &ParallelConfig,
    context: &TaskContext,
    limit: usize,
) -> Result<Value, StepError> {
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();

    for (index, branch) in config.branches.iter().enumerate() {
        let tasks = Arc::clone(&tasks);
        let semaphore = Arc::clone(&semaphore);
        let branch = branch.clone();
        let context = context.clone();

        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let result = tasks.invoke(&branch.action, &branch.params, &context).await;
            (index, result)
        });
    }

    let mut results: Vec<Option<Result<Value, ServiceError>>> =
        config.branches.iter().map(|_| None).collect();

    while let Some(joined) = set.join_next().await {
        let (index, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!("Parallel branch task of step '{}' aborted: {}", context.step_id, e);
                return Err(StepError::Branch {
                    branch: context.step_id.clone(),
                    message: e.to_string(),
                });
            }
        };

        if let Err(e) = &result {
            let branch = &config.branches[index].id;
            warn!("Branch '{}' of step '{}' failed: {}", branch, context.step_id, e);

            if config.fail_fast && !config.best_effort {
                // Siblings keep running; their results are dropped
                set.detach_all();
                return Err(StepError::Branch {
                    branch: branch.clone(),
                    message: e.to_string(),
                });
            }
        }
        results[index] = Some(result);
    }

    let mut aggregate = Map::new();
    for (branch, result) in config.branches.iter().zip(results) {
        match result {
            Some(Ok(value)) => {
                aggregate.insert(branch.id.clone(), value);
            }
            Some(Err(e)) if config.best_effort => {
                aggregate.insert(branch.id.clone(), json!({ "error": e.to_string() }));
            }
            Some(Err(e)) => {
                return Err(StepError::Branch {
                    branch: branch.id.clone(),
                    message: e.to_string(),
                })
            }
            None => {
                return Err(StepError::Branch {
                    branch: branch.id.clone(),
                    message: "branch produced no result".to_string(),
                })
            }
        }
    }

    Ok(Value::Object(aggregate))
}

fn wait_state(step_id: &str, config: &WaitConfig) -> WaitState {
    WaitState {
        step_id: step_id.to_string(),
        correlation_id: config
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        deadline: config.deadline_seconds.and_then(|secs| {
            let secs = i64::try_from(secs.min(MAX_WAIT_SECONDS)).ok()?;
            Utc::now().checked_add_signed(ChronoDuration::seconds(secs))
        }),
    }
}

async fn execute_subprocess(
    engine: &Engine,
    step: &Step,
    config: &SubprocessConfig,
    parent: &WorkflowInstance,
) -> Result<StepOutcome, StepError> {
    let child_error = |instance_id: &str, message: String| StepError::Subprocess {
        instance_id: instance_id.to_string(),
        message,
    };

    let limit = engine.config().max_subprocess_depth;
    if parent.subprocess_depth() >= limit {
        return Err(StepError::Config(format!(
            "Subprocess '{}' of step '{}' would exceed the nesting limit of {}",
            config.workflow_id, step.id, limit
        )));
    }

    match config.mode {
        SubprocessMode::Asynchronous => {
            let correlation_id = Uuid::new_v4().to_string();
            let child = engine
                .create_child(parent, &step.id, config, Some(correlation_id.clone()))
                .await
                .map_err(|e| child_error("-", e.to_string()))?;

            Ok(StepOutcome::Suspended {
                wait: WaitState {
                    step_id: step.id.clone(),
                    correlation_id,
                    deadline: None,
                },
                launch: Some(child.value.id),
            })
        }
        SubprocessMode::Synchronous => {
            let child = engine
                .create_child(parent, &step.id, config, None)
                .await
                .map_err(|e| child_error("-", e.to_string()))?;
            let child_id = child.value.id.clone();

            let mut child = engine
                .run_boxed(child)
                .await
                .map_err(|e| child_error(&child_id, e.to_string()))?;

            match child.value.status {
                InstanceStatus::Completed => Ok(StepOutcome::Completed(child.value.output)),
                InstanceStatus::Failed => Err(child_error(
                    &child_id,
                    child.value.error.unwrap_or_else(|| "child failed".to_string()),
                )),
                InstanceStatus::Active => {
                    // The child is parked on a wait; hand completion back
                    // through the signal path
                    let correlation_id = Uuid::new_v4().to_string();
                    engine
                        .link_to_parent(&mut child, correlation_id.clone())
                        .await
                        .map_err(|e| child_error(&child_id, e.to_string()))?;
                    Ok(StepOutcome::Suspended {
                        wait: WaitState {
                            step_id: step.id.clone(),
                            correlation_id,
                            deadline: None,
                        },
                        launch: None,
                    })
                }
            }
        }
    }
}
