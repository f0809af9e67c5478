//! Workflow Execution Engine
//!
//! The instance runner. Drives a step-graph instance forward until it
//! completes, fails, or suspends on a wait:
//!
//! 1. execute the current step (with its retry policy)
//! 2. append an `execute` history entry
//! 3. store the result under `variables[step_id]`
//! 4. checkpoint, so a crash from here on re-resolves instead of re-executing
//! 5. resolve the successor and either finish or move on
//!
//! Every write is a compare-and-swap on the stored instance version.
//! Resumption (signals, wait deadlines, child completion), cancellation
//! and crash recovery re-enter through their own entry points.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::config::{DeadEndPolicy, EngineConfig};
use crate::error::{Result, StepError, StoreError, WorkflowError};
use crate::services::Services;
use crate::store::{DocumentStore, Filter, Repository, Versioned};
use crate::workflow::model::SubprocessConfig;
use crate::workflow::{
    resolve_next, validate, HistoryEntry, ParentLink, Resolution, Step, StepKind, WaitState,
    WorkflowDefinition, WorkflowInstance,
};

use super::step::{execute_step, StepOutcome};

/// Actor recorded for engine-initiated history entries.
pub const SYSTEM_ACTOR: &str = "system";

/// Failure reason for instances that outlive `settings.timeout_seconds`.
pub const TIMEOUT: &str = "Timeout";

/// Failure reason prefix when no successor condition matches.
pub const DEAD_END: &str = "DeadEnd";

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Workflow instance runner.
///
/// Cheap to clone; clones share the store and collaborators.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use contentflow::config::EngineConfig;
/// use contentflow::execution::Engine;
/// use contentflow::services::Services;
/// use contentflow::store::MemoryStore;
///
/// # async fn demo() -> contentflow::Result<()> {
/// let engine = Engine::new(Arc::new(MemoryStore::new()), Services::default(), EngineConfig::default());
/// let definition = engine.definition("article-review").await?;
/// let instance = engine
///     .create_instance(&definition, "post-42", serde_json::json!({}), "ana", None)
///     .await?;
/// let finished = engine.run(instance).await?;
/// println!("{:?}", finished.value.status);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    definitions: Repository<WorkflowDefinition>,
    instances: Repository<WorkflowInstance>,
    services: Services,
    config: Arc<EngineConfig>,
}

impl Engine {
    pub fn new(store: Arc<dyn DocumentStore>, services: Services, config: EngineConfig) -> Self {
        Self {
            definitions: Repository::new(Arc::clone(&store)),
            instances: Repository::new(store),
            services,
            config: Arc::new(config),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn definitions(&self) -> &Repository<WorkflowDefinition> {
        &self.definitions
    }

    pub fn instances(&self) -> &Repository<WorkflowInstance> {
        &self.instances
    }

    /// Loads a definition or fails with `NotFound`.
    pub async fn definition(&self, id: &str) -> Result<WorkflowDefinition> {
        self.definitions
            .get(id)
            .await?
            .map(|doc| doc.value)
            .ok_or_else(|| WorkflowError::not_found("Workflow", id))
    }

    /// Loads an instance or fails with `NotFound`.
    pub async fn instance(&self, id: &str) -> Result<Versioned<WorkflowInstance>> {
        self.instances
            .get(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Instance", id))
    }

    /// Active instances of a workflow.
    pub async fn active_instances(&self, workflow_id: &str) -> Result<Vec<Versioned<WorkflowInstance>>> {
        let filter = Filter::new()
            .eq("workflow_id", workflow_id)
            .eq("status", "active");
        Ok(self.instances.query(&filter).await?)
    }

    /// Persists a new `active/running` instance without running it.
    pub async fn create_instance(
        &self,
        definition: &WorkflowDefinition,
        subject_id: impl Into<String>,
        input: Value,
        actor: impl Into<String>,
        parent: Option<ParentLink>,
    ) -> Result<Versioned<WorkflowInstance>> {
        let mut instance = WorkflowInstance::new(definition, subject_id, input, actor);
        instance.parent = parent;

        let doc = self.instances.insert(instance).await?;
        info!(
            "Created instance {} of workflow '{}'",
            doc.value.id, definition.id
        );
        Ok(doc)
    }

    /// Creates the child instance of a subprocess step.
    pub(crate) async fn create_child(
        &self,
        parent: &WorkflowInstance,
        step_id: &str,
        config: &SubprocessConfig,
        correlation_id: Option<String>,
    ) -> Result<Versioned<WorkflowInstance>> {
        let definition = self.definition(&config.workflow_id).await?;
        if !definition.active {
            return Err(WorkflowError::Validation(format!(
                "Workflow '{}' is inactive",
                definition.id
            )));
        }

        let input = if config.input.is_null() {
            parent.variables.clone()
        } else {
            config.input.clone()
        };
        let link = ParentLink {
            instance_id: parent.id.clone(),
            step_id: step_id.to_string(),
            correlation_id,
            depth: parent.subprocess_depth() + 1,
        };

        self.create_instance(
            &definition,
            parent.subject_id.clone(),
            input,
            parent.initiated_by.clone(),
            Some(link),
        )
        .await
    }

    /// Makes a parked child signal its parent when it terminates.
    pub(crate) async fn link_to_parent(
        &self,
        child: &mut Versioned<WorkflowInstance>,
        correlation_id: String,
    ) -> Result<()> {
        if let Some(link) = child.value.parent.as_mut() {
            link.correlation_id = Some(correlation_id);
        }
        self.instances.update(child).await?;
        Ok(())
    }

    /// Boxed [`run`](Self::run), for call sites inside the run loop itself.
    pub fn run_boxed(
        &self,
        doc: Versioned<WorkflowInstance>,
    ) -> BoxFuture<'_, Result<Versioned<WorkflowInstance>>> {
        Box::pin(self.run(doc))
    }

    /// Advances a running instance until it completes, fails or waits.
    ///
    /// Step failures are recorded on the instance, not returned; the error
    /// path is for store conflicts, missing definitions and invalid graphs.
    pub async fn run(
        &self,
        mut doc: Versioned<WorkflowInstance>,
    ) -> Result<Versioned<WorkflowInstance>> {
        let definition = self.definition(&doc.value.workflow_id).await?;
        if definition.is_stage_based() {
            return Ok(doc);
        }
        validate(&definition)?;

        debug!(
            "Running instance {} of workflow '{}'",
            doc.value.id, definition.id
        );

        loop {
            if !doc.value.is_running() {
                return Ok(doc);
            }

            if doc.value.pending_resolution {
                if !self.advance(&definition, &mut doc).await? {
                    return Ok(doc);
                }
                continue;
            }

            if self.timed_out(&definition, &doc.value) {
                warn!("Instance {} exceeded its timeout", doc.value.id);
                let step_id = doc.value.current_step.clone();
                doc.value.mark_failed(step_id.as_deref(), SYSTEM_ACTOR, TIMEOUT);
                self.finish(&mut doc).await?;
                return Ok(doc);
            }

            let step_id = match doc.value.current_step.clone() {
                Some(id) => id,
                None => {
                    doc.value
                        .mark_failed(None, SYSTEM_ACTOR, "Instance has no current step");
                    self.finish(&mut doc).await?;
                    return Ok(doc);
                }
            };
            let step = match definition.get_step(&step_id) {
                Some(step) => step,
                None => {
                    let reason = format!(
                        "Step '{}' no longer exists in workflow '{}'",
                        step_id, definition.id
                    );
                    doc.value.mark_failed(Some(&step_id), SYSTEM_ACTOR, reason);
                    self.finish(&mut doc).await?;
                    return Ok(doc);
                }
            };

            match self.execute_with_retry(step, &mut doc.value).await {
                Ok(StepOutcome::Completed(result)) => {
                    let actor = doc.value.initiated_by.clone();
                    doc.value.record(HistoryEntry::for_step(
                        &step.id,
                        &actor,
                        "execute",
                        result.clone(),
                    ));
                    doc.value.set_variable(&step.id, result);
                    doc.value.pending_resolution = true;

                    if !self.checkpoint(&mut doc).await? {
                        return Ok(doc);
                    }
                }
                Ok(StepOutcome::Suspended { wait, launch }) => {
                    return self.suspend(doc, wait, launch).await;
                }
                Err(err) => {
                    error!(
                        "Step '{}' failed in instance {}: {}",
                        step.id, doc.value.id, err
                    );
                    let actor = doc.value.initiated_by.clone();
                    doc.value.mark_failed(Some(&step.id), &actor, err.to_string());
                    self.finish(&mut doc).await?;
                    return Ok(doc);
                }
            }
        }
    }

    /// Runs a step, retrying retryable failures per its policy.
    ///
    /// Each failed attempt that will be retried leaves a `retry` history
    /// entry; the n-th retry waits `retry_delay_seconds * n`.
    async fn execute_with_retry(
        &self,
        step: &Step,
        instance: &mut WorkflowInstance,
    ) -> std::result::Result<StepOutcome, StepError> {
        let policy = step.retry_policy.clone();
        let max_retries = policy.as_ref().map_or(0, |p| p.max_retries);
        let mut retry = 0;

        loop {
            match execute_step(self, step, instance).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && retry < max_retries => {
                    retry += 1;
                    let delay = policy
                        .as_ref()
                        .map_or(Duration::ZERO, |p| p.delay_for(retry));
                    warn!(
                        "Step '{}' failed (retry {}/{} in {:?}): {}",
                        step.id, retry, max_retries, delay, err
                    );

                    let actor = instance.initiated_by.clone();
                    instance.record(HistoryEntry::for_step(
                        &step.id,
                        &actor,
                        "retry",
                        json!({ "retry": retry, "error": err.to_string() }),
                    ));
                    self.services.scheduler.delay(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resolves the successor of the current step after its result is
    /// checkpointed. Returns whether the loop should continue.
    async fn advance(
        &self,
        definition: &WorkflowDefinition,
        doc: &mut Versioned<WorkflowInstance>,
    ) -> Result<bool> {
        let step_id = doc.value.current_step.clone().unwrap_or_default();
        let result = doc.value.variable(&step_id).cloned().unwrap_or(Value::Null);

        match resolve_next(definition, &step_id, &result, &doc.value.variables) {
            Ok(Resolution::Next(next)) => {
                debug!("Instance {}: '{}' -> '{}'", doc.value.id, step_id, next);
                doc.value.current_step = Some(next);
                doc.value.pending_resolution = false;
                self.checkpoint(doc).await
            }
            Ok(Resolution::Terminal) => {
                self.complete(definition, doc).await?;
                Ok(false)
            }
            Ok(Resolution::DeadEnd) => {
                match self.config.dead_end_policy {
                    DeadEndPolicy::Fail => {
                        let reason = format!(
                            "{}: no successor condition matched after step '{}'",
                            DEAD_END, step_id
                        );
                        doc.value.mark_failed(Some(&step_id), SYSTEM_ACTOR, reason);
                        self.finish(doc).await?;
                    }
                    DeadEndPolicy::Complete => self.complete(definition, doc).await?,
                }
                Ok(false)
            }
            Err(err) => {
                doc.value
                    .mark_failed(Some(&step_id), SYSTEM_ACTOR, err.to_string());
                self.finish(doc).await?;
                Ok(false)
            }
        }
    }

    /// Completes the instance, enforcing the output contract.
    async fn complete(
        &self,
        definition: &WorkflowDefinition,
        doc: &mut Versioned<WorkflowInstance>,
    ) -> Result<()> {
        if let Some(schema) = &definition.output_schema {
            let missing = schema.missing_fields(&doc.value.variables);
            if !missing.is_empty() {
                let step_id = doc.value.current_step.clone();
                let reason = format!(
                    "Output is missing required fields: {}",
                    missing.join(", ")
                );
                doc.value.mark_failed(step_id.as_deref(), SYSTEM_ACTOR, reason);
                return self.finish(doc).await;
            }
        }

        doc.value.mark_completed();
        info!("Instance {} completed", doc.value.id);
        self.finish(doc).await
    }

    /// Persists a terminal instance and signals a waiting parent.
    async fn finish(&self, doc: &mut Versioned<WorkflowInstance>) -> Result<()> {
        if self.checkpoint(doc).await? {
            self.notify_parent(&doc.value).await;
        }
        Ok(())
    }

    /// Compare-and-swap write of the instance.
    ///
    /// Returns `false` when another writer already finished the instance
    /// (a cancellation, typically); `doc` is then replaced by the stored
    /// copy and the caller must stop.
    async fn checkpoint(&self, doc: &mut Versioned<WorkflowInstance>) -> Result<bool> {
        match self.instances.update(doc).await {
            Ok(()) => Ok(true),
            Err(err @ StoreError::Conflict { .. }) => {
                let latest = self.instance(&doc.value.id).await?;
                if latest.value.is_terminal() {
                    info!(
                        "Instance {} was finished concurrently ({:?}); stopping",
                        latest.value.id, latest.value.status
                    );
                    *doc = latest;
                    Ok(false)
                } else {
                    Err(err.into())
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn suspend(
        &self,
        mut doc: Versioned<WorkflowInstance>,
        wait: WaitState,
        launch: Option<String>,
    ) -> Result<Versioned<WorkflowInstance>> {
        let actor = doc.value.initiated_by.clone();
        doc.value.record(HistoryEntry::for_step(
            &wait.step_id,
            &actor,
            "wait",
            json!({ "correlation_id": wait.correlation_id, "deadline": wait.deadline }),
        ));

        let correlation_id = wait.correlation_id.clone();
        let deadline = wait.deadline;
        doc.value.suspend(wait);
        if !self.checkpoint(&mut doc).await? {
            return Ok(doc);
        }
        info!(
            "Instance {} waiting on correlation id '{}'",
            doc.value.id, correlation_id
        );

        if let Some(deadline) = deadline {
            self.schedule_expiry(&doc.value.id, &correlation_id, deadline);
        }

        if let Some(child_id) = launch {
            let child = self.instance(&child_id).await?;
            self.run_boxed(child).await?;
            return self.instance(&doc.value.id).await;
        }
        Ok(doc)
    }

    fn schedule_expiry(&self, instance_id: &str, correlation_id: &str, deadline: DateTime<Utc>) {
        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let engine = self.clone();
        let instance_id = instance_id.to_string();
        let correlation_id = correlation_id.to_string();

        self.services.scheduler.after(
            delay,
            Box::pin(async move {
                if let Err(e) = engine.expire_wait_boxed(&instance_id, &correlation_id).await {
                    warn!("Wait deadline for instance {} not applied: {}", instance_id, e);
                }
            }),
        );
    }

    /// Resumes an instance suspended on `correlation_id` with `payload` as
    /// the waiting step's result, then keeps running it.
    pub async fn resume(
        &self,
        instance_id: &str,
        correlation_id: &str,
        payload: Value,
        actor: &str,
    ) -> Result<Versioned<WorkflowInstance>> {
        let mut doc = self.instance(instance_id).await?;
        let step_id = match &doc.value.waiting {
            Some(wait) if doc.value.is_active() && wait.correlation_id == correlation_id => {
                wait.step_id.clone()
            }
            _ => {
                return Err(WorkflowError::Validation(format!(
                    "Instance {} is not waiting on correlation id '{}'",
                    instance_id, correlation_id
                )))
            }
        };
        let definition = self.definition(&doc.value.workflow_id).await?;
        let is_subprocess = matches!(
            definition.get_step(&step_id).map(|s| &s.kind),
            Some(StepKind::Subprocess(_))
        );

        info!("Resuming instance {} at step '{}'", instance_id, step_id);
        doc.value.take_wait();
        doc.value
            .record(HistoryEntry::for_step(&step_id, actor, "resume", payload.clone()));

        if is_subprocess && payload.get("status").and_then(Value::as_str) == Some("failed") {
            let err = StepError::Subprocess {
                instance_id: payload["instance_id"].as_str().unwrap_or_default().to_string(),
                message: payload["error"]
                    .as_str()
                    .unwrap_or("child instance failed")
                    .to_string(),
            };
            doc.value.mark_failed(Some(&step_id), SYSTEM_ACTOR, err.to_string());
            self.instances.update(&mut doc).await?;
            self.notify_parent(&doc.value).await;
            return Ok(doc);
        }

        let result = if is_subprocess {
            payload.get("output").cloned().unwrap_or(Value::Null)
        } else {
            payload
        };
        doc.value.set_variable(&step_id, result);
        doc.value.pending_resolution = true;
        self.instances.update(&mut doc).await?;

        self.run(doc).await
    }

    fn resume_boxed<'a>(
        &'a self,
        instance_id: &'a str,
        correlation_id: &'a str,
        payload: Value,
        actor: &'a str,
    ) -> BoxFuture<'a, Result<Versioned<WorkflowInstance>>> {
        Box::pin(self.resume(instance_id, correlation_id, payload, actor))
    }

    /// Deadline callback of a wait step. Resumes with `{"timed_out": true}`
    /// unless the instance has moved on already.
    pub async fn expire_wait(
        &self,
        instance_id: &str,
        correlation_id: &str,
    ) -> Result<Versioned<WorkflowInstance>> {
        let doc = self.instance(instance_id).await?;
        let still_waiting = doc.value.is_waiting()
            && doc
                .value
                .waiting
                .as_ref()
                .map_or(false, |w| w.correlation_id == correlation_id);
        if !still_waiting {
            debug!("Ignoring stale deadline for instance {}", instance_id);
            return Ok(doc);
        }

        info!("Wait deadline reached for instance {}", instance_id);
        self.resume(instance_id, correlation_id, json!({ "timed_out": true }), SYSTEM_ACTOR)
            .await
    }

    fn expire_wait_boxed<'a>(
        &'a self,
        instance_id: &'a str,
        correlation_id: &'a str,
    ) -> BoxFuture<'a, Result<Versioned<WorkflowInstance>>> {
        Box::pin(self.expire_wait(instance_id, correlation_id))
    }

    /// Signals the parent of a terminated subprocess child.
    async fn notify_parent(&self, child: &WorkflowInstance) {
        let (parent_id, correlation_id) = match &child.parent {
            Some(ParentLink {
                instance_id,
                correlation_id: Some(correlation_id),
                ..
            }) if child.is_terminal() => (instance_id.clone(), correlation_id.clone()),
            _ => return,
        };

        let payload = json!({
            "instance_id": child.id,
            "status": child.status,
            "output": child.output,
            "error": child.error,
        });
        debug!("Instance {} signalling parent {}", child.id, parent_id);
        if let Err(e) = self
            .resume_boxed(&parent_id, &correlation_id, payload, SYSTEM_ACTOR)
            .await
        {
            warn!(
                "Could not signal parent {} of instance {}: {}",
                parent_id, child.id, e
            );
        }
    }

    /// Cancels an active instance. Allowed for its initiator and for holders
    /// of the configured admin role. Steps in flight are not interrupted.
    pub async fn cancel(&self, instance_id: &str, actor: &str) -> Result<Versioned<WorkflowInstance>> {
        let mut doc = self.instance(instance_id).await?;
        if doc.value.is_terminal() {
            return Err(WorkflowError::Validation(format!(
                "Instance {} has already finished",
                instance_id
            )));
        }

        let allowed = doc.value.initiated_by == actor
            || self
                .services
                .roles
                .has_role(actor, &self.config.admin_role)
                .await;
        if !allowed {
            return Err(WorkflowError::Forbidden {
                actor: actor.to_string(),
                operation: format!("cancel instance {}", instance_id),
            });
        }

        doc.value.mark_cancelled(actor);
        self.instances.update(&mut doc).await?;
        info!("Instance {} cancelled by {}", instance_id, actor);
        self.notify_parent(&doc.value).await;
        Ok(doc)
    }

    /// Picks up an instance after a crash or restart.
    ///
    /// Running instances continue (re-resolving if their last result was
    /// already recorded); waiting instances get their deadline re-armed.
    pub async fn recover(&self, instance_id: &str) -> Result<Versioned<WorkflowInstance>> {
        let doc = self.instance(instance_id).await?;

        if doc.value.is_running() {
            info!(
                "Recovering instance {} (pending resolution: {})",
                instance_id, doc.value.pending_resolution
            );
            return self.run(doc).await;
        }

        if let Some(wait) = &doc.value.waiting {
            if let Some(deadline) = wait.deadline {
                self.schedule_expiry(&doc.value.id, &wait.correlation_id, deadline);
            }
        }
        Ok(doc)
    }

    fn timed_out(&self, definition: &WorkflowDefinition, instance: &WorkflowInstance) -> bool {
        definition.settings.timeout_seconds.map_or(false, |secs| {
            let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
            let limit = chrono::Duration::seconds(secs);
            instance.age(Utc::now()) >= limit
        })
    }
}
