//! Workflow Service
//!
//! The public facade. Composes the validator, the instance runner and the
//! store, and talks to the surrounding application's collaborators for
//! roles, suggestions, analytics and timers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::content::version::apply_patch;
use crate::content::{diff_fields, select_winner, ABTest, Changes, ContentVersion, Variant};
use crate::error::{DefinitionError, Result, StoreError, WorkflowError};
use crate::execution::Engine;
use crate::services::{AnalyticsFilter, Services, Suggestions};
use crate::store::{DocumentStore, Filter, Repository, Versioned, SUBJECTS};
use crate::workflow::{
    available_actions, resolve_transition, validate, ExecutionMode, HistoryEntry, StageKind,
    WorkflowDefinition, WorkflowInstance,
};

/// Subject field holding the number of the latest content version.
pub const VERSION_COUNTER: &str = "version_count";

/// Action that finalizes the subject.
pub const PUBLISH_ACTION: &str = "publish";

/// Action that attaches AI suggestions.
pub const REVIEW_ACTION: &str = "review";

const SUBJECT_WRITE_ATTEMPTS: usize = 3;

/// A caller-invoked stage action.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub instance_id: String,
    pub action: String,
    pub actor: String,
    pub comment: Option<String>,
    /// Version the caller last read; stale versions are rejected
    pub expected_version: Option<u64>,
}

impl TransitionRequest {
    pub fn new(
        instance_id: impl Into<String>,
        action: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            action: action.into(),
            actor: actor.into(),
            comment: None,
            expected_version: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Entry point for applications embedding the engine.
#[derive(Clone)]
pub struct WorkflowService {
    engine: Engine,
    store: Arc<dyn DocumentStore>,
    versions: Repository<ContentVersion>,
    ab_tests: Repository<ABTest>,
    /// Serializes capped instance starts
    admission: Arc<Mutex<()>>,
}

impl WorkflowService {
    pub fn new(store: Arc<dyn DocumentStore>, services: Services, config: EngineConfig) -> Self {
        Self {
            engine: Engine::new(Arc::clone(&store), services, config),
            versions: Repository::new(Arc::clone(&store)),
            ab_tests: Repository::new(Arc::clone(&store)),
            admission: Arc::new(Mutex::new(())),
            store,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    // ---------------------------------------------------------------
    // Definitions
    // ---------------------------------------------------------------

    /// Validates and stores a new definition.
    pub async fn create_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Versioned<WorkflowDefinition>> {
        validate(&definition)?;

        let id = definition.id.clone();
        match self.engine.definitions().insert(definition).await {
            Ok(stored) => {
                info!("Created workflow '{}'", id);
                Ok(stored)
            }
            Err(StoreError::Conflict { .. }) => Err(WorkflowError::Validation(format!(
                "Workflow '{}' already exists",
                id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces a definition. Steps or stages that an active instance sits
    /// on may not be removed.
    pub async fn update_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Versioned<WorkflowDefinition>> {
        validate(&definition)?;
        let mut stored = self.get_workflow(&definition.id).await?;

        {
            let nodes = definition.node_ids();
            for instance in self.engine.active_instances(&definition.id).await? {
                let position = instance
                    .value
                    .current_step
                    .as_deref()
                    .or(instance.value.current_stage.as_deref());
                if let Some(node) = position {
                    if !nodes.contains(node) {
                        return Err(DefinitionError::InUse {
                            instance_id: instance.value.id.clone(),
                            node: node.to_string(),
                        }
                        .into());
                    }
                }
            }
        }

        stored.value = definition;
        self.engine.definitions().update(&mut stored).await?;
        info!(
            "Updated workflow '{}' (version {})",
            stored.value.id, stored.version
        );
        Ok(stored)
    }

    /// Logical deletion; the definition stays readable for its instances.
    pub async fn deactivate_workflow(&self, id: &str) -> Result<Versioned<WorkflowDefinition>> {
        let mut stored = self.get_workflow(id).await?;
        stored.value.active = false;
        self.engine.definitions().update(&mut stored).await?;
        info!("Deactivated workflow '{}'", id);
        Ok(stored)
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Versioned<WorkflowDefinition>> {
        self.engine
            .definitions()
            .get(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Workflow", id))
    }

    pub async fn list_workflows(&self, active_only: bool) -> Result<Vec<WorkflowDefinition>> {
        let filter = if active_only {
            Filter::new().eq("active", true)
        } else {
            Filter::new()
        };
        Ok(self
            .engine
            .definitions()
            .query(&filter)
            .await?
            .into_iter()
            .map(|doc| doc.value)
            .collect())
    }

    // ---------------------------------------------------------------
    // Instances
    // ---------------------------------------------------------------

    /// Starts an instance and, for step graphs, runs it.
    ///
    /// Synchronous definitions return the instance as it stands after the
    /// run (possibly completed already); asynchronous ones return it as
    /// created while the run continues on the runtime.
    pub async fn start_instance(
        &self,
        workflow_id: &str,
        subject_id: &str,
        input: Value,
        actor: &str,
    ) -> Result<Versioned<WorkflowInstance>> {
        let definition = self.engine.definition(workflow_id).await?;
        if !definition.active {
            return Err(WorkflowError::Validation(format!(
                "Workflow '{}' is inactive",
                workflow_id
            )));
        }
        validate(&definition)?;

        if let Some(schema) = &definition.input_schema {
            let missing = schema.missing_fields(&input);
            if !missing.is_empty() {
                return Err(WorkflowError::Validation(format!(
                    "Input is missing required fields: {}",
                    missing.join(", ")
                )));
            }
        }

        // Count and insert under one lock so concurrent starts through this
        // service cannot both slip under the cap. Services sharing a store
        // from separate processes are not serialized.
        let admission = match definition.settings.max_concurrent_instances {
            Some(limit) => {
                let guard = self.admission.lock().await;
                let active = self.engine.active_instances(workflow_id).await?.len();
                if active >= limit {
                    return Err(WorkflowError::Validation(format!(
                        "Workflow '{}' already has {} active instances (limit {})",
                        workflow_id, active, limit
                    )));
                }
                Some(guard)
            }
            None => None,
        };

        let doc = self
            .engine
            .create_instance(&definition, subject_id, input, actor, None)
            .await?;
        drop(admission);

        if definition.is_stage_based() {
            return Ok(doc);
        }

        match definition.settings.execution_mode {
            ExecutionMode::Synchronous => self.engine.run(doc).await,
            ExecutionMode::Asynchronous => {
                let engine = self.engine.clone();
                let started = doc.clone();
                tokio::spawn(async move {
                    let id = doc.value.id.clone();
                    if let Err(e) = engine.run(doc).await {
                        error!("Background run of instance {} failed: {}", id, e);
                    }
                });
                Ok(started)
            }
        }
    }

    /// Applies a stage action to a stage-graph instance.
    ///
    /// Nothing is written when the action does not match a transition out
    /// of the current stage, when the actor lacks the required roles, or
    /// when `expected_version` is stale.
    pub async fn transition_instance(
        &self,
        request: TransitionRequest,
    ) -> Result<Versioned<WorkflowInstance>> {
        let mut doc = self.engine.instance(&request.instance_id).await?;
        if let Some(expected) = request.expected_version {
            if expected != doc.version {
                return Err(WorkflowError::ConcurrentModification {
                    id: request.instance_id.clone(),
                    expected,
                    actual: doc.version,
                });
            }
        }
        if doc.value.is_terminal() {
            return Err(WorkflowError::Validation(format!(
                "Instance {} has already finished",
                request.instance_id
            )));
        }

        let definition = self.engine.definition(&doc.value.workflow_id).await?;
        let stage = doc.value.current_stage.clone().ok_or_else(|| {
            WorkflowError::Validation(format!(
                "Instance {} is not a stage workflow",
                request.instance_id
            ))
        })?;

        let transition = resolve_transition(&definition, &stage, &request.action)
            .ok_or_else(|| WorkflowError::InvalidTransition {
                instance_id: request.instance_id.clone(),
                stage: stage.clone(),
                action: request.action.clone(),
                available: available_actions(&definition, &stage)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            })?
            .clone();

        if !transition.required_roles.is_empty() {
            let mut allowed = false;
            for role in &transition.required_roles {
                if self.engine.services().roles.has_role(&request.actor, role).await {
                    allowed = true;
                    break;
                }
            }
            if !allowed {
                return Err(WorkflowError::Forbidden {
                    actor: request.actor.clone(),
                    operation: format!("{} from stage '{}'", request.action, stage),
                });
            }
        }

        let publishing = request.action == PUBLISH_ACTION;
        let subject = self.subject_snapshot(&doc.value.subject_id).await?;
        if publishing && subject.is_none() {
            return Err(WorkflowError::not_found("Subject", doc.value.subject_id.clone()));
        }

        let mut entry = HistoryEntry::for_stage(
            &transition.to,
            &request.actor,
            &request.action,
            request.comment.clone(),
        );
        entry.result = json!({ "from": stage, "to": transition.to });
        doc.value.record(entry);

        let snapshot = subject
            .clone()
            .unwrap_or_else(|| json!({ "id": doc.value.subject_id }));
        if request.action == REVIEW_ACTION {
            if let Some(suggestions) = self.suggestions_for(&snapshot).await {
                doc.value.set_variable("suggestions", json!(suggestions));
            }
        }
        if publishing {
            let analytics = self.analytics_for(&doc.value.subject_id).await;
            let suggestions = self.suggestions_for(&snapshot).await;
            doc.value.set_variable(
                "publish_snapshot",
                json!({
                    "analytics": analytics,
                    "suggestions": suggestions,
                    "published_at": Utc::now(),
                }),
            );
        }

        doc.value.current_stage = Some(transition.to.clone());
        let reached_end = definition
            .get_stage(&transition.to)
            .map_or(false, |s| s.kind == StageKind::End);
        if reached_end {
            doc.value.mark_completed();
        }

        self.engine.instances().update(&mut doc).await?;
        info!(
            "Instance {}: '{}' moved {} -> {}",
            doc.value.id, request.action, stage, transition.to
        );

        if publishing {
            self.finalize_subject(&doc.value.subject_id, &request.actor).await?;
        }
        Ok(doc)
    }

    /// Delivers an external signal to a waiting instance.
    pub async fn resume_instance(
        &self,
        instance_id: &str,
        correlation_id: &str,
        payload: Value,
        actor: &str,
    ) -> Result<Versioned<WorkflowInstance>> {
        self.engine
            .resume(instance_id, correlation_id, payload, actor)
            .await
    }

    pub async fn cancel_instance(
        &self,
        instance_id: &str,
        actor: &str,
    ) -> Result<Versioned<WorkflowInstance>> {
        self.engine.cancel(instance_id, actor).await
    }

    pub async fn recover_instance(&self, instance_id: &str) -> Result<Versioned<WorkflowInstance>> {
        self.engine.recover(instance_id).await
    }

    /// Recovers every active instance; used at process start.
    pub async fn recover_all(&self) -> Result<Vec<Versioned<WorkflowInstance>>> {
        let active = self
            .engine
            .instances()
            .query(&Filter::new().eq("status", "active"))
            .await?;

        let mut recovered = Vec::with_capacity(active.len());
        for doc in active {
            recovered.push(self.engine.recover(&doc.value.id).await?);
        }
        Ok(recovered)
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<Versioned<WorkflowInstance>> {
        self.engine.instance(instance_id).await
    }

    pub async fn list_instances(&self, workflow_id: &str) -> Result<Vec<Versioned<WorkflowInstance>>> {
        Ok(self
            .engine
            .instances()
            .query(&Filter::new().eq("workflow_id", workflow_id))
            .await?)
    }

    /// Deletes finished instances older than their definition's
    /// `retention_days`. Returns how many were removed.
    pub async fn purge_expired_instances(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut retention: HashMap<String, Option<u32>> = HashMap::new();
        let mut purged = 0;

        for doc in self.engine.instances().query(&Filter::new()).await? {
            let finished = match doc.value.finished_at() {
                Some(at) if doc.value.is_terminal() => at,
                _ => continue,
            };

            let days = match retention.get(&doc.value.workflow_id) {
                Some(days) => *days,
                None => {
                    let days = self
                        .engine
                        .definitions()
                        .get(&doc.value.workflow_id)
                        .await?
                        .and_then(|d| d.value.settings.retention_days);
                    retention.insert(doc.value.workflow_id.clone(), days);
                    days
                }
            };

            let expires = days.and_then(|days| {
                finished.checked_add_signed(chrono::Duration::days(i64::from(days)))
            });
            if let Some(expires) = expires {
                if expires <= now && self.engine.instances().delete(&doc.value.id).await? {
                    purged += 1;
                }
            }
        }

        if purged > 0 {
            info!("Purged {} expired instances", purged);
        }
        Ok(purged)
    }

    // ---------------------------------------------------------------
    // Subjects and versions
    // ---------------------------------------------------------------

    /// Creates a subject. Later edits go through
    /// [`update_subject`](Self::update_subject) so they are versioned.
    pub async fn create_subject(&self, subject_id: &str, mut body: Value) -> Result<u64> {
        if let Some(map) = body.as_object_mut() {
            map.remove(VERSION_COUNTER);
        }
        match self.store.compare_and_swap(SUBJECTS, subject_id, body, 0).await {
            Ok(version) => {
                info!("Created subject {}", subject_id);
                Ok(version)
            }
            Err(StoreError::Conflict { .. }) => Err(WorkflowError::Validation(format!(
                "Subject '{}' already exists",
                subject_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_subject(&self, subject_id: &str) -> Result<Value> {
        self.subject_snapshot(subject_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Subject", subject_id))
    }

    async fn subject_snapshot(&self, subject_id: &str) -> Result<Option<Value>> {
        Ok(self
            .store
            .get(SUBJECTS, subject_id)
            .await?
            .map(|doc| doc.body))
    }

    /// Applies a patch to a subject and records a version when a tracked
    /// field changed.
    pub async fn update_subject(
        &self,
        subject_id: &str,
        patch: Value,
        actor: &str,
        description: &str,
    ) -> Result<Option<ContentVersion>> {
        let current = self
            .store
            .get(SUBJECTS, subject_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Subject", subject_id))?;

        let config = self.engine.config();
        let changes = diff_fields(&current.body, &patch, |field| {
            field != VERSION_COUNTER && config.is_versioned(field)
        });

        let mut updated = apply_patch(&current.body, &patch);
        if let (Some(map), Some(counter)) = (updated.as_object_mut(), current.body.get(VERSION_COUNTER)) {
            map.insert(VERSION_COUNTER.to_string(), counter.clone());
        }
        self.store
            .compare_and_swap(SUBJECTS, subject_id, updated, current.version)
            .await?;

        if changes.is_empty() {
            return Ok(None);
        }
        self.create_version(subject_id, actor, changes, description)
            .await
            .map(Some)
    }

    /// Appends a version record. Independent of any workflow status.
    pub async fn create_version(
        &self,
        subject_id: &str,
        actor: &str,
        changes: Changes,
        description: &str,
    ) -> Result<ContentVersion> {
        if self.store.get(SUBJECTS, subject_id).await?.is_none() {
            return Err(WorkflowError::not_found("Subject", subject_id));
        }

        let number = self
            .store
            .increment(SUBJECTS, subject_id, VERSION_COUNTER, 1)
            .await?;
        let version = ContentVersion::new(subject_id, number, actor, changes, description);
        let stored = self.versions.insert(version).await?;

        info!(
            "Recorded version {} of subject {} by {}",
            number, subject_id, actor
        );
        Ok(stored.value)
    }

    /// Versions of a subject, oldest first.
    pub async fn list_versions(&self, subject_id: &str) -> Result<Vec<ContentVersion>> {
        let mut versions: Vec<ContentVersion> = self
            .versions
            .query(&Filter::new().eq("subject_id", subject_id))
            .await?
            .into_iter()
            .map(|doc| doc.value)
            .collect();
        versions.sort_by_key(|v| v.number);
        Ok(versions)
    }

    async fn finalize_subject(&self, subject_id: &str, actor: &str) -> Result<()> {
        let patch = json!({
            "status": "published",
            "published_at": Utc::now(),
            "published_by": actor,
        });

        for attempt in 1..=SUBJECT_WRITE_ATTEMPTS {
            let current = self
                .store
                .get(SUBJECTS, subject_id)
                .await?
                .ok_or_else(|| WorkflowError::not_found("Subject", subject_id))?;
            let body = apply_patch(&current.body, &patch);

            match self
                .store
                .compare_and_swap(SUBJECTS, subject_id, body, current.version)
                .await
            {
                Ok(_) => {
                    info!("Subject {} published by {}", subject_id, actor);
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) if attempt < SUBJECT_WRITE_ATTEMPTS => {
                    warn!("Subject {} changed while publishing; retrying", subject_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn suggestions_for(&self, subject: &Value) -> Option<Suggestions> {
        match self.engine.services().suggestions.suggest(subject).await {
            Ok(suggestions) => Some(suggestions),
            Err(e) => {
                warn!("Suggestion service unavailable, continuing without: {}", e);
                None
            }
        }
    }

    async fn analytics_for(&self, subject_id: &str) -> Option<Value> {
        let filter = AnalyticsFilter {
            subject_id: subject_id.to_string(),
            ..Default::default()
        };
        match self.engine.services().analytics.get_analytics(&filter).await {
            Ok(metrics) => Some(json!(metrics)),
            Err(e) => {
                warn!("Analytics unavailable for subject {}: {}", subject_id, e);
                None
            }
        }
    }

    // ---------------------------------------------------------------
    // A/B tests
    // ---------------------------------------------------------------

    /// Starts an experiment and schedules its single completion check.
    pub async fn start_ab_test(
        &self,
        subject_id: &str,
        variants: Vec<Variant>,
        metrics: Vec<String>,
        duration_seconds: u64,
        actor: &str,
    ) -> Result<ABTest> {
        if variants.is_empty() {
            return Err(WorkflowError::Validation(
                "An A/B test needs at least one variant".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = variants.iter().find(|v| !seen.insert(v.id.as_str())) {
            return Err(WorkflowError::Validation(format!(
                "Duplicate variant id '{}'",
                duplicate.id
            )));
        }
        if self.subject_snapshot(subject_id).await?.is_none() {
            return Err(WorkflowError::not_found("Subject", subject_id));
        }

        let test = ABTest::new(subject_id, variants, metrics, duration_seconds, actor);
        let stored = self.ab_tests.insert(test).await?;
        info!(
            "Started A/B test {} on subject {} for {}s",
            stored.value.id, subject_id, duration_seconds
        );

        let service = self.clone();
        let test_id = stored.value.id.clone();
        self.engine.services().scheduler.after(
            Duration::from_secs(duration_seconds),
            Box::pin(async move {
                if let Err(e) = service.complete_ab_test(&test_id).await {
                    warn!("A/B test {} not completed: {}", test_id, e);
                }
            }),
        );

        Ok(stored.value)
    }

    pub async fn complete_ab_test(&self, test_id: &str) -> Result<ABTest> {
        self.complete_ab_test_at(test_id, Utc::now()).await
    }

    /// Scores every variant and records the winner.
    ///
    /// Fails with a validation error before the test is due and after it
    /// has completed; concurrent completions race on the stored version.
    pub async fn complete_ab_test_at(&self, test_id: &str, now: DateTime<Utc>) -> Result<ABTest> {
        let mut doc = self
            .ab_tests
            .get(test_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("ABTest", test_id))?;

        if !doc.value.is_running() {
            return Err(WorkflowError::Validation(format!(
                "A/B test {} has already completed",
                test_id
            )));
        }
        if !doc.value.is_due(now) {
            return Err(WorkflowError::Validation(format!(
                "A/B test {} is not due until {}",
                test_id,
                doc.value.due_at()
            )));
        }

        let analytics = Arc::clone(&self.engine.services().analytics);
        let mut measured = Vec::with_capacity(doc.value.variants.len());
        for variant in &doc.value.variants {
            let filter = AnalyticsFilter {
                subject_id: doc.value.subject_id.clone(),
                variant_id: Some(variant.id.clone()),
                metrics: doc.value.metrics.clone(),
            };
            measured.push((variant.id.clone(), analytics.get_analytics(&filter).await?));
        }

        let results = select_winner(&measured, &doc.value.metrics).ok_or_else(|| {
            WorkflowError::Validation(format!("A/B test {} has no variants", test_id))
        })?;
        info!(
            "A/B test {} completed: winner {} ({:?}% improvement)",
            test_id, results.winner, results.improvement
        );

        doc.value.complete(results, now);
        self.ab_tests.update(&mut doc).await?;
        Ok(doc.value)
    }

    pub async fn get_ab_test(&self, test_id: &str) -> Result<ABTest> {
        self.ab_tests
            .get(test_id)
            .await?
            .map(|doc| doc.value)
            .ok_or_else(|| WorkflowError::not_found("ABTest", test_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ABTestStatus;
    use crate::error::ServiceError;
    use crate::services::{
        ManualScheduler, StaticAnalytics, StaticRoles, SuggestionService,
    };
    use crate::store::MemoryStore;
    use crate::workflow::model::{Schema, Settings};
    use crate::workflow::{InstanceStatus, Stage, Step, Transition};
    use async_trait::async_trait;

    struct FixedSuggestions;

    #[async_trait]
    impl SuggestionService for FixedSuggestions {
        async fn suggest(&self, subject: &Value) -> std::result::Result<Suggestions, ServiceError> {
            let title = subject.get("title").and_then(Value::as_str).unwrap_or("?");
            Ok(Suggestions {
                suggestions: vec![format!("Shorten '{}'", title)],
                scores: [("readability".to_string(), 0.7)].into_iter().collect(),
            })
        }
    }

    struct DownSuggestions;

    #[async_trait]
    impl SuggestionService for DownSuggestions {
        async fn suggest(&self, _subject: &Value) -> std::result::Result<Suggestions, ServiceError> {
            Err(ServiceError::new("model overloaded"))
        }
    }

    fn approval_definition() -> WorkflowDefinition {
        WorkflowDefinition::from_stages(
            "approval",
            vec![
                Stage::new("draft", StageKind::Start),
                Stage::new("review", StageKind::Review),
                Stage::new("published", StageKind::End),
            ],
            vec![
                Transition::new("draft", "review", "review"),
                Transition::new("review", "draft", "reject").requires_role("editor"),
                Transition::new("review", "published", "publish").requires_role("editor"),
            ],
        )
    }

    fn service_with(services: Services) -> (WorkflowService, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let services = services
            .with_scheduler(scheduler.clone())
            .with_roles(Arc::new(StaticRoles::new().with_role("erin", "editor")));
        let service = WorkflowService::new(
            Arc::new(MemoryStore::new()),
            services,
            EngineConfig::default(),
        );
        (service, scheduler)
    }

    fn service() -> (WorkflowService, Arc<ManualScheduler>) {
        service_with(Services::default())
    }

    #[tokio::test]
    async fn test_create_workflow_validates_and_rejects_duplicates() {
        let (service, _) = service();

        let invalid = WorkflowDefinition::from_steps("bad", vec![]);
        assert!(matches!(
            service.create_workflow(invalid).await,
            Err(WorkflowError::Definition(DefinitionError::NoSteps))
        ));

        let valid = WorkflowDefinition::from_steps("ok", vec![Step::task("a", "noop")]);
        let stored = service.create_workflow(valid.clone()).await.unwrap();
        assert_eq!(stored.version, 1);
        assert!(matches!(
            service.create_workflow(valid).await,
            Err(WorkflowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_start_instance_checks() {
        let (service, _) = service();
        assert!(matches!(
            service.start_instance("ghost", "post-1", json!({}), "ana").await,
            Err(WorkflowError::NotFound { .. })
        ));

        let definition = WorkflowDefinition::from_steps("needs-title", vec![Step::task("a", "noop")])
            .with_input_schema(Schema::requiring(["title"]));
        service.create_workflow(definition).await.unwrap();

        let missing = service
            .start_instance("needs-title", "post-1", json!({"body": "x"}), "ana")
            .await;
        assert!(matches!(missing, Err(WorkflowError::Validation(ref m)) if m.contains("title")));

        let done = service
            .start_instance("needs-title", "post-1", json!({"title": "Hi"}), "ana")
            .await
            .unwrap();
        assert_eq!(done.value.status, InstanceStatus::Completed);

        service.deactivate_workflow("needs-title").await.unwrap();
        assert!(matches!(
            service
                .start_instance("needs-title", "post-1", json!({"title": "Hi"}), "ana")
                .await,
            Err(WorkflowError::Validation(_))
        ));
        assert!(service.list_workflows(true).await.unwrap().is_empty());
        assert_eq!(service.list_workflows(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_max_concurrent_instances() {
        let (service, _) = service();
        let definition = approval_definition().with_settings(Settings {
            max_concurrent_instances: Some(1),
            ..Default::default()
        });
        service.create_workflow(definition).await.unwrap();

        service
            .start_instance("approval", "post-1", json!({}), "ana")
            .await
            .unwrap();
        let second = service
            .start_instance("approval", "post-2", json!({}), "ana")
            .await;
        assert!(matches!(second, Err(WorkflowError::Validation(_))));
    }

    #[tokio::test]
    async fn test_concurrent_starts_respect_cap_on_file_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = crate::store::FileStore::open(temp_dir.path()).await.unwrap();
        let service = WorkflowService::new(
            Arc::new(store),
            Services::default().with_scheduler(Arc::new(ManualScheduler::new())),
            EngineConfig::default(),
        );
        let definition = approval_definition().with_settings(Settings {
            max_concurrent_instances: Some(2),
            ..Default::default()
        });
        service.create_workflow(definition).await.unwrap();

        let (a, b, c, d) = tokio::join!(
            service.start_instance("approval", "post-1", json!({}), "ana"),
            service.start_instance("approval", "post-2", json!({}), "ana"),
            service.start_instance("approval", "post-3", json!({}), "ana"),
            service.start_instance("approval", "post-4", json!({}), "ana"),
        );
        let started = [a, b, c, d].iter().filter(|r| r.is_ok()).count();
        assert_eq!(started, 2);
        assert_eq!(service.list_instances("approval").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_asynchronous_execution_mode_runs_in_background() {
        let (service, _) = service();
        let definition = WorkflowDefinition::from_steps("bg", vec![Step::task("a", "noop")])
            .with_settings(Settings {
                execution_mode: ExecutionMode::Asynchronous,
                ..Default::default()
            });
        service.create_workflow(definition).await.unwrap();

        let started = service
            .start_instance("bg", "post-1", json!({}), "ana")
            .await
            .unwrap();
        assert!(started.value.is_running());

        let mut status = InstanceStatus::Active;
        for _ in 0..100 {
            status = service.get_instance(&started.value.id).await.unwrap().value.status;
            if status != InstanceStatus::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_stage_workflow_review_and_publish() {
        let (service, _) = service_with(
            Services::default()
                .with_suggestions(Arc::new(FixedSuggestions))
                .with_analytics(Arc::new(StaticAnalytics::new().with_metric("post-1", "views", 42.0))),
        );
        service.create_workflow(approval_definition()).await.unwrap();
        service
            .create_subject("post-1", json!({"title": "Launch notes", "status": "draft"}))
            .await
            .unwrap();

        let started = service
            .start_instance("approval", "post-1", json!({}), "ana")
            .await
            .unwrap();
        assert_eq!(started.value.current_stage.as_deref(), Some("draft"));

        let reviewed = service
            .transition_instance(TransitionRequest::new(&started.value.id, "review", "ana"))
            .await
            .unwrap();
        assert_eq!(reviewed.value.current_stage.as_deref(), Some("review"));
        assert_eq!(
            reviewed.value.variables["suggestions"]["suggestions"][0],
            "Shorten 'Launch notes'"
        );

        let forbidden = service
            .transition_instance(TransitionRequest::new(&started.value.id, "publish", "ana"))
            .await;
        assert!(matches!(forbidden, Err(WorkflowError::Forbidden { .. })));

        let published = service
            .transition_instance(
                TransitionRequest::new(&started.value.id, "publish", "erin")
                    .with_comment("ship it")
                    .expecting(reviewed.version),
            )
            .await
            .unwrap();
        assert_eq!(published.value.status, InstanceStatus::Completed);
        assert_eq!(
            published.value.variables["publish_snapshot"]["analytics"]["views"],
            42.0
        );
        let last = published.value.history.last().unwrap();
        assert_eq!(last.stage_id.as_deref(), Some("published"));
        assert_eq!(last.comment.as_deref(), Some("ship it"));

        let subject = service.get_subject("post-1").await.unwrap();
        assert_eq!(subject["status"], "published");
        assert_eq!(subject["published_by"], "erin");
    }

    #[tokio::test]
    async fn test_suggestion_failure_does_not_block_review() {
        let (service, _) =
            service_with(Services::default().with_suggestions(Arc::new(DownSuggestions)));
        service.create_workflow(approval_definition()).await.unwrap();
        let started = service
            .start_instance("approval", "post-1", json!({}), "ana")
            .await
            .unwrap();

        let reviewed = service
            .transition_instance(TransitionRequest::new(&started.value.id, "review", "ana"))
            .await
            .unwrap();
        assert_eq!(reviewed.value.current_stage.as_deref(), Some("review"));
        assert!(reviewed.value.variable("suggestions").is_none());
    }

    #[tokio::test]
    async fn test_publish_requires_subject() {
        let (service, _) = service();
        service.create_workflow(approval_definition()).await.unwrap();
        let started = service
            .start_instance("approval", "missing-post", json!({}), "ana")
            .await
            .unwrap();
        let reviewed = service
            .transition_instance(TransitionRequest::new(&started.value.id, "review", "ana"))
            .await
            .unwrap();

        let result = service
            .transition_instance(TransitionRequest::new(&started.value.id, "publish", "erin"))
            .await;
        assert!(matches!(result, Err(WorkflowError::NotFound { .. })));
        let unchanged = service.get_instance(&started.value.id).await.unwrap();
        assert_eq!(unchanged.version, reviewed.version);
    }

    #[tokio::test]
    async fn test_update_workflow_refuses_to_remove_occupied_stage() {
        let (service, _) = service();
        service.create_workflow(approval_definition()).await.unwrap();
        let started = service
            .start_instance("approval", "post-1", json!({}), "ana")
            .await
            .unwrap();
        service
            .transition_instance(TransitionRequest::new(&started.value.id, "review", "ana"))
            .await
            .unwrap();

        let trimmed = WorkflowDefinition::from_stages(
            "approval",
            vec![
                Stage::new("draft", StageKind::Start),
                Stage::new("published", StageKind::End),
            ],
            vec![Transition::new("draft", "published", "publish")],
        );
        let result = service.update_workflow(trimmed).await;
        assert!(matches!(
            result,
            Err(WorkflowError::Definition(DefinitionError::InUse { ref node, .. })) if node == "review"
        ));

        let mut renamed = approval_definition();
        renamed.description = "two-person review".to_string();
        let updated = service.update_workflow(renamed).await.unwrap();
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn test_purge_expired_instances() {
        let (service, _) = service();
        let definition = WorkflowDefinition::from_steps("short-lived", vec![Step::task("a", "noop")])
            .with_settings(Settings {
                retention_days: Some(7),
                ..Default::default()
            });
        service.create_workflow(definition).await.unwrap();
        let done = service
            .start_instance("short-lived", "post-1", json!({}), "ana")
            .await
            .unwrap();

        assert_eq!(service.purge_expired_instances(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::days(8);
        assert_eq!(service.purge_expired_instances(later).await.unwrap(), 1);
        assert!(service.get_instance(&done.value.id).await.is_err());
    }

    #[tokio::test]
    async fn test_update_subject_versions_tracked_changes() {
        let (service, _) = service();
        service
            .create_subject("post-1", json!({"title": "Draft", "body": "Hello"}))
            .await
            .unwrap();

        let first = service
            .update_subject("post-1", json!({"title": "Final"}), "ana", "retitle")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.number, 1);
        assert_eq!(first.changes["title"].old, "Draft");

        let unchanged = service
            .update_subject("post-1", json!({"body": "Hello"}), "ana", "noop")
            .await
            .unwrap();
        assert!(unchanged.is_none());

        let second = service
            .update_subject("post-1", json!({"body": "Bye"}), "kim", "rewrite")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.number, 2);

        let versions = service.list_versions("post-1").await.unwrap();
        let numbers: Vec<i64> = versions.iter().map(|v| v.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(service.get_subject("post-1").await.unwrap()["body"], "Bye");
    }

    #[tokio::test]
    async fn test_version_numbers_survive_repeated_edits() {
        let (service, _) = service();
        service
            .create_subject("post-1", json!({"title": "A", "version_count": 7}))
            .await
            .unwrap();
        let first = service
            .update_subject("post-1", json!({"title": "B"}), "ana", "edit")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.number, 1);

        let recreate = service.create_subject("post-1", json!({"title": "C"})).await;
        assert!(matches!(recreate, Err(WorkflowError::Validation(_))));

        let second = service
            .update_subject("post-1", json!({"title": "C"}), "ana", "edit")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.number, 2);

        let numbers: Vec<i64> = service
            .list_versions("post-1")
            .await
            .unwrap()
            .iter()
            .map(|v| v.number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_create_version_requires_subject() {
        let (service, _) = service();
        let result = service
            .create_version("ghost", "ana", Changes::new(), "nothing")
            .await;
        assert!(matches!(result, Err(WorkflowError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_ab_test_lifecycle() {
        let analytics = StaticAnalytics::new()
            .with_metric("A", "conversion", 10.0)
            .with_metric("B", "conversion", 8.0);
        let (service, scheduler) =
            service_with(Services::default().with_analytics(Arc::new(analytics)));
        service.create_subject("post-1", json!({})).await.unwrap();

        let test = service
            .start_ab_test(
                "post-1",
                vec![
                    Variant::new("A", json!({"title": "Short"})),
                    Variant::new("B", json!({"title": "Long"})),
                ],
                vec!["conversion".to_string()],
                3600,
                "ana",
            )
            .await
            .unwrap();
        assert_eq!(test.status, ABTestStatus::Running);
        assert_eq!(scheduler.pending(), vec![Duration::from_secs(3600)]);

        let early = service.complete_ab_test(&test.id).await;
        assert!(matches!(early, Err(WorkflowError::Validation(ref m)) if m.contains("not due")));

        let due = test.due_at();
        let completed = service.complete_ab_test_at(&test.id, due).await.unwrap();
        let results = completed.results.unwrap();
        assert_eq!(results.winner, "A");
        assert_eq!(results.improvement, Some(25.0));

        let again = service.complete_ab_test_at(&test.id, due).await;
        assert!(matches!(again, Err(WorkflowError::Validation(_))));
    }

    #[tokio::test]
    async fn test_ab_test_scheduled_completion() {
        let (service, scheduler) = service();
        service.create_subject("post-1", json!({})).await.unwrap();

        let test = service
            .start_ab_test(
                "post-1",
                vec![Variant::new("only", Value::Null)],
                vec!["clicks".to_string()],
                0,
                "ana",
            )
            .await
            .unwrap();
        assert_eq!(scheduler.run_pending().await, 1);

        let completed = service.get_ab_test(&test.id).await.unwrap();
        assert_eq!(completed.status, ABTestStatus::Completed);
        assert_eq!(completed.results.unwrap().winner, "only");
    }

    #[tokio::test]
    async fn test_ab_test_input_validation() {
        let (service, _) = service();
        service.create_subject("post-1", json!({})).await.unwrap();

        let empty = service.start_ab_test("post-1", vec![], vec![], 10, "ana").await;
        assert!(matches!(empty, Err(WorkflowError::Validation(_))));

        let duplicate = service
            .start_ab_test(
                "post-1",
                vec![Variant::new("A", Value::Null), Variant::new("A", Value::Null)],
                vec![],
                10,
                "ana",
            )
            .await;
        assert!(matches!(duplicate, Err(WorkflowError::Validation(_))));

        let ghost = service
            .start_ab_test("ghost", vec![Variant::new("A", Value::Null)], vec![], 10, "ana")
            .await;
        assert!(matches!(ghost, Err(WorkflowError::NotFound { .. })));
    }
}
