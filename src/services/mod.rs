//! Collaborator Interfaces
//!
//! Everything the engine consumes from the surrounding application:
//! role checks, task actions, AI suggestions, analytics and timers.
//! Implementations are injected through [`Services`].

pub mod builtin;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;

pub use builtin::{BuiltinTaskRunner, NoSuggestions, StaticAnalytics};

/// A deferred unit of work handed to a [`Scheduler`].
pub type Callback = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Metric name to value.
pub type Metrics = BTreeMap<String, f64>;

/// Answers whether an actor holds a role.
#[async_trait]
pub trait RoleChecker: Send + Sync {
    async fn has_role(&self, actor: &str, role: &str) -> bool;
}

/// What a task action sees of the instance invoking it.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TaskContext {
    pub instance_id: String,
    pub workflow_id: String,
    pub subject_id: String,
    pub step_id: String,
    pub actor: String,
    pub input: Value,
    pub variables: Value,
}

/// Runs the external actions behind `task` steps and parallel branches.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn invoke(
        &self,
        action: &str,
        params: &Value,
        context: &TaskContext,
    ) -> Result<Value, ServiceError>;
}

/// AI-generated enrichment for a subject snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Suggestions {
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub scores: Metrics,
}

#[async_trait]
pub trait SuggestionService: Send + Sync {
    async fn suggest(&self, subject: &Value) -> Result<Suggestions, ServiceError>;
}

/// Selects the metrics an [`AnalyticsService`] reports.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct AnalyticsFilter {
    pub subject_id: String,
    /// Restricts the report to one A/B variant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    /// Metric names of interest; empty means all
    pub metrics: Vec<String>,
}

#[async_trait]
pub trait AnalyticsService: Send + Sync {
    async fn get_analytics(&self, filter: &AnalyticsFilter) -> Result<Metrics, ServiceError>;
}

/// Timer abstraction used for retries, wait deadlines and A/B completion.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Runs `task` once, `delay` from now. Never blocks the caller.
    fn after(&self, delay: Duration, task: Callback);

    /// Suspends the caller for `duration`.
    async fn delay(&self, duration: Duration);
}

/// Wall-clock scheduler on the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: Callback) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }

    async fn delay(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Scheduler that never sleeps. Delays are recorded and deferred tasks
/// are queued until [`ManualScheduler::run_pending`] is awaited.
#[derive(Default)]
pub struct ManualScheduler {
    delays: Mutex<Vec<Duration>>,
    pending: Mutex<Vec<(Duration, Callback)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested through [`Scheduler::delay`], in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Delays of the queued tasks, in scheduling order.
    pub fn pending(&self) -> Vec<Duration> {
        self.pending
            .lock()
            .map(|p| p.iter().map(|(delay, _)| *delay).collect())
            .unwrap_or_default()
    }

    /// Runs every queued task, including ones queued while running.
    /// Returns how many ran.
    pub async fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch: Vec<(Duration, Callback)> = match self.pending.lock() {
                Ok(mut pending) => pending.drain(..).collect(),
                Err(_) => return ran,
            };
            if batch.is_empty() {
                return ran;
            }
            for (_, task) in batch {
                task.await;
                ran += 1;
            }
        }
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    fn after(&self, delay: Duration, task: Callback) {
        debug!("Deferring task by {:?}", delay);
        if let Ok(mut pending) = self.pending.lock() {
            pending.push((delay, task));
        }
    }

    async fn delay(&self, duration: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
    }
}

/// Fixed actor-to-roles table.
#[derive(Debug, Clone, Default)]
pub struct StaticRoles {
    roles: HashMap<String, HashSet<String>>,
}

impl StaticRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, actor: impl Into<String>, role: impl Into<String>) -> Self {
        self.roles.entry(actor.into()).or_default().insert(role.into());
        self
    }
}

#[async_trait]
impl RoleChecker for StaticRoles {
    async fn has_role(&self, actor: &str, role: &str) -> bool {
        self.roles.get(actor).map_or(false, |roles| roles.contains(role))
    }
}

/// The set of collaborators an engine is wired with.
#[derive(Clone)]
pub struct Services {
    pub tasks: Arc<dyn TaskRunner>,
    pub roles: Arc<dyn RoleChecker>,
    pub suggestions: Arc<dyn SuggestionService>,
    pub analytics: Arc<dyn AnalyticsService>,
    pub scheduler: Arc<dyn Scheduler>,
}

impl Default for Services {
    /// Built-in actions, no roles, no suggestions, empty analytics and the
    /// tokio scheduler.
    fn default() -> Self {
        Self {
            tasks: Arc::new(BuiltinTaskRunner),
            roles: Arc::new(StaticRoles::default()),
            suggestions: Arc::new(NoSuggestions),
            analytics: Arc::new(StaticAnalytics::default()),
            scheduler: Arc::new(TokioScheduler),
        }
    }
}

impl Services {
    pub fn with_tasks(mut self, tasks: Arc<dyn TaskRunner>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_roles(mut self, roles: Arc<dyn RoleChecker>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_suggestions(mut self, suggestions: Arc<dyn SuggestionService>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsService>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_static_roles() {
        let roles = StaticRoles::new()
            .with_role("ana", "editor")
            .with_role("ana", "admin");

        assert!(roles.has_role("ana", "editor").await);
        assert!(roles.has_role("ana", "admin").await);
        assert!(!roles.has_role("kim", "editor").await);
    }

    #[tokio::test]
    async fn test_manual_scheduler_defers_until_run() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        scheduler.after(
            Duration::from_secs(60),
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        scheduler.delay(Duration::from_secs(3)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), vec![Duration::from_secs(60)]);
        assert_eq!(scheduler.delays(), vec![Duration::from_secs(3)]);

        assert_eq!(scheduler.run_pending().await, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(scheduler.pending().is_empty());
    }

    #[tokio::test]
    async fn test_tokio_scheduler_runs_callback() {
        let scheduler = TokioScheduler;
        let (tx, rx) = tokio::sync::oneshot::channel();

        scheduler.after(
            Duration::from_millis(1),
            Box::pin(async move {
                let _ = tx.send(42);
            }),
        );
        assert_eq!(rx.await.unwrap(), 42);
    }
}
