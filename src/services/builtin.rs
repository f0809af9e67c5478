//! Built-in collaborator implementations used by the CLI and as defaults.

use std::collections::HashMap;

use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};

use super::{
    AnalyticsFilter, AnalyticsService, Metrics, SuggestionService, Suggestions, TaskContext,
    TaskRunner,
};
use crate::error::ServiceError;

/// Actions every engine understands without extra wiring:
///
/// - `noop`: returns `null`
/// - `echo`: returns its parameters
/// - `log`: logs `params.message` and returns it
/// - `fail`: always fails with `params.message`
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTaskRunner;

#[async_trait]
impl TaskRunner for BuiltinTaskRunner {
    async fn invoke(
        &self,
        action: &str,
        params: &Value,
        context: &TaskContext,
    ) -> Result<Value, ServiceError> {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match action {
            "noop" => Ok(Value::Null),
            "echo" => Ok(params.clone()),
            "log" => {
                info!("[{}:{}] {}", context.instance_id, context.step_id, message);
                Ok(json!(message))
            }
            "fail" => Err(ServiceError::new(if message.is_empty() {
                "action failed"
            } else {
                message
            })),
            other => Err(ServiceError::new(format!("Unknown action '{}'", other))),
        }
    }
}

/// Suggestion service that has nothing to say.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSuggestions;

#[async_trait]
impl SuggestionService for NoSuggestions {
    async fn suggest(&self, _subject: &Value) -> Result<Suggestions, ServiceError> {
        Ok(Suggestions::default())
    }
}

/// Analytics served from a fixed table keyed by variant (or subject) id.
#[derive(Debug, Clone, Default)]
pub struct StaticAnalytics {
    metrics: HashMap<String, Metrics>,
}

impl StaticAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, key: impl Into<String>, metric: impl Into<String>, value: f64) -> Self {
        self.metrics
            .entry(key.into())
            .or_default()
            .insert(metric.into(), value);
        self
    }
}

#[async_trait]
impl AnalyticsService for StaticAnalytics {
    async fn get_analytics(&self, filter: &AnalyticsFilter) -> Result<Metrics, ServiceError> {
        let key = filter.variant_id.as_deref().unwrap_or(&filter.subject_id);
        let all = self.metrics.get(key).cloned().unwrap_or_default();

        if filter.metrics.is_empty() {
            return Ok(all);
        }
        Ok(all
            .into_iter()
            .filter(|(name, _)| filter.metrics.contains(name))
            .collect())
    }
}
