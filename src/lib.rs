//! ContentFlow - Content Workflow Engine
//!
//! Drives content items (posts, pages, media) through editorial stages
//! and executes automated step graphs on their behalf. Every state change
//! is persisted through optimistic concurrency control, so concurrent
//! editors and background runners never silently overwrite each other.
//!
//! # Architecture
//!
//! - [`workflow`]: Definitions, validation, conditions and instances
//! - [`execution`]: The instance runner (retries, waits, parallel branches, subprocesses)
//! - [`store`]: Versioned document storage (in-memory and file-backed)
//! - [`services`]: Collaborator seams for tasks, roles, AI suggestions, analytics and timers
//! - [`content`]: Content versions and A/B tests
//! - [`service`]: The public [`WorkflowService`] facade
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use contentflow::config::EngineConfig;
//! use contentflow::services::Services;
//! use contentflow::store::MemoryStore;
//! use contentflow::workflow::{Step, WorkflowDefinition};
//! use contentflow::WorkflowService;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = WorkflowService::new(
//!         Arc::new(MemoryStore::new()),
//!         Services::default(),
//!         EngineConfig::from_env(),
//!     );
//!
//!     let definition = WorkflowDefinition::from_steps(
//!         "notify",
//!         vec![Step::task("announce", "log")],
//!     );
//!     service.create_workflow(definition).await?;
//!
//!     let instance = service
//!         .start_instance("notify", "post-42", serde_json::json!({}), "editor")
//!         .await?;
//!     println!("{:?}", instance.value.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod content;
pub mod error;
pub mod execution;
pub mod service;
pub mod services;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{Result, WorkflowError};
pub use execution::Engine;
pub use service::{TransitionRequest, WorkflowService};
pub use store::{DocumentStore, FileStore, MemoryStore, Versioned};
pub use workflow::{load_definition, WorkflowDefinition, WorkflowInstance};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ContentFlow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "ContentFlow");
    }

    #[test]
    fn test_module_exports_definition() {
        let definition = WorkflowDefinition::from_steps(
            "test",
            vec![workflow::Step::task("only", "noop")],
        );
        assert_eq!(definition.id, "test");
        assert_eq!(definition.len(), 1);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
