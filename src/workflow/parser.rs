//! Definition Parser
//!
//! Loads workflow definitions from YAML or JSON files and validates them
//! before handing them to the engine.

use std::error::Error;
use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowDefinition;
use super::validator::validate;

/// Serialized form of a definition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    /// Picks the format from a file extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Parses a definition from text without validating it.
pub fn parse_definition(
    content: &str,
    format: DefinitionFormat,
) -> Result<WorkflowDefinition, Box<dyn Error>> {
    let definition: WorkflowDefinition = match format {
        DefinitionFormat::Yaml => serde_yaml::from_str(content).map_err(|e| {
            format!("Failed to parse workflow YAML: {}. Check the file format.", e)
        })?,
        DefinitionFormat::Json => serde_json::from_str(content).map_err(|e| {
            format!("Failed to parse workflow JSON: {}. Check the file format.", e)
        })?,
    };

    debug!(
        "Parsed workflow '{}': {} steps, {} stages",
        definition.id,
        definition.steps.len(),
        definition.stages.len()
    );
    Ok(definition)
}

/// Loads and validates a workflow definition file.
///
/// # Example
///
/// ```rust,no_run
/// use contentflow::workflow::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("article-review.yaml")?;
///     println!("Loaded {} steps", definition.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition, Box<dyn Error>> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        )
    })?;

    debug!("Workflow content loaded ({} bytes)", content.len());

    let definition = parse_definition(&content, DefinitionFormat::from_path(path))?;
    validate(&definition)?;

    Ok(definition)
}

/// Writes a definition to disk in the format implied by the extension.
pub fn save_definition(
    definition: &WorkflowDefinition,
    path: impl AsRef<Path>,
) -> Result<(), Box<dyn Error>> {
    let path = path.as_ref();
    let content = match DefinitionFormat::from_path(path) {
        DefinitionFormat::Yaml => serde_yaml::to_string(definition)?,
        DefinitionFormat::Json => serde_json::to_string_pretty(definition)?,
    };
    fs::write(path, content)?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{StepKind, SubprocessMode};
    use tempfile::tempdir;

    const REVIEW_YAML: &str = r#"
id: article-review
name: Article review
steps:
  - id: lint
    type: task
    action: lint_article
    params:
      strict: true
    next: [gate]
  - id: gate
    type: decision
    expression: "variables.lint.errors == 0"
    next: [publish, reject]
    conditions:
      reject: "result == false"
  - id: publish
    type: subprocess
    workflow_id: publish-pipeline
    mode: asynchronous
  - id: reject
    type: wait
    deadline_seconds: 3600
    retry_policy:
      max_retries: 1
"#;

    #[test]
    fn test_parse_yaml_definition() {
        let definition = parse_definition(REVIEW_YAML, DefinitionFormat::Yaml).unwrap();

        assert_eq!(definition.id, "article-review");
        assert_eq!(definition.steps.len(), 4);
        match &definition.steps[0].kind {
            StepKind::Task(config) => {
                assert_eq!(config.action, "lint_article");
                assert_eq!(config.params["strict"], true);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        match &definition.steps[2].kind {
            StepKind::Subprocess(config) => {
                assert_eq!(config.mode, SubprocessMode::Asynchronous)
            }
            other => panic!("unexpected kind {:?}", other),
        }
        let reject = &definition.steps[3];
        assert_eq!(reject.retry_policy.as_ref().unwrap().retry_delay_seconds, 0);
        assert!(validate(&definition).is_ok());
    }

    #[test]
    fn test_load_definition_file_not_found() {
        let result = load_definition("/nonexistent/path/workflow.yaml");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to read"));
    }

    #[test]
    fn test_load_definition_rejects_invalid_graph() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("cycle.yaml");
        std::fs::write(
            &path,
            r#"
id: cycle
name: Cycle
steps:
  - { id: a, type: task, action: noop, next: [b] }
  - { id: b, type: task, action: noop, next: [a] }
"#,
        )
        .unwrap();

        let result = load_definition(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Cycle"));
    }

    #[test]
    fn test_load_definition_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        std::fs::write(&path, "this is not valid yaml: [[[").unwrap();

        assert!(load_definition(&path).is_err());
    }

    #[test]
    fn test_save_and_reload_json() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("review.json");
        let definition = parse_definition(REVIEW_YAML, DefinitionFormat::Yaml).unwrap();

        save_definition(&definition, &path).unwrap();
        assert_eq!(DefinitionFormat::from_path(&path), DefinitionFormat::Json);

        let reloaded = load_definition(&path).unwrap();
        assert_eq!(reloaded, definition);
    }
}
