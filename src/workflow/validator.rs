//! Workflow Validation
//!
//! Structural checks run before a definition is persisted and again before
//! an instance is started:
//! - Step graph: non-empty, unique IDs, valid references, no cycles,
//!   complete decision conditions, parsable expressions
//! - Stage graph: unique stages, transitions between known stages,
//!   a start and an end stage
//!
//! Validation is pure; it never mutates the definition.

use std::collections::{HashMap, HashSet};

use log::{debug, info};

use crate::error::DefinitionError;

use super::expression::Expression;
use super::model::{StageKind, Step, StepKind, WorkflowDefinition};

/// Validates a workflow definition.
///
/// Step-graph checks run in a fixed order, each with its own error:
/// 1. At least one step (`NoSteps`)
/// 2. Unique step IDs (`DuplicateStep`)
/// 3. Every `next` entry exists (`DanglingReference`)
/// 4. No cycle reachable from the first step (`CycleDetected`)
/// 5. Decision steps carry conditions for every successor beyond the first
///    (`MissingCondition`)
/// 6. Every expression parses (`InvalidExpression`)
pub fn validate(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if definition.is_stage_based() {
        validate_stages(definition)?;
        info!(
            "Workflow '{}' validated: {} stages, {} transitions",
            definition.id,
            definition.stages.len(),
            definition.transitions.len()
        );
        return Ok(());
    }

    if definition.steps.is_empty() {
        return Err(DefinitionError::NoSteps);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &definition.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::DuplicateStep(step.id.clone()));
        }
    }

    for step in &definition.steps {
        for next_id in &step.next {
            if !seen_ids.contains(next_id.as_str()) {
                return Err(DefinitionError::DanglingReference {
                    step: step.id.clone(),
                    reference: next_id.clone(),
                });
            }
        }
    }

    detect_cycle(definition)?;

    for step in &definition.steps {
        check_conditions(step)?;
        check_expressions(step)?;
    }

    info!(
        "Workflow '{}' validated: {} steps",
        definition.id,
        definition.steps.len()
    );
    Ok(())
}

/// Depth-first traversal from the first declared step with an explicit
/// recursion stack. A successor already on the stack is a back-edge.
fn detect_cycle(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let Some(first) = definition.first_step() else {
        return Ok(());
    };

    let successors: HashMap<&str, &[String]> = definition
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.next.as_slice()))
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: HashSet<&str> = HashSet::new();
    // (node, index of the next successor to explore)
    let mut stack: Vec<(&str, usize)> = vec![(first.id.as_str(), 0)];
    visited.insert(first.id.as_str());
    on_stack.insert(first.id.as_str());

    while let Some((node, cursor)) = stack.last_mut() {
        let node_id: &str = *node;
        let next = successors.get(node_id).copied().unwrap_or(&[]);

        if *cursor >= next.len() {
            on_stack.remove(node_id);
            stack.pop();
            continue;
        }

        let successor = next[*cursor].as_str();
        *cursor += 1;

        if on_stack.contains(successor) {
            debug!("Back-edge {} -> {}", node_id, successor);
            return Err(DefinitionError::CycleDetected {
                from: node_id.to_string(),
                to: successor.to_string(),
            });
        }

        if visited.insert(successor) {
            on_stack.insert(successor);
            stack.push((successor, 0));
        }
    }

    let unreachable = definition.steps.len() - visited.len();
    if unreachable > 0 {
        debug!(
            "Workflow '{}' has {} step(s) unreachable from '{}'",
            definition.id, unreachable, first.id
        );
    }

    Ok(())
}

fn check_conditions(step: &Step) -> Result<(), DefinitionError> {
    if !matches!(step.kind, StepKind::Decision(_)) || step.next.len() < 2 {
        return Ok(());
    }

    for successor in step.next.iter().skip(1) {
        if !step.conditions.contains_key(successor) {
            return Err(DefinitionError::MissingCondition {
                step: step.id.clone(),
                successor: successor.clone(),
            });
        }
    }
    Ok(())
}

fn check_expressions(step: &Step) -> Result<(), DefinitionError> {
    let own = match &step.kind {
        StepKind::Decision(config) => Some(config.expression.as_str()),
        _ => None,
    };

    for expression in own.into_iter().chain(step.conditions.values().map(String::as_str)) {
        if let Err(e) = Expression::parse(expression) {
            return Err(DefinitionError::InvalidExpression {
                step: step.id.clone(),
                expression: expression.to_string(),
                reason: e.to_string(),
            });
        }
    }
    Ok(())
}

fn validate_stages(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let mut stage_ids: HashSet<&str> = HashSet::new();
    for stage in &definition.stages {
        if !stage_ids.insert(stage.id.as_str()) {
            return Err(DefinitionError::DuplicateStage(stage.id.clone()));
        }
    }

    for transition in &definition.transitions {
        for stage in [&transition.from, &transition.to] {
            if !stage_ids.contains(stage.as_str()) {
                return Err(DefinitionError::UnknownStage {
                    action: transition.action.clone(),
                    stage: stage.clone(),
                });
            }
        }
    }

    if !definition.stages.iter().any(|s| s.kind == StageKind::Start) {
        return Err(DefinitionError::MissingStartStage);
    }
    if !definition.stages.iter().any(|s| s.kind == StageKind::End) {
        return Err(DefinitionError::MissingEndStage);
    }
    Ok(())
}

/// Collects every problem instead of stopping at the first.
///
/// Useful for editor feedback; the authoritative check is [`validate`].
pub fn quick_validate(definition: &WorkflowDefinition) -> Vec<String> {
    let mut errors = Vec::new();

    if definition.is_empty() {
        errors.push(DefinitionError::NoSteps.to_string());
        return errors;
    }

    let step_ids: HashSet<_> = definition.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &definition.steps {
        if step.id.trim().is_empty() {
            errors.push("A step has an empty ID".to_string());
        }

        for next_id in &step.next {
            if !step_ids.contains(next_id.as_str()) {
                errors.push(
                    DefinitionError::DanglingReference {
                        step: step.id.clone(),
                        reference: next_id.clone(),
                    }
                    .to_string(),
                );
            }
        }

        if let Err(e) = check_conditions(step) {
            errors.push(e.to_string());
        }
        if let Err(e) = check_expressions(step) {
            errors.push(e.to_string());
        }
    }

    if errors.is_empty() {
        if let Err(e) = validate(definition) {
            errors.push(e.to_string());
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Stage, Transition};

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::from_steps(
            "linear",
            vec![
                Step::task("a", "noop").then("b"),
                Step::task("b", "noop").then("c"),
                Step::task("c", "noop"),
            ],
        )
    }

    #[test]
    fn test_valid_linear_workflow() {
        assert!(validate(&linear()).is_ok());
    }

    #[test]
    fn test_empty_workflow() {
        let definition = WorkflowDefinition::new("empty", "Empty");
        assert_eq!(validate(&definition), Err(DefinitionError::NoSteps));
    }

    #[test]
    fn test_duplicate_ids() {
        let definition = WorkflowDefinition::from_steps(
            "dup",
            vec![Step::task("same", "noop"), Step::task("same", "noop")],
        );
        assert_eq!(
            validate(&definition),
            Err(DefinitionError::DuplicateStep("same".to_string()))
        );
    }

    #[test]
    fn test_dangling_reference() {
        let definition =
            WorkflowDefinition::from_steps("dangling", vec![Step::task("a", "noop").then("ghost")]);

        match validate(&definition) {
            Err(DefinitionError::DanglingReference { step, reference }) => {
                assert_eq!(step, "a");
                assert_eq!(reference, "ghost");
            }
            other => panic!("expected DanglingReference, got {:?}", other),
        }
    }

    #[test]
    fn test_three_step_cycle() {
        let definition = WorkflowDefinition::from_steps(
            "cycle",
            vec![
                Step::task("a", "noop").then("b"),
                Step::task("b", "noop").then("c"),
                Step::task("c", "noop").then("a"),
            ],
        );

        assert_eq!(
            validate(&definition),
            Err(DefinitionError::CycleDetected {
                from: "c".to_string(),
                to: "a".to_string()
            })
        );
    }

    #[test]
    fn test_self_loop() {
        let definition = WorkflowDefinition::from_steps(
            "self",
            vec![Step::task("a", "noop").then("a")],
        );
        assert!(matches!(
            validate(&definition),
            Err(DefinitionError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let definition = WorkflowDefinition::from_steps(
            "diamond",
            vec![
                Step::decision("split", "true")
                    .then("left")
                    .when("right", "result == false"),
                Step::task("left", "noop").then("join"),
                Step::task("right", "noop").then("join"),
                Step::task("join", "noop"),
            ],
        );
        assert!(validate(&definition).is_ok());
    }

    #[test]
    fn test_cycle_unreachable_from_first_step_is_ignored() {
        let definition = WorkflowDefinition::from_steps(
            "island",
            vec![
                Step::task("start", "noop"),
                Step::task("x", "noop").then("y"),
                Step::task("y", "noop").then("x"),
            ],
        );
        assert!(validate(&definition).is_ok());
    }

    #[test]
    fn test_missing_condition() {
        let definition = WorkflowDefinition::from_steps(
            "decide",
            vec![
                Step::decision("gate", "variables.ok").then("yes").then("no"),
                Step::task("yes", "noop"),
                Step::task("no", "noop"),
            ],
        );

        assert_eq!(
            validate(&definition),
            Err(DefinitionError::MissingCondition {
                step: "gate".to_string(),
                successor: "no".to_string()
            })
        );
    }

    #[test]
    fn test_invalid_expression() {
        let definition =
            WorkflowDefinition::from_steps("bad", vec![Step::decision("gate", "a = = b")]);
        assert!(matches!(
            validate(&definition),
            Err(DefinitionError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_stage_definition_valid() {
        let definition = WorkflowDefinition::from_stages(
            "approval",
            vec![
                Stage::new("draft", StageKind::Start),
                Stage::new("review", StageKind::Review),
                Stage::new("published", StageKind::End),
            ],
            vec![
                Transition::new("draft", "review", "submit"),
                Transition::new("review", "published", "publish"),
            ],
        );
        assert!(validate(&definition).is_ok());
    }

    #[test]
    fn test_stage_definition_errors() {
        let unknown = WorkflowDefinition::from_stages(
            "unknown",
            vec![
                Stage::new("draft", StageKind::Start),
                Stage::new("done", StageKind::End),
            ],
            vec![Transition::new("draft", "limbo", "submit")],
        );
        assert!(matches!(
            validate(&unknown),
            Err(DefinitionError::UnknownStage { .. })
        ));

        let no_end = WorkflowDefinition::from_stages(
            "no-end",
            vec![Stage::new("draft", StageKind::Start)],
            vec![],
        );
        assert_eq!(validate(&no_end), Err(DefinitionError::MissingEndStage));

        let no_start = WorkflowDefinition::from_stages(
            "no-start",
            vec![Stage::new("done", StageKind::End)],
            vec![],
        );
        assert_eq!(validate(&no_start), Err(DefinitionError::MissingStartStage));
    }

    #[test]
    fn test_quick_validate_collects_all() {
        let definition = WorkflowDefinition::from_steps(
            "many",
            vec![
                Step::task("a", "noop").then("ghost"),
                Step::decision("b", "x").then("a").then("c"),
                Step::task("c", "noop"),
            ],
        );
        let errors = quick_validate(&definition);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("unknown step")));
        assert!(errors.iter().any(|e| e.contains("no condition")));
    }

    #[test]
    fn test_quick_validate_empty() {
        let errors = quick_validate(&WorkflowDefinition::new("e", "E"));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("no steps"));
    }
}
