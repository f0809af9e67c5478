//! Transition Resolution
//!
//! Picks where an instance goes next. The step graph resolves leniently
//! (no matching condition is a dead end the caller must handle); the stage
//! graph resolves strictly (an unknown action is an error).

use log::{debug, warn};
use serde_json::{json, Value};

use crate::error::StepError;

use super::expression::Expression;
use super::model::{Transition, WorkflowDefinition};

/// Outcome of resolving the successor of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Continue with this step
    Next(String),
    /// The step has no successors; the instance is finished
    Terminal,
    /// Several successors, none of whose conditions held
    DeadEnd,
}

/// Builds the context conditions are evaluated against.
pub fn condition_context(result: &Value, variables: &Value) -> Value {
    json!({ "result": result, "variables": variables })
}

/// Resolves the step that follows `current_step_id`.
///
/// - no successors: [`Resolution::Terminal`]
/// - one successor: that successor, unconditionally
/// - several: the first (in declaration order) whose condition is true;
///   a successor without a condition only matches when it is listed first
pub fn resolve_next(
    definition: &WorkflowDefinition,
    current_step_id: &str,
    step_result: &Value,
    variables: &Value,
) -> Result<Resolution, StepError> {
    let step = definition.get_step(current_step_id).ok_or_else(|| {
        StepError::Config(format!(
            "Step '{}' not found in workflow '{}'",
            current_step_id, definition.id
        ))
    })?;

    match step.next.as_slice() {
        [] => Ok(Resolution::Terminal),
        [only] => Ok(Resolution::Next(only.clone())),
        successors => {
            let context = condition_context(step_result, variables);

            for (position, successor) in successors.iter().enumerate() {
                let matched = match step.conditions.get(successor) {
                    Some(source) => {
                        let expression =
                            Expression::parse(source).map_err(|e| StepError::Expression {
                                expression: source.clone(),
                                message: e.to_string(),
                            })?;
                        expression.evaluate(&context)
                    }
                    None => position == 0,
                };

                if matched {
                    debug!("Step '{}' resolved to '{}'", step.id, successor);
                    return Ok(Resolution::Next(successor.clone()));
                }
            }

            warn!(
                "Step '{}' in workflow '{}': no successor condition matched",
                step.id, definition.id
            );
            Ok(Resolution::DeadEnd)
        }
    }
}

/// Finds the stage transition for `action` out of `current_stage`.
///
/// Returns `None` when no transition matches; callers turn that into
/// `InvalidTransition`.
pub fn resolve_transition<'a>(
    definition: &'a WorkflowDefinition,
    current_stage: &str,
    action: &str,
) -> Option<&'a Transition> {
    definition
        .transitions
        .iter()
        .find(|t| t.from == current_stage && t.action == action)
}

/// Actions available from a stage, in declaration order.
pub fn available_actions<'a>(definition: &'a WorkflowDefinition, stage: &str) -> Vec<&'a str> {
    definition
        .transitions
        .iter()
        .filter(|t| t.from == stage)
        .map(|t| t.action.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Stage, StageKind, Step};

    fn branching(condition_for_y: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_steps(
            "branching",
            vec![
                Step::decision("d", "variables.flag").then("x").when("y", condition_for_y),
                Step::task("x", "noop"),
                Step::task("y", "noop"),
            ],
        )
    }

    #[test]
    fn test_terminal_step() {
        let definition = branching("true");
        let resolution = resolve_next(&definition, "x", &Value::Null, &json!({})).unwrap();
        assert_eq!(resolution, Resolution::Terminal);
    }

    #[test]
    fn test_single_successor_is_unconditional() {
        let definition = WorkflowDefinition::from_steps(
            "linear",
            vec![Step::task("a", "noop").then("b"), Step::task("b", "noop")],
        );
        let resolution = resolve_next(&definition, "a", &json!(false), &json!({})).unwrap();
        assert_eq!(resolution, Resolution::Next("b".to_string()));
    }

    #[test]
    fn test_false_condition_always_selects_first() {
        let definition = branching("false");
        for result in [json!(true), json!(false), Value::Null, json!({"any": 1})] {
            let resolution = resolve_next(&definition, "d", &result, &json!({})).unwrap();
            assert_eq!(resolution, Resolution::Next("x".to_string()));
        }
    }

    #[test]
    fn test_first_matching_condition_wins() {
        let definition = WorkflowDefinition::from_steps(
            "scores",
            vec![
                Step::task("score", "rate")
                    .when("high", "result > 8")
                    .when("mid", "result > 4")
                    .when("low", "true"),
                Step::task("high", "noop"),
                Step::task("mid", "noop"),
                Step::task("low", "noop"),
            ],
        );

        let resolve = |r: Value| resolve_next(&definition, "score", &r, &json!({})).unwrap();
        assert_eq!(resolve(json!(9)), Resolution::Next("high".to_string()));
        assert_eq!(resolve(json!(5)), Resolution::Next("mid".to_string()));
        assert_eq!(resolve(json!(1)), Resolution::Next("low".to_string()));
    }

    #[test]
    fn test_dead_end_when_nothing_matches() {
        let definition = WorkflowDefinition::from_steps(
            "dead",
            vec![
                Step::task("a", "noop")
                    .when("b", "variables.go == 'b'")
                    .when("c", "variables.go == 'c'"),
                Step::task("b", "noop"),
                Step::task("c", "noop"),
            ],
        );
        let resolution = resolve_next(&definition, "a", &Value::Null, &json!({"go": "z"})).unwrap();
        assert_eq!(resolution, Resolution::DeadEnd);
    }

    #[test]
    fn test_conditions_see_variables() {
        let definition = branching("variables.route == 'y'");
        let resolution =
            resolve_next(&definition, "d", &json!(false), &json!({"route": "y"})).unwrap();
        // x has no condition and is listed first, so it still wins
        assert_eq!(resolution, Resolution::Next("x".to_string()));
    }

    #[test]
    fn test_unknown_step() {
        let definition = branching("true");
        assert!(resolve_next(&definition, "nope", &Value::Null, &json!({})).is_err());
    }

    #[test]
    fn test_stage_transition_lookup() {
        let definition = WorkflowDefinition::from_stages(
            "approval",
            vec![
                Stage::new("draft", StageKind::Start),
                Stage::new("review", StageKind::Review),
                Stage::new("published", StageKind::End),
            ],
            vec![
                Transition::new("draft", "review", "submit"),
                Transition::new("review", "draft", "reject"),
                Transition::new("review", "published", "publish"),
            ],
        );

        let transition = resolve_transition(&definition, "review", "publish").unwrap();
        assert_eq!(transition.to, "published");
        assert!(resolve_transition(&definition, "draft", "publish").is_none());
        assert_eq!(available_actions(&definition, "review"), vec!["reject", "publish"]);
    }
}
