//! Iterative kickoff loop — repeated agent turns until approval or cap.
//!
//! Drives the Advocate/Contrarian debate for one phase: each round invokes
//! an opaque agent-turn capability, extracts the contrarian verdict, and
//! carries rejected output forward as feedback for the next round. Inside
//! a round, transient provider failures rotate through the configured
//! model candidates; anything non-retryable fails the whole run loudly.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::{CrucibleError, CrucibleResult, TurnError};
use crate::health::{FailureAction, ModelSelector, ModelStrategySnapshot, RateLimitSnapshot};
use crate::phase::Phase;
use crate::verdict::{extract_verdict, Verdict};

/// Structured inputs handed to an agent turn.
pub type TurnInputs = Map<String, Value>;

/// Default iteration cap when none (or an invalid one) is supplied.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// One agent turn: consumes structured inputs, produces free text.
///
/// The loop depends only on this abstraction, never on a concrete agent
/// framework. A fresh instance is created for every attempt.
pub trait AgentTurn {
    fn run(&mut self, inputs: &TurnInputs) -> Result<String, TurnError>;
}

/// Post-approval implementation turn.
///
/// Returns `None` (or empty text) when the phase has no implementation
/// concept or the implementer produced nothing worth recording.
pub trait ImplementationTurn {
    fn run(
        &mut self,
        phase: Phase,
        base_inputs: &TurnInputs,
        approved: &str,
    ) -> Result<Option<String>, TurnError>;
}

/// Outcome of a single loop round. Immutable once appended.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    /// 1-based iteration index.
    pub iteration: u32,
    /// Verdict recorded for this round.
    pub verdict: Verdict,
    /// Raw result text.
    pub result: String,
}

/// Final result of a kickoff loop invocation.
#[derive(Debug, Clone, Serialize)]
pub struct KickoffOutcome {
    /// Final result text (implementation output when it ran).
    pub result: String,
    /// Verdict of the final history record.
    pub verdict: Verdict,
    /// Number of records in `history`.
    pub iterations_run: usize,
    /// Every round, in order.
    pub history: Vec<IterationRecord>,
    /// Whether the contrarian approved.
    pub accepted: bool,
    /// Whether the cap was exhausted without approval.
    pub limit_reached: bool,
    /// The sanitized iteration cap that was applied.
    pub max_iterations: u32,
    /// Rate-limit headroom observed during the run.
    pub rate_limits: HashMap<String, RateLimitSnapshot>,
    /// Model fallback state at loop end.
    pub model_strategy: ModelStrategySnapshot,
}

/// Sanitize a user/environment-provided iteration cap.
///
/// Any missing, non-parseable, or non-positive value defaults to
/// [`DEFAULT_MAX_ITERATIONS`]. Deliberate: a bad cap degrades to the
/// standard budget instead of failing the run.
pub fn safe_max_iterations(raw: Option<&str>) -> u32 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|parsed| *parsed > 0)
        .map(|parsed| parsed as u32)
        .unwrap_or(DEFAULT_MAX_ITERATIONS)
}

/// Execute agent turns repeatedly until the verdict is APPROVED or the
/// iteration cap is hit.
///
/// Per iteration the inputs are rebuilt from `base_inputs` plus the
/// iteration index, the cap, and — when the previous round was rejected —
/// a `previous_feedback` entry carrying the rejected text. The `studio`
/// phase has no verdict concept: it always records `Unknown` and runs
/// exactly one round.
///
/// After approval (non-studio), `implementation` runs once; non-empty
/// output is appended to the history as an `Implementation` record and
/// becomes the final result.
pub fn run_iterative_kickoff<F>(
    mut turn_factory: F,
    phase: Phase,
    base_inputs: &TurnInputs,
    max_iterations: Option<&str>,
    selector: &ModelSelector,
    implementation: Option<&mut dyn ImplementationTurn>,
) -> CrucibleResult<KickoffOutcome>
where
    F: FnMut() -> Box<dyn AgentTurn>,
{
    let cap = safe_max_iterations(max_iterations);
    let mut history: Vec<IterationRecord> = Vec::new();
    let mut verdict = Verdict::Unknown;

    for iteration in 1..=cap {
        let mut inputs = base_inputs.clone();
        inputs.insert("iteration".to_string(), json!(iteration));
        inputs.insert("max_iterations".to_string(), json!(cap));

        let feedback = match history.last() {
            Some(previous) if previous.verdict == Verdict::Rejected => format!(
                "The previous iteration was REJECTED. Address this feedback in your revised proposal:\n\n{}",
                previous.result
            ),
            _ => String::new(),
        };
        inputs.insert("previous_feedback".to_string(), json!(feedback));

        let result = run_with_fallback(&mut turn_factory, iteration, &inputs, selector)?;

        if phase.has_verdict() {
            verdict = extract_verdict(&result);
        }
        let recorded = if phase.has_verdict() {
            verdict
        } else {
            Verdict::Unknown
        };
        history.push(IterationRecord {
            iteration,
            verdict: recorded,
            result,
        });
        info!(phase = %phase, iteration, verdict = %recorded, "iteration complete");

        if phase.is_studio() || verdict.is_approved() {
            break;
        }
    }

    let accepted = verdict.is_approved();

    if accepted && !phase.is_studio() {
        if let Some(turn) = implementation {
            let approved = history
                .last()
                .expect("loop runs at least one iteration")
                .result
                .clone();
            if let Some(text) = turn.run(phase, base_inputs, &approved)? {
                if !text.is_empty() {
                    let iteration = history.len() as u32 + 1;
                    history.push(IterationRecord {
                        iteration,
                        verdict: Verdict::Implementation,
                        result: text,
                    });
                    verdict = Verdict::Implementation;
                    info!(phase = %phase, "implementation turn recorded");
                }
            }
        }
    }

    let result = history
        .last()
        .expect("loop runs at least one iteration")
        .result
        .clone();
    let iterations_run = history.len();
    let limit_reached = iterations_run >= cap as usize && !accepted && !phase.is_studio();

    Ok(KickoffOutcome {
        result,
        verdict,
        iterations_run,
        history,
        accepted,
        limit_reached,
        max_iterations: cap,
        rate_limits: selector.monitor().snapshot(),
        model_strategy: selector.snapshot(),
    })
}

/// One iteration's inner model-retry loop.
///
/// Up to `max(1, candidate_count)` attempts, each with a freshly selected
/// candidate and a fresh agent-turn instance. Retryable failures rotate to
/// the next candidate; fatal or final failures propagate unchanged.
fn run_with_fallback<F>(
    turn_factory: &mut F,
    iteration: u32,
    inputs: &TurnInputs,
    selector: &ModelSelector,
) -> CrucibleResult<String>
where
    F: FnMut() -> Box<dyn AgentTurn>,
{
    let attempts = selector.candidate_count().max(1);

    for attempt in 1..=attempts {
        let candidate = selector.select_model();
        let mut attempt_inputs = inputs.clone();
        attempt_inputs.insert("model".to_string(), json!(candidate.clone()));

        let mut turn = turn_factory();
        match turn.run(&attempt_inputs) {
            Ok(text) => return Ok(text),
            Err(err) => match selector.classify_failure(&candidate, &err) {
                FailureAction::Retry if attempt < attempts => {
                    warn!(
                        candidate = %candidate,
                        attempt,
                        error = %err,
                        "retryable agent-turn failure, rotating candidate"
                    );
                }
                _ => return Err(CrucibleError::Turn(err)),
            },
        }
    }

    // Defensive: the match above always returns on the final attempt.
    Err(CrucibleError::AllCandidatesFailed {
        iteration,
        attempted: attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthConfig, RateLimitMonitor};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    /// Yields scripted outcomes, one per agent-turn invocation.
    struct ScriptedTurns {
        responses: Rc<RefCell<Vec<Result<String, TurnError>>>>,
        calls: Rc<RefCell<usize>>,
    }

    impl ScriptedTurns {
        fn new(responses: Vec<Result<String, TurnError>>) -> Self {
            Self {
                responses: Rc::new(RefCell::new(responses)),
                calls: Rc::new(RefCell::new(0)),
            }
        }

        fn factory(&self) -> impl FnMut() -> Box<dyn AgentTurn> {
            let responses = Rc::clone(&self.responses);
            let calls = Rc::clone(&self.calls);
            move || {
                Box::new(OneShot {
                    responses: Rc::clone(&responses),
                    calls: Rc::clone(&calls),
                }) as Box<dyn AgentTurn>
            }
        }

        fn calls(&self) -> usize {
            *self.calls.borrow()
        }
    }

    struct OneShot {
        responses: Rc<RefCell<Vec<Result<String, TurnError>>>>,
        calls: Rc<RefCell<usize>>,
    }

    impl AgentTurn for OneShot {
        fn run(&mut self, _inputs: &TurnInputs) -> Result<String, TurnError> {
            *self.calls.borrow_mut() += 1;
            self.responses.borrow_mut().remove(0)
        }
    }

    struct FixedImplementation(Option<String>);

    impl ImplementationTurn for FixedImplementation {
        fn run(
            &mut self,
            _phase: Phase,
            _base_inputs: &TurnInputs,
            _approved: &str,
        ) -> Result<Option<String>, TurnError> {
            Ok(self.0.clone())
        }
    }

    fn selector() -> ModelSelector {
        ModelSelector::with_candidates(
            HealthConfig::default(),
            Arc::new(RateLimitMonitor::default()),
            vec!["alpha".to_string(), "beta".to_string()],
        )
    }

    fn inputs() -> TurnInputs {
        let mut map = TurnInputs::new();
        map.insert("idea".to_string(), json!("a web stealth roguelike"));
        map
    }

    #[test]
    fn test_safe_max_iterations_boundary_table() {
        assert_eq!(safe_max_iterations(None), 3);
        assert_eq!(safe_max_iterations(Some("")), 3);
        assert_eq!(safe_max_iterations(Some("0")), 3);
        assert_eq!(safe_max_iterations(Some("-1")), 3);
        assert_eq!(safe_max_iterations(Some("5")), 5);
        assert_eq!(safe_max_iterations(Some("10")), 10);
        assert_eq!(safe_max_iterations(Some("not a number")), 3);
    }

    #[test]
    fn test_iterates_until_approved_before_cap() {
        let turns = ScriptedTurns::new(vec![
            Ok("Some critique...\nVERDICT: REJECTED".to_string()),
            Ok("Improved plan!\nVERDICT: APPROVED".to_string()),
        ]);
        let selector = selector();

        let outcome = run_iterative_kickoff(
            turns.factory(),
            Phase::Market,
            &inputs(),
            Some("5"),
            &selector,
            None,
        )
        .unwrap();

        assert_eq!(outcome.verdict, Verdict::Approved);
        assert_eq!(outcome.iterations_run, 2);
        assert!(outcome.accepted);
        assert!(!outcome.limit_reached);
        assert_eq!(outcome.max_iterations, 5);
    }

    #[test]
    fn test_respects_iteration_cap_and_flags_limit() {
        let turns = ScriptedTurns::new(vec![
            Ok("Still bad.\nVERDICT: REJECTED".to_string()),
            Ok("Nope.\nVERDICT: REJECTED".to_string()),
        ]);
        let selector = selector();

        let outcome = run_iterative_kickoff(
            turns.factory(),
            Phase::Design,
            &inputs(),
            Some("2"),
            &selector,
            None,
        )
        .unwrap();

        assert_eq!(outcome.verdict, Verdict::Rejected);
        assert_eq!(outcome.iterations_run, 2);
        assert!(!outcome.accepted);
        assert!(outcome.limit_reached);
    }

    #[test]
    fn test_rejection_feedback_reaches_next_round() {
        let seen_feedback = Rc::new(RefCell::new(Vec::<String>::new()));

        struct Recorder {
            responses: Rc<RefCell<Vec<String>>>,
            seen: Rc<RefCell<Vec<String>>>,
        }
        impl AgentTurn for Recorder {
            fn run(&mut self, inputs: &TurnInputs) -> Result<String, TurnError> {
                let feedback = inputs
                    .get("previous_feedback")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.seen.borrow_mut().push(feedback);
                Ok(self.responses.borrow_mut().remove(0))
            }
        }

        let responses = Rc::new(RefCell::new(vec![
            "Fatal flaw: No monetization.\nVERDICT: REJECTED".to_string(),
            "Added monetization!\nVERDICT: APPROVED".to_string(),
        ]));
        let selector = selector();

        let outcome = {
            let responses = Rc::clone(&responses);
            let seen = Rc::clone(&seen_feedback);
            run_iterative_kickoff(
                move || {
                    Box::new(Recorder {
                        responses: Rc::clone(&responses),
                        seen: Rc::clone(&seen),
                    }) as Box<dyn AgentTurn>
                },
                Phase::Design,
                &inputs(),
                Some("5"),
                &selector,
                None,
            )
            .unwrap()
        };

        assert!(outcome.accepted);
        assert_eq!(outcome.history[0].verdict, Verdict::Rejected);
        assert_eq!(outcome.history[1].verdict, Verdict::Approved);

        let seen = seen_feedback.borrow();
        assert_eq!(seen[0], "");
        assert!(seen[1].contains("Fatal flaw"));
        assert!(seen[1].contains("REJECTED"));
    }

    #[test]
    fn test_implementation_runs_after_approval() {
        let turns = ScriptedTurns::new(vec![Ok("Great idea!\nVERDICT: APPROVED".to_string())]);
        let selector = selector();
        let mut implementation =
            FixedImplementation(Some("## Implementation\n\n1. Target audience".to_string()));

        let outcome = run_iterative_kickoff(
            turns.factory(),
            Phase::Market,
            &inputs(),
            Some("5"),
            &selector,
            Some(&mut implementation),
        )
        .unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.iterations_run, 2);
        assert_eq!(outcome.verdict, Verdict::Implementation);
        assert_eq!(outcome.history[0].verdict, Verdict::Approved);
        assert_eq!(outcome.history[1].verdict, Verdict::Implementation);
        assert!(outcome.result.contains("## Implementation"));
    }

    #[test]
    fn test_implementation_skipped_when_empty() {
        let turns = ScriptedTurns::new(vec![Ok("VERDICT: APPROVED".to_string())]);
        let selector = selector();
        let mut implementation = FixedImplementation(None);

        let outcome = run_iterative_kickoff(
            turns.factory(),
            Phase::Market,
            &inputs(),
            Some("5"),
            &selector,
            Some(&mut implementation),
        )
        .unwrap();

        assert_eq!(outcome.iterations_run, 1);
        assert_eq!(outcome.verdict, Verdict::Approved);
    }

    #[test]
    fn test_studio_phase_single_round_no_verdict() {
        let turns = ScriptedTurns::new(vec![Ok("Roundtable synthesis text".to_string())]);
        let selector = selector();

        let outcome = run_iterative_kickoff(
            turns.factory(),
            Phase::Studio,
            &inputs(),
            Some("5"),
            &selector,
            None,
        )
        .unwrap();

        assert_eq!(outcome.iterations_run, 1);
        assert_eq!(outcome.verdict, Verdict::Unknown);
        assert!(!outcome.accepted);
        assert!(!outcome.limit_reached);
    }

    #[test]
    fn test_retry_rotates_candidate_on_rate_limit() {
        let turns = ScriptedTurns::new(vec![
            Err(TurnError::new("rate limited").with_status(429)),
            Ok("VERDICT: APPROVED".to_string()),
        ]);
        let selector = selector();

        let outcome = run_iterative_kickoff(
            turns.factory(),
            Phase::Market,
            &inputs(),
            Some("3"),
            &selector,
            None,
        )
        .unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.iterations_run, 1);
        assert_eq!(turns.calls(), 2);
        // The failing candidate was cooled down and the retry moved on.
        assert_eq!(outcome.model_strategy.cooling, vec!["alpha".to_string()]);
    }

    #[test]
    fn test_fatal_error_propagates() {
        let turns = ScriptedTurns::new(vec![Err(TurnError::new("invalid api key")
            .with_status(401))]);
        let selector = selector();

        let err = run_iterative_kickoff(
            turns.factory(),
            Phase::Market,
            &inputs(),
            Some("3"),
            &selector,
            None,
        )
        .unwrap_err();

        assert!(matches!(err, CrucibleError::Turn(_)));
        assert_eq!(turns.calls(), 1);
    }

    #[test]
    fn test_retryable_error_on_last_attempt_propagates() {
        let turns = ScriptedTurns::new(vec![
            Err(TurnError::new("overloaded").with_status(503)),
            Err(TurnError::new("overloaded").with_status(503)),
        ]);
        let selector = selector(); // two candidates => two attempts

        let err = run_iterative_kickoff(
            turns.factory(),
            Phase::Market,
            &inputs(),
            Some("3"),
            &selector,
            None,
        )
        .unwrap_err();

        assert!(matches!(err, CrucibleError::Turn(_)));
        assert_eq!(turns.calls(), 2);
    }

    #[test]
    fn test_inputs_carry_iteration_and_model() {
        let captured = Rc::new(RefCell::new(Vec::<TurnInputs>::new()));

        struct Capturing {
            captured: Rc<RefCell<Vec<TurnInputs>>>,
        }
        impl AgentTurn for Capturing {
            fn run(&mut self, inputs: &TurnInputs) -> Result<String, TurnError> {
                self.captured.borrow_mut().push(inputs.clone());
                Ok("VERDICT: APPROVED".to_string())
            }
        }

        let selector = selector();
        {
            let captured = Rc::clone(&captured);
            run_iterative_kickoff(
                move || {
                    Box::new(Capturing {
                        captured: Rc::clone(&captured),
                    }) as Box<dyn AgentTurn>
                },
                Phase::Tech,
                &inputs(),
                Some("4"),
                &selector,
                None,
            )
            .unwrap();
        }

        let captured = captured.borrow();
        let first = &captured[0];
        assert_eq!(first.get("iteration"), Some(&json!(1)));
        assert_eq!(first.get("max_iterations"), Some(&json!(4)));
        assert_eq!(first.get("model"), Some(&json!("alpha")));
        assert_eq!(first.get("idea"), Some(&json!("a web stealth roguelike")));
    }
}
