//! Phase-aware state-machine arbiter.
//!
//! A pure decision function over the latest execution, the (advisory)
//! critique, and the shared state. No IO, no mutation — the orchestrator
//! applies whatever the decision implies. The critique parameter is
//! accepted for interface completeness; transitions never consume its
//! numeric outputs.

use tracing::debug;

use crate::critic::CriticFeedback;
use crate::phase::RepairPhase;
use crate::report::ExecutionResult;
use crate::state::SharedState;

/// Hard cap on loop iterations per run.
pub const MAX_TOTAL_ITERATIONS: u32 = 20;
/// Retries allowed on a single task before a replan.
pub const MAX_RETRIES_PER_TASK: u32 = 3;

/// The five possible loop decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Terminal: the run succeeded.
    Success,
    /// Terminal: the run failed.
    Fail,
    /// Move to the next phase (or next task from validation).
    Advance,
    /// Repeat the current task with state untouched.
    Retry,
    /// Abandon the cycle: restore, reset to reproduce, re-plan.
    Replan,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::Advance => "ADVANCE",
            Self::Retry => "RETRY",
            Self::Replan => "REPLAN",
        };
        write!(f, "{s}")
    }
}

/// A decision plus its human-readable reasoning.
#[derive(Debug, Clone)]
pub struct MediationResult {
    pub decision: Decision,
    pub reason: String,
}

impl MediationResult {
    fn new(decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: reason.into(),
        }
    }
}

/// Decide the next loop action.
pub fn decide(
    exec: &ExecutionResult,
    _critique: &CriticFeedback,
    state: &SharedState,
) -> MediationResult {
    let result = decide_inner(exec, state);
    debug!(
        decision = %result.decision,
        phase = %state.current_phase(),
        reason = %result.reason,
        "Mediation decision"
    );
    result
}

fn decide_inner(exec: &ExecutionResult, state: &SharedState) -> MediationResult {
    if state.total_iterations() >= MAX_TOTAL_ITERATIONS {
        return MediationResult::new(Decision::Fail, "Maximum iterations exceeded");
    }

    if exec.has_errors() && !exec.test_results.was_run {
        // Failing test runs are signal, not tool errors; everything else
        // goes through the per-phase error ladders.
        return match state.current_phase() {
            RepairPhase::RepairPatch => patch_error_ladder(state),
            _ => {
                if state.attempts_on_current_task() >= MAX_RETRIES_PER_TASK {
                    MediationResult::new(Decision::Replan, "Tool errors exhausted task retries")
                } else {
                    MediationResult::new(Decision::Retry, "Tool error — retrying task")
                }
            }
        };
    }

    match state.current_phase() {
        RepairPhase::Reproduce => decide_reproduce(exec, state),
        RepairPhase::RepairAnalyze => decide_analyze(state),
        RepairPhase::RepairPatch => decide_patch(exec, state),
        RepairPhase::Validate => decide_validate(exec),
    }
}

fn decide_reproduce(exec: &ExecutionResult, state: &SharedState) -> MediationResult {
    if !exec.test_results.was_run {
        if state.attempts_on_current_task() >= MAX_RETRIES_PER_TASK {
            return MediationResult::new(Decision::Replan, "Tests never ran during reproduce");
        }
        return MediationResult::new(Decision::Retry, "Tests not run yet");
    }

    if exec.test_results.any_failed() {
        return MediationResult::new(Decision::Advance, "Failure reproduced");
    }

    // Tests pass.
    if !state.failure_observed() {
        return MediationResult::new(Decision::Success, "no repair needed");
    }
    if state.repair_history().is_empty() {
        return MediationResult::new(Decision::Retry, "unexpected pass without patch");
    }
    MediationResult::new(Decision::Success, "Tests pass after recorded repair")
}

fn decide_analyze(state: &SharedState) -> MediationResult {
    if state.has_valid_root_cause_analysis() {
        return MediationResult::new(Decision::Advance, "Valid root cause analysis produced");
    }
    if state.attempts_on_current_task() >= MAX_RETRIES_PER_TASK {
        let reason = state
            .last_root_cause_analysis()
            .and_then(|a| a.invalid_reason())
            .unwrap_or("no analysis produced");
        return MediationResult::new(
            Decision::Replan,
            format!("Analysis retries exhausted: {reason}"),
        );
    }
    MediationResult::new(Decision::Retry, "Analysis invalid — retrying")
}

fn decide_patch(exec: &ExecutionResult, state: &SharedState) -> MediationResult {
    if !exec.modified_files.is_empty() {
        return MediationResult::new(Decision::Advance, "Patch applied");
    }
    if state.attempts_on_current_task() >= MAX_RETRIES_PER_TASK {
        return MediationResult::new(Decision::Replan, "No patch applied within task retries");
    }
    MediationResult::new(Decision::Retry, "No files modified — retrying patch")
}

fn decide_validate(exec: &ExecutionResult) -> MediationResult {
    if !exec.test_results.was_run {
        return MediationResult::new(Decision::Retry, "Validation run missing");
    }
    if exec.test_results.all_passed() {
        return MediationResult::new(Decision::Success, "Tests pass after patch");
    }
    MediationResult::new(Decision::Replan, "Validation failed — patch did not fix the bug")
}

/// Escalation ladder for patching-phase tool errors.
///
/// "not found" means the model hallucinated file content — a retry with
/// the same mental model cannot succeed, so replan immediately.
/// "multiple times" is recoverable once: retry with an ambiguity hint,
/// replan on the second consecutive occurrence.
fn patch_error_ladder(state: &SharedState) -> MediationResult {
    if state.attempts_on_current_task() >= MAX_RETRIES_PER_TASK {
        return MediationResult::new(Decision::Replan, "Patch tool errors exhausted task retries");
    }
    let error = state.last_tool_error().unwrap_or("");
    if error.contains("not found") {
        return MediationResult::new(
            Decision::Replan,
            "Search block not found — model hallucinated content",
        );
    }
    if error.contains("multiple times") {
        if state.consecutive_tool_errors() >= 2 {
            return MediationResult::new(
                Decision::Replan,
                "Ambiguous search block twice in a row",
            );
        }
        return MediationResult::new(Decision::Retry, "Ambiguous search block — retrying");
    }
    MediationResult::new(Decision::Retry, "Patch tool error — retrying")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critic::{CriticFeedback, RiskLevel};
    use crate::repair_attempt::{RepairAttempt, RepairOutcome};
    use crate::report::{parse_test_output, TestResults, ToolResult};

    fn critique() -> CriticFeedback {
        CriticFeedback {
            summary: String::new(),
            risk_level: RiskLevel::Low,
            satisfaction: 1.0,
        }
    }

    fn exec_tests_failed() -> ExecutionResult {
        ExecutionResult {
            task: "t".into(),
            tool_results: vec![],
            test_results: parse_test_output("t.py::t FAILED", 1),
            modified_files: vec![],
        }
    }

    fn exec_tests_passed() -> ExecutionResult {
        ExecutionResult {
            task: "t".into(),
            tool_results: vec![],
            test_results: parse_test_output("t.py::t PASSED", 0),
            modified_files: vec![],
        }
    }

    fn exec_no_tests() -> ExecutionResult {
        ExecutionResult {
            task: "t".into(),
            tool_results: vec![],
            test_results: TestResults::not_run(),
            modified_files: vec![],
        }
    }

    fn exec_tool_error() -> ExecutionResult {
        ExecutionResult {
            task: "t".into(),
            tool_results: vec![ToolResult::error("replace_in_file", "bad".into())],
            test_results: TestResults::not_run(),
            modified_files: vec![],
        }
    }

    fn state_in(phase: RepairPhase) -> SharedState {
        let mut state = SharedState::new("g");
        // Walk the legal chain to reach the target phase.
        for next in [
            RepairPhase::RepairAnalyze,
            RepairPhase::RepairPatch,
            RepairPhase::Validate,
        ] {
            if state.current_phase() == phase {
                break;
            }
            state.set_phase(next);
        }
        state
    }

    #[test]
    fn test_iteration_cap_wins_over_everything() {
        let mut state = state_in(RepairPhase::Reproduce);
        for _ in 0..MAX_TOTAL_ITERATIONS {
            state.increment_total_iterations();
        }
        let result = decide(&exec_tests_failed(), &critique(), &state);
        assert_eq!(result.decision, Decision::Fail);
        assert_eq!(result.reason, "Maximum iterations exceeded");
    }

    // -- REPRODUCE --

    #[test]
    fn test_reproduce_tests_failed_advances() {
        let state = state_in(RepairPhase::Reproduce);
        let result = decide(&exec_tests_failed(), &critique(), &state);
        assert_eq!(result.decision, Decision::Advance);
    }

    #[test]
    fn test_reproduce_tests_not_run_retries_then_replans() {
        let mut state = state_in(RepairPhase::Reproduce);
        state.increment_task_attempts();
        let result = decide(&exec_no_tests(), &critique(), &state);
        assert_eq!(result.decision, Decision::Retry);

        state.increment_task_attempts();
        state.increment_task_attempts();
        let result = decide(&exec_no_tests(), &critique(), &state);
        assert_eq!(result.decision, Decision::Replan);
    }

    #[test]
    fn test_reproduce_pass_without_prior_failure_is_success() {
        let state = state_in(RepairPhase::Reproduce);
        let result = decide(&exec_tests_passed(), &critique(), &state);
        assert_eq!(result.decision, Decision::Success);
        assert_eq!(result.reason, "no repair needed");
    }

    #[test]
    fn test_reproduce_pass_after_failure_without_repair_retries() {
        let mut state = state_in(RepairPhase::Reproduce);
        state.mark_failure_observed();
        let result = decide(&exec_tests_passed(), &critique(), &state);
        assert_eq!(result.decision, Decision::Retry);
        assert_eq!(result.reason, "unexpected pass without patch");
    }

    #[test]
    fn test_reproduce_pass_after_recorded_repair_is_success() {
        let mut state = state_in(RepairPhase::Reproduce);
        state.mark_failure_observed();
        state.add_repair_attempt(RepairAttempt::new(1, RepairOutcome::ValidateFailed));
        let result = decide(&exec_tests_passed(), &critique(), &state);
        assert_eq!(result.decision, Decision::Success);
    }

    // -- REPAIR_ANALYZE --

    #[test]
    fn test_analyze_valid_analysis_advances() {
        use crate::root_cause::RootCauseAnalysis;
        let mut state = state_in(RepairPhase::RepairAnalyze);
        let valid = RootCauseAnalysis::parse(
            r#"{"artifactPath": "src/a.py", "rootCauseSummary": "s",
                "causalExplanation": "c", "minimalFixStrategy": "m"}"#,
            None,
            None,
            None,
        );
        assert!(valid.is_valid());
        state.set_root_cause_analysis(valid);
        let result = decide(&exec_no_tests(), &critique(), &state);
        assert_eq!(result.decision, Decision::Advance);
    }

    #[test]
    fn test_analyze_invalid_retries_then_replans_with_reason() {
        use crate::root_cause::RootCauseAnalysis;
        let mut state = state_in(RepairPhase::RepairAnalyze);
        state.set_root_cause_analysis(RootCauseAnalysis::invalid("missing fields"));
        state.increment_task_attempts();
        assert_eq!(
            decide(&exec_no_tests(), &critique(), &state).decision,
            Decision::Retry
        );

        state.increment_task_attempts();
        state.increment_task_attempts();
        let result = decide(&exec_no_tests(), &critique(), &state);
        assert_eq!(result.decision, Decision::Replan);
        assert!(result.reason.contains("missing fields"));
    }

    // -- REPAIR_PATCH --

    #[test]
    fn test_patch_modified_files_advance() {
        let state = state_in(RepairPhase::RepairPatch);
        let exec = ExecutionResult {
            modified_files: vec!["src/a.py".into()],
            ..exec_no_tests()
        };
        assert_eq!(decide(&exec, &critique(), &state).decision, Decision::Advance);
    }

    #[test]
    fn test_patch_no_modification_retries_then_replans() {
        let mut state = state_in(RepairPhase::RepairPatch);
        state.increment_task_attempts();
        assert_eq!(
            decide(&exec_no_tests(), &critique(), &state).decision,
            Decision::Retry
        );
        state.increment_task_attempts();
        state.increment_task_attempts();
        assert_eq!(
            decide(&exec_no_tests(), &critique(), &state).decision,
            Decision::Replan
        );
    }

    #[test]
    fn test_patch_not_found_error_replans_immediately() {
        let mut state = state_in(RepairPhase::RepairPatch);
        state.increment_task_attempts();
        state.set_last_tool_error(Some("Search block not found in file.".into()));
        state.increment_consecutive_tool_errors();
        let result = decide(&exec_tool_error(), &critique(), &state);
        assert_eq!(result.decision, Decision::Replan);
        assert!(result.reason.contains("hallucinated"));
    }

    #[test]
    fn test_patch_ambiguous_error_retries_once_then_replans() {
        let mut state = state_in(RepairPhase::RepairPatch);
        state.increment_task_attempts();
        state.set_last_tool_error(Some("Search block found multiple times".into()));
        state.increment_consecutive_tool_errors();
        assert_eq!(
            decide(&exec_tool_error(), &critique(), &state).decision,
            Decision::Retry
        );

        state.increment_task_attempts();
        state.increment_consecutive_tool_errors();
        assert_eq!(
            decide(&exec_tool_error(), &critique(), &state).decision,
            Decision::Replan
        );
    }

    #[test]
    fn test_patch_generic_error_retries() {
        let mut state = state_in(RepairPhase::RepairPatch);
        state.increment_task_attempts();
        state.set_last_tool_error(Some("Failed to write file: disk full".into()));
        state.increment_consecutive_tool_errors();
        assert_eq!(
            decide(&exec_tool_error(), &critique(), &state).decision,
            Decision::Retry
        );
    }

    #[test]
    fn test_patch_errors_exhaust_attempts_replan() {
        let mut state = state_in(RepairPhase::RepairPatch);
        for _ in 0..MAX_RETRIES_PER_TASK {
            state.increment_task_attempts();
        }
        state.set_last_tool_error(Some("anything".into()));
        assert_eq!(
            decide(&exec_tool_error(), &critique(), &state).decision,
            Decision::Replan
        );
    }

    // -- VALIDATE --

    #[test]
    fn test_validate_pass_is_success() {
        let state = state_in(RepairPhase::Validate);
        assert_eq!(
            decide(&exec_tests_passed(), &critique(), &state).decision,
            Decision::Success
        );
    }

    #[test]
    fn test_validate_fail_replans() {
        let state = state_in(RepairPhase::Validate);
        assert_eq!(
            decide(&exec_tests_failed(), &critique(), &state).decision,
            Decision::Replan
        );
    }

    #[test]
    fn test_validate_not_run_retries() {
        let state = state_in(RepairPhase::Validate);
        assert_eq!(
            decide(&exec_no_tests(), &critique(), &state).decision,
            Decision::Retry
        );
    }

    /// Validation never advances — only success, retry, or replan.
    #[test]
    fn test_validate_never_advances() {
        let state = state_in(RepairPhase::Validate);
        for exec in [exec_tests_passed(), exec_tests_failed(), exec_no_tests()] {
            assert_ne!(decide(&exec, &critique(), &state).decision, Decision::Advance);
        }
    }

    #[test]
    fn test_tests_ran_despite_tool_errors_falls_through() {
        // run_tests exits non-zero: its error flag must not trigger the
        // tool-error ladder, the failing tests are the signal.
        let state = state_in(RepairPhase::Reproduce);
        let exec = ExecutionResult {
            task: "t".into(),
            tool_results: vec![ToolResult {
                tool: "run_tests".into(),
                exit_code: 1,
                stdout: "t.py::t FAILED".into(),
                stderr: String::new(),
                target_file: None,
            }],
            test_results: parse_test_output("t.py::t FAILED", 1),
            modified_files: vec![],
        };
        assert_eq!(decide(&exec, &critique(), &state).decision, Decision::Advance);
    }
}
