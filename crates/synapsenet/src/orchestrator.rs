//! The Controlled Iterative Repair driver.
//!
//! One `run_task` invocation owns one [`SharedState`] and drives the loop:
//! plan → execute → critique → mediate → apply the decision. The
//! orchestrator is the only component that mutates phase, takes and
//! restores workspace snapshots, captures repair history, and emits the
//! per-run metadata file and benchmark record.
//!
//! Phase transitions happen only here, and only on an ADVANCE decision;
//! REPLAN always resets to the reproduce phase after restoring the
//! snapshot; retries leave state untouched.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::analyzer::FailureAnalyzer;
use crate::config::RepairConfig;
use crate::critic::Critic;
use crate::executor::Executor;
use crate::llm::LlmClient;
use crate::mediator::{self, Decision, MAX_RETRIES_PER_TASK};
use crate::phase::RepairPhase;
use crate::planner::Planner;
use crate::repair_attempt::{RepairAttempt, RepairOutcome};
use crate::report::FailureType;
use crate::runner::TestRunner;
use crate::state::SharedState;
use crate::workspace::{SnapshotSpec, Workspace, WorkspaceSnapshot};

/// Consecutive replans tolerated before the run is declared unplannable.
pub const MAX_CONSECUTIVE_REPLANS: u32 = 3;

/// Name of the per-run metadata file written at the workspace root.
pub const METADATA_FILE: &str = "synapsenet_metadata.json";

/// Structured result of one repair run.
#[derive(Debug, Clone, Serialize)]
pub struct CirResult {
    pub success: bool,
    pub total_iterations: u32,
    pub status: String,
    pub details: String,
}

/// Drives the repair loop for one goal at a time.
pub struct Orchestrator {
    workspace: Arc<Workspace>,
    planner: Planner,
    executor: Executor,
    critic: Critic,
    source_ext: String,
    snapshot_prefixes: Vec<String>,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, workspace: Arc<Workspace>, config: &RepairConfig) -> Self {
        let runner = TestRunner::new(workspace.root(), &config.interpreter);
        let analyzer = FailureAnalyzer::new(&config.source_ext);
        Self {
            planner: Planner::new(llm.clone()),
            executor: Executor::new(llm.clone(), workspace.clone(), runner, analyzer),
            critic: Critic::new(llm),
            workspace,
            source_ext: config.source_ext.clone(),
            snapshot_prefixes: config.snapshot_prefixes.clone(),
        }
    }

    /// Run one repair task to completion. Always returns a structured
    /// result; never panics or throws to the caller.
    pub async fn run_task(&self, goal: &str) -> CirResult {
        let started = Instant::now();
        let mut state = SharedState::new(goal);
        let mut snapshot: Option<WorkspaceSnapshot> = None;
        let mut consecutive_replans: u32 = 0;

        info!(goal = %goal, "Repair run starting");

        let initial_plan = match self.planner.generate_plan(&state).await {
            Ok(plan) => plan,
            Err(e) => {
                return self.finish(&state, false, &format!("LLM transport failed: {e}"), None, started)
            }
        };
        state.update_plan(initial_plan);

        loop {
            state.increment_total_iterations();

            let Some(task) = state.current_task().map(str::to_string) else {
                consecutive_replans += 1;
                warn!(
                    consecutive_replans,
                    "No task available in current plan"
                );
                if consecutive_replans >= MAX_CONSECUTIVE_REPLANS {
                    return self.finish(
                        &state,
                        false,
                        "Planner unable to generate valid plan",
                        None,
                        started,
                    );
                }
                state.soft_reset();
                state.set_phase(RepairPhase::Reproduce);
                match self.planner.revise_plan(&state).await {
                    Ok(plan) => state.update_plan(plan),
                    Err(e) => {
                        return self.finish(
                            &state,
                            false,
                            &format!("LLM transport failed: {e}"),
                            None,
                            started,
                        )
                    }
                }
                continue;
            };

            state.increment_task_attempts();
            info!(
                iteration = state.total_iterations(),
                phase = %state.current_phase(),
                attempts = state.attempts_on_current_task(),
                task = %task,
                "Executing task"
            );

            let exec = match self.executor.execute(&task, &mut state).await {
                Ok(exec) => exec,
                Err(e) => {
                    return self.finish(
                        &state,
                        false,
                        &format!("LLM transport failed: {e}"),
                        None,
                        started,
                    )
                }
            };
            if exec.test_results.was_run {
                state.set_last_test_results(exec.test_results.clone());
            }
            state.record_execution(exec.clone());

            let critique = match self.critic.analyze(&exec, &state).await {
                Ok(critique) => critique,
                Err(e) => {
                    return self.finish(
                        &state,
                        false,
                        &format!("LLM transport failed: {e}"),
                        None,
                        started,
                    )
                }
            };
            state.record_critique(critique.clone());

            let mediation = mediator::decide(&exec, &critique, &state);
            info!(
                decision = %mediation.decision,
                reason = %mediation.reason,
                "Applying mediation decision"
            );

            match mediation.decision {
                Decision::Success => {
                    let details = if state.modified_files().is_empty() {
                        "No files modified".to_string()
                    } else {
                        format!("Modified files: {}", state.modified_files().join(", "))
                    };
                    return self.finish(&state, true, &mediation.reason, Some(details), started);
                }

                Decision::Fail => {
                    return self.finish(&state, false, &mediation.reason, None, started);
                }

                Decision::Advance => {
                    consecutive_replans = 0;
                    if let Err(result) =
                        self.apply_advance(&mut state, &mut snapshot, started).await
                    {
                        return result;
                    }
                }

                Decision::Retry => {
                    // State untouched; the next iteration repeats the task.
                }

                Decision::Replan => {
                    state.increment_replan_count();
                    consecutive_replans += 1;

                    if state.current_phase().records_repair_attempt() {
                        let attempt = capture_repair_attempt(&state);
                        state.add_repair_attempt(attempt);
                    }

                    if let Some(snap) = snapshot.take() {
                        if let Err(e) = self.workspace.restore(&snap) {
                            error!(error = %e, "Workspace restore failed — aborting run");
                            return self.finish(
                                &state,
                                false,
                                &format!("Workspace restore failed: {e}"),
                                None,
                                started,
                            );
                        }
                    }
                    state.clear_modified_files();
                    state.soft_reset();
                    state.set_phase(RepairPhase::Reproduce);
                    state.reset_task_attempts();

                    if consecutive_replans >= MAX_CONSECUTIVE_REPLANS {
                        return self.finish(
                            &state,
                            false,
                            "Planner unable to generate valid plan",
                            None,
                            started,
                        );
                    }

                    match self.planner.revise_plan(&state).await {
                        Ok(plan) => state.update_plan(plan),
                        Err(e) => {
                            return self.finish(
                                &state,
                                false,
                                &format!("LLM transport failed: {e}"),
                                None,
                                started,
                            )
                        }
                    }
                }
            }
        }
    }

    /// Phase transition table for ADVANCE decisions.
    async fn apply_advance(
        &self,
        state: &mut SharedState,
        snapshot: &mut Option<WorkspaceSnapshot>,
        started: Instant,
    ) -> Result<(), CirResult> {
        match state.current_phase() {
            RepairPhase::Reproduce => {
                // The failure is now observed; capture the pristine
                // source tree before any repair touches it.
                state.mark_failure_observed();
                if snapshot.is_none() {
                    let spec = SnapshotSpec {
                        source_ext: self.source_ext.clone(),
                        prefixes: self.snapshot_prefixes.clone(),
                        extra_paths: state
                            .failing_artifact()
                            .map(|a| vec![a.to_string()])
                            .unwrap_or_default(),
                    };
                    match self.workspace.snapshot(&spec) {
                        Ok(snap) => *snapshot = Some(snap),
                        Err(e) => {
                            error!(error = %e, "Snapshot failed — cannot guarantee rollback");
                            return Err(self.finish(
                                state,
                                false,
                                &format!("Snapshot failed: {e}"),
                                None,
                                started,
                            ));
                        }
                    }
                }
                state.clear_root_cause_analysis();
                state.set_phase(RepairPhase::RepairAnalyze);
                state.reset_task_attempts();
            }
            RepairPhase::RepairAnalyze => {
                state.set_phase(RepairPhase::RepairPatch);
                state.reset_task_attempts();
            }
            RepairPhase::RepairPatch => {
                state.clear_tool_error_state();
                state.set_phase(RepairPhase::Validate);
                state.reset_task_attempts();
            }
            RepairPhase::Validate => {
                // The mediator never advances out of validation; a plan
                // with trailing tasks would continue here.
                state.advance_to_next_task();
                return Ok(());
            }
        }

        match self.planner.generate_plan(state).await {
            Ok(plan) => {
                state.update_plan(plan);
                Ok(())
            }
            Err(e) => Err(self.finish(
                state,
                false,
                &format!("LLM transport failed: {e}"),
                None,
                started,
            )),
        }
    }

    /// Export metadata, emit the benchmark record, and build the result.
    fn finish(
        &self,
        state: &SharedState,
        success: bool,
        status: &str,
        details: Option<String>,
        started: Instant,
    ) -> CirResult {
        let exit_code = if success { 0 } else { 1 };
        let tests_passed = state
            .last_test_results()
            .map(|r| r.all_passed())
            .unwrap_or(false);

        let metadata = json!({
            "workspace": self.workspace.root().display().to_string(),
            "modified_files": state.modified_files(),
            "iterations": state.total_iterations(),
            "replans": state.replan_count(),
            "tests_passed": tests_passed,
            "exit_code": exit_code,
            "completed_at": chrono::Utc::now().to_rfc3339(),
        });
        let rendered = serde_json::to_string_pretty(&metadata).unwrap_or_default();
        if let Err(e) = self.workspace.write_file(METADATA_FILE, &rendered) {
            warn!(error = %e, "Failed to write run metadata");
        }

        let failure_type = state
            .last_test_results()
            .map(|r| r.failure_type)
            .unwrap_or(FailureType::None);
        let wall_time = started.elapsed().as_secs_f64();
        info!(
            target: "benchmark",
            case_id = %state.goal(),
            resolved = success,
            total_iterations = state.total_iterations(),
            replan_count = state.replan_count(),
            tool_call_count = state.tool_call_count(),
            failure_type = %failure_type,
            failing_artifact = state.failing_artifact().unwrap_or("-"),
            wall_time_seconds = wall_time,
            final_status = %status,
            "Benchmark"
        );

        CirResult {
            success,
            total_iterations: state.total_iterations(),
            status: status.to_string(),
            details: details.unwrap_or_else(|| {
                if success {
                    "No files modified".into()
                } else {
                    format!("Run ended in phase {}", state.current_phase())
                }
            }),
        }
    }
}

/// Build a [`RepairAttempt`] from live state, before the soft reset
/// clears what it summarizes.
fn capture_repair_attempt(state: &SharedState) -> RepairAttempt {
    let outcome = match state.current_phase() {
        RepairPhase::RepairAnalyze => {
            if state.attempts_on_current_task() >= MAX_RETRIES_PER_TASK {
                RepairOutcome::AnalysisCapExceeded
            } else {
                RepairOutcome::AnalysisInvalid
            }
        }
        RepairPhase::RepairPatch => match state.last_tool_error() {
            Some(e) if e.contains("not found") => RepairOutcome::SearchFailed,
            Some(e) if e.contains("multiple times") => RepairOutcome::SearchAmbiguous,
            _ => RepairOutcome::NoPatch,
        },
        _ => {
            let syntax = state
                .last_test_results()
                .map(|r| r.failure_type == FailureType::SyntaxError)
                .unwrap_or(false)
                || state.collection_failure_subtype() == Some("SYNTAX_ERROR");
            if syntax {
                RepairOutcome::SyntaxError
            } else {
                RepairOutcome::ValidateFailed
            }
        }
    };

    let mut attempt = RepairAttempt::new(state.replan_count(), outcome);

    if let Some(analysis) = state.last_root_cause_analysis() {
        attempt = attempt.with_diagnosis(
            analysis.root_cause_summary.clone(),
            analysis.minimal_fix_strategy.clone(),
        );
    }
    if let Some(block) = state.last_search_block() {
        attempt = attempt.with_search_block(block);
    }
    if !state.modified_files().is_empty() {
        attempt = attempt
            .with_patch_summary(format!("replace_in_file on {}", state.modified_files().join(", ")));
    }
    if matches!(
        outcome,
        RepairOutcome::ValidateFailed | RepairOutcome::SyntaxError
    ) {
        attempt = attempt.with_validation_failure(
            state.collection_failure_subtype().map(str::to_string),
            state.failing_artifact_line(),
            state.collection_failure_reason().map(str::to_string),
        );
    }
    attempt
}
