//! Advisory execution review.
//!
//! The critic obtains a free-text critique from the model and attaches
//! heuristic attributes derived from the execution alone. It is strictly
//! advisory: the mediator never consumes its numeric outputs when deciding
//! transitions.

use std::sync::Arc;

use tracing::debug;

use crate::llm::{LlmClient, LlmError, Role};
use crate::report::ExecutionResult;
use crate::state::SharedState;

/// Hard bound on the critique prompt.
const MAX_PROMPT_CHARS: usize = 14_000;
/// Bounds applied to injected error details.
const MAX_ERROR_LINES: usize = 20;
const MAX_ERROR_CHARS: usize = 2_500;

/// Advisory risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Critique of one execution.
#[derive(Debug, Clone)]
pub struct CriticFeedback {
    /// Free-text critique from the model.
    pub summary: String,
    /// Heuristic: HIGH when errors and failing tests coincide.
    pub risk_level: RiskLevel,
    /// Heuristic satisfaction in [0, 1].
    pub satisfaction: f64,
}

/// Summary reviewer over execution results.
pub struct Critic {
    llm: Arc<dyn LlmClient>,
}

impl Critic {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn analyze(
        &self,
        exec: &ExecutionResult,
        state: &SharedState,
    ) -> Result<CriticFeedback, LlmError> {
        let prompt = build_critique_prompt(exec, state);
        let summary = self
            .llm
            .generate(Role::Critic, &prompt, Role::Critic.temperature())
            .await?;

        let has_errors = exec.has_errors();
        let tests_failing = exec.test_results.was_run && exec.test_results.any_failed();

        let (risk_level, satisfaction) = match (has_errors, tests_failing) {
            (true, true) => (RiskLevel::High, 0.2),
            (false, false) => (RiskLevel::Low, 1.0),
            _ => (RiskLevel::Medium, 0.5),
        };

        debug!(%risk_level, satisfaction, "Critique attached");
        Ok(CriticFeedback {
            summary,
            risk_level,
            satisfaction,
        })
    }
}

fn build_critique_prompt(exec: &ExecutionResult, state: &SharedState) -> String {
    let mut prompt = format!(
        "Review the latest step of an automated bug repair.\n\n\
         Goal: {}\nPhase: {}\nTask: {}\n\n\
         Test results: {}\n",
        state.goal(),
        state.current_phase(),
        exec.task,
        exec.test_results.summary(),
    );

    if exec.has_errors() {
        prompt.push_str("Tool errors:\n");
        prompt.push_str(&bound_error_details(&exec.error_summary()));
        prompt.push('\n');
    }

    if !exec.modified_files.is_empty() {
        prompt.push_str(&format!("Files modified: {}\n", exec.modified_files.join(", ")));
    }

    prompt.push_str(
        "\nCritique this step: flag logical flaws, missing evidence, and risky \
         assumptions. Plain text only.\n",
    );

    if prompt.len() > MAX_PROMPT_CHARS {
        prompt.truncate(MAX_PROMPT_CHARS);
    }
    prompt
}

/// Truncate error details to 20 lines and 2,500 characters, cutting at a
/// line boundary.
fn bound_error_details(details: &str) -> String {
    let mut out = String::new();
    let mut lines = 0;
    for line in details.lines() {
        if lines >= MAX_ERROR_LINES || out.len() + line.len() + 1 > MAX_ERROR_CHARS {
            out.push_str("... (truncated)\n");
            break;
        }
        out.push_str(line);
        out.push('\n');
        lines += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::report::{parse_test_output, TestResults, ToolResult};

    fn exec_with(errors: bool, tests_failing: Option<bool>) -> ExecutionResult {
        let tool_results = if errors {
            vec![ToolResult::error("read_file", "boom".into())]
        } else {
            vec![ToolResult::ok("read_file", "ok".into(), None)]
        };
        let test_results = match tests_failing {
            None => TestResults::not_run(),
            Some(true) => parse_test_output("t.py::t FAILED", 1),
            Some(false) => parse_test_output("t.py::t PASSED", 0),
        };
        ExecutionResult {
            task: "t".into(),
            tool_results,
            test_results,
            modified_files: vec![],
        }
    }

    async fn feedback_for(errors: bool, tests_failing: Option<bool>) -> CriticFeedback {
        let critic = Critic::new(Arc::new(ScriptedLlm::new(["looks fine"])));
        let state = SharedState::new("g");
        critic
            .analyze(&exec_with(errors, tests_failing), &state)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_high_risk_when_both_problems() {
        let feedback = feedback_for(true, Some(true)).await;
        assert_eq!(feedback.risk_level, RiskLevel::High);
        assert_eq!(feedback.satisfaction, 0.2);
    }

    #[tokio::test]
    async fn test_low_risk_when_clean() {
        let feedback = feedback_for(false, Some(false)).await;
        assert_eq!(feedback.risk_level, RiskLevel::Low);
        assert_eq!(feedback.satisfaction, 1.0);
        assert_eq!(feedback.summary, "looks fine");
    }

    #[tokio::test]
    async fn test_medium_risk_when_mixed() {
        let errors_only = feedback_for(true, None).await;
        assert_eq!(errors_only.risk_level, RiskLevel::Medium);
        assert_eq!(errors_only.satisfaction, 0.5);

        let failures_only = feedback_for(false, Some(true)).await;
        assert_eq!(failures_only.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_error_details_bounded_by_lines() {
        let details = (0..50).map(|i| format!("e{i}")).collect::<Vec<_>>().join("\n");
        let bounded = bound_error_details(&details);
        assert!(bounded.lines().count() <= MAX_ERROR_LINES + 1);
        assert!(bounded.contains("(truncated)"));
    }

    #[test]
    fn test_error_details_bounded_by_chars_at_line_boundary() {
        let long_line = "x".repeat(400);
        let details = (0..10).map(|_| long_line.clone()).collect::<Vec<_>>().join("\n");
        let bounded = bound_error_details(&details);
        assert!(bounded.len() <= MAX_ERROR_CHARS + 20);
        // No mid-line cut: every line is either full or the marker
        for line in bounded.lines() {
            assert!(line == long_line || line == "... (truncated)");
        }
    }

    #[test]
    fn test_prompt_capped() {
        let mut exec = exec_with(false, None);
        exec.task = "t".repeat(20_000);
        let state = SharedState::new("g");
        let prompt = build_critique_prompt(&exec, &state);
        assert!(prompt.len() <= MAX_PROMPT_CHARS);
    }
}
