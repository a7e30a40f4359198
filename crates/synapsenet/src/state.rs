//! Shared run context threaded through the repair loop.
//!
//! Owned exclusively by the orchestrator; the executor mutates it while a
//! step runs, every other role only reads. One instance exists per
//! `run_task` invocation and dies with it.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::critic::CriticFeedback;
use crate::phase::RepairPhase;
use crate::planner::PlannerOutput;
use crate::repair_attempt::RepairAttempt;
use crate::report::{ExecutionResult, TestResults};
use crate::root_cause::RootCauseAnalysis;

/// Cap applied to cached file content.
pub const MAX_FILE_CONTENT_LINES: usize = 500;

/// Repair history FIFO cap.
pub const MAX_REPAIR_HISTORY: usize = 5;

/// Distinctive prefix of the cache truncation marker line.
///
/// The marker is valid comment syntax in the target ecosystem, unlikely to
/// appear in real source, and consistently formatted so search
/// normalization can strip it. If it were freeform text it could partially
/// match a search block spanning the truncation boundary and produce a
/// false "not found" rejection of a valid analysis.
pub const TRUNCATION_MARKER_PREFIX: &str = "# <<< TRUNCATED: ";

/// Mutable shared context for one repair run.
pub struct SharedState {
    goal: String,

    current_plan: Option<PlannerOutput>,
    current_task_index: usize,
    attempts_on_current_task: u32,
    total_iterations: u32,

    execution_history: Vec<ExecutionResult>,
    critique_history: Vec<CriticFeedback>,

    current_phase: RepairPhase,
    last_test_results: Option<TestResults>,

    modified_files: Vec<String>,

    collection_failure_module: Option<String>,
    collection_failure_subtype: Option<String>,
    collection_failure_reason: Option<String>,
    failing_artifact: Option<String>,
    failing_artifact_line: Option<u32>,

    last_tool_error: Option<String>,
    consecutive_tool_errors: u32,
    last_search_block: Option<String>,

    last_root_cause_analysis: Option<RootCauseAnalysis>,

    repair_history: Vec<RepairAttempt>,

    recent_file_reads: HashMap<String, String>,
    structure_discovered: bool,
    failure_observed: bool,

    replan_count: u32,
    tool_call_count: u32,
}

impl SharedState {
    pub fn new(goal: &str) -> Self {
        Self {
            goal: goal.to_string(),
            current_plan: None,
            current_task_index: 0,
            attempts_on_current_task: 0,
            total_iterations: 0,
            execution_history: Vec::new(),
            critique_history: Vec::new(),
            current_phase: RepairPhase::Reproduce,
            last_test_results: None,
            modified_files: Vec::new(),
            collection_failure_module: None,
            collection_failure_subtype: None,
            collection_failure_reason: None,
            failing_artifact: None,
            failing_artifact_line: None,
            last_tool_error: None,
            consecutive_tool_errors: 0,
            last_search_block: None,
            last_root_cause_analysis: None,
            repair_history: Vec::new(),
            recent_file_reads: HashMap::new(),
            structure_discovered: false,
            failure_observed: false,
            replan_count: 0,
            tool_call_count: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Phase
    // -----------------------------------------------------------------------

    pub fn current_phase(&self) -> RepairPhase {
        self.current_phase
    }

    pub fn set_phase(&mut self, phase: RepairPhase) {
        if self.current_phase != phase {
            info!(from = %self.current_phase, to = %phase, "Phase transition");
            self.current_phase = phase;
        }
    }

    // -----------------------------------------------------------------------
    // Test results
    // -----------------------------------------------------------------------

    /// Record the latest run. An all-pass result clears every piece of
    /// stale collection-failure metadata.
    pub fn set_last_test_results(&mut self, results: TestResults) {
        if results.all_passed()
            && (self.collection_failure_subtype.is_some()
                || self.failing_artifact.is_some()
                || self.collection_failure_module.is_some())
        {
            info!(
                subtype = ?self.collection_failure_subtype,
                artifact = ?self.failing_artifact,
                "Tests passed — clearing collection failure metadata"
            );
            self.collection_failure_module = None;
            self.collection_failure_subtype = None;
            self.collection_failure_reason = None;
            self.failing_artifact = None;
            self.failing_artifact_line = None;
        }
        self.last_test_results = Some(results);
    }

    pub fn last_test_results(&self) -> Option<&TestResults> {
        self.last_test_results.as_ref()
    }

    // -----------------------------------------------------------------------
    // Modified files
    // -----------------------------------------------------------------------

    pub fn add_modified_file(&mut self, path: &str) {
        if path.trim().is_empty() {
            return;
        }
        let normalized = normalize_path(path);
        if !self.modified_files.contains(&normalized) {
            info!(path = %normalized, "Tracked modified file");
            self.modified_files.push(normalized);
        }
    }

    pub fn modified_files(&self) -> &[String] {
        &self.modified_files
    }

    pub fn clear_modified_files(&mut self) {
        if !self.modified_files.is_empty() {
            info!(count = self.modified_files.len(), "Cleared modified files");
        }
        self.modified_files.clear();
    }

    // -----------------------------------------------------------------------
    // Iteration and plan tracking
    // -----------------------------------------------------------------------

    pub fn increment_total_iterations(&mut self) {
        self.total_iterations += 1;
    }

    pub fn increment_task_attempts(&mut self) {
        self.attempts_on_current_task += 1;
    }

    pub fn reset_task_attempts(&mut self) {
        self.attempts_on_current_task = 0;
    }

    pub fn advance_to_next_task(&mut self) {
        self.current_task_index += 1;
        self.attempts_on_current_task = 0;
    }

    pub fn update_plan(&mut self, plan: PlannerOutput) {
        self.current_plan = Some(plan);
        self.current_task_index = 0;
        self.attempts_on_current_task = 0;
    }

    pub fn current_plan(&self) -> Option<&PlannerOutput> {
        self.current_plan.as_ref()
    }

    pub fn current_task(&self) -> Option<&str> {
        self.current_plan
            .as_ref()?
            .steps
            .get(self.current_task_index)
            .map(String::as_str)
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn current_task_index(&self) -> usize {
        self.current_task_index
    }

    pub fn attempts_on_current_task(&self) -> u32 {
        self.attempts_on_current_task
    }

    pub fn total_iterations(&self) -> u32 {
        self.total_iterations
    }

    // -----------------------------------------------------------------------
    // History recording
    // -----------------------------------------------------------------------

    pub fn record_execution(&mut self, result: ExecutionResult) {
        for file in result.modified_files.clone() {
            self.add_modified_file(&file);
        }
        self.execution_history.push(result);
    }

    pub fn record_critique(&mut self, feedback: CriticFeedback) {
        self.critique_history.push(feedback);
    }

    pub fn recent_executions(&self, n: usize) -> &[ExecutionResult] {
        let start = self.execution_history.len().saturating_sub(n);
        &self.execution_history[start..]
    }

    // -----------------------------------------------------------------------
    // Collection failure metadata
    // -----------------------------------------------------------------------

    pub fn set_collection_failure_module(&mut self, module: Option<String>) {
        self.collection_failure_module = module.as_deref().map(normalize_path);
    }

    pub fn set_collection_failure_subtype(&mut self, subtype: Option<String>) {
        if let Some(s) = &subtype {
            info!(subtype = %s, "Collection failure subtype");
        }
        self.collection_failure_subtype = subtype;
    }

    pub fn collection_failure_subtype(&self) -> Option<&str> {
        self.collection_failure_subtype.as_deref()
    }

    pub fn set_failing_artifact(&mut self, artifact: Option<String>) {
        self.failing_artifact = artifact
            .filter(|a| a != "." && a != "..")
            .map(|a| normalize_path(&a));
        if let Some(artifact) = &self.failing_artifact {
            info!(artifact = %artifact, "Failing artifact");
        }
    }

    pub fn failing_artifact(&self) -> Option<&str> {
        self.failing_artifact.as_deref()
    }

    pub fn set_failing_artifact_line(&mut self, line: Option<u32>) {
        if let Some(line) = line {
            info!(line, "Failing artifact line");
        }
        self.failing_artifact_line = line;
    }

    pub fn failing_artifact_line(&self) -> Option<u32> {
        self.failing_artifact_line
    }

    pub fn set_collection_failure_reason(&mut self, reason: Option<String>) {
        self.collection_failure_reason = reason;
    }

    pub fn collection_failure_reason(&self) -> Option<&str> {
        self.collection_failure_reason.as_deref()
    }

    // -----------------------------------------------------------------------
    // Tool error tracking
    // -----------------------------------------------------------------------

    pub fn set_last_tool_error(&mut self, error: Option<String>) {
        if let Some(e) = &error {
            let preview: String = e.chars().take(80).collect();
            warn!(error = %preview, "Tool error recorded");
        }
        self.last_tool_error = error;
    }

    pub fn last_tool_error(&self) -> Option<&str> {
        self.last_tool_error.as_deref()
    }

    pub fn increment_consecutive_tool_errors(&mut self) {
        self.consecutive_tool_errors += 1;
        warn!(
            consecutive = self.consecutive_tool_errors,
            "Consecutive tool errors"
        );
    }

    pub fn consecutive_tool_errors(&self) -> u32 {
        self.consecutive_tool_errors
    }

    pub fn clear_tool_error_state(&mut self) {
        if self.last_tool_error.is_some() || self.consecutive_tool_errors > 0 {
            info!(
                consecutive = self.consecutive_tool_errors,
                "Clearing tool error state"
            );
        }
        self.last_tool_error = None;
        self.consecutive_tool_errors = 0;
        self.last_search_block = None;
    }

    pub fn set_last_search_block(&mut self, block: Option<String>) {
        self.last_search_block = block;
    }

    pub fn last_search_block(&self) -> Option<&str> {
        self.last_search_block.as_deref()
    }

    // -----------------------------------------------------------------------
    // Root cause analysis
    // -----------------------------------------------------------------------

    pub fn set_root_cause_analysis(&mut self, analysis: RootCauseAnalysis) {
        if analysis.is_valid() {
            info!(
                artifact = ?analysis.artifact_path,
                line = ?analysis.artifact_line,
                "Root cause analysis stored"
            );
        }
        self.last_root_cause_analysis = Some(analysis);
    }

    pub fn clear_root_cause_analysis(&mut self) {
        if self.last_root_cause_analysis.is_some() {
            info!("Clearing root cause analysis for fresh diagnosis");
        }
        self.last_root_cause_analysis = None;
    }

    pub fn last_root_cause_analysis(&self) -> Option<&RootCauseAnalysis> {
        self.last_root_cause_analysis.as_ref()
    }

    pub fn has_valid_root_cause_analysis(&self) -> bool {
        self.last_root_cause_analysis
            .as_ref()
            .map(|a| a.is_valid())
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Repair history
    // -----------------------------------------------------------------------

    pub fn add_repair_attempt(&mut self, attempt: RepairAttempt) {
        if self.repair_history.len() >= MAX_REPAIR_HISTORY {
            self.repair_history.remove(0);
        }
        info!(
            attempt = attempt.attempt_number,
            outcome = %attempt.outcome,
            history = self.repair_history.len() + 1,
            "Repair attempt recorded"
        );
        self.repair_history.push(attempt);
    }

    pub fn repair_history(&self) -> &[RepairAttempt] {
        &self.repair_history
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    pub fn increment_replan_count(&mut self) {
        self.replan_count += 1;
        info!(replans = self.replan_count, "Replan count");
    }

    pub fn replan_count(&self) -> u32 {
        self.replan_count
    }

    pub fn increment_tool_call_count(&mut self) {
        self.tool_call_count += 1;
    }

    pub fn tool_call_count(&self) -> u32 {
        self.tool_call_count
    }

    pub fn mark_failure_observed(&mut self) {
        if !self.failure_observed {
            info!("Failure observed — repair will be required");
        }
        self.failure_observed = true;
    }

    pub fn failure_observed(&self) -> bool {
        self.failure_observed
    }

    // -----------------------------------------------------------------------
    // File cache
    // -----------------------------------------------------------------------

    pub fn has_read_file(&self, path: &str) -> bool {
        self.recent_file_reads.contains_key(&normalize_path(path))
    }

    /// Cache a file read, truncating at 500 lines with an 80/20 head/tail
    /// split and exactly one marker line at the cut.
    pub fn cache_file_read(&mut self, path: &str, content: &str) {
        let normalized = normalize_path(path);
        let truncated = truncate_content(content, MAX_FILE_CONTENT_LINES);
        let cached_lines = truncated.split('\n').count();
        info!(path = %normalized, lines = cached_lines, "Cached file read");
        self.recent_file_reads.insert(normalized, truncated);
    }

    pub fn cached_file(&self, path: &str) -> Option<&str> {
        self.recent_file_reads
            .get(&normalize_path(path))
            .map(String::as_str)
    }

    pub fn recent_file_reads(&self) -> &HashMap<String, String> {
        &self.recent_file_reads
    }

    /// Concatenated content of every cached file.
    pub fn concatenated_cache(&self) -> String {
        let mut parts: Vec<&str> = self.recent_file_reads.values().map(String::as_str).collect();
        parts.sort();
        parts.join("\n")
    }

    pub fn clear_file_cache(&mut self) {
        let size = self.recent_file_reads.len();
        self.recent_file_reads.clear();
        self.structure_discovered = false;
        self.collection_failure_module = None;
        self.collection_failure_subtype = None;
        self.collection_failure_reason = None;
        self.failing_artifact = None;
        self.failing_artifact_line = None;
        if size > 0 {
            info!(cleared = size, "Cleared file cache and reset discovery");
        }
    }

    pub fn has_file_context(&self) -> bool {
        !self.recent_file_reads.is_empty()
    }

    pub fn set_structure_discovered(&mut self, discovered: bool) {
        if discovered && !self.structure_discovered {
            info!("Project structure marked as discovered");
        }
        self.structure_discovered = discovered;
    }

    pub fn structure_discovered(&self) -> bool {
        self.structure_discovered
    }

    /// Soft reset — clears patch/tool state but preserves structural
    /// knowledge.
    ///
    /// Preserved intentionally: the file cache and discovery flag (the
    /// planner needs them), the last test results and failing artifact +
    /// line (replan prompts need grounded context), and the last root
    /// cause analysis (injected into the revised plan).
    pub fn soft_reset(&mut self) {
        self.collection_failure_module = None;
        self.collection_failure_subtype = None;
        self.last_tool_error = None;
        self.consecutive_tool_errors = 0;
        self.last_search_block = None;
        info!(
            cached_files = self.recent_file_reads.len(),
            artifact = ?self.failing_artifact,
            modified = self.modified_files.len(),
            "Soft reset: collection metadata cleared, structural knowledge preserved"
        );
    }
}

// ---------------------------------------------------------------------------
// Path utilities
// ---------------------------------------------------------------------------

/// Drop a leading `./`, trim any trailing slash, collapse runs of `/`.
pub fn normalize_path(path: &str) -> String {
    let path = path.strip_prefix("./").unwrap_or(path);
    let mut collapsed = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                collapsed.push('/');
            }
            prev_slash = true;
        } else {
            collapsed.push(c);
            prev_slash = false;
        }
    }
    collapsed.trim_end_matches('/').to_string()
}

fn truncate_content(content: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    if lines.len() <= max_lines {
        return content.to_string();
    }
    // 80/20 head/tail split; the marker line counts against the cap so the
    // cached entry never exceeds `max_lines` lines.
    let keep_start = max_lines * 8 / 10;
    let keep_end = max_lines - keep_start - 1;

    let mut out = String::new();
    for line in &lines[..keep_start] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&format!(
        "{TRUNCATION_MARKER_PREFIX}{} lines omitted >>>\n",
        lines.len() - keep_start - keep_end
    ));
    for line in &lines[lines.len() - keep_end..] {
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::parse_test_output;

    #[test]
    fn test_initial_state() {
        let state = SharedState::new("fix the bug");
        assert_eq!(state.current_phase(), RepairPhase::Reproduce);
        assert_eq!(state.total_iterations(), 0);
        assert!(state.current_task().is_none());
        assert!(!state.failure_observed());
    }

    #[test]
    fn test_modified_files_deduplicated_and_ordered() {
        let mut state = SharedState::new("g");
        state.add_modified_file("./src/a.py");
        state.add_modified_file("src/a.py");
        state.add_modified_file("src//b.py");
        state.add_modified_file("   ");
        assert_eq!(state.modified_files(), &["src/a.py", "src/b.py"]);
    }

    #[test]
    fn test_all_pass_clears_collection_metadata() {
        let mut state = SharedState::new("g");
        state.set_failing_artifact(Some("src/a.py".into()));
        state.set_failing_artifact_line(Some(10));
        state.set_collection_failure_subtype(Some("IMPORT_ERROR".into()));
        state.set_collection_failure_reason(Some("bad import".into()));

        let passing = parse_test_output("tests/t.py::test_a PASSED\n1 passed", 0);
        state.set_last_test_results(passing);

        assert!(state.failing_artifact().is_none());
        assert!(state.failing_artifact_line().is_none());
        assert!(state.collection_failure_subtype().is_none());
        assert!(state.collection_failure_reason().is_none());
    }

    #[test]
    fn test_failing_results_keep_collection_metadata() {
        let mut state = SharedState::new("g");
        state.set_failing_artifact(Some("src/a.py".into()));
        let failing = parse_test_output("tests/t.py::test_a FAILED", 1);
        state.set_last_test_results(failing);
        assert_eq!(state.failing_artifact(), Some("src/a.py"));
    }

    #[test]
    fn test_cache_truncation_has_single_marker_and_cap() {
        let mut state = SharedState::new("g");
        let content = (0..800)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        state.cache_file_read("src/big.py", &content);

        let cached = state.cached_file("src/big.py").unwrap();
        let lines: Vec<&str> = cached.lines().collect();
        assert!(lines.len() <= MAX_FILE_CONTENT_LINES);

        let markers = lines
            .iter()
            .filter(|l| l.starts_with(TRUNCATION_MARKER_PREFIX))
            .count();
        assert_eq!(markers, 1);

        // 80/20 split: head is the first 400 lines, tail the last 99
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[399], "line 399");
        assert_eq!(*lines.last().unwrap(), "line 799");
        assert!(cached.contains("301 lines omitted"));
    }

    #[test]
    fn test_small_file_not_truncated() {
        let mut state = SharedState::new("g");
        state.cache_file_read("src/small.py", "a\nb\nc");
        assert_eq!(state.cached_file("src/small.py").unwrap(), "a\nb\nc");
    }

    #[test]
    fn test_cache_normalizes_path_keys() {
        let mut state = SharedState::new("g");
        state.cache_file_read("./src/a.py", "content");
        assert!(state.has_read_file("src/a.py"));
        assert!(state.has_read_file("./src//a.py"));
        assert_eq!(state.recent_file_reads().len(), 1);
    }

    #[test]
    fn test_soft_reset_preserves_structural_knowledge() {
        let mut state = SharedState::new("g");
        state.cache_file_read("src/a.py", "x = 1");
        state.set_structure_discovered(true);
        state.set_failing_artifact(Some("src/a.py".into()));
        state.set_failing_artifact_line(Some(3));
        state.set_collection_failure_subtype(Some("SYNTAX_ERROR".into()));
        state.set_last_tool_error(Some("boom".into()));
        state.increment_consecutive_tool_errors();
        state.set_last_test_results(parse_test_output("t.py::t FAILED", 1));

        state.soft_reset();

        // Cleared
        assert!(state.collection_failure_subtype().is_none());
        assert!(state.last_tool_error().is_none());
        assert_eq!(state.consecutive_tool_errors(), 0);
        // Preserved
        assert!(state.has_read_file("src/a.py"));
        assert!(state.structure_discovered());
        assert_eq!(state.failing_artifact(), Some("src/a.py"));
        assert_eq!(state.failing_artifact_line(), Some(3));
        assert!(state.last_test_results().is_some());
    }

    #[test]
    fn test_clear_file_cache_resets_discovery_and_collection() {
        let mut state = SharedState::new("g");
        state.cache_file_read("src/a.py", "x");
        state.set_structure_discovered(true);
        state.set_failing_artifact(Some("src/a.py".into()));
        state.clear_file_cache();
        assert!(!state.has_file_context());
        assert!(!state.structure_discovered());
        assert!(state.failing_artifact().is_none());
    }

    #[test]
    fn test_repair_history_fifo_cap() {
        use crate::repair_attempt::{RepairAttempt, RepairOutcome};
        let mut state = SharedState::new("g");
        for i in 1..=7 {
            state.add_repair_attempt(RepairAttempt::new(i, RepairOutcome::NoPatch));
        }
        assert_eq!(state.repair_history().len(), MAX_REPAIR_HISTORY);
        assert_eq!(state.repair_history()[0].attempt_number, 3);
        assert_eq!(state.repair_history()[4].attempt_number, 7);
    }

    #[test]
    fn test_dot_artifact_rejected() {
        let mut state = SharedState::new("g");
        state.set_failing_artifact(Some(".".into()));
        assert!(state.failing_artifact().is_none());
        state.set_failing_artifact(Some("..".into()));
        assert!(state.failing_artifact().is_none());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src/a.py"), "src/a.py");
        assert_eq!(normalize_path("src//deep///a.py"), "src/deep/a.py");
        assert_eq!(normalize_path("src/dir/"), "src/dir");
    }

    #[test]
    fn test_task_navigation() {
        let mut state = SharedState::new("g");
        state.update_plan(PlannerOutput {
            steps: vec!["first".into(), "second".into()],
            reasoning: String::new(),
        });
        assert_eq!(state.current_task(), Some("first"));
        state.increment_task_attempts();
        assert_eq!(state.attempts_on_current_task(), 1);
        state.advance_to_next_task();
        assert_eq!(state.current_task(), Some("second"));
        assert_eq!(state.attempts_on_current_task(), 0);
        state.advance_to_next_task();
        assert!(state.current_task().is_none());
    }

    #[test]
    fn test_update_plan_resets_position() {
        let mut state = SharedState::new("g");
        state.update_plan(PlannerOutput {
            steps: vec!["a".into()],
            reasoning: String::new(),
        });
        state.advance_to_next_task();
        state.update_plan(PlannerOutput {
            steps: vec!["b".into()],
            reasoning: String::new(),
        });
        assert_eq!(state.current_task(), Some("b"));
    }
}
