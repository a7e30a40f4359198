//! Task execution: prompt construction, tool-call parsing, gate
//! enforcement, and sequential tool dispatch.
//!
//! The analysis phase takes a separate tool-less path that parses the
//! model's diagnosis instead of tool calls. All other phases share the
//! common path:
//!
//! 1. build the phase-grounded prompt and invoke the model,
//! 2. parse the `tool_calls` JSON (one re-prompt on structural failure),
//! 3. apply gates — discovery, repair evidence, phase filter,
//! 4. run the surviving calls in order, recording modified files and
//!    parsing test output.
//!
//! Gates substitute, drop, or augment model-proposed calls from shared
//! state; they are the only place the loop overrides the model.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::analyzer::FailureAnalyzer;
use crate::llm::{LlmClient, LlmError, Role};
use crate::phase::RepairPhase;
use crate::report::{parse_test_output, ExecutionResult, FailureType, TestResults, ToolResult};
use crate::root_cause::{extract_json_object, strip_fences, RootCauseAnalysis};
use crate::runner::TestRunner;
use crate::state::SharedState;
use crate::workspace::Workspace;

/// One model-proposed tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub args: Value,
}

/// Tools permitted per phase. Calls outside the allowlist are dropped.
pub fn phase_allowlist(phase: RepairPhase) -> &'static [&'static str] {
    match phase {
        RepairPhase::Reproduce => &["read_file", "run_tests", "grep", "list_files", "file_tree"],
        RepairPhase::RepairAnalyze => &[],
        RepairPhase::RepairPatch => &[
            "read_file",
            "replace_in_file",
            "write_file",
            "grep",
            "list_files",
            "file_tree",
        ],
        RepairPhase::Validate => &["run_tests"],
    }
}

/// Dispatches tools against the sandboxed workspace.
pub struct Executor {
    llm: Arc<dyn LlmClient>,
    workspace: Arc<Workspace>,
    runner: TestRunner,
    analyzer: FailureAnalyzer,
}

impl Executor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        workspace: Arc<Workspace>,
        runner: TestRunner,
        analyzer: FailureAnalyzer,
    ) -> Self {
        Self {
            llm,
            workspace,
            runner,
            analyzer,
        }
    }

    /// Execute one plan task against the current state.
    pub async fn execute(
        &self,
        task: &str,
        state: &mut SharedState,
    ) -> Result<ExecutionResult, LlmError> {
        if state.current_phase() == RepairPhase::RepairAnalyze {
            return self.execute_analysis(task, state).await;
        }

        let prompt = self.build_tool_prompt(task, state);
        let raw = self
            .llm
            .generate(Role::Executor, &prompt, Role::Executor.temperature())
            .await?;

        let mut calls = match parse_tool_calls(&raw) {
            Ok(calls) => calls,
            Err(()) => {
                warn!("Tool-call JSON failed structurally — re-prompting once");
                let reminder = format!(
                    "{prompt}\n\nREMINDER: your previous response was not valid JSON. \
                     Respond with ONLY the JSON object described above. No prose."
                );
                let raw = self
                    .llm
                    .generate(Role::Executor, &reminder, Role::Executor.temperature())
                    .await?;
                parse_tool_calls(&raw).unwrap_or_default()
            }
        };

        self.apply_discovery_gate(&mut calls, state);
        self.apply_repair_evidence_gate(&mut calls, state);
        self.apply_phase_filter(&mut calls, state);

        if calls.is_empty() {
            let message = "Executor produced no usable tool calls";
            state.set_last_tool_error(Some(message.to_string()));
            state.increment_consecutive_tool_errors();
            return Ok(ExecutionResult::step_error(message));
        }

        let mut tool_results = Vec::new();
        let mut modified_files = Vec::new();
        let mut test_results = TestResults::not_run();

        for call in calls {
            state.increment_tool_call_count();
            let result = self.run_tool(&call, state).await;

            if result.succeeded()
                && matches!(call.tool.as_str(), "write_file" | "replace_in_file")
            {
                if let Some(path) = &result.target_file {
                    modified_files.push(path.clone());
                }
            }

            if call.tool == "run_tests" {
                test_results = parse_test_output(&result.stdout, result.exit_code);
                if result.exit_code != 0 {
                    if let Err(message) = self.ground_failure(&test_results, state) {
                        state.set_last_tool_error(Some(message.clone()));
                        state.increment_consecutive_tool_errors();
                        return Ok(ExecutionResult::step_error(&message));
                    }
                }
            }

            tool_results.push(result);
        }

        let exec = ExecutionResult {
            task: task.to_string(),
            tool_results,
            test_results,
            modified_files,
        };

        // Tool-error bookkeeping for the mediator ladder and the next
        // attempt's prompt. Failing test runs are not tool errors in this
        // sense — their signal lives in TestResults.
        let real_errors: Vec<String> = exec
            .tool_results
            .iter()
            .filter(|r| !r.succeeded() && r.tool != "run_tests")
            .map(|r| {
                if r.stderr.is_empty() {
                    r.stdout.clone()
                } else {
                    r.stderr.clone()
                }
            })
            .collect();
        if !real_errors.is_empty() {
            state.set_last_tool_error(Some(real_errors.join("\n")));
            state.increment_consecutive_tool_errors();
        } else {
            state.clear_tool_error_state();
        }

        Ok(exec)
    }

    /// Extract the failure signal from the latest run and ground the
    /// identified artifact in the file cache. An artifact that cannot be
    /// read is a fatal step error.
    fn ground_failure(
        &self,
        results: &TestResults,
        state: &mut SharedState,
    ) -> Result<(), String> {
        let signal = self.analyzer.analyze(&results.raw_output);
        state.set_collection_failure_subtype(Some(signal.subtype.to_string()));
        state.set_failing_artifact(signal.failing_artifact);
        state.set_failing_artifact_line(signal.failing_line);
        state.set_collection_failure_reason(Some(signal.reason));

        let Some(artifact) = state.failing_artifact().map(String::from) else {
            return Ok(());
        };
        if state.has_read_file(&artifact) {
            return Ok(());
        }
        match self.workspace.read_file(&artifact) {
            Ok(content) => {
                state.cache_file_read(&artifact, &content);
                Ok(())
            }
            Err(e) => Err(format!(
                "Failed to ground failing artifact {artifact}: {e}"
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Gates
    // -----------------------------------------------------------------------

    /// Before structure discovery, a reproduce step that proposes no
    /// discovery tool is replaced with a single `list_files .`.
    fn apply_discovery_gate(&self, calls: &mut Vec<ToolCall>, state: &SharedState) {
        if state.current_phase() != RepairPhase::Reproduce || state.structure_discovered() {
            return;
        }
        let has_discovery = calls
            .iter()
            .any(|c| c.tool == "list_files" || c.tool == "file_tree");
        if !has_discovery {
            info!("Discovery gate: injecting list_files before any other activity");
            *calls = vec![ToolCall {
                tool: "list_files".into(),
                args: json!({"path": "."}),
            }];
        }
    }

    /// A patching step may not run blind: when the failing artifact is
    /// known but not cached, the model's calls are replaced with a single
    /// read of that artifact. Unrecoverable paths fall back to discovery.
    fn apply_repair_evidence_gate(&self, calls: &mut Vec<ToolCall>, state: &SharedState) {
        if state.current_phase() != RepairPhase::RepairPatch {
            return;
        }
        let evidence_relevant = state
            .last_test_results()
            .map(|r| {
                matches!(
                    r.failure_type,
                    FailureType::AssertionError | FailureType::CollectionError
                )
            })
            .unwrap_or(false);
        if !evidence_relevant {
            return;
        }
        let Some(artifact) = state.failing_artifact() else {
            return;
        };
        if state.has_read_file(artifact) {
            return;
        }
        match sanitize_artifact_path(artifact) {
            Some(path) => {
                info!(path = %path, "Repair evidence gate: forcing read of failing artifact");
                *calls = vec![ToolCall {
                    tool: "read_file".into(),
                    args: json!({"path": path}),
                }];
            }
            None => {
                warn!(artifact = %artifact, "Repair evidence gate: artifact path unusable, falling back to discovery");
                *calls = vec![ToolCall {
                    tool: "list_files".into(),
                    args: json!({"path": "."}),
                }];
            }
        }
    }

    fn apply_phase_filter(&self, calls: &mut Vec<ToolCall>, state: &SharedState) {
        let allowed = phase_allowlist(state.current_phase());
        calls.retain(|c| {
            let keep = allowed.contains(&c.tool.as_str());
            if !keep {
                warn!(tool = %c.tool, phase = %state.current_phase(), "Phase filter dropped tool call");
            }
            keep
        });
    }

    // -----------------------------------------------------------------------
    // Tool dispatch
    // -----------------------------------------------------------------------

    async fn run_tool(&self, call: &ToolCall, state: &mut SharedState) -> ToolResult {
        info!(tool = %call.tool, "Executing tool");
        match call.tool.as_str() {
            "read_file" => self.tool_read_file(&call.args, state),
            "write_file" => self.tool_write_file(&call.args),
            "replace_in_file" => self.tool_replace_in_file(&call.args, state),
            "grep" => self.tool_grep(&call.args),
            "list_files" => self.tool_list_files(&call.args, state),
            "file_tree" => self.tool_file_tree(&call.args, state),
            "run_tests" => self.tool_run_tests().await,
            other => ToolResult::error(other, format!("Unknown tool: {other}")),
        }
    }

    fn tool_read_file(&self, args: &Value, state: &mut SharedState) -> ToolResult {
        let path = match require_str(args, "path") {
            Ok(path) => path,
            Err(e) => return ToolResult::error("read_file", e),
        };
        match self.workspace.read_file(&path) {
            Ok(content) => {
                state.cache_file_read(&path, &content);
                ToolResult::ok("read_file", content, Some(path))
            }
            Err(e) => ToolResult::error("read_file", format!("Failed to read file: {e}")),
        }
    }

    fn tool_write_file(&self, args: &Value) -> ToolResult {
        let path = match require_str(args, "path") {
            Ok(path) => path,
            Err(e) => return ToolResult::error("write_file", e),
        };
        let content = match require_str(args, "content") {
            Ok(content) => content,
            Err(e) => return ToolResult::error("write_file", e),
        };
        match self.workspace.write_file(&path, &content) {
            Ok(()) => ToolResult {
                tool: "write_file".into(),
                exit_code: 0,
                stdout: "File written successfully".into(),
                stderr: String::new(),
                target_file: Some(path),
            },
            Err(e) => ToolResult::error("write_file", format!("Failed to write file: {e}")),
        }
    }

    fn tool_replace_in_file(&self, args: &Value, state: &mut SharedState) -> ToolResult {
        let path = match require_str(args, "path") {
            Ok(path) => path,
            Err(e) => return ToolResult::error("replace_in_file", e),
        };
        let search_block = match require_str(args, "search_block") {
            Ok(block) => block,
            Err(e) => return ToolResult::error("replace_in_file", e),
        };
        let replace_block = match require_str(args, "replace_block") {
            Ok(block) => block,
            Err(e) => return ToolResult::error("replace_in_file", e),
        };

        state.set_last_search_block(Some(search_block.clone()));

        let original = match self.workspace.read_file(&path) {
            Ok(content) => content,
            Err(e) => {
                return ToolResult::error(
                    "replace_in_file",
                    format!("Failed to replace block: {e}"),
                )
            }
        };

        // Tier 1: exact substring match, which must be unique.
        let exact = find_all(&original, &search_block);
        if exact.len() > 1 {
            return ToolResult::error(
                "replace_in_file",
                "Search block found multiple times - be more specific".into(),
            );
        }
        if exact.len() == 1 {
            let updated = original.replacen(&search_block, &replace_block, 1);
            return match self.workspace.write_file(&path, &updated) {
                Ok(()) => {
                    info!(path = %path, "Replaced block (exact match)");
                    ToolResult {
                        tool: "replace_in_file".into(),
                        exit_code: 0,
                        stdout: "Block replaced successfully".into(),
                        stderr: String::new(),
                        target_file: Some(path),
                    }
                }
                Err(e) => ToolResult::error(
                    "replace_in_file",
                    format!("Failed to replace block: {e}"),
                ),
            };
        }

        // Tier 2: whitespace-normalized matching over candidate line
        // windows of the same length as the search block.
        info!("Exact match failed, trying whitespace-normalized matching");
        let candidates = fuzzy_window_matches(&original, &search_block);
        match candidates.len() {
            1 => {
                let updated = original.replacen(&candidates[0], &replace_block, 1);
                match self.workspace.write_file(&path, &updated) {
                    Ok(()) => {
                        info!(path = %path, "Replaced block (fuzzy match)");
                        ToolResult {
                            tool: "replace_in_file".into(),
                            exit_code: 0,
                            stdout: "Block replaced successfully (whitespace normalized)".into(),
                            stderr: String::new(),
                            target_file: Some(path),
                        }
                    }
                    Err(e) => ToolResult::error(
                        "replace_in_file",
                        format!("Failed to replace block: {e}"),
                    ),
                }
            }
            n if n > 1 => ToolResult::error(
                "replace_in_file",
                "Search block found multiple times - be more specific".into(),
            ),
            _ => {
                warn!(path = %path, "Could not find search block");
                let snippet = relevant_snippet(&original, &search_block);
                ToolResult::error(
                    "replace_in_file",
                    format!(
                        "Search block not found in file.\n\n\
                         You searched for:\n{}\n\n\
                         Actual file contains:\n{snippet}\n\n\
                         Tip: Copy the EXACT text from the file, including whitespace.",
                        truncate_chars(&search_block, 200)
                    ),
                )
            }
        }
    }

    fn tool_grep(&self, args: &Value) -> ToolResult {
        let pattern = match require_str(args, "pattern") {
            Ok(pattern) => pattern,
            Err(e) => return ToolResult::error("grep", e),
        };
        let path = match require_str(args, "path") {
            Ok(path) => path,
            Err(e) => return ToolResult::error("grep", e),
        };
        match self.workspace.grep(&pattern, &path) {
            Ok(matches) => {
                let output = matches
                    .iter()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolResult::ok("grep", output, None)
            }
            Err(e) => ToolResult::error("grep", format!("Failed to search: {e}")),
        }
    }

    fn tool_list_files(&self, args: &Value, state: &mut SharedState) -> ToolResult {
        let path = optional_str(args, "path", ".");
        match self.workspace.list_files(&path) {
            Ok(entries) => {
                state.set_structure_discovered(true);
                ToolResult::ok("list_files", entries.join("\n"), None)
            }
            Err(e) => ToolResult::error("list_files", format!("Failed to list files: {e}")),
        }
    }

    fn tool_file_tree(&self, args: &Value, state: &mut SharedState) -> ToolResult {
        let path = optional_str(args, "path", ".");
        let depth = args
            .get("depth")
            .and_then(Value::as_u64)
            .unwrap_or(3) as usize;
        match self.workspace.file_tree(&path, depth) {
            Ok(tree) => {
                state.set_structure_discovered(true);
                ToolResult::ok("file_tree", tree, None)
            }
            Err(e) => ToolResult::error("file_tree", format!("Failed to build tree: {e}")),
        }
    }

    async fn tool_run_tests(&self) -> ToolResult {
        let result = self.runner.run_tests().await;
        info!(exit_code = result.exit_code, "run_tests executed");
        ToolResult {
            tool: "run_tests".into(),
            exit_code: result.exit_code,
            stdout: result.output,
            stderr: String::new(),
            target_file: None,
        }
    }

    // -----------------------------------------------------------------------
    // Analysis path (tool-less)
    // -----------------------------------------------------------------------

    async fn execute_analysis(
        &self,
        task: &str,
        state: &mut SharedState,
    ) -> Result<ExecutionResult, LlmError> {
        let prompt = self.build_analysis_prompt(task, state);
        let raw = self
            .llm
            .generate(Role::Executor, &prompt, Role::Executor.temperature())
            .await?;

        let cached = state.concatenated_cache();
        let cached = (!cached.is_empty()).then_some(cached.as_str());
        let analysis = RootCauseAnalysis::parse(
            &raw,
            state.failing_artifact(),
            state.failing_artifact_line(),
            cached,
        );
        if !analysis.is_valid() {
            warn!(reason = ?analysis.invalid_reason(), "Analysis failed validation");
        }
        state.set_root_cause_analysis(analysis);

        Ok(ExecutionResult {
            task: task.to_string(),
            tool_results: Vec::new(),
            test_results: TestResults::not_run(),
            modified_files: Vec::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Prompt builders
    // -----------------------------------------------------------------------

    fn build_tool_prompt(&self, task: &str, state: &SharedState) -> String {
        let phase = state.current_phase();
        let mut prompt = format!(
            "You are executing one step of an automated bug repair.\n\n\
             Phase: {phase}\nTask: {task}\n\n"
        );

        if let Some(results) = state.last_test_results() {
            prompt.push_str(&format!("Test status: {}\n", results.summary()));
            if let Some(snippet) = &results.error_snippet {
                prompt.push_str(&format!("Key error:\n{snippet}\n"));
            }
            if results.failure_type == FailureType::CollectionError {
                prompt.push_str("Collection failure output (truncated):\n");
                prompt.push_str(&first_n_lines(&results.raw_output, 40));
                prompt.push('\n');
            }
            if results.any_failed() {
                prompt.push_str(&format!("Hint: {}\n", results.failure_type.repair_hint()));
            }
            prompt.push('\n');
        }

        if let Some(artifact) = state.failing_artifact() {
            prompt.push_str(&format!("Failing artifact: {artifact}"));
            if let Some(line) = state.failing_artifact_line() {
                prompt.push_str(&format!(" (line {line})"));
            }
            prompt.push('\n');
            if let Some(content) = state.cached_file(artifact) {
                prompt.push_str(&format!("Excerpt of {artifact}:\n"));
                prompt.push_str(&extract_file_window(content, state.failing_artifact_line()));
            }
            prompt.push('\n');
        }

        if let Some(error) = state.last_tool_error() {
            prompt.push_str(&format!(
                "Your previous attempt failed with:\n{}\n",
                truncate_chars(error, 600)
            ));
            if error.contains("not found") {
                prompt.push_str(
                    "The search block did not exist in the file. Copy it exactly from the \
                     excerpt above — no line-number prefixes, no '>>' markers.\n",
                );
            } else if error.contains("multiple times") {
                prompt.push_str(
                    "The search block was ambiguous. Include more surrounding lines to make \
                     it unique.\n",
                );
            }
            prompt.push('\n');
        }

        if phase == RepairPhase::RepairPatch {
            if let Some(analysis) = state.last_root_cause_analysis().filter(|a| a.is_valid()) {
                prompt.push_str(&analysis.to_patch_prompt_block());
                prompt.push_str("\n\n");
            }
        }

        prompt.push_str(&tool_reference(phase));
        prompt.push_str(
            "\nRespond with a JSON object:\n\
             {\"reasoning\": \"...\", \"tool_calls\": [{\"tool\": \"name\", \"args\": {...}}]}\n",
        );
        prompt
    }

    fn build_analysis_prompt(&self, task: &str, state: &SharedState) -> String {
        let mut prompt = format!(
            "You are diagnosing a test failure. Task: {task}\n\n\
             Do NOT call any tools. Produce a diagnosis from the evidence below.\n\n"
        );

        if let Some(results) = state.last_test_results() {
            prompt.push_str("Raw failure output:\n");
            prompt.push_str(&first_n_lines(&results.raw_output, 60));
            prompt.push_str("\n\n");
        }

        if let Some(artifact) = state.failing_artifact() {
            if let Some(content) = state.cached_file(artifact) {
                prompt.push_str(&format!("Content of {artifact}"));
                if let Some(line) = state.failing_artifact_line() {
                    prompt.push_str(&format!(" (failure reported at line {line})"));
                }
                prompt.push_str(":\n");
                prompt.push_str(&extract_file_window(content, state.failing_artifact_line()));
                prompt.push_str("\n\n");
            }
        }

        if !state.repair_history().is_empty() {
            prompt.push_str("Previously failed repair attempts:\n");
            for attempt in state.repair_history() {
                prompt.push_str(&attempt.to_prompt_section());
            }
            prompt.push('\n');
        }

        prompt.push_str(
            "Respond with ONLY a JSON object with these fields:\n\
             {\n\
             \"artifactPath\": \"workspace-relative path of the root-cause file\",\n\
             \"artifactLine\": <line number of the defect>,\n\
             \"rootCauseSummary\": \"one-sentence diagnosis\",\n\
             \"causalExplanation\": \"why this causes the observed failure\",\n\
             \"minimalFixStrategy\": \"the smallest change that fixes it\",\n\
             \"whyPreviousAttemptsFailed\": \"only when history is shown above\",\n\
             \"proposedSearchBlock\": \"the exact lines you will search for when patching, \
             copied verbatim from the file content above\"\n\
             }\n",
        );
        prompt
    }
}

// ---------------------------------------------------------------------------
// Tool-call parsing
// ---------------------------------------------------------------------------

/// Parse the executor wire format.
///
/// `Err(())` means the response is not JSON at all (structural failure,
/// worth one re-prompt). Valid JSON without a usable `tool_calls` array
/// yields an empty list.
pub fn parse_tool_calls(raw: &str) -> Result<Vec<ToolCall>, ()> {
    let stripped = strip_fences(raw);
    let json = extract_json_object(stripped).ok_or(())?;
    let value: Value = serde_json::from_str(json).map_err(|_| ())?;

    let Some(entries) = value.get("tool_calls").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let tool = entry.get("tool").and_then(Value::as_str)?.to_string();
            let args = entry.get("args").cloned().unwrap_or_else(|| json!({}));
            Some(ToolCall { tool, args })
        })
        .collect())
}

// ---------------------------------------------------------------------------
// File windowing
// ---------------------------------------------------------------------------

/// Render a line-numbered window of `content` around `failure_line`
/// (±80 lines), or the first 120 lines when the failure line is unknown.
/// Elided head and tail ranges are summarized.
pub fn extract_file_window(content: &str, failure_line: Option<u32>) -> String {
    if content.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = content.split('\n').collect();
    let total = lines.len();

    let (start, end) = match failure_line {
        Some(line) if line > 0 => {
            let line = line as usize;
            (line.saturating_sub(80).max(1), (line + 80).min(total))
        }
        _ => (1, 120.min(total)),
    };
    if start > end {
        return String::new();
    }

    let mut out = String::new();
    if start > 1 {
        out.push_str(&format!("  ... (lines 1-{} omitted)\n", start - 1));
    }
    for n in start..=end {
        out.push_str(&format!("{n:>5} | {}\n", lines[n - 1]));
    }
    if end < total {
        out.push_str(&format!("  ... (lines {}-{} omitted)\n", end + 1, total));
    }
    out
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn tool_reference(phase: RepairPhase) -> String {
    let allowed = phase_allowlist(phase);
    let mut out = String::from("Available tools in this phase:\n");
    for tool in allowed {
        let line = match *tool {
            "read_file" => "- read_file {\"path\"}: read a file",
            "write_file" => "- write_file {\"path\", \"content\"}: write a file, creating parents",
            "replace_in_file" => {
                "- replace_in_file {\"path\", \"search_block\", \"replace_block\"}: \
                 replace one exact block of text"
            }
            "grep" => "- grep {\"pattern\", \"path\"}: regex search, path:line:content results",
            "list_files" => "- list_files {\"path\"?}: list a directory (default \".\")",
            "file_tree" => "- file_tree {\"path\"?, \"depth\"?}: directory tree (default depth 3)",
            "run_tests" => "- run_tests {}: run the project test suite",
            other => other,
        };
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn require_str(args: &Value, field: &str) -> Result<String, String> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("Missing required field: {field}"))
}

fn optional_str(args: &Value, field: &str, default: &str) -> String {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn find_all(haystack: &str, needle: &str) -> Vec<usize> {
    if needle.is_empty() {
        return Vec::new();
    }
    let mut offsets = Vec::new();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        offsets.push(start + pos);
        start += pos + 1;
    }
    offsets
}

/// Candidate windows of the same line count as the search block whose
/// whitespace-normalized text equals the normalized search block.
fn fuzzy_window_matches(content: &str, search_block: &str) -> Vec<String> {
    let norm_search = normalize_whitespace(search_block);
    if norm_search.is_empty() {
        return Vec::new();
    }
    let lines: Vec<&str> = content.split('\n').collect();
    let window = search_block.split('\n').count();
    if window == 0 || window > lines.len() {
        return Vec::new();
    }

    let mut matches = Vec::new();
    for i in 0..=(lines.len() - window) {
        let candidate = lines[i..i + window].join("\n");
        if normalize_whitespace(&candidate) == norm_search {
            matches.push(candidate);
        }
    }
    matches
}

/// Collapse whitespace runs within each line and trim it, preserving line
/// structure.
fn normalize_whitespace(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Context around the closest match of the search block's first line:
/// 2 lines before, 5 after. Falls back to the head of the file.
fn relevant_snippet(content: &str, search_block: &str) -> String {
    let first_line = search_block
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");

    if first_line.is_empty() {
        return truncate_chars(content, 300);
    }

    let lines: Vec<&str> = content.split('\n').collect();
    let found = lines.iter().position(|l| {
        let trimmed = l.trim();
        trimmed.contains(first_line) || first_line.contains(trimmed) && !trimmed.is_empty()
    });

    match found {
        Some(idx) => {
            let start = idx.saturating_sub(2);
            let end = (idx + 5).min(lines.len());
            lines[start..end].join("\n")
        }
        None => truncate_chars(content, 300),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max.saturating_sub(3);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

/// Strip window-prefix, marker, and whitespace contamination off an
/// artifact path destined for a generated tool call. Returns `None` when
/// the path cannot be made single-token clean.
fn sanitize_artifact_path(raw: &str) -> Option<String> {
    let first = raw.lines().next()?.trim();
    let mut candidate = first.trim_start_matches(">>").trim();
    if let Some(idx) = candidate.find('|') {
        let prefix = candidate[..idx].trim();
        if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) {
            candidate = candidate[idx + 1..].trim();
        }
    }
    if candidate.is_empty()
        || candidate.contains(char::is_whitespace)
        || candidate.contains('>')
        || candidate.contains("<<<")
    {
        return None;
    }
    Some(candidate.to_string())
}

fn first_n_lines(text: &str, n: usize) -> String {
    text.lines().take(n).collect::<Vec<_>>().join("\n")
}
