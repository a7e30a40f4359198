//! Execution reporting types: test results, failure classification,
//! per-tool outcomes, and the aggregate result of one executor invocation.

use serde::{Deserialize, Serialize};

/// Classification of a test-suite failure.
///
/// Different failure classes steer different repair strategies, so the
/// class is surfaced to both the mediator and the repair prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// Tests passed.
    None,
    /// An assertion failed — the logic is wrong.
    AssertionError,
    /// The patch broke the source structure.
    SyntaxError,
    /// A module or dependency could not be imported.
    ImportError,
    /// Wrong method or property access.
    AttributeError,
    /// Type mismatch in an operation.
    TypeError,
    /// Sequence access out of bounds.
    IndexError,
    /// Mapping key missing.
    KeyError,
    /// The runner could not collect tests at all.
    CollectionError,
    /// Unclassified.
    Unknown,
}

impl FailureType {
    /// Strategy hint injected into repair prompts.
    pub fn repair_hint(self) -> &'static str {
        match self {
            Self::AssertionError => {
                "The logic is incorrect. Review the algorithm and fix the computation."
            }
            Self::SyntaxError => {
                "The source syntax is broken. Check indentation, brackets, and structure."
            }
            Self::ImportError => "Missing import or module. Add the required import statement.",
            Self::AttributeError => {
                "Wrong method or property name. Check the object type and available members."
            }
            Self::TypeError => {
                "Type mismatch in operation. Ensure compatible types or add a conversion."
            }
            Self::IndexError => {
                "Sequence index out of bounds. Add bounds checking or fix the indexing logic."
            }
            Self::KeyError => {
                "Mapping key does not exist. Use a defaulted lookup or check key existence."
            }
            Self::CollectionError => {
                "The runner could not collect tests. Fix structural issues preventing discovery."
            }
            Self::Unknown => "Unclassified error. Analyze the error message carefully.",
            Self::None => "No error - tests passed.",
        }
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::AssertionError => "ASSERTION_ERROR",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::ImportError => "IMPORT_ERROR",
            Self::AttributeError => "ATTRIBUTE_ERROR",
            Self::TypeError => "TYPE_ERROR",
            Self::IndexError => "INDEX_ERROR",
            Self::KeyError => "KEY_ERROR",
            Self::CollectionError => "COLLECTION_ERROR",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// TestResults
// ---------------------------------------------------------------------------

/// Immutable outcome of one test-runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResults {
    pub passing: Vec<String>,
    pub failing: Vec<String>,
    pub raw_output: String,
    pub was_run: bool,
    pub failure_type: FailureType,
    pub error_snippet: Option<String>,
}

impl TestResults {
    /// Sentinel for executions that never invoked the runner.
    pub fn not_run() -> Self {
        Self {
            passing: Vec::new(),
            failing: Vec::new(),
            raw_output: String::new(),
            was_run: false,
            failure_type: FailureType::None,
            error_snippet: None,
        }
    }

    pub fn any_failed(&self) -> bool {
        !self.failing.is_empty()
    }

    pub fn all_passed(&self) -> bool {
        self.was_run && self.failing.is_empty() && !self.passing.is_empty()
    }

    /// Short human-readable summary.
    pub fn summary(&self) -> String {
        if !self.was_run {
            return "Tests not run".into();
        }
        let mut summary = format!("{} passed, {} failed", self.passing.len(), self.failing.len());
        if !self.failing.is_empty()
            && self.failure_type != FailureType::None
            && self.failure_type != FailureType::Unknown
        {
            summary.push_str(&format!(" ({})", self.failure_type));
        }
        summary
    }

    /// Multi-line failure summary for prompt injection.
    pub fn detailed_failure_summary(&self) -> String {
        if !self.any_failed() {
            return "All tests passed".into();
        }
        let mut out = format!(
            "Failure Type: {}\nFailed Tests: {}\n",
            self.failure_type,
            self.failing.len()
        );
        for test in &self.failing {
            out.push_str(&format!("  - {test}\n"));
        }
        if let Some(snippet) = &self.error_snippet {
            out.push_str(&format!("\nKey Error:\n{snippet}\n"));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Test-output parsing
// ---------------------------------------------------------------------------

/// Build [`TestResults`] from merged runner output and its exit code.
///
/// Exit-code mapping: 0 → NONE, 1 → ASSERTION_ERROR, 2/4/5 →
/// COLLECTION_ERROR, anything else → ASSERTION_ERROR. The class is then
/// upgraded when the output names a more specific error kind.
pub fn parse_test_output(output: &str, exit_code: i32) -> TestResults {
    let mut passing = Vec::new();
    let mut failing = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        // pytest verbose lines: `path::test_id PASSED` / `path::test_id FAILED`
        if let Some(id) = line.strip_suffix(" PASSED").map(str::trim) {
            if id.contains("::") && !passing.iter().any(|p| p == id) {
                passing.push(id.to_string());
            }
        } else if let Some(id) = line.strip_suffix(" FAILED").map(str::trim) {
            if id.contains("::") && !failing.iter().any(|f| f == id) {
                failing.push(id.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("FAILED ") {
            // summary form: `FAILED path::test_id - AssertionError: ...`
            let id = rest.split_whitespace().next().unwrap_or(rest).to_string();
            if id.contains("::") && !failing.contains(&id) {
                failing.push(id);
            }
        }
    }

    let failure_type = if exit_code == 0 {
        FailureType::None
    } else {
        classify_failure(output, exit_code)
    };

    // A non-zero exit with no parseable test ids still counts as a failure.
    if exit_code != 0 && failing.is_empty() {
        failing.push("test_run_failure".into());
    }

    let error_snippet = if exit_code != 0 {
        extract_error_snippet(output)
    } else {
        None
    };

    TestResults {
        passing,
        failing,
        raw_output: output.to_string(),
        was_run: true,
        failure_type,
        error_snippet,
    }
}

fn classify_failure(output: &str, exit_code: i32) -> FailureType {
    // Content-specific classes win over the coarse exit-code mapping.
    if output.contains("SyntaxError") || output.contains("IndentationError") {
        return FailureType::SyntaxError;
    }
    if output.contains("ModuleNotFoundError") || output.contains("ImportError") {
        return FailureType::ImportError;
    }
    if output.contains("AttributeError") {
        return FailureType::AttributeError;
    }
    if output.contains("TypeError") {
        return FailureType::TypeError;
    }
    if output.contains("IndexError") {
        return FailureType::IndexError;
    }
    if output.contains("KeyError") {
        return FailureType::KeyError;
    }
    if output.contains("AssertionError") {
        return FailureType::AssertionError;
    }
    match exit_code {
        1 => FailureType::AssertionError,
        2 | 4 | 5 => FailureType::CollectionError,
        _ => FailureType::AssertionError,
    }
}

/// First output line naming an error, plus the following line for context.
fn extract_error_snippet(output: &str) -> Option<String> {
    let lines: Vec<&str> = output.lines().collect();
    let idx = lines.iter().position(|l| l.contains("Error"))?;
    let mut snippet = lines[idx].trim().to_string();
    if let Some(next) = lines.get(idx + 1) {
        if !next.trim().is_empty() {
            snippet.push('\n');
            snippet.push_str(next.trim());
        }
    }
    if snippet.len() > 500 {
        snippet.truncate(500);
    }
    Some(snippet)
}

// ---------------------------------------------------------------------------
// ToolResult / ExecutionResult
// ---------------------------------------------------------------------------

/// Outcome of a single tool call. Exit code 0 indicates success.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub target_file: Option<String>,
}

impl ToolResult {
    pub fn ok(tool: &str, stdout: String, target_file: Option<String>) -> Self {
        Self {
            tool: tool.to_string(),
            exit_code: 0,
            stdout,
            stderr: String::new(),
            target_file,
        }
    }

    pub fn error(tool: &str, message: String) -> Self {
        Self {
            tool: tool.to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: message,
            target_file: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Aggregate result of one `Executor::execute` invocation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub task: String,
    pub tool_results: Vec<ToolResult>,
    pub test_results: TestResults,
    pub modified_files: Vec<String>,
}

impl ExecutionResult {
    /// Error result for a step that could not be executed at all.
    pub fn step_error(message: &str) -> Self {
        Self {
            task: format!("ERROR: {message}"),
            tool_results: vec![ToolResult::error("error", message.to_string())],
            test_results: TestResults::not_run(),
            modified_files: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.tool_results.iter().any(|r| !r.succeeded())
    }

    /// Concatenated error text of all failed tools.
    pub fn tool_errors(&self) -> String {
        self.tool_results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| {
                if r.stderr.is_empty() {
                    r.stdout.as_str()
                } else {
                    r.stderr.as_str()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    /// Tool errors capped at 15 lines.
    ///
    /// A failed run_tests carries the entire runner output; the critic
    /// needs the failure signal, not the full log.
    pub fn error_summary(&self) -> String {
        let full = self.tool_errors();
        let lines: Vec<&str> = full.lines().collect();
        if lines.len() <= 15 {
            return full;
        }
        let mut out = lines[..15].join("\n");
        out.push_str(&format!("\n... ({} more lines omitted)", lines.len() - 15));
        out
    }

    pub fn tests_pass(&self) -> bool {
        self.test_results.all_passed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assertion_error_classification() {
        let output = "\
test_calculator.py::test_subtract FAILED

def test_subtract():
    result = subtract(5, 3)
>   assert result == 2
E   AssertionError: assert 8 == 2

1 failed, 0 passed
";
        let results = parse_test_output(output, 1);
        assert_eq!(results.failure_type, FailureType::AssertionError);
        assert!(results.error_snippet.unwrap().contains("AssertionError"));
        assert!(results
            .failure_type
            .repair_hint()
            .contains("logic is incorrect"));
        assert_eq!(results.failing, vec!["test_calculator.py::test_subtract"]);
    }

    #[test]
    fn test_syntax_error_classification() {
        let output = "\
ERROR collecting test_calculator.py
test_calculator.py:3
    def subtract(a, b)
                      ^
SyntaxError: invalid syntax
";
        let results = parse_test_output(output, 2);
        assert_eq!(results.failure_type, FailureType::SyntaxError);
        assert!(results.failure_type.repair_hint().contains("syntax is broken"));
    }

    #[test]
    fn test_import_error_classification() {
        let output = "E   ModuleNotFoundError: No module named 'numpy'\n1 failed";
        let results = parse_test_output(output, 1);
        assert_eq!(results.failure_type, FailureType::ImportError);
    }

    #[test]
    fn test_attribute_error_classification() {
        let output = "E   AttributeError: 'Calculator' object has no attribute 'computee'";
        let results = parse_test_output(output, 1);
        assert_eq!(results.failure_type, FailureType::AttributeError);
    }

    #[test]
    fn test_exit_code_2_maps_to_collection_error() {
        let results = parse_test_output("some unclassifiable noise", 2);
        assert_eq!(results.failure_type, FailureType::CollectionError);
    }

    #[test]
    fn test_exit_codes_4_and_5_map_to_collection_error() {
        assert_eq!(
            parse_test_output("noise", 4).failure_type,
            FailureType::CollectionError
        );
        assert_eq!(
            parse_test_output("noise", 5).failure_type,
            FailureType::CollectionError
        );
    }

    #[test]
    fn test_all_passed() {
        let output = "\
test_calculator.py::test_add PASSED
test_calculator.py::test_multiply PASSED
2 passed in 0.01s
";
        let results = parse_test_output(output, 0);
        assert!(results.all_passed());
        assert_eq!(results.failure_type, FailureType::None);
        assert_eq!(results.passing.len(), 2);
        assert!(results.error_snippet.is_none());
    }

    #[test]
    fn test_nonzero_exit_without_ids_records_generic_failure() {
        let results = parse_test_output("", 1);
        assert!(results.any_failed());
        assert!(!results.all_passed());
    }

    #[test]
    fn test_not_run_sentinel() {
        let results = TestResults::not_run();
        assert!(!results.was_run);
        assert!(!results.all_passed());
        assert_eq!(results.summary(), "Tests not run");
    }

    #[test]
    fn test_summary_includes_failure_type() {
        let output = "test_x.py::test_a FAILED\nE   TypeError: bad operand";
        let results = parse_test_output(output, 1);
        assert!(results.summary().contains("TYPE_ERROR"));
    }

    #[test]
    fn test_execution_result_error_summary_caps_lines() {
        let long_error = (0..40)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let exec = ExecutionResult {
            task: "t".into(),
            tool_results: vec![ToolResult::error("run_tests", long_error)],
            test_results: TestResults::not_run(),
            modified_files: vec![],
        };
        let summary = exec.error_summary();
        assert!(summary.lines().count() <= 16);
        assert!(summary.contains("more lines omitted"));
    }

    #[test]
    fn test_execution_result_has_errors() {
        let ok = ExecutionResult {
            task: "t".into(),
            tool_results: vec![ToolResult::ok("read_file", "x".into(), None)],
            test_results: TestResults::not_run(),
            modified_files: vec![],
        };
        assert!(!ok.has_errors());
        let bad = ExecutionResult::step_error("boom");
        assert!(bad.has_errors());
        assert!(bad.tool_errors().contains("boom"));
    }

    #[test]
    fn test_failure_type_serde() {
        let json = serde_json::to_string(&FailureType::CollectionError).unwrap();
        assert_eq!(json, "\"COLLECTION_ERROR\"");
    }
}
