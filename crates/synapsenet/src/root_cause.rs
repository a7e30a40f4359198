//! Structured root-cause diagnosis produced by the analysis phase.
//!
//! The raw model output is parsed into [`RootCauseAnalysis`] and validated
//! deterministically against the shared state — no numeric confidence is
//! involved. Parse failures produce an invalid sentinel rather than an
//! error: a bad diagnosis is a recoverable reasoning problem, never fatal.
//!
//! Validation rules:
//! 1. `root_cause_summary`, `causal_explanation`, `minimal_fix_strategy`,
//!    and `artifact_path` must be non-empty (hard).
//! 2. `artifact_line`, when both it and the analyzer-identified line are
//!    known, must fall within a dynamically computed tolerance (hard).
//! 3. `proposed_search_block`, when present, must approximately appear in
//!    the cached file content after whitespace normalization (hard).
//! 4. Artifact-path mismatch against the analyzer heuristic is a soft
//!    check: logged by the caller, never rejecting. The analyzer picks the
//!    frame where the failure manifests, which is not necessarily the root
//!    cause file.

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::info;

use crate::state::TRUNCATION_MARKER_PREFIX;

/// JSON wire shape of the analysis the model emits.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisWire {
    #[serde(default)]
    artifact_path: Option<String>,
    #[serde(default)]
    artifact_line: Option<u32>,
    #[serde(default)]
    root_cause_summary: Option<String>,
    #[serde(default)]
    causal_explanation: Option<String>,
    #[serde(default)]
    minimal_fix_strategy: Option<String>,
    #[serde(default)]
    why_previous_attempts_failed: Option<String>,
    #[serde(default)]
    proposed_search_block: Option<String>,
}

/// Validated diagnosis of one failure.
#[derive(Debug, Clone)]
pub struct RootCauseAnalysis {
    pub artifact_path: Option<String>,
    pub artifact_line: Option<u32>,
    pub root_cause_summary: Option<String>,
    pub causal_explanation: Option<String>,
    pub minimal_fix_strategy: Option<String>,
    pub why_previous_attempts_failed: Option<String>,
    /// The exact search block the model intends to use when patching.
    /// Optional — when absent, the feasibility check is skipped.
    pub proposed_search_block: Option<String>,
    valid: bool,
    invalid_reason: Option<String>,
}

impl RootCauseAnalysis {
    /// Parse the raw model text and run deterministic validation.
    ///
    /// `cached_content` is the concatenated content of all cached file
    /// reads, used for the search-block feasibility check.
    pub fn parse(
        raw: &str,
        known_artifact: Option<&str>,
        known_line: Option<u32>,
        cached_content: Option<&str>,
    ) -> Self {
        let stripped = strip_fences(raw);
        let json = match extract_json_object(stripped) {
            Some(json) => json,
            None => return Self::invalid("analysis response contained no JSON object"),
        };
        let wire: AnalysisWire = match serde_json::from_str(json) {
            Ok(wire) => wire,
            Err(e) => return Self::invalid(&format!("analysis JSON failed to parse: {e}")),
        };

        let reason = validate(&wire, known_line, cached_content);

        // Soft path check — log only.
        if let (Some(proposed), Some(known)) = (wire.artifact_path.as_deref(), known_artifact) {
            if normalize_path_loose(proposed) != normalize_path_loose(known) {
                info!(
                    proposed = %proposed,
                    known = %known,
                    "Analysis names a different artifact than the analyzer heuristic"
                );
            }
        }

        Self {
            artifact_path: wire.artifact_path,
            artifact_line: wire.artifact_line,
            root_cause_summary: wire.root_cause_summary,
            causal_explanation: wire.causal_explanation,
            minimal_fix_strategy: wire.minimal_fix_strategy,
            why_previous_attempts_failed: wire.why_previous_attempts_failed,
            proposed_search_block: wire.proposed_search_block,
            valid: reason.is_none(),
            invalid_reason: reason,
        }
    }

    /// Sentinel for output that could not be parsed at all.
    pub fn invalid(reason: &str) -> Self {
        Self {
            artifact_path: None,
            artifact_line: None,
            root_cause_summary: None,
            causal_explanation: None,
            minimal_fix_strategy: None,
            why_previous_attempts_failed: None,
            proposed_search_block: None,
            valid: false,
            invalid_reason: Some(reason.to_string()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalid_reason(&self) -> Option<&str> {
        self.invalid_reason.as_deref()
    }

    /// Render for injection into the patching prompt. Only meaningful when
    /// the analysis is valid.
    pub fn to_patch_prompt_block(&self) -> String {
        let mut out = String::from("=== ROOT CAUSE ANALYSIS ===\n");
        out.push_str(&format!(
            "Artifact    : {}",
            self.artifact_path.as_deref().unwrap_or("?")
        ));
        if let Some(line) = self.artifact_line {
            out.push_str(&format!(" (line {line})"));
        }
        out.push('\n');
        out.push_str(&format!(
            "Root cause  : {}\n",
            self.root_cause_summary.as_deref().unwrap_or("")
        ));
        out.push_str(&format!(
            "Explanation : {}\n",
            self.causal_explanation.as_deref().unwrap_or("")
        ));
        out.push_str(&format!(
            "Fix strategy: {}\n",
            self.minimal_fix_strategy.as_deref().unwrap_or("")
        ));
        if self.proposed_search_block.is_some() {
            out.push_str("Search block: use the block you identified in analysis as starting point.\n");
        }
        out.push_str("=== END ROOT CAUSE ANALYSIS ===");
        out
    }

    /// Render for replan-prompt history, annotated as a failed diagnosis.
    pub fn to_replan_prompt_block(&self, patch_outcome: &str) -> String {
        let mut out = format!("Previous root cause analysis (outcome: {patch_outcome}):\n");
        out.push_str(&format!(
            "  Artifact   : {}",
            self.artifact_path.as_deref().unwrap_or("?")
        ));
        if let Some(line) = self.artifact_line {
            out.push_str(&format!(" (line {line})"));
        }
        out.push('\n');
        out.push_str(&format!(
            "  Root cause : {}\n",
            self.root_cause_summary.as_deref().unwrap_or("")
        ));
        out.push_str(&format!(
            "  Fix tried  : {}\n",
            self.minimal_fix_strategy.as_deref().unwrap_or("")
        ));
        out.push_str("This analysis led to a failed patch. Re-evaluate assumptions.\n");
        out
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(
    wire: &AnalysisWire,
    known_line: Option<u32>,
    cached_content: Option<&str>,
) -> Option<String> {
    if is_blank(&wire.root_cause_summary) {
        return Some("rootCauseSummary is missing or empty".into());
    }
    if is_blank(&wire.causal_explanation) {
        return Some("causalExplanation is missing or empty".into());
    }
    if is_blank(&wire.minimal_fix_strategy) {
        return Some("minimalFixStrategy is missing or empty".into());
    }
    if is_blank(&wire.artifact_path) {
        return Some("artifactPath is missing or empty".into());
    }

    // Line tolerance — hard fail only when both lines are known.
    //
    // The effective file length is the max of three sources: the cached
    // window's line count (often a truncated 500-line slice), 4x the known
    // line, and 4x the reported line. Tolerance is 20% of that, floored at
    // 75 lines, so a small cached window cannot collapse the band and
    // reject a valid diagnosis.
    if let (Some(known), Some(reported)) = (known_line, wire.artifact_line) {
        if known > 0 && reported > 0 {
            let cached_lines = cached_content
                .map(|c| c.split('\n').count() as u32)
                .unwrap_or(0);
            let effective = cached_lines.max(known * 4).max(reported * 4);
            let tolerance = 75.max(effective / 5);
            let delta = known.abs_diff(reported);
            info!(
                known_line = known,
                proposed_line = reported,
                delta,
                tolerance,
                "Analysis line tolerance check"
            );
            if delta > tolerance {
                return Some(format!(
                    "artifactLine {reported} is {delta} lines from known failure line {known} \
                     (tolerance={tolerance}, effectiveFileLength={effective})"
                ));
            }
        }
    }

    // Search-block feasibility — hard fail only when both sides present.
    if let (Some(block), Some(content)) = (wire.proposed_search_block.as_deref(), cached_content) {
        if !block.trim().is_empty()
            && !content.trim().is_empty()
            && !search_block_exists(block, content)
        {
            return Some(
                "proposedSearchBlock does not approximately match any content in cached files. \
                 Copy the search block from the file excerpt shown, not from memory."
                    .into(),
            );
        }
    }

    None
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

fn normalize_path_loose(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches("./")
        .trim()
        .to_string()
}

// ---------------------------------------------------------------------------
// Normalized search-block feasibility
// ---------------------------------------------------------------------------

/// Whether `search_block` approximately exists in `content`.
///
/// Naive `contains` would reject valid blocks: windowed injection alters
/// leading whitespace, and models drop trailing spaces or change line
/// endings. Both sides are normalized first; blocks under 10 normalized
/// chars are waved through (too short to validate meaningfully).
pub fn search_block_exists(search_block: &str, content: &str) -> bool {
    let norm_block = normalize_for_search(search_block);
    if norm_block.len() < 10 {
        return true;
    }
    normalize_for_search(content).contains(&norm_block)
}

static LINE_NUMBER_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\s*\|\s?").expect("static pattern"));
static MARKER_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*>>\s?").expect("static pattern"));
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static pattern"));

/// Normalize text for approximate comparison: unify line endings, strip
/// window line-number and `>>` prefixes, drop truncation-marker lines,
/// trim each line, collapse internal whitespace, drop blanks. Idempotent.
pub fn normalize_for_search(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::new();
    for line in unified.split('\n') {
        // Strip window prefixes to a fixed point; `>> 13 | code` carries both.
        let mut stripped = line.to_string();
        loop {
            let next = MARKER_PREFIX
                .replace(&LINE_NUMBER_PREFIX.replace(&stripped, ""), "")
                .into_owned();
            if next == stripped {
                break;
            }
            stripped = next;
        }
        if stripped.trim_start().starts_with(TRUNCATION_MARKER_PREFIX) {
            continue;
        }
        let collapsed = WHITESPACE_RUN.replace_all(stripped.trim(), " ");
        if !collapsed.is_empty() {
            out.push_str(&collapsed);
            out.push('\n');
        }
    }
    out.trim().to_string()
}

// ---------------------------------------------------------------------------
// Fence / JSON extraction
// ---------------------------------------------------------------------------

/// Drop Markdown code-fence lines around the payload.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // Skip an optional language tag on the fence line
        let rest = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        };
        return rest.trim_end_matches('`').trim();
    }
    trimmed
}

/// Slice from the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_JSON: &str = r#"{
        "artifactPath": "src/calculator.py",
        "artifactLine": 2,
        "rootCauseSummary": "multiply divides instead of multiplying",
        "causalExplanation": "the operator on line 2 is / rather than *",
        "minimalFixStrategy": "replace a / b with a * b",
        "proposedSearchBlock": "    return a / b"
    }"#;

    const FILE_CONTENT: &str = "def multiply(a, b):\n    return a / b\n";

    #[test]
    fn test_valid_analysis() {
        let rca = RootCauseAnalysis::parse(
            VALID_JSON,
            Some("src/calculator.py"),
            Some(2),
            Some(FILE_CONTENT),
        );
        assert!(rca.is_valid(), "reason: {:?}", rca.invalid_reason());
        assert_eq!(rca.artifact_line, Some(2));
    }

    #[test]
    fn test_fenced_analysis_accepted() {
        let raw = format!("```json\n{VALID_JSON}\n```");
        let rca = RootCauseAnalysis::parse(&raw, None, None, Some(FILE_CONTENT));
        assert!(rca.is_valid());
    }

    #[test]
    fn test_prose_preamble_accepted() {
        let raw = format!("Here is my diagnosis:\n{VALID_JSON}\nDone.");
        let rca = RootCauseAnalysis::parse(&raw, None, None, Some(FILE_CONTENT));
        assert!(rca.is_valid());
    }

    #[test]
    fn test_missing_summary_rejected() {
        let raw = r#"{"artifactPath": "src/a.py", "causalExplanation": "x",
                      "minimalFixStrategy": "y"}"#;
        let rca = RootCauseAnalysis::parse(raw, None, None, None);
        assert!(!rca.is_valid());
        assert!(rca.invalid_reason().unwrap().contains("rootCauseSummary"));
    }

    #[test]
    fn test_garbage_is_invalid_sentinel() {
        let rca = RootCauseAnalysis::parse("not json at all", None, None, None);
        assert!(!rca.is_valid());
        assert!(rca.invalid_reason().unwrap().contains("no JSON object"));
    }

    #[test]
    fn test_line_within_tolerance_accepted() {
        let rca = RootCauseAnalysis::parse(VALID_JSON, None, Some(60), Some(FILE_CONTENT));
        // delta 58 within the floor of 75
        assert!(rca.is_valid(), "reason: {:?}", rca.invalid_reason());
    }

    #[test]
    fn test_line_far_out_of_tolerance_rejected() {
        let raw = VALID_JSON.replace("\"artifactLine\": 2", "\"artifactLine\": 4000");
        let rca = RootCauseAnalysis::parse(&raw, None, Some(2), Some(FILE_CONTENT));
        assert!(!rca.is_valid());
        assert!(rca.invalid_reason().unwrap().contains("tolerance"));
    }

    #[test]
    fn test_tolerance_scales_with_reported_line() {
        // reported 500, known 420: effective = 2000, tolerance = 400 ≥ delta 80
        let raw = VALID_JSON.replace("\"artifactLine\": 2", "\"artifactLine\": 500");
        let rca = RootCauseAnalysis::parse(&raw, None, Some(420), Some(FILE_CONTENT));
        assert!(rca.is_valid(), "reason: {:?}", rca.invalid_reason());
    }

    #[test]
    fn test_hallucinated_search_block_rejected() {
        let raw = VALID_JSON.replace(
            "    return a / b",
            "    return completely_invented_code(a, b)",
        );
        let rca = RootCauseAnalysis::parse(&raw, None, None, Some(FILE_CONTENT));
        assert!(!rca.is_valid());
        assert!(rca
            .invalid_reason()
            .unwrap()
            .contains("proposedSearchBlock"));
    }

    #[test]
    fn test_path_mismatch_is_soft() {
        let rca = RootCauseAnalysis::parse(
            VALID_JSON,
            Some("src/other_module.py"),
            Some(2),
            Some(FILE_CONTENT),
        );
        assert!(rca.is_valid());
    }

    #[test]
    fn test_search_block_survives_window_prefixes() {
        let windowed = "    1 | def multiply(a, b):\n    2 |     return a / b\n";
        assert!(search_block_exists("    return a / b", windowed));
    }

    #[test]
    fn test_search_block_survives_truncation_marker() {
        let content = format!(
            "def f():\n    pass\n{TRUNCATION_MARKER_PREFIX}400 lines omitted >>>\ndef g():\n    return 1\n"
        );
        assert!(search_block_exists("def g():\n    return 1", &content));
    }

    #[test]
    fn test_short_blocks_pass_through() {
        assert!(search_block_exists("x", "anything at all"));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let input = "   12 |  def f( a,   b ):\n   >> 13 |     return a+b\n\n";
        let once = normalize_for_search(input);
        let twice = normalize_for_search(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_deletes_truncation_marker() {
        let input = format!("line one\n{TRUNCATION_MARKER_PREFIX}3 lines omitted >>>\nline two");
        let norm = normalize_for_search(&input);
        assert_eq!(norm, "line one\nline two");
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_extract_json_object() {
        assert_eq!(extract_json_object("noise {\"a\": 1} tail"), Some("{\"a\": 1}"));
        assert_eq!(extract_json_object("no braces"), None);
    }
}
