//! Bounded history of failed repair cycles.
//!
//! One [`RepairAttempt`] is captured at the moment a REPLAN fires from an
//! analysis, patching, or validation phase — before the soft reset clears
//! the per-cycle state it summarizes. Reproduce-phase replans carry no
//! repair signal and are never recorded.
//!
//! Attempts render as plain text for planner prompt injection; structured
//! JSON nested inside a prompt confuses weak local models.

use std::fmt;

/// How the repair cycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Analysis JSON was malformed or failed structural validation.
    AnalysisInvalid,
    /// Retry cap hit before a valid analysis was produced.
    AnalysisCapExceeded,
    /// replace_in_file search block matched nothing in the file.
    SearchFailed,
    /// replace_in_file search block matched multiple locations.
    SearchAmbiguous,
    /// Patch applied but tests still failed in validation.
    ValidateFailed,
    /// Patch introduced a syntax error detected in validation.
    SyntaxError,
    /// Retry cap exhausted without any patch being applied.
    NoPatch,
}

impl fmt::Display for RepairOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AnalysisInvalid => "ANALYSIS_INVALID",
            Self::AnalysisCapExceeded => "ANALYSIS_CAP_EXCEEDED",
            Self::SearchFailed => "SEARCH_FAILED",
            Self::SearchAmbiguous => "SEARCH_AMBIGUOUS",
            Self::ValidateFailed => "VALIDATE_FAILED",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::NoPatch => "NO_PATCH",
        };
        write!(f, "{s}")
    }
}

/// Immutable record of one failed repair cycle.
#[derive(Debug, Clone)]
pub struct RepairAttempt {
    pub attempt_number: u32,
    pub outcome: RepairOutcome,
    /// Short description of what was patched, e.g. "replace_in_file on rewrite.py".
    pub patch_summary: Option<String>,
    /// The exact search block the model used; None if no patch was attempted.
    pub search_block_used: Option<String>,
    /// What the model diagnosed.
    pub root_cause_summary: Option<String>,
    /// What fix the model planned.
    pub minimal_fix_strategy: Option<String>,
    /// Failure subtype from the subsequent test run.
    pub validation_failure_subtype: Option<String>,
    /// Line number of the new failure after the patch.
    pub validation_failure_line: Option<u32>,
    /// Raw failure reason from the analyzer.
    pub validation_failure_reason: Option<String>,
}

impl RepairAttempt {
    pub fn new(attempt_number: u32, outcome: RepairOutcome) -> Self {
        Self {
            attempt_number,
            outcome,
            patch_summary: None,
            search_block_used: None,
            root_cause_summary: None,
            minimal_fix_strategy: None,
            validation_failure_subtype: None,
            validation_failure_line: None,
            validation_failure_reason: None,
        }
    }

    pub fn with_patch_summary(mut self, value: impl Into<String>) -> Self {
        self.patch_summary = Some(value.into());
        self
    }

    pub fn with_search_block(mut self, value: impl Into<String>) -> Self {
        self.search_block_used = Some(value.into());
        self
    }

    pub fn with_diagnosis(
        mut self,
        summary: Option<String>,
        fix_strategy: Option<String>,
    ) -> Self {
        self.root_cause_summary = summary;
        self.minimal_fix_strategy = fix_strategy;
        self
    }

    pub fn with_validation_failure(
        mut self,
        subtype: Option<String>,
        line: Option<u32>,
        reason: Option<String>,
    ) -> Self {
        self.validation_failure_subtype = subtype;
        self.validation_failure_line = line;
        self.validation_failure_reason = reason;
        self
    }

    /// Plain-text block for replan prompt injection.
    pub fn to_prompt_section(&self) -> String {
        let mut out = format!("Attempt #{}\n", self.attempt_number);
        out.push_str(&format!("  Outcome     : {}\n", self.outcome));

        if let Some(diagnosis) = self.root_cause_summary.as_deref().filter(|s| !s.is_empty()) {
            out.push_str(&format!("  Diagnosis   : {diagnosis}\n"));
        }
        if let Some(fix) = self.minimal_fix_strategy.as_deref().filter(|s| !s.is_empty()) {
            out.push_str(&format!("  Fix planned : {fix}\n"));
        }
        if let Some(patch) = self.patch_summary.as_deref().filter(|s| !s.is_empty()) {
            out.push_str(&format!("  Patch       : {patch}\n"));
        }

        match self.outcome {
            RepairOutcome::AnalysisInvalid => {
                out.push_str("  Failure     : Analysis JSON failed structural validation.\n");
                out.push_str("  Hint        : Produce all required fields with the exact artifact path.\n");
            }
            RepairOutcome::AnalysisCapExceeded => {
                out.push_str("  Failure     : Retry cap hit before a valid analysis was produced.\n");
                out.push_str("  Hint        : Consider a different diagnostic approach.\n");
            }
            RepairOutcome::SearchFailed => {
                out.push_str("  Failure     : Search block did not match any text in the file.\n");
                out.push_str("  Hint        : Copy search_block EXACTLY from the file window.\n");
                out.push_str("                No line-number prefixes. No '>>' marker.\n");
                if let Some(block) = self.search_block_used.as_deref().filter(|s| !s.is_empty()) {
                    out.push_str("  Bad block   : |\n");
                    for line in first_n_lines(block, 3).split('\n') {
                        out.push_str(&format!("                {line}\n"));
                    }
                }
            }
            RepairOutcome::SearchAmbiguous => {
                out.push_str("  Failure     : Search block matched multiple locations.\n");
                out.push_str(
                    "  Hint        : Include at least 5 lines of unique surrounding context.\n",
                );
            }
            RepairOutcome::ValidateFailed => {
                out.push_str("  Failure     : Patch applied but tests still fail.\n");
                if let Some(subtype) = &self.validation_failure_subtype {
                    out.push_str(&format!("  New subtype : {subtype}\n"));
                }
                if let Some(line) = self.validation_failure_line {
                    out.push_str(&format!("  New line    : {line}\n"));
                }
                if let Some(reason) = self
                    .validation_failure_reason
                    .as_deref()
                    .filter(|s| !s.is_empty())
                {
                    out.push_str(&format!("  Reason      : {reason}\n"));
                }
                out.push_str("  Hint        : The diagnosis or fix strategy needs revisiting.\n");
            }
            RepairOutcome::SyntaxError => {
                out.push_str("  Failure     : Patch introduced a syntax error.\n");
                if let Some(line) = self.validation_failure_line {
                    out.push_str(&format!("  Syntax line : {line}\n"));
                }
                out.push_str("  Hint        : replace_block had invalid source. Check indentation.\n");
            }
            RepairOutcome::NoPatch => {
                out.push_str("  Failure     : No patch was applied (retry cap exhausted).\n");
                out.push_str("  Hint        : Try a simpler, more targeted fix.\n");
            }
        }

        out
    }
}

fn first_n_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut out = lines[..n.min(lines.len())].join("\n");
    if lines.len() > n {
        out.push_str(&format!("\n  [+{} more lines]", lines.len() - n));
    }
    out
}
