//! Failure analyzer — regex extraction over merged test-runner output.
//!
//! Extraction hierarchy, in order of precedence:
//!
//! 1. Deepest workspace stack frame, in either of two formats:
//!    a) standard traceback:  `File "/abs/path/src/foo.py", line N`
//!    b) runner short frame:  `src/foo.py:301:` (anchored at line start,
//!       known project directory prefixes only)
//!    Source frames are preferred over test frames; within a category the
//!    last match wins (deepest frame).
//! 2. `ERROR collecting path.py` header.
//! 3. `FAILED path.py::test_name` summary line.
//! 4. "no tests ran" / "no tests collected" markers.
//!
//! The standard-frame path capture excludes newlines explicitly so a
//! runner's `> source` marker line can never bleed into the captured path.

use regex::Regex;
use tracing::{info, warn};

/// Collection-failure subtype attached to the shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSubtype {
    ImportError,
    SyntaxError,
    NoTestsFound,
    Unknown,
}

impl std::fmt::Display for FailureSubtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ImportError => "IMPORT_ERROR",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::NoTestsFound => "NO_TESTS_FOUND",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Structured result of analyzing one failing run.
#[derive(Debug, Clone)]
pub struct FailureSignal {
    pub subtype: FailureSubtype,
    pub failing_artifact: Option<String>,
    pub failing_line: Option<u32>,
    pub reason: String,
}

impl FailureSignal {
    fn unknown() -> Self {
        Self {
            subtype: FailureSubtype::Unknown,
            failing_artifact: None,
            failing_line: None,
            reason: "Could not determine failure cause".into(),
        }
    }
}

struct FrameCandidate {
    path: String,
    is_source: bool,
    line: Option<u32>,
}

/// Regex extractor over merged runner output.
pub struct FailureAnalyzer {
    standard_frame: Regex,
    short_frame: Regex,
    error_collecting: Regex,
    failed_test: Regex,
    import_error: Regex,
    syntax_error: Regex,
}

impl FailureAnalyzer {
    /// Build the analyzer for one source extension (e.g. `py`).
    pub fn new(source_ext: &str) -> Self {
        let ext = regex::escape(source_ext);
        Self {
            standard_frame: Regex::new(&format!(
                r#"File "([^"\n\r]+\.{ext})",\s*line (\d+)"#
            ))
            .expect("static pattern"),
            short_frame: Regex::new(&format!(
                r"(?m)^[ \t]*((?:src|testing|tests)/[^\s:]+\.{ext}):(\d+):"
            ))
            .expect("static pattern"),
            error_collecting: Regex::new(&format!(r"(?m)ERROR collecting[ \t]+(\S+\.{ext})"))
                .expect("static pattern"),
            failed_test: Regex::new(&format!(r"(?m)^[ \t]*FAILED[ \t]+(\S+?\.{ext})::"))
                .expect("static pattern"),
            import_error: Regex::new(r"ImportError|ModuleNotFoundError").expect("static pattern"),
            syntax_error: Regex::new(r"SyntaxError|IndentationError").expect("static pattern"),
        }
    }

    /// Extract the failure signal from merged runner output.
    pub fn analyze(&self, output: &str) -> FailureSignal {
        info!(chars = output.len(), "Analyzing test runner output");

        if output.trim().is_empty() {
            warn!("Empty test runner output");
            return FailureSignal::unknown();
        }

        if let Some(frame) = self.best_frame(output) {
            let subtype = self.determine_subtype(output);
            info!(
                source = frame.is_source,
                line = frame.line,
                path = %frame.path,
                "Best stack frame selected"
            );
            return FailureSignal {
                subtype,
                reason: format!("Stack trace points to {}", frame.path),
                failing_artifact: Some(frame.path),
                failing_line: frame.line,
            };
        }

        if let Some(cap) = self.error_collecting.captures(output) {
            let path = cap[1].trim().to_string();
            info!(path = %path, "Artifact extracted from ERROR collecting header");
            return FailureSignal {
                subtype: self.determine_subtype(output),
                reason: format!("Collection error in {path}"),
                failing_artifact: Some(path),
                failing_line: None,
            };
        }

        if let Some(cap) = self.failed_test.captures(output) {
            let path = cap[1].to_string();
            info!(path = %path, "Artifact extracted from FAILED summary line");
            return FailureSignal {
                subtype: FailureSubtype::Unknown,
                reason: "Test file contains failing assertion".into(),
                failing_artifact: Some(path),
                failing_line: None,
            };
        }

        if output.contains("ERROR: not found")
            || output.contains("no tests ran")
            || output.contains("no tests collected")
        {
            return FailureSignal {
                subtype: FailureSubtype::NoTestsFound,
                failing_artifact: None,
                failing_line: None,
                reason: "No tests found or collected".into(),
            };
        }

        warn!("Could not extract artifact from output");
        FailureSignal::unknown()
    }

    /// Scan both frame formats; prefer source frames over test frames and
    /// take the last (deepest) match within each category.
    fn best_frame(&self, output: &str) -> Option<FrameCandidate> {
        let mut last_source: Option<FrameCandidate> = None;
        let mut last_test: Option<FrameCandidate> = None;

        for cap in self.standard_frame.captures_iter(output) {
            let full_path = &cap[1];
            if is_non_project_frame(full_path) {
                continue;
            }
            let Some(relative) = extract_relative_path(full_path) else {
                continue;
            };
            if !is_single_line_path(&relative) {
                continue;
            }
            let line = cap[2].parse::<u32>().ok();
            store_candidate(&mut last_source, &mut last_test, relative, line);
        }

        for cap in self.short_frame.captures_iter(output) {
            let relative = cap[1].trim().to_string();
            if is_non_project_frame(&relative) || !is_single_line_path(&relative) {
                continue;
            }
            let line = cap[2].parse::<u32>().ok();
            store_candidate(&mut last_source, &mut last_test, relative, line);
        }

        last_source.or(last_test)
    }

    fn determine_subtype(&self, output: &str) -> FailureSubtype {
        if self.import_error.is_match(output) {
            return FailureSubtype::ImportError;
        }
        if self.syntax_error.is_match(output) {
            return FailureSubtype::SyntaxError;
        }
        if output.contains("no tests ran") || output.contains("no tests collected") {
            return FailureSubtype::NoTestsFound;
        }
        FailureSubtype::Unknown
    }
}

fn store_candidate(
    last_source: &mut Option<FrameCandidate>,
    last_test: &mut Option<FrameCandidate>,
    relative: String,
    line: Option<u32>,
) {
    let is_test = relative.starts_with("testing/") || relative.starts_with("tests/");
    let candidate = FrameCandidate {
        path: relative,
        is_source: !is_test,
        line,
    };
    if candidate.is_source {
        *last_source = Some(candidate);
    } else {
        *last_test = Some(candidate);
    }
}

/// A valid artifact path is one line: no newlines, no `>` markers, no
/// internal spaces.
fn is_single_line_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\n')
        && !path.contains('\r')
        && !path.contains('>')
        && !path.contains(' ')
}

fn is_non_project_frame(path: &str) -> bool {
    path.contains("/venv/")
        || path.contains("site-packages")
        || path.contains("<frozen")
        || path.contains("/importlib/")
}

/// Convert an absolute path to workspace-relative using directory anchors.
fn extract_relative_path(absolute: &str) -> Option<String> {
    let normalized = absolute.replace('\\', "/");
    let normalized = normalized.trim();

    for anchor in ["/src/", "/testing/", "/tests/"] {
        if let Some(idx) = normalized.find(anchor) {
            return Some(normalized[idx + 1..].to_string());
        }
    }

    if normalized.starts_with("src/")
        || normalized.starts_with("testing/")
        || normalized.starts_with("tests/")
    {
        return Some(normalized.to_string());
    }

    let parts: Vec<&str> = normalized.split('/').collect();
    match parts.len() {
        0 => None,
        1 => Some(parts[0].to_string()),
        n => Some(format!("{}/{}", parts[n - 2], parts[n - 1])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> FailureAnalyzer {
        FailureAnalyzer::new("py")
    }

    #[test]
    fn test_standard_frame_extraction() {
        let output = r#"
Traceback (most recent call last):
  File "/home/user/project/src/calculator.py", line 12, in multiply
    return a / b
ZeroDivisionError: division by zero
"#;
        let signal = analyzer().analyze(output);
        assert_eq!(signal.failing_artifact.as_deref(), Some("src/calculator.py"));
        assert_eq!(signal.failing_line, Some(12));
    }

    #[test]
    fn test_source_frame_preferred_over_test_frame() {
        let output = r#"
  File "/ws/tests/test_calc.py", line 5, in test_multiply
    assert multiply(2, 3) == 6
  File "/ws/src/calc.py", line 2, in multiply
    return a / b
"#;
        let signal = analyzer().analyze(output);
        assert_eq!(signal.failing_artifact.as_deref(), Some("src/calc.py"));
        assert_eq!(signal.failing_line, Some(2));
    }

    #[test]
    fn test_last_source_frame_wins() {
        let output = r#"
  File "/ws/src/outer.py", line 10, in call
  File "/ws/src/inner.py", line 42, in compute
"#;
        let signal = analyzer().analyze(output);
        assert_eq!(signal.failing_artifact.as_deref(), Some("src/inner.py"));
        assert_eq!(signal.failing_line, Some(42));
    }

    #[test]
    fn test_short_frame_extraction() {
        let output = "\ndef multiply(a, b):\n>       return a / b\nsrc/calculator.py:2: ZeroDivisionError\n";
        let signal = analyzer().analyze(output);
        assert_eq!(signal.failing_artifact.as_deref(), Some("src/calculator.py"));
        assert_eq!(signal.failing_line, Some(2));
    }

    #[test]
    fn test_non_project_frames_excluded() {
        let output = r#"
  File "/usr/lib/python3/site-packages/pytest/main.py", line 100, in run
  File "/ws/venv/lib/runner.py", line 5, in go
"#;
        let signal = analyzer().analyze(output);
        assert!(signal.failing_artifact.is_none());
    }

    #[test]
    fn test_error_collecting_fallback() {
        let output = "ERROR collecting tests/test_app.py\nImportError: No module named 'missing'\n";
        let signal = analyzer().analyze(output);
        assert_eq!(signal.failing_artifact.as_deref(), Some("tests/test_app.py"));
        assert_eq!(signal.subtype, FailureSubtype::ImportError);
    }

    #[test]
    fn test_failed_summary_fallback() {
        let output = "FAILED tests/test_app.py::test_case - assert 1 == 2\n";
        let signal = analyzer().analyze(output);
        assert_eq!(signal.failing_artifact.as_deref(), Some("tests/test_app.py"));
        assert_eq!(signal.subtype, FailureSubtype::Unknown);
    }

    #[test]
    fn test_no_tests_collected() {
        let signal = analyzer().analyze("no tests collected in 0.01s\n");
        assert_eq!(signal.subtype, FailureSubtype::NoTestsFound);
        assert!(signal.failing_artifact.is_none());
    }

    #[test]
    fn test_syntax_subtype() {
        let output = "ERROR collecting src/app.py\n    def f(\nSyntaxError: invalid syntax\n";
        let signal = analyzer().analyze(output);
        assert_eq!(signal.subtype, FailureSubtype::SyntaxError);
    }

    #[test]
    fn test_empty_output_is_unknown() {
        let signal = analyzer().analyze("   \n  ");
        assert_eq!(signal.subtype, FailureSubtype::Unknown);
        assert!(signal.failing_artifact.is_none());
    }

    #[test]
    fn test_artifact_is_never_multiline() {
        // A marker line between the traceback frame and the path must not
        // bleed into the capture.
        let output = "  File \"/ws/src/a.py\", line 3, in f\n>   broken()\nE   ValueError\n";
        let signal = analyzer().analyze(output);
        let artifact = signal.failing_artifact.unwrap();
        assert!(!artifact.contains('\n'));
        assert!(!artifact.contains('>'));
        assert!(!artifact.contains(' '));
    }

    #[test]
    fn test_relative_path_anchors() {
        assert_eq!(
            extract_relative_path("/abs/ws/src/pkg/mod.py"),
            Some("src/pkg/mod.py".into())
        );
        assert_eq!(
            extract_relative_path("/abs/ws/testing/helper.py"),
            Some("testing/helper.py".into())
        );
        assert_eq!(
            extract_relative_path("src/app.py"),
            Some("src/app.py".into())
        );
        // No anchor: last two components
        assert_eq!(
            extract_relative_path("/somewhere/else/module.py"),
            Some("else/module.py".into())
        );
    }
}
