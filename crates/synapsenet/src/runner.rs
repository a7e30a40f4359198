//! Test-runner process execution.
//!
//! stdout and stderr are merged at the OS level — both streams share one
//! pipe — so the runner's chronological output order survives intact. The
//! failure analyzer's patterns depend on that ordering: with separate
//! streams concatenated after the fact, a traceback's `File "..."` line
//! can drift away from the error line it belongs to.

use std::process::Stdio;
use std::time::Duration;

use tracing::{info, warn};

/// Timeout for full test-suite runs.
const SUITE_TIMEOUT_SECS: u64 = 60;

/// Merged output of one spawned process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code; −1 for timeout, −2 for spawn/wait failure.
    pub exit_code: i32,
    /// Chronologically merged stdout + stderr.
    pub output: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Spawns the configured test framework inside the workspace.
pub struct TestRunner {
    workspace_root: std::path::PathBuf,
    interpreter: String,
}

impl TestRunner {
    pub fn new(workspace_root: &std::path::Path, interpreter: &str) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            interpreter: interpreter.to_string(),
        }
    }

    /// Run the test suite with auto-discovery on the workspace root.
    pub async fn run_tests(&self) -> ProcessOutput {
        self.execute(
            &[
                "-m",
                "pytest",
                ".",
                "-v",
                "--tb=long",
                "--disable-warnings",
                "--maxfail=1",
            ],
            Duration::from_secs(SUITE_TIMEOUT_SECS),
        )
        .await
    }

    async fn execute(&self, args: &[&str], timeout: Duration) -> ProcessOutput {
        info!(
            interpreter = %self.interpreter,
            args = ?args,
            "Executing test runner"
        );

        let (reader, writer) = match std::io::pipe() {
            Ok(pair) => pair,
            Err(e) => {
                return ProcessOutput {
                    exit_code: -2,
                    output: format!("Process execution failed: {e}"),
                }
            }
        };
        let writer_err = match writer.try_clone() {
            Ok(w) => w,
            Err(e) => {
                return ProcessOutput {
                    exit_code: -2,
                    output: format!("Process execution failed: {e}"),
                }
            }
        };

        // The Command owns the pipe writers; dropping it after spawn closes
        // the parent's copies so the reader sees EOF when the child exits.
        let spawned = {
            let mut cmd = tokio::process::Command::new(&self.interpreter);
            cmd.args(args)
                .current_dir(&self.workspace_root)
                .stdin(Stdio::null())
                .stdout(Stdio::from(writer))
                .stderr(Stdio::from(writer_err));
            cmd.spawn()
        };

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return ProcessOutput {
                    exit_code: -2,
                    output: format!("Failed to spawn test runner: {e}"),
                }
            }
        };

        let read_task = tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut reader = reader;
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        });

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let output = read_task.await.unwrap_or_default();
                let exit_code = status.code().unwrap_or(-1);
                info!(exit_code, output_len = output.len(), "Test runner finished");
                ProcessOutput { exit_code, output }
            }
            Ok(Err(e)) => {
                let _ = read_task.await;
                ProcessOutput {
                    exit_code: -2,
                    output: format!("Process wait failed: {e}"),
                }
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Test runner timed out");
                let _ = child.start_kill();
                let _ = child.wait().await;
                let mut output = read_task.await.unwrap_or_default();
                output.push_str(&format!("\nTIMEOUT after {} seconds", timeout.as_secs()));
                ProcessOutput {
                    exit_code: -1,
                    output,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner_with_script(dir: &std::path::Path, script: &str) -> TestRunner {
        let path = dir.join("fake_runner.sh");
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        TestRunner::new(dir, path.to_str().unwrap())
    }

    #[tokio::test]
    async fn test_merged_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with_script(
            dir.path(),
            "#!/bin/sh\necho out-line\necho err-line 1>&2\nexit 1\n",
        );
        let result = runner.run_tests().await;
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("out-line"));
        assert!(result.output.contains("err-line"));
    }

    #[tokio::test]
    async fn test_zero_exit_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with_script(dir.path(), "#!/bin/sh\necho 1 passed\nexit 0\n");
        let result = runner.run_tests().await;
        assert!(result.success());
        assert!(result.output.contains("1 passed"));
    }

    #[tokio::test]
    async fn test_missing_interpreter_reports_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(dir.path(), "/nonexistent/interpreter");
        let result = runner.run_tests().await;
        assert_eq!(result.exit_code, -2);
        assert!(result.output.contains("Failed to spawn"));
    }
}
