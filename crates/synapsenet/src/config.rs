//! Runtime configuration, populated from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// LLM endpoint configuration (OpenAI-compatible chat completions).
#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    /// Base URL, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    /// Model name sent in every request.
    pub model: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum retries for transient transport failures.
    pub max_retries: u32,
}

/// Top-level repair-engine configuration.
#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Directory under which all file IO is confined. Created if missing.
    pub workspace: PathBuf,
    /// Interpreter used to launch the test framework (`<interpreter> -m pytest`).
    pub interpreter: String,
    /// LLM transport settings.
    pub llm: LlmEndpoint,
    /// Control-plane bind address.
    pub bind: String,
    /// Control-plane port.
    pub port: u16,
    /// Project source extension (no dot) used by the failure analyzer and
    /// the snapshot predicate.
    pub source_ext: String,
    /// Directory prefixes whose source files are snapshot-managed.
    pub snapshot_prefixes: Vec<String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            workspace: std::env::var("SYNAPSENET_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./workspace")),
            interpreter: std::env::var("SYNAPSENET_INTERPRETER")
                .unwrap_or_else(|_| "python3".into()),
            llm: LlmEndpoint {
                base_url: std::env::var("SYNAPSENET_LLM_URL")
                    .unwrap_or_else(|_| "http://localhost:11434/v1".into()),
                model: std::env::var("SYNAPSENET_LLM_MODEL")
                    .unwrap_or_else(|_| "llama3:8b".into()),
                api_key: std::env::var("SYNAPSENET_LLM_API_KEY")
                    .ok()
                    .filter(|k| !k.is_empty()),
                timeout: Duration::from_secs(
                    std::env::var("SYNAPSENET_LLM_TIMEOUT_SECS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(120),
                ),
                max_retries: std::env::var("SYNAPSENET_LLM_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3),
            },
            bind: std::env::var("SYNAPSENET_BIND").unwrap_or_else(|_| "127.0.0.1".into()),
            port: std::env::var("SYNAPSENET_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8090),
            source_ext: std::env::var("SYNAPSENET_SOURCE_EXT").unwrap_or_else(|_| "py".into()),
            snapshot_prefixes: std::env::var("SYNAPSENET_SNAPSHOT_PREFIXES")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
                .unwrap_or_else(|| vec!["src/".into()]),
        }
    }
}

impl RepairConfig {
    /// Configuration from the environment.
    pub fn from_env() -> Self {
        Self::default()
    }
}
