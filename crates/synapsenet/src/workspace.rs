//! Sandboxed workspace file system.
//!
//! Every path is resolved under the workspace root and normalized before
//! access; a resolved path escaping the root is an explicit error. Writes
//! are atomic (temp file + rename) so an interruption never leaves a
//! half-written source file behind.
//!
//! The snapshot/restore pair is a mini-VCS: a snapshot stores
//! path → content for files matching a predicate; restore writes each file
//! back and deletes any currently-matching path absent from the snapshot,
//! undoing repair-created files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
const MAX_SEARCH_RESULTS: usize = 100;
const MAX_TREE_DEPTH: usize = 10;

/// Workspace-level errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path cannot be empty")]
    EmptyPath,

    #[error("path traversal attempt detected: {0}")]
    Traversal(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("file too large: {path} ({size} bytes, max {max})")]
    TooLarge { path: String, size: u64, max: u64 },

    #[error("invalid search pattern: {0}")]
    BadPattern(String),

    #[error("restore failed: {0}")]
    Restore(String),
}

/// A single grep match.
#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub content: String,
}

impl std::fmt::Display for SearchMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.path, self.line, self.content)
    }
}

/// Predicate selecting which files a snapshot manages.
#[derive(Debug, Clone)]
pub struct SnapshotSpec {
    /// Source extension without the dot, e.g. `py`.
    pub source_ext: String,
    /// Directory prefixes under which source files are managed.
    pub prefixes: Vec<String>,
    /// Extra paths always captured (the failing artifact).
    pub extra_paths: Vec<String>,
}

impl SnapshotSpec {
    pub fn matches(&self, relative: &str) -> bool {
        let rel = relative.replace('\\', "/");
        if self.extra_paths.iter().any(|p| *p == rel) {
            return true;
        }
        rel.ends_with(&format!(".{}", self.source_ext))
            && self.prefixes.iter().any(|p| rel.starts_with(p.as_str()))
    }
}

/// Captured path → content state, restorable onto the workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceSnapshot {
    files: BTreeMap<String, String>,
    spec: SnapshotSpec,
}

impl WorkspaceSnapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.files.contains_key(relative)
    }
}

/// Sandboxed view of one directory tree.
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (creating if missing) the workspace rooted at `root`.
    pub fn new(root: &Path) -> Result<Self, WorkspaceError> {
        if !root.exists() {
            fs::create_dir_all(root)?;
            info!(root = %root.display(), "Created workspace");
        }
        let root = root.canonicalize()?;
        info!(root = %root.display(), "Workspace initialized");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path under the root, rejecting escapes.
    ///
    /// Resolution is lexical so that paths of not-yet-existing files (for
    /// writes) still validate.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        if relative.trim().is_empty() {
            return Err(WorkspaceError::EmptyPath);
        }
        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() || !resolved.starts_with(&self.root) {
                        return Err(WorkspaceError::Traversal(relative.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(WorkspaceError::Traversal(relative.to_string()));
                }
            }
        }
        if !resolved.starts_with(&self.root) {
            return Err(WorkspaceError::Traversal(relative.to_string()));
        }
        Ok(resolved)
    }

    // -----------------------------------------------------------------------
    // File operations
    // -----------------------------------------------------------------------

    pub fn read_file(&self, relative: &str) -> Result<String, WorkspaceError> {
        let target = self.resolve(relative)?;
        let size = fs::metadata(&target)?.len();
        if size > MAX_FILE_SIZE {
            return Err(WorkspaceError::TooLarge {
                path: relative.to_string(),
                size,
                max: MAX_FILE_SIZE,
            });
        }
        Ok(fs::read_to_string(&target)?)
    }

    /// Read a 1-indexed inclusive line range. `end = None` reads to EOF.
    pub fn read_lines(
        &self,
        relative: &str,
        start: usize,
        end: Option<usize>,
    ) -> Result<Vec<String>, WorkspaceError> {
        let content = self.read_file(relative)?;
        let lines: Vec<&str> = content.lines().collect();
        let start = start.saturating_sub(1).min(lines.len());
        let end = end.unwrap_or(lines.len()).min(lines.len());
        Ok(lines[start..end.max(start)]
            .iter()
            .map(|l| l.to_string())
            .collect())
    }

    /// Atomic write: temp file in the target directory, then rename.
    pub fn write_file(&self, relative: &str, content: &str) -> Result<(), WorkspaceError> {
        let target = self.resolve(relative)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        let tmp = target.with_file_name(format!(".{file_name}.tmp"));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub fn file_exists(&self, relative: &str) -> bool {
        self.resolve(relative).map(|p| p.exists()).unwrap_or(false)
    }

    /// Regex search, returning `path:line: content` matches capped at 100.
    pub fn grep(&self, pattern: &str, relative: &str) -> Result<Vec<SearchMatch>, WorkspaceError> {
        let target = self.resolve(relative)?;
        let regex =
            regex::Regex::new(pattern).map_err(|e| WorkspaceError::BadPattern(e.to_string()))?;

        let mut results = Vec::new();
        if target.is_dir() {
            for file in self.walk(&target, MAX_TREE_DEPTH)? {
                self.search_in_file(&file, &regex, &mut results);
                if results.len() >= MAX_SEARCH_RESULTS {
                    break;
                }
            }
        } else {
            self.search_in_file(&target, &regex, &mut results);
        }
        results.truncate(MAX_SEARCH_RESULTS);
        Ok(results)
    }

    pub fn list_files(&self, relative: &str) -> Result<Vec<String>, WorkspaceError> {
        let target = self.resolve(relative)?;
        if !target.is_dir() {
            return Err(WorkspaceError::NotADirectory(relative.to_string()));
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&target)? {
            let entry = entry?;
            if is_ignored(&entry.path()) {
                continue;
            }
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
        entries.sort();
        Ok(entries)
    }

    /// Box-drawing directory tree, depth-capped.
    pub fn file_tree(&self, relative: &str, max_depth: usize) -> Result<String, WorkspaceError> {
        let target = self.resolve(relative)?;
        if !target.is_dir() {
            return Err(WorkspaceError::NotADirectory(relative.to_string()));
        }
        let mut output = format!("{relative}/\n");
        self.build_tree(&target, "", max_depth.min(MAX_TREE_DEPTH), &mut output)?;
        Ok(output)
    }

    // -----------------------------------------------------------------------
    // Snapshot / restore
    // -----------------------------------------------------------------------

    pub fn snapshot(&self, spec: &SnapshotSpec) -> Result<WorkspaceSnapshot, WorkspaceError> {
        let mut files = BTreeMap::new();
        for absolute in self.walk(&self.root, MAX_TREE_DEPTH)? {
            let relative = self.relative_name(&absolute);
            if !spec.matches(&relative) {
                continue;
            }
            let size = fs::metadata(&absolute)?.len();
            if size > MAX_FILE_SIZE {
                return Err(WorkspaceError::TooLarge {
                    path: relative,
                    size,
                    max: MAX_FILE_SIZE,
                });
            }
            files.insert(relative, fs::read_to_string(&absolute)?);
        }
        info!(files = files.len(), "Snapshot taken");
        Ok(WorkspaceSnapshot {
            files,
            spec: spec.clone(),
        })
    }

    /// Write every captured file back; delete currently-matching files not
    /// in the snapshot. Idempotent: restoring twice yields the same tree.
    pub fn restore(&self, snapshot: &WorkspaceSnapshot) -> Result<(), WorkspaceError> {
        let current: Vec<String> = self
            .walk(&self.root, MAX_TREE_DEPTH)
            .map_err(|e| WorkspaceError::Restore(format!("could not enumerate workspace: {e}")))?
            .iter()
            .map(|p| self.relative_name(p))
            .filter(|rel| snapshot.spec.matches(rel))
            .collect();

        for (relative, content) in &snapshot.files {
            self.write_file(relative, content)
                .map_err(|e| WorkspaceError::Restore(format!("could not write {relative}: {e}")))?;
        }

        for relative in current {
            if !snapshot.files.contains_key(&relative) {
                let absolute = self
                    .resolve(&relative)
                    .map_err(|e| WorkspaceError::Restore(e.to_string()))?;
                fs::remove_file(&absolute).map_err(|e| {
                    WorkspaceError::Restore(format!("could not delete {relative}: {e}"))
                })?;
                info!(path = %relative, "Restore: deleted repair-created file");
            }
        }

        info!(files = snapshot.files.len(), "Workspace restored to snapshot");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn relative_name(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .unwrap_or(absolute)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn walk(&self, dir: &Path, depth: usize) -> Result<Vec<PathBuf>, WorkspaceError> {
        let mut files = Vec::new();
        if depth == 0 {
            return Ok(files);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if is_ignored(&path) {
                continue;
            }
            if path.is_dir() {
                files.extend(self.walk(&path, depth - 1)?);
            } else if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn search_in_file(&self, file: &Path, regex: &regex::Regex, out: &mut Vec<SearchMatch>) {
        let Ok(content) = fs::read_to_string(file) else {
            warn!(file = %file.display(), "Skipping unreadable file during search");
            return;
        };
        let relative = self.relative_name(file);
        for (idx, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                out.push(SearchMatch {
                    path: relative.clone(),
                    line: idx + 1,
                    content: line.to_string(),
                });
                if out.len() >= MAX_SEARCH_RESULTS {
                    return;
                }
            }
        }
    }

    fn build_tree(
        &self,
        dir: &Path,
        prefix: &str,
        depth: usize,
        output: &mut String,
    ) -> Result<(), WorkspaceError> {
        if depth == 0 {
            return Ok(());
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| !is_ignored(p))
            .collect();
        entries.sort();

        let count = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            let is_last = i == count - 1;
            let name = entry
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            output.push_str(prefix);
            output.push_str(if is_last { "└── " } else { "├── " });
            output.push_str(&name);
            if entry.is_dir() {
                output.push_str("/\n");
                let child_prefix = format!("{prefix}{}", if is_last { "    " } else { "│   " });
                self.build_tree(entry, &child_prefix, depth - 1, output)?;
            } else {
                output.push('\n');
            }
        }
        Ok(())
    }
}

fn is_ignored(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.starts_with('.')
        || name == "__pycache__"
        || name == "node_modules"
        || name == "target"
        || name.ends_with(".pyc")
}
