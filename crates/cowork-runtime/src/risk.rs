//! Risk classification of tool invocations.
//!
//! - Read-only tools are `low`.
//! - File-mutating tools are `medium`, or `high` when the target is a
//!   protected path or lies outside the session working directory.
//! - `Bash` is `high` when the command matches a destructive pattern, else `medium`.
//! - Anything unknown is `medium`.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use cowork_core::RiskLevel;
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde_json::Value;

use crate::errors::RuntimeError;

const READ_ONLY_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "LS",
    "NotebookRead",
    "TodoWrite",
    "WebSearch",
];

const WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

const PATH_KEYS: &[&str] = &["file_path", "notebook_path", "path"];

const DEFAULT_PROTECTED: &[&str] = &[
    "**/.env",
    "**/.env.*",
    "**/.git/**",
    "**/.ssh/**",
    "**/*.pem",
    "**/id_rsa*",
];

static DESTRUCTIVE_COMMANDS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\brm\s+(-[a-z]*r[a-z]*f|-[a-z]*f[a-z]*r|--recursive\s+--force|--force\s+--recursive)\b", "recursive force delete"),
        (r"(?i)(^|[;&|]\s*)sudo\s", "privilege escalation"),
        (r"(?i)\bgit\s+push\s+.*(--force|-f\b)", "force push"),
        (r"(?i)\bgit\s+reset\s+--hard\b", "hard reset"),
        (r"(?i)\bgit\s+clean\s+-[a-z]*f", "git clean"),
        (r"(?i)\bmkfs(\.|\s)", "filesystem format"),
        (r"(?i)\bdd\s+.*of=/dev/", "raw device write"),
        (r"(?i)>\s*/dev/[sh]d[a-z]", "raw device write"),
        (r"(?i)\bchmod\s+(-R\s+)?777\b", "world-writable permissions"),
        (r"(?i)\b(curl|wget)\b[^|]*\|\s*(ba|z)?sh\b", "pipe to shell"),
        (r":\(\)\s*\{\s*:\|\s*:\s*&\s*\}\s*;\s*:", "fork bomb"),
    ]
    .into_iter()
    .filter_map(|(pattern, reason)| Regex::new(pattern).ok().map(|re| (re, reason)))
    .collect()
});

/// Result of classifying one invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RiskAssessment {
    /// Level.
    pub level: RiskLevel,
    /// Why, when above `low`.
    pub reason: Option<String>,
    /// Offending path, if a path rule fired.
    pub blocked_path: Option<String>,
}

impl RiskAssessment {
    fn new(level: RiskLevel, reason: impl Into<String>) -> Self {
        Self {
            level,
            reason: Some(reason.into()),
            blocked_path: None,
        }
    }
}

/// Classifies tool invocations for one working directory.
pub struct RiskClassifier {
    cwd: PathBuf,
    protected: GlobSet,
}

impl RiskClassifier {
    /// Build a classifier rooted at `cwd` with extra protected globs.
    pub fn new(cwd: impl Into<PathBuf>, extra_protected: &[String]) -> Result<Self, RuntimeError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in DEFAULT_PROTECTED
            .iter()
            .copied()
            .chain(extra_protected.iter().map(String::as_str))
        {
            let glob = Glob::new(pattern).map_err(|e| {
                RuntimeError::Validation(format!("invalid protected path pattern {pattern}: {e}"))
            })?;
            let _ = builder.add(glob);
        }
        let protected = builder
            .build()
            .map_err(|e| RuntimeError::Validation(format!("invalid protected paths: {e}")))?;
        Ok(Self {
            cwd: cwd.into(),
            protected,
        })
    }

    /// Classify `tool_name` called with `input`.
    pub fn classify(&self, tool_name: &str, input: &Value) -> RiskAssessment {
        if READ_ONLY_TOOLS.contains(&tool_name) {
            return RiskAssessment {
                level: RiskLevel::Low,
                reason: None,
                blocked_path: None,
            };
        }
        if tool_name == "Bash" {
            let command = input.get("command").and_then(Value::as_str).unwrap_or("");
            return match DESTRUCTIVE_COMMANDS.iter().find(|(re, _)| re.is_match(command)) {
                Some((_, reason)) => RiskAssessment::new(RiskLevel::High, *reason),
                None => RiskAssessment::new(RiskLevel::Medium, "runs a shell command"),
            };
        }
        if WRITE_TOOLS.contains(&tool_name) {
            return self.classify_write(input);
        }
        RiskAssessment::new(RiskLevel::Medium, format!("uses {tool_name}"))
    }

    fn classify_write(&self, input: &Value) -> RiskAssessment {
        let Some(raw) = PATH_KEYS
            .iter()
            .find_map(|k| input.get(*k).and_then(Value::as_str))
        else {
            return RiskAssessment::new(RiskLevel::Medium, "modifies files");
        };

        let resolved = normalize(&self.cwd.join(raw));
        if self.protected.is_match(&resolved) {
            return RiskAssessment {
                level: RiskLevel::High,
                reason: Some("writes a protected path".into()),
                blocked_path: Some(raw.to_owned()),
            };
        }
        if !resolved.starts_with(normalize(&self.cwd)) {
            return RiskAssessment {
                level: RiskLevel::High,
                reason: Some("writes outside the working directory".into()),
                blocked_path: Some(raw.to_owned()),
            };
        }
        RiskAssessment::new(RiskLevel::Medium, "modifies files")
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                let _ = out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
