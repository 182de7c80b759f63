//! Per-session pre-commit readiness.
//!
//! Successful lint/test/build/typecheck commands set flags; source edits
//! invalidate them. Commit/push/merge gates query the flags. State is one
//! JSON file per session in the per-user temp directory, mode 0o600.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use marvel_core::fsio;
use marvel_core::hook::ReadinessCheck;

/// Source extensions whose edits invalidate lint/typecheck/test.
const SOURCE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "rs", "py", "go", "java", "rb",
];

static LINT_COMMANDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^(?:npm|pnpm|yarn|bun)\s+(?:run\s+)?lint\b").unwrap(),
        Regex::new(r"^(?:npx\s+)?eslint\b").unwrap(),
        Regex::new(r"^cargo\s+clippy\b").unwrap(),
        Regex::new(r"^ruff\s+check\b").unwrap(),
    ]
});

static TEST_COMMANDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^(?:npm|pnpm|yarn|bun)\s+(?:run\s+)?test\b").unwrap(),
        Regex::new(r"^(?:npx\s+)?(?:jest|vitest)\b").unwrap(),
        Regex::new(r"^pytest\b").unwrap(),
        Regex::new(r"^cargo\s+test\b").unwrap(),
        Regex::new(r"^go\s+test\b").unwrap(),
    ]
});

static BUILD_COMMANDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^(?:npm|pnpm|yarn|bun)\s+(?:run\s+)?build\b").unwrap(),
        Regex::new(r"^cargo\s+build\b").unwrap(),
        Regex::new(r"^go\s+build\b").unwrap(),
        Regex::new(r"^tsc\s+(?:-b|--build)\b").unwrap(),
    ]
});

static TYPECHECK_COMMANDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^(?:npm|pnpm|yarn|bun)\s+(?:run\s+)?typecheck\b").unwrap(),
        Regex::new(r"^(?:npx\s+)?tsc\b(?:\s+--noEmit\b)?").unwrap(),
        Regex::new(r"^mypy\b").unwrap(),
        Regex::new(r"^cargo\s+check\b").unwrap(),
    ]
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreCommitFlags {
    pub lint_passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lint_at: Option<DateTime<Utc>>,
    pub test_passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_at: Option<DateTime<Utc>>,
    pub build_passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_at: Option<DateTime<Utc>>,
    pub typecheck_passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typecheck_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub pre_commit: PreCommitFlags,
}

impl SessionState {
    pub fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            started_at: now,
            last_updated: now,
            pre_commit: PreCommitFlags::default(),
        }
    }

    /// Match a successful bash command against the verification sets.
    /// Returns true when any flag changed.
    pub fn record_command_success(&mut self, command: &str) -> bool {
        let normalized = marvel_core::command::normalize_command(command);
        let now = Utc::now();
        let mut changed = false;

        if LINT_COMMANDS.iter().any(|re| re.is_match(&normalized)) {
            self.pre_commit.lint_passed = true;
            self.pre_commit.lint_at = Some(now);
            changed = true;
        }
        if TEST_COMMANDS.iter().any(|re| re.is_match(&normalized)) {
            self.pre_commit.test_passed = true;
            self.pre_commit.test_at = Some(now);
            changed = true;
        }
        if BUILD_COMMANDS.iter().any(|re| re.is_match(&normalized)) {
            self.pre_commit.build_passed = true;
            self.pre_commit.build_at = Some(now);
            changed = true;
        }
        if TYPECHECK_COMMANDS.iter().any(|re| re.is_match(&normalized)) {
            self.pre_commit.typecheck_passed = true;
            self.pre_commit.typecheck_at = Some(now);
            changed = true;
        }

        if changed {
            self.last_updated = now;
        }
        changed
    }

    /// A successful edit of a source file invalidates lint, typecheck
    /// and test. Build is not automatically invalidated.
    pub fn invalidate_for_edit(&mut self, file_path: &str) -> bool {
        let is_source = file_path
            .rsplit('.')
            .next()
            .map(str::to_lowercase)
            .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext.as_str()));
        if !is_source {
            return false;
        }

        debug!(file = %file_path, "source edit invalidates verification flags");
        self.pre_commit.lint_passed = false;
        self.pre_commit.typecheck_passed = false;
        self.pre_commit.test_passed = false;
        self.last_updated = Utc::now();
        true
    }

    /// Commit readiness: lint and typecheck.
    pub fn check_pre_commit(&self) -> ReadinessCheck {
        let mut missing = Vec::new();
        if !self.pre_commit.lint_passed {
            missing.push("lint".to_string());
        }
        if !self.pre_commit.typecheck_passed {
            missing.push("typecheck".to_string());
        }
        if missing.is_empty() {
            ReadinessCheck::ready()
        } else {
            ReadinessCheck::missing(missing)
        }
    }

    /// Merge readiness: lint, typecheck and test.
    pub fn check_merge(&self) -> ReadinessCheck {
        let mut missing = Vec::new();
        if !self.pre_commit.lint_passed {
            missing.push("lint".to_string());
        }
        if !self.pre_commit.typecheck_passed {
            missing.push("typecheck".to_string());
        }
        if !self.pre_commit.test_passed {
            missing.push("test".to_string());
        }
        if missing.is_empty() {
            ReadinessCheck::ready()
        } else {
            ReadinessCheck::missing(missing)
        }
    }
}

/// One file per session under the per-user temp directory.
#[derive(Debug, Clone)]
pub struct SessionStateStore {
    path: PathBuf,
}

impl SessionStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the state for `session_id`; a file whose session id does not
    /// match is discarded and replaced with a fresh state.
    pub fn load(&self, session_id: &str) -> SessionState {
        match fsio::read_json::<SessionState>(&self.path) {
            Some(state) if state.session_id == session_id => state,
            Some(_) => {
                debug!(path = %self.path.display(), "discarding session state with mismatched id");
                SessionState::new(session_id)
            }
            None => SessionState::new(session_id),
        }
    }

    pub fn save(&self, state: &SessionState) {
        fsio::write_json_best_effort(&self.path, state, Some(0o600));
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
